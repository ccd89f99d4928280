/// Principal context for a request (authenticated identity).
///
/// Inserted into request extensions by whatever authenticates the caller;
/// admission control keys on it when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: String,
}

impl PrincipalContext {
    pub fn new(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
        }
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }
}
