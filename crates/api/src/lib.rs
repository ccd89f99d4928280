//! HTTP admission control: rate-limit middleware and request context.

pub mod context;
pub mod middleware;

pub use context::PrincipalContext;
pub use middleware::{AdmissionState, admission_middleware, with_admission};
