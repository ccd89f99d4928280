//! Real-time notification events and the pub/sub transport abstraction.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, PublishError, Subscription};
pub use event::{Event, Priority, ROOM_ALL};
pub use in_memory_bus::InMemoryEventBus;
