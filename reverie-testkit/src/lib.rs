//! Test support for reverie: an in-memory job store with a movable clock,
//! scripted handlers and dispatchers, and payload fixtures.

pub mod fixtures;
pub mod mock;
pub mod queue;

pub use mock::{HandlerCall, MockDispatcher, MockHandler, MockStep};
pub use queue::InMemoryJobStore;
