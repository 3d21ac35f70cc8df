//! Event Dispatch
//!
//! Generic single-consumer event dispatcher: producers enqueue events from
//! any thread, one dedicated worker fans each event out to the registered
//! observers in registration order.

mod dispatcher;

pub use dispatcher::{EventDispatcher, Observer};
