// Utilities shared by every layer: logging and the cancellable work loop.

pub mod cancellable_loop;
pub mod logging;

pub use cancellable_loop::{CancellableLoop, LoopHandle};
pub use logging::{Component, LogSink, Logger};
