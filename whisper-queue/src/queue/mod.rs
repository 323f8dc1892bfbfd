//! Queue orchestration: the queue controller, the timeout reaper, and the
//! completion handler.

pub mod completion;
pub mod controller;
pub mod reaper;

pub use completion::CompletionHandler;
pub use controller::{ControllerConfig, QueueController};
pub use reaper::{ReaperConfig, TIMEOUT_ERROR_MESSAGE, TimeoutReaper};
