pub mod batcher;
pub mod scheduler;

pub use batcher::{MessageBatcher, MessageSink};
pub use scheduler::{TaskExecutor, TaskScheduler};
