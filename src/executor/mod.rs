pub mod timed_executor;
pub mod timed_queue;

pub use timed_executor::{PendingTasks, ScheduledTask, ShutdownPolicy, TimedExecutor};
pub use timed_queue::{Task, TaskId, TimedQueue};
