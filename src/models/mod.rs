pub mod task;
pub mod trigger;

pub use task::{
    CompletedTask, FailedTask, PriorityClass, Task, TaskDraft, TaskState, TerminalKind,
};
pub use trigger::{TaskListing, Trigger};
