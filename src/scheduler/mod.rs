pub mod handlers;
pub mod hooks;
pub mod job;
pub mod manager;
pub mod queue;

pub use handlers::{
    Handlers, MessageHandler, PreHandler, ResultHandler, StatsHandler, Tag, OPERATION_AVERAGE,
    OPERATION_DIFFERENCE,
};
pub use hooks::{DelayHook, ExitHook, MatchHook, PidHook, RunnerHook, StreamHook};
pub use job::{Job, JobHandle, JobOptions};
pub use manager::{Manager, Router};
pub use queue::NamedQueues;
