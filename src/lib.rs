pub mod command;
pub mod config;
pub mod error;
pub mod process;
pub mod result;
pub mod scheduler;
pub mod shutdown;
pub mod stream;

pub use command::{Command, JobFlags};
pub use config::ManagerConfig;
pub use error::{PmError, Result};
pub use result::{JobResult, JobState};
pub use scheduler::{Job, JobHandle, Manager};
