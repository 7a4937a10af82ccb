use std::io::Read;
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::command::Command;
use crate::error::Result;
use crate::stream::{consume, Message};

pub mod builtin;
pub mod container;
pub mod extension;
pub mod pid_table;
pub mod system;

pub use builtin::{BuiltinProcess, Context, Runnable};
pub use container::{Channel, ContainerProcess};
pub use extension::{Extension, ExtensionProcess};
pub use pid_table::{PidTable, SystemPidTable, TestingPidTable};
pub use system::SystemProcess;

/// Depth of the message channel between a process and its job.
pub(crate) const MESSAGE_BUFFER: usize = 100;

/// One spawn attempt producing a stream of messages.
///
/// The stream always ends with exactly one terminal message, flagged
/// [`crate::stream::Flag::EXIT_SUCCESS`] or [`crate::stream::Flag::EXIT_ERROR`].
pub trait Process: Send + Sync {
    fn command(&self) -> &Command;

    fn run(&self) -> Result<mpsc::Receiver<Message>>;

    fn as_signaler(&self) -> Option<&dyn Signaler> {
        None
    }

    fn as_stater(&self) -> Option<&dyn Stater> {
        None
    }

    fn as_container(&self) -> Option<&dyn Contained> {
        None
    }
}

pub trait Signaler {
    fn signal(&self, signal: Signal) -> Result<()>;
}

pub trait Stater {
    fn stats(&self) -> ProcessStats;
}

/// A process running inside its own namespaces.
pub trait Contained {
    fn pid(&self) -> Option<i32>;

    /// Hands out the control channel. Only the first call gets it.
    fn take_channel(&self) -> Option<Channel>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Percent of one core.
    pub cpu: f64,
    pub rss: u64,
    pub vms: u64,
    pub swap: u64,
}

/// What a process factory gets from the job that owns it.
#[derive(Clone)]
pub struct ProcessEnv {
    pub table: Arc<dyn PidTable>,
    /// Drop the restricted capabilities from every child's bounding set.
    pub unprivileged: bool,
}

impl ProcessEnv {
    pub fn new(table: Arc<dyn PidTable>) -> Self {
        Self {
            table,
            unprivileged: false,
        }
    }
}

pub type ProcessFactory = Arc<dyn Fn(ProcessEnv, Command) -> Arc<dyn Process> + Send + Sync>;

/// Exit code of a reaped child. Deaths by signal report `128 + signo`.
pub(crate) fn exit_code(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => *code,
        WaitStatus::Signaled(_, signal, _) => 128 + *signal as i32,
        _ => -1,
    }
}

/// Terminal message for a reaped child; failures carry `1000 + exit code`.
pub(crate) fn terminal_message(status: Option<WaitStatus>) -> Message {
    match status.as_ref().map(exit_code) {
        Some(0) => Message::exit_success(),
        Some(code) => Message::exit_error(1000 + code.max(0) as u32),
        None => Message::exit_error(1000),
    }
}

/// Decodes `source` on a blocking thread, forwarding every message to `tx`.
pub(crate) fn pump<R>(source: R, level: u16, tx: mpsc::Sender<Message>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        if let Err(e) = consume(source, level, |msg| {
            let _ = tx.blocking_send(msg);
        }) {
            warn!(level, error = %e, "failed to read process output");
        }
    })
}

/// Samples cpu and memory of `pid`.
pub(crate) fn sample_stats(sampler: &Mutex<sysinfo::System>, pid: i32) -> ProcessStats {
    let mut stats = ProcessStats {
        swap: read_swap(pid),
        ..Default::default()
    };

    let spid = sysinfo::Pid::from_u32(pid as u32);
    let mut sys = sampler.lock().unwrap_or_else(|e| e.into_inner());
    if !sys.refresh_process(spid) {
        return stats;
    }
    if let Some(process) = sys.process(spid) {
        stats.cpu = process.cpu_usage() as f64;
        stats.rss = process.memory();
        stats.vms = process.virtual_memory();
    }
    stats
}

/// `VmSwap` of `/proc/<pid>/status`, in bytes.
fn read_swap(pid: i32) -> u64 {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return 0;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmSwap:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}
