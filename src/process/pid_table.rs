use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{PmError, Result};

/// Registry bridging process spawn and child reaping.
pub trait PidTable: Send + Sync {
    /// Runs `spawn` and registers the pid it returns. No child can be reaped
    /// before the registration completes.
    fn register_pid(&self, spawn: &mut dyn FnMut() -> Result<i32>) -> Result<i32>;

    /// Resolves once the registered `pid` has been reaped.
    fn wait_pid(&self, pid: i32) -> Result<oneshot::Receiver<WaitStatus>>;
}

struct Slot {
    tx: Option<oneshot::Sender<WaitStatus>>,
    rx: Option<oneshot::Receiver<WaitStatus>>,
}

/// Pid table backed by a process-wide SIGCHLD reaper.
///
/// The reaper drains every exited child with `waitpid(-1, WNOHANG)`, so at
/// most one instance may exist per process: use [`SystemPidTable::global`].
/// Children started with `tokio::process` or waited on directly would be
/// stolen by it.
pub struct SystemPidTable {
    slots: Mutex<HashMap<i32, Slot>>,
}

impl SystemPidTable {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide table. The first call starts the reaper thread and
    /// returns once it listens for SIGCHLD.
    pub fn global() -> Arc<SystemPidTable> {
        static GLOBAL: OnceLock<Arc<SystemPidTable>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let table = Arc::new(SystemPidTable::new());
                start_reaper(table.clone());
                table
            })
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i32, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Collects all exited children. The table lock is held across the
    /// waitpid loop so a child spawned inside `register_pid` cannot be reaped
    /// before its slot exists.
    fn reap(&self) {
        let mut slots = self.lock();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        deliver(&mut slots, pid.as_raw(), status);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    error!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
    }
}

fn deliver(slots: &mut HashMap<i32, Slot>, pid: i32, status: WaitStatus) {
    let Some(slot) = slots.get_mut(&pid) else {
        debug!(pid, "reaped unregistered child");
        return;
    };

    if let Some(tx) = slot.tx.take() {
        let _ = tx.send(status);
    }
    if slot.rx.is_none() {
        slots.remove(&pid);
    }
}

impl PidTable for SystemPidTable {
    fn register_pid(&self, spawn: &mut dyn FnMut() -> Result<i32>) -> Result<i32> {
        let mut slots = self.lock();
        let pid = spawn()?;
        let (tx, rx) = oneshot::channel();
        slots.insert(
            pid,
            Slot {
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        Ok(pid)
    }

    fn wait_pid(&self, pid: i32) -> Result<oneshot::Receiver<WaitStatus>> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&pid).ok_or(PmError::UnknownPid(pid))?;
        let rx = slot.rx.take().ok_or(PmError::UnknownPid(pid))?;
        if slot.tx.is_none() {
            slots.remove(&pid);
        }
        Ok(rx)
    }
}

fn start_reaper(table: Arc<SystemPidTable>) {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();

    let spawned = std::thread::Builder::new()
        .name("pm-reaper".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to build reaper runtime");
                    return;
                }
            };

            runtime.block_on(async move {
                let mut sigchld = match signal(SignalKind::child()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "failed to listen for SIGCHLD");
                        return;
                    }
                };
                let _ = ready_tx.send(());

                while sigchld.recv().await.is_some() {
                    table.reap();
                }
                warn!("SIGCHLD stream closed, reaper exiting");
            });
        });

    match spawned {
        Ok(_) => {
            let _ = ready_rx.recv();
        }
        Err(e) => error!(error = %e, "failed to start reaper thread"),
    }
}

/// Pid table that waits on each child directly from a dedicated thread.
///
/// Only for tests that never run a [`SystemPidTable`] in the same process.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestingPidTable;

impl PidTable for TestingPidTable {
    fn register_pid(&self, spawn: &mut dyn FnMut() -> Result<i32>) -> Result<i32> {
        spawn()
    }

    fn wait_pid(&self, pid: i32) -> Result<oneshot::Receiver<WaitStatus>> {
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name(format!("wait-{pid}"))
            .spawn(move || loop {
                match waitpid(Pid::from_raw(pid), None) {
                    Ok(status) => {
                        let _ = tx.send(status);
                        break;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        warn!(pid, error = %e, "waitpid failed");
                        break;
                    }
                }
            })?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_delivered_before_wait_is_kept() {
        let table = SystemPidTable::new();
        let pid = table.register_pid(&mut || Ok(4242)).unwrap();
        assert_eq!(pid, 4242);

        deliver(&mut table.lock(), pid, WaitStatus::Exited(Pid::from_raw(pid), 3));
        let mut rx = table.wait_pid(pid).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WaitStatus::Exited(Pid::from_raw(pid), 3));
        assert!(table.lock().is_empty());
    }

    #[test]
    fn wait_then_deliver() {
        let table = SystemPidTable::new();
        table.register_pid(&mut || Ok(7)).unwrap();
        let mut rx = table.wait_pid(7).unwrap();
        assert!(rx.try_recv().is_err());

        deliver(&mut table.lock(), 7, WaitStatus::Exited(Pid::from_raw(7), 0));
        assert_eq!(rx.try_recv().unwrap(), WaitStatus::Exited(Pid::from_raw(7), 0));
        assert!(table.lock().is_empty());
    }

    #[test]
    fn unknown_or_twice_awaited_pid_is_an_error() {
        let table = SystemPidTable::new();
        assert!(matches!(table.wait_pid(1), Err(PmError::UnknownPid(1))));

        table.register_pid(&mut || Ok(9)).unwrap();
        let _rx = table.wait_pid(9).unwrap();
        assert!(table.wait_pid(9).is_err());
    }

    #[test]
    fn failed_spawn_registers_nothing() {
        let table = SystemPidTable::new();
        let err = table
            .register_pid(&mut || Err(PmError::internal("nope")))
            .unwrap_err();
        assert_eq!(err.code(), 500);
        assert!(table.lock().is_empty());
    }

    #[test]
    fn unregistered_pid_is_ignored() {
        let table = SystemPidTable::new();
        deliver(&mut table.lock(), 11, WaitStatus::Exited(Pid::from_raw(11), 0));
        assert!(table.lock().is_empty());
    }
}
