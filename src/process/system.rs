use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    pump, sample_stats, terminal_message, Process, ProcessEnv, ProcessFactory, ProcessStats,
    Signaler, Stater, MESSAGE_BUFFER,
};
use crate::command::{Command, SystemCommandArguments};
use crate::error::{PmError, Result};
use crate::stream::message::{LEVEL_STDERR, LEVEL_STDOUT};
use crate::stream::Message;

/// Capabilities removed from the bounding set of children in unprivileged
/// mode: mac/audit control, module loading, raw io, ptrace, boot, time,
/// tty config, mknod, lease, syslog, net admin, setpcap, lock and alarm.
const RESTRICTED_CAPABILITIES: [libc::c_ulong; 24] = [
    8, 16, 17, 20, 21, 23, 24, 25, 26, 30, 32, 33, 12, 34, 2, 9, 11, 14, 15, 19, 22, 28, 35, 36,
];

/// Runs in the forked child. Failures are ignored: kernels without a
/// capability or without CAP_SETPCAP still get to exec.
pub(crate) fn drop_bounding_set() -> std::io::Result<()> {
    for cap in RESTRICTED_CAPABILITIES {
        unsafe {
            libc::prctl(
                libc::PR_CAPBSET_DROP,
                cap,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            );
        }
    }
    Ok(())
}

pub(crate) fn set_unprivileged(cmd: &mut std::process::Command) {
    unsafe {
        cmd.pre_exec(drop_bounding_set);
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolves `name` the way a shell would: names with a slash are taken as
/// paths, others are searched in `PATH`.
pub fn lookup_path(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// A child process forked from a binary on the host.
pub struct SystemProcess {
    command: Command,
    env: ProcessEnv,
    pid: OnceLock<i32>,
    sampler: Mutex<sysinfo::System>,
}

impl SystemProcess {
    pub fn new(env: ProcessEnv, command: Command) -> Self {
        Self {
            command,
            env,
            pid: OnceLock::new(),
            sampler: Mutex::new(sysinfo::System::new()),
        }
    }

    pub fn factory() -> ProcessFactory {
        Arc::new(|env: ProcessEnv, cmd: Command| {
            Arc::new(SystemProcess::new(env, cmd)) as Arc<dyn Process>
        })
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid.get().copied()
    }

    /// Spawns `args` under this process's command.
    pub(crate) fn spawn(&self, args: &SystemCommandArguments) -> Result<mpsc::Receiver<Message>> {
        let path = lookup_path(&args.name).ok_or_else(|| {
            PmError::not_found(format!("executable file not found in $PATH: {}", args.name))
        })?;

        let mut cmd = std::process::Command::new(&path);
        cmd.args(&args.args).envs(&args.env);
        if !args.dir.is_empty() {
            cmd.current_dir(&args.dir);
        }

        if args.stdin.is_empty() {
            cmd.stdin(Stdio::null());
        } else {
            cmd.stdin(Stdio::piped());
        }

        if self.command.flags.no_output {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        if !self.command.flags.no_setpgid {
            cmd.process_group(0);
        }
        if self.env.unprivileged {
            set_unprivileged(&mut cmd);
        }

        let mut child = None;
        let pid = self.env.table.register_pid(&mut || {
            let spawned = cmd.spawn().map_err(PmError::Spawn)?;
            let pid = spawned.id() as i32;
            child = Some(spawned);
            Ok(pid)
        })?;
        let mut child = child.ok_or_else(|| PmError::internal("spawn returned no child"))?;
        let _ = self.pid.set(pid);

        info!(job_id = %self.command.id, pid, path = %path.display(), "process started");

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);

        if let Some(mut stdin) = child.stdin.take() {
            let input = args.stdin.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = stdin.write_all(input.as_bytes()) {
                    debug!(pid, error = %e, "failed to write stdin");
                }
            });
        }

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, LEVEL_STDOUT, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, LEVEL_STDERR, tx.clone()));
        }

        let waiter = self.env.table.wait_pid(pid)?;
        let job_id = self.command.id.clone();
        tokio::spawn(async move {
            let status = waiter.await.ok();
            for p in pumps {
                let _ = p.await;
            }
            debug!(job_id = %job_id, pid, ?status, "process exited");
            let _ = tx.send(terminal_message(status)).await;
            drop(child);
        });

        Ok(rx)
    }
}

impl Process for SystemProcess {
    fn command(&self) -> &Command {
        &self.command
    }

    fn run(&self) -> Result<mpsc::Receiver<Message>> {
        let args: SystemCommandArguments = self.command.arguments()?;
        self.spawn(&args)
    }

    fn as_signaler(&self) -> Option<&dyn Signaler> {
        Some(self)
    }

    fn as_stater(&self) -> Option<&dyn Stater> {
        Some(self)
    }
}

impl Signaler for SystemProcess {
    /// Signals the whole process group unless the command kept the
    /// supervisor's group.
    fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self
            .pid()
            .map(Pid::from_raw)
            .ok_or_else(|| PmError::NotRunning(self.command.id.clone()))?;

        if self.command.flags.no_setpgid {
            kill(pid, signal)?;
        } else {
            killpg(getpgid(Some(pid))?, signal)?;
        }
        Ok(())
    }
}

impl Stater for SystemProcess {
    fn stats(&self) -> ProcessStats {
        match self.pid() {
            Some(pid) => sample_stats(&self.sampler, pid),
            None => ProcessStats::default(),
        }
    }
}
