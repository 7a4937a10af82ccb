use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use nix::fcntl::OFlag;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{pipe2, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::system::drop_bounding_set;
use super::{
    exit_code, sample_stats, Contained, Process, ProcessEnv, ProcessFactory, ProcessStats,
    Signaler, Stater, MESSAGE_BUFFER,
};
use crate::command::{Command, ContainerCommandArguments};
use crate::error::{PmError, Result};
use crate::stream::Message;

/// Fd the contained process reads commands from.
pub const CHANNEL_READ_FD: RawFd = 3;
/// Fd the contained process writes results to.
pub const CHANNEL_WRITE_FD: RawFd = 4;

/// Bidirectional pipe to a contained process, separate from its output.
///
/// Values travel as newline-delimited JSON.
pub struct Channel {
    reader: BufReader<File>,
    writer: File,
}

impl Channel {
    /// Two connected channels: what one writes the other reads.
    pub fn pair() -> Result<(Channel, Channel)> {
        let (a_read, b_write) = pipe2(OFlag::O_CLOEXEC)?;
        let (b_read, a_write) = pipe2(OFlag::O_CLOEXEC)?;

        let a = Channel {
            reader: BufReader::new(File::from(a_read)),
            writer: File::from(a_write),
        };
        let b = Channel {
            reader: BufReader::new(File::from(b_read)),
            writer: File::from(b_write),
        };
        Ok((a, b))
    }

    pub fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    fn raw_fds(&self) -> (RawFd, RawFd) {
        (self.reader.get_ref().as_raw_fd(), self.writer.as_raw_fd())
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

fn check(rc: libc::c_int) -> std::io::Result<libc::c_int> {
    if rc == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Lowest fd used while shuffling descriptors in the cloned child, above
/// the standard and channel slots.
const FD_FLOOR: RawFd = 10;
/// Stack of the cloned child until it execs.
const CLONE_STACK: usize = 256 * 1024;
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

fn c_string(value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| PmError::bad_request(format!("value contains a nul byte: {value}")))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| PmError::bad_request(format!("path contains a nul byte: {}", path.display())))
}

/// Null-terminated pointer array over `values`.
fn pointers(values: &[CString]) -> Vec<*const libc::c_char> {
    values
        .iter()
        .map(|v| v.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Paths tried in order by the child. The binary only exists below the new
/// root, so nothing is resolved on the host.
fn exec_candidates(name: &str, env: &HashMap<String, String>) -> Result<Vec<CString>> {
    if name.contains('/') {
        return Ok(vec![c_string(name)?]);
    }
    let search = env.get("PATH").map(String::as_str).unwrap_or(DEFAULT_PATH);
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| c_string(&format!("{dir}/{name}")))
        .collect()
}

/// Everything the cloned child needs, prepared before the clone. The child
/// only makes raw syscalls on it.
struct Confinement {
    root: Option<CString>,
    dir: Option<CString>,
    candidates: Vec<CString>,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    /// stdin, stdout and stderr.
    stdio: [File; 3],
    /// Read and write ends placed at the channel fds.
    channel: (RawFd, RawFd),
    unprivileged: bool,
}

impl Confinement {
    fn prepare(
        args: &ContainerCommandArguments,
        stdout: File,
        stderr: File,
        channel: (RawFd, RawFd),
        unprivileged: bool,
    ) -> Result<Self> {
        let root = match args.chroot.as_str() {
            "" => None,
            root => Some(c_path(Path::new(root))?),
        };
        let dir = match (args.dir.as_str(), &root) {
            ("", None) => None,
            ("", Some(_)) => Some(c_path(Path::new("/"))?),
            (dir, _) => Some(c_path(Path::new(dir))?),
        };

        let argv = std::iter::once(&args.name)
            .chain(&args.args)
            .map(|a| c_string(a))
            .collect::<Result<Vec<_>>>()?;
        let envp = args
            .env
            .iter()
            .map(|(k, v)| c_string(&format!("{k}={v}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root,
            dir,
            candidates: exec_candidates(&args.name, &args.env)?,
            argv_ptrs: pointers(&argv),
            envp_ptrs: pointers(&envp),
            _argv: argv,
            _envp: envp,
            stdio: [File::open("/dev/null")?, stdout, stderr],
            channel,
            unprivileged,
        })
    }

    /// Clones a child directly into `namespaces`, so the binary is the init
    /// of a fresh pid namespace. Returns once the exec succeeded or failed.
    fn spawn(&self, namespaces: CloneFlags) -> Result<i32> {
        let (report_read, report_write) = pipe2(OFlag::O_CLOEXEC)?;
        let report = report_write.as_raw_fd();

        let mut stack = vec![0u8; CLONE_STACK];
        let pid = unsafe {
            clone(
                Box::new(|| self.enter(report)),
                &mut stack,
                namespaces,
                Some(libc::SIGCHLD),
            )
        }?;
        drop(report_write);

        // EOF means the exec went through and closed the report pipe.
        let mut errno = [0u8; 4];
        match File::from(report_read).read_exact(&mut errno) {
            Ok(()) => {
                let _ = waitpid(pid, None);
                Err(PmError::Spawn(std::io::Error::from_raw_os_error(
                    i32::from_ne_bytes(errno),
                )))
            }
            Err(_) => Ok(pid.as_raw()),
        }
    }

    /// Runs in the cloned child and never returns. A failure is written to
    /// the report pipe as a raw errno.
    fn enter(&self, report: RawFd) -> isize {
        let mut report = report;
        let err = match self.exec(&mut report) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        let errno = err.raw_os_error().unwrap_or(libc::EINVAL).to_ne_bytes();
        unsafe {
            libc::write(report, errno.as_ptr().cast(), errno.len());
            libc::_exit(127)
        }
    }

    /// Confines the child and execs the first candidate that exists.
    fn exec(&self, report: &mut RawFd) -> std::io::Result<Infallible> {
        unsafe {
            // Every descriptor is lifted above the floor before any slot is
            // written, so neither a source nor the report pipe is clobbered.
            *report = check(libc::fcntl(*report, libc::F_DUPFD_CLOEXEC, FD_FLOOR))?;
            let sources = [
                self.stdio[0].as_raw_fd(),
                self.stdio[1].as_raw_fd(),
                self.stdio[2].as_raw_fd(),
                self.channel.0,
                self.channel.1,
            ];
            let mut lifted = [0; 5];
            for (slot, fd) in sources.iter().enumerate() {
                lifted[slot] = check(libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, FD_FLOOR))?;
            }

            check(libc::setsid())?;
            if self.unprivileged {
                drop_bounding_set()?;
            }
            if let Some(root) = &self.root {
                check(libc::chroot(root.as_ptr()))?;
            }
            if let Some(dir) = &self.dir {
                check(libc::chdir(dir.as_ptr()))?;
            }

            let slots = [
                libc::STDIN_FILENO,
                libc::STDOUT_FILENO,
                libc::STDERR_FILENO,
                CHANNEL_READ_FD,
                CHANNEL_WRITE_FD,
            ];
            for (fd, slot) in lifted.iter().zip(slots) {
                check(libc::dup2(*fd, slot))?;
            }
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());

            let mut denied = false;
            for path in &self.candidates {
                libc::execve(path.as_ptr(), self.argv_ptrs.as_ptr(), self.envp_ptrs.as_ptr());
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ENOENT) | Some(libc::ENOTDIR) => {}
                    Some(libc::EACCES) => denied = true,
                    _ => return Err(err),
                }
            }
            let errno = if denied { libc::EACCES } else { libc::ENOENT };
            Err(std::io::Error::from_raw_os_error(errno))
        }
    }
}

/// A process cloned straight into fresh pid, mount and uts namespaces (and
/// a fresh network namespace unless it shares the host's), chrooted and in
/// its own session. The binary is pid 1 of its namespace.
pub struct ContainerProcess {
    command: Command,
    env: ProcessEnv,
    pid: OnceLock<i32>,
    channel: Mutex<Option<Channel>>,
    sampler: Mutex<sysinfo::System>,
}

impl ContainerProcess {
    pub fn new(env: ProcessEnv, command: Command) -> Self {
        Self {
            command,
            env,
            pid: OnceLock::new(),
            channel: Mutex::new(None),
            sampler: Mutex::new(sysinfo::System::new()),
        }
    }

    pub fn factory() -> ProcessFactory {
        Arc::new(|env: ProcessEnv, cmd: Command| {
            Arc::new(ContainerProcess::new(env, cmd)) as Arc<dyn Process>
        })
    }

    fn output(&self, args: &ContainerCommandArguments) -> Result<(File, File)> {
        let log = if args.log.is_empty() {
            OpenOptions::new().write(true).open("/dev/null")?
        } else {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&args.log)?
        };
        let err = log.try_clone()?;
        Ok((log, err))
    }
}

impl Process for ContainerProcess {
    fn command(&self) -> &Command {
        &self.command
    }

    fn run(&self) -> Result<mpsc::Receiver<Message>> {
        let args: ContainerCommandArguments = self.command.arguments()?;

        let mut namespaces =
            CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS;
        if !args.host_network {
            namespaces |= CloneFlags::CLONE_NEWNET;
        }

        let (host, inner) = Channel::pair()?;
        let (stdout, stderr) = self.output(&args)?;
        let confinement =
            Confinement::prepare(&args, stdout, stderr, inner.raw_fds(), self.env.unprivileged)?;

        let pid = self
            .env
            .table
            .register_pid(&mut || confinement.spawn(namespaces))?;
        drop(inner);
        let _ = self.pid.set(pid);
        *self.channel.lock().unwrap_or_else(|e| e.into_inner()) = Some(host);

        info!(job_id = %self.command.id, pid, root = %args.chroot, "container started");

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let waiter = self.env.table.wait_pid(pid)?;
        let job_id = self.command.id.clone();
        tokio::spawn(async move {
            let status = waiter.await.ok();
            debug!(job_id = %job_id, pid, ?status, "container exited");
            let message = match status.as_ref().map(exit_code) {
                Some(0) => Message::exit_success(),
                Some(code) => Message::exit_error(code.max(0) as u32),
                None => Message::exit_error(0),
            };
            let _ = tx.send(message).await;
        });

        Ok(rx)
    }

    fn as_signaler(&self) -> Option<&dyn Signaler> {
        Some(self)
    }

    fn as_stater(&self) -> Option<&dyn Stater> {
        Some(self)
    }

    fn as_container(&self) -> Option<&dyn Contained> {
        Some(self)
    }
}

impl Signaler for ContainerProcess {
    fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self
            .pid
            .get()
            .ok_or_else(|| PmError::NotRunning(self.command.id.clone()))?;
        // The child leads its own session, so its pid is the group id.
        killpg(Pid::from_raw(*pid), signal)?;
        Ok(())
    }
}

impl Stater for ContainerProcess {
    fn stats(&self) -> ProcessStats {
        match self.pid.get() {
            Some(pid) => sample_stats(&self.sampler, *pid),
            None => ProcessStats::default(),
        }
    }
}

impl Contained for ContainerProcess {
    fn pid(&self) -> Option<i32> {
        self.pid.get().copied()
    }

    fn take_channel(&self) -> Option<Channel> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
