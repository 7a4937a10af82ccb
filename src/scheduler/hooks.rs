use std::sync::{Mutex, Once};
use std::time::Duration;

use regex::Regex;

use crate::error::Result;
use crate::result::JobState;
use crate::stream::message::{LEVEL_STDERR, LEVEL_STDOUT};
use crate::stream::Message;

/// Observer of one job's lifecycle. Every callback defaults to a no-op.
///
/// `tick` runs on a blocking thread once per tick interval with the time
/// elapsed since the attempt started; `message` and `exit` run inline on the
/// job loop; `pid` runs once the spawned pid is registered.
pub trait RunnerHook: Send + Sync {
    fn tick(&self, _elapsed: Duration) {}

    fn message(&self, _msg: &Message) {}

    fn exit(&self, _state: JobState) {}

    fn pid(&self, _pid: i32) {}
}

/// Fires once the job has been running for longer than `delay`.
pub struct DelayHook {
    delay: Duration,
    action: Box<dyn Fn() + Send + Sync>,
    once: Once,
}

impl DelayHook {
    pub fn new<F>(delay: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            delay,
            action: Box::new(action),
            once: Once::new(),
        }
    }
}

impl RunnerHook for DelayHook {
    fn tick(&self, elapsed: Duration) {
        if elapsed > self.delay {
            self.once.call_once(|| (self.action)());
        }
    }
}

/// Fires once when the job exits, with whether it succeeded.
pub struct ExitHook {
    action: Box<dyn Fn(bool) + Send + Sync>,
    once: Once,
}

impl ExitHook {
    pub fn new<F>(action: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        Self {
            action: Box::new(action),
            once: Once::new(),
        }
    }
}

impl RunnerHook for ExitHook {
    fn exit(&self, state: JobState) {
        self.once
            .call_once(|| (self.action)(state == JobState::Success));
    }
}

/// Fires once with the first pid the job spawns.
pub struct PidHook {
    action: Box<dyn Fn(i32) + Send + Sync>,
    once: Once,
}

impl PidHook {
    pub fn new<F>(action: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        Self {
            action: Box::new(action),
            once: Once::new(),
        }
    }
}

impl RunnerHook for PidHook {
    fn pid(&self, pid: i32) {
        self.once.call_once(|| (self.action)(pid));
    }
}

/// Fires once on the first message whose body matches a pattern.
pub struct MatchHook {
    pattern: Regex,
    action: Box<dyn Fn(&Message) + Send + Sync>,
    once: Once,
}

impl MatchHook {
    pub fn new<F>(pattern: &str, action: F) -> Result<Self>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            action: Box::new(action),
            once: Once::new(),
        })
    }
}

impl RunnerHook for MatchHook {
    fn message(&self, msg: &Message) {
        if self.once.is_completed() {
            return;
        }
        if self.pattern.is_match(&msg.message) {
            self.once.call_once(|| (self.action)(msg));
        }
    }
}

/// Collects the complete stdout and stderr of a job.
#[derive(Default)]
pub struct StreamHook {
    stdout: Mutex<String>,
    stderr: Mutex<String>,
}

impl StreamHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(&self) -> String {
        self.stdout.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stderr(&self) -> String {
        self.stderr.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn append(buf: &Mutex<String>, text: &str) {
        let mut buf = buf.lock().unwrap_or_else(|e| e.into_inner());
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(text);
    }
}

impl RunnerHook for StreamHook {
    fn message(&self, msg: &Message) {
        if msg.meta.is_terminal() && msg.message.is_empty() {
            return;
        }
        match msg.level() {
            LEVEL_STDOUT => Self::append(&self.stdout, &msg.message),
            LEVEL_STDERR => Self::append(&self.stderr, &msg.message),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (c.clone(), c)
    }

    #[test]
    fn delay_hook_fires_once_after_delay() {
        let (count, seen) = counter();
        let hook = DelayHook::new(Duration::from_secs(2), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        hook.tick(Duration::from_secs(1));
        hook.tick(Duration::from_secs(2));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        hook.tick(Duration::from_secs(3));
        hook.tick(Duration::from_secs(4));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exit_hook_reports_success_once() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let hook = ExitHook::new(move |ok| sink.lock().unwrap().push(ok));

        hook.exit(JobState::Error);
        hook.exit(JobState::Success);
        assert_eq!(*results.lock().unwrap(), vec![false]);
    }

    #[test]
    fn pid_hook_keeps_first_pid() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let hook = PidHook::new(move |pid| *sink.lock().unwrap() = Some(pid));
        hook.pid(10);
        hook.pid(11);
        assert_eq!(*seen.lock().unwrap(), Some(10));
    }

    #[test]
    fn match_hook_fires_on_first_match_only() {
        let (count, seen) = counter();
        let hook = MatchHook::new(r"^ready on port \d+$", move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        hook.message(&Message::new(1, "starting"));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        hook.message(&Message::new(1, "ready on port 80"));
        hook.message(&Message::new(1, "ready on port 81"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn match_hook_rejects_bad_pattern() {
        assert!(MatchHook::new("(unclosed", |_| {}).is_err());
    }

    #[test]
    fn stream_hook_accumulates_everything() {
        let hook = StreamHook::new();
        for i in 0..150 {
            hook.message(&Message::new(LEVEL_STDOUT, format!("line {i}")));
        }
        hook.message(&Message::new(LEVEL_STDERR, "oops"));
        hook.message(&Message::new(11, "debug is ignored"));
        hook.message(&Message::exit_success());

        assert_eq!(hook.stdout().lines().count(), 150);
        assert!(hook.stdout().starts_with("line 0\nline 1"));
        assert_eq!(hook.stderr(), "oops");
    }
}
