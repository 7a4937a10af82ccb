//! Job state machine over real child processes, reaped through the
//! direct-wait testing table.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde_json::json;

use pm_lite::command::{Command, JobFlags, SystemCommandArguments};
use pm_lite::config::ManagerConfig;
use pm_lite::process::{BuiltinProcess, Runnable, SystemProcess, TestingPidTable};
use pm_lite::result::JobState;
use pm_lite::scheduler::{
    DelayHook, ExitHook, Job, JobHandle, JobOptions, MatchHook, PidHook, RunnerHook,
};
use pm_lite::stream::Message;

fn options() -> JobOptions {
    JobOptions::new(Arc::new(TestingPidTable)).with_config(
        ManagerConfig::default()
            .with_restart_delay(Duration::from_millis(20))
            .with_tick_interval(Duration::from_millis(20)),
    )
}

fn system_job(cmd: Command, hooks: Vec<Arc<dyn RunnerHook>>) -> JobHandle {
    Job::new(cmd, SystemProcess::factory(), hooks, options())
}

fn shell(script: &str) -> Command {
    Command::system("sh", &["-c", script])
}

/// Counts every exit, not just the first.
#[derive(Default)]
struct ExitCounter {
    exits: Mutex<Vec<JobState>>,
}

impl RunnerHook for ExitCounter {
    fn exit(&self, state: JobState) {
        self.exits.lock().unwrap().push(state);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cat_echoes_stdin() {
    let args = SystemCommandArguments {
        name: "cat".to_string(),
        stdin: "hello world".to_string(),
        ..Default::default()
    };
    let cmd = Command::new("core.system").with_arguments(&args);

    let result = system_job(cmd, Vec::new()).start().await;

    assert_eq!(result.state, JobState::Success);
    assert_eq!(result.code, 0);
    assert_eq!(result.streams.stdout(), "hello world");
    assert_eq!(result.streams.stderr(), "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_max_time_kills_job() {
    let mut cmd = Command::system("sleep", &["10"]);
    cmd.max_time = 1;

    let started = Instant::now();
    let result = system_job(cmd, Vec::new()).start().await;

    assert_eq!(result.state, JobState::Timeout);
    assert_eq!(result.code, 1000 + 128 + Signal::SIGKILL as u32);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exit_code_is_offset() {
    let result = system_job(shell("echo oops >&2; exit 3"), Vec::new())
        .start()
        .await;

    assert_eq!(result.state, JobState::Error);
    assert_eq!(result.code, 1003);
    assert_eq!(result.streams.stderr(), "oops");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_framed_output_is_classified() {
    let script = r#"echo "plain line"; echo "9::disk failing"; echo '20::{"a":1}'"#;
    let result = system_job(shell(script), Vec::new()).start().await;

    assert_eq!(result.state, JobState::Success);
    assert_eq!(result.streams.stdout(), "plain line");
    assert_eq!(result.critical, "disk failing");
    assert_eq!(result.level, 20);
    assert_eq!(result.data, r#"{"a":1}"#);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signal_reaches_process() {
    let pid = Arc::new(AtomicI32::new(0));
    let seen = pid.clone();
    let hooks: Vec<Arc<dyn RunnerHook>> = vec![Arc::new(PidHook::new(move |p| {
        seen.store(p, Ordering::SeqCst)
    }))];

    let job = system_job(Command::system("sleep", &["30"]), hooks);
    let running = tokio::spawn(job.clone().start());

    while pid.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(job.is_running());
    assert!(job.process().is_some());
    assert!(job.start_time() > 0);
    job.signal(Signal::SIGTERM).unwrap();

    let result = running.await.unwrap();
    assert_eq!(result.state, JobState::Error);
    assert_eq!(result.code, 1000 + 128 + Signal::SIGTERM as u32);
    assert!(matches!(
        job.signal(Signal::SIGTERM),
        Err(pm_lite::PmError::NotRunning(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_job_runs_max_restart_times() {
    let counter = Arc::new(ExitCounter::default());
    let mut cmd = Command::system("false", &[]);
    cmd.max_restart = 3;

    let result = system_job(cmd, vec![counter.clone()]).start().await;

    assert_eq!(result.state, JobState::Error);
    assert_eq!(result.code, 1001);
    assert_eq!(*counter.exits.lock().unwrap(), vec![JobState::Error; 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_successful_job_is_not_restarted() {
    let counter = Arc::new(ExitCounter::default());
    let mut cmd = Command::system("true", &[]);
    cmd.max_restart = 3;

    let result = system_job(cmd, vec![counter.clone()]).start().await;

    assert_eq!(result.state, JobState::Success);
    assert_eq!(counter.exits.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_protected_job_respawns_until_unscheduled() {
    let counter = Arc::new(ExitCounter::default());
    let cmd = Command::system("true", &[]).with_flags(JobFlags {
        protected: true,
        ..Default::default()
    });

    let job = system_job(cmd, vec![counter.clone()]);
    let running = tokio::spawn(job.clone().start());

    while counter.exits.lock().unwrap().len() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    job.unschedule();

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.state, JobState::Killed);
    assert!(!job.is_running());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signal_during_restart_pause_kills_job() {
    let counter = Arc::new(ExitCounter::default());
    let mut cmd = Command::system("false", &[]);
    cmd.max_restart = 100;

    let options = JobOptions::new(Arc::new(TestingPidTable))
        .with_config(ManagerConfig::default().with_restart_delay(Duration::from_secs(30)));
    let job = Job::new(cmd, SystemProcess::factory(), vec![counter.clone()], options);
    let running = tokio::spawn(job.clone().start());

    while counter.exits.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    job.signal(Signal::SIGTERM).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.state, JobState::Killed);
    assert_eq!(counter.exits.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hooks_fire_once() {
    let exited = Arc::new(Mutex::new(Vec::new()));
    let matched = Arc::new(AtomicUsize::new(0));
    let delayed = Arc::new(AtomicBool::new(false));

    let exit_sink = exited.clone();
    let match_count = matched.clone();
    let delay_flag = delayed.clone();
    let hooks: Vec<Arc<dyn RunnerHook>> = vec![
        Arc::new(ExitHook::new(move |ok| exit_sink.lock().unwrap().push(ok))),
        Arc::new(
            MatchHook::new("^ready", move |_msg: &Message| {
                match_count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap(),
        ),
        Arc::new(DelayHook::new(Duration::from_millis(100), move || {
            delay_flag.store(true, Ordering::SeqCst)
        })),
    ];

    let script = "echo ready; sleep 0.1; echo ready; sleep 0.4";
    let result = system_job(shell(script), hooks).start().await;

    assert_eq!(result.state, JobState::Success);
    assert_eq!(*exited.lock().unwrap(), vec![true]);
    assert_eq!(matched.load(Ordering::SeqCst), 1);
    assert!(delayed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_output_discards_streams() {
    let cmd = shell("echo hidden; echo hidden >&2").with_flags(JobFlags {
        no_output: true,
        ..Default::default()
    });
    let result = system_job(cmd, Vec::new()).start().await;

    assert_eq!(result.state, JobState::Success);
    assert_eq!(result.streams.stdout(), "");
    assert_eq!(result.streams.stderr(), "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscriber_sees_live_messages_in_order() {
    let job = system_job(shell("echo one; sleep 0.2; echo two"), Vec::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    job.subscribe(move |msg| sink.lock().unwrap().push(msg.message.clone()));

    job.clone().start().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first().map(String::as_str), Some("one"));
    assert_eq!(seen.get(1).map(String::as_str), Some("two"));
    // Terminal message closes the stream.
    assert_eq!(seen.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_binary_is_error_result() {
    let result = system_job(Command::system("no-such-binary-here", &[]), Vec::new())
        .start()
        .await;

    assert_eq!(result.state, JobState::Error);
    assert_eq!(result.code, 404);
    assert!(result.data.contains("no-such-binary-here"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_builtin_panic_is_error_result() {
    let job = Job::new(
        Command::new("test.boom"),
        BuiltinProcess::factory(Runnable::plain(|_| panic!("boom"))),
        Vec::new(),
        options(),
    );
    let result = job.start().await;

    assert_eq!(result.state, JobState::Error);
    assert_eq!(result.code, 500);
    assert_eq!(result.level, 20);
    assert_eq!(result.data, "\"boom\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_returns_same_result_to_every_waiter() {
    let job = Job::new(
        Command::new("test.value"),
        BuiltinProcess::factory(Runnable::plain(|_| Ok(json!([1, 2, 3])))),
        Vec::new(),
        options(),
    );

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let job = job.clone();
            tokio::spawn(async move { job.wait().await })
        })
        .collect();
    let result = job.clone().start().await;

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), result);
    }
    assert_eq!(result.data, "[1,2,3]");
}
