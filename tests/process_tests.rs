//! Process kinds driven directly, without a job around them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use pm_lite::command::{Command, ContainerCommandArguments, SystemCommandArguments};
use pm_lite::process::{
    ContainerProcess, Extension, Process, ProcessEnv, SystemProcess, TestingPidTable,
};
use pm_lite::stream::message::{LEVEL_STDERR, LEVEL_STDOUT};
use pm_lite::stream::{Flag, Message};

fn env() -> ProcessEnv {
    ProcessEnv::new(Arc::new(TestingPidTable))
}

fn system(args: SystemCommandArguments) -> Arc<dyn Process> {
    let cmd = Command::new("core.system").with_arguments(&args);
    SystemProcess::factory()(env(), cmd)
}

fn shell(script: &str) -> Arc<dyn Process> {
    system(SystemCommandArguments {
        name: "sh".into(),
        args: vec!["-c".into(), script.into()],
        ..Default::default()
    })
}

async fn collect(process: &dyn Process) -> Vec<Message> {
    let mut rx = process.run().unwrap();
    let mut messages = Vec::new();
    while let Some(msg) = rx.recv().await {
        messages.push(msg);
    }
    messages
}

fn text_at(messages: &[Message], level: u16) -> String {
    messages
        .iter()
        .filter(|m| m.level() == level && !m.meta.is_terminal())
        .map(|m| m.message.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminal_message_is_last_and_unique() {
    let process = shell("for i in 1 2 3 4 5; do echo line $i; echo err $i >&2; done");
    let messages = collect(process.as_ref()).await;

    let terminals: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.meta.is_terminal())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminals, vec![messages.len() - 1]);

    let last = messages.last().unwrap();
    assert!(last.meta.is(Flag::EXIT_SUCCESS));
    assert_eq!(last.level(), LEVEL_STDOUT);

    assert_eq!(
        text_at(&messages, LEVEL_STDOUT),
        "line 1\nline 2\nline 3\nline 4\nline 5"
    );
    assert_eq!(text_at(&messages, LEVEL_STDERR), "err 1\nerr 2\nerr 3\nerr 4\nerr 5");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_carries_offset_code() {
    let messages = collect(shell("exit 7").as_ref()).await;
    let last = messages.last().unwrap();
    assert!(last.meta.is(Flag::EXIT_ERROR));
    assert_eq!(last.level(), LEVEL_STDERR);
    assert_eq!(last.meta.code(), 1007);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_env_and_dir_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let expected_dir = dir.path().canonicalize().unwrap();

    let process = system(SystemCommandArguments {
        name: "sh".into(),
        dir: dir.path().to_string_lossy().into_owned(),
        args: vec!["-c".into(), "echo $PM_TEST_VAR; pwd -P".into()],
        env: HashMap::from([("PM_TEST_VAR".to_string(), "from-env".to_string())]),
        ..Default::default()
    });
    let messages = collect(process.as_ref()).await;

    assert_eq!(
        text_at(&messages, LEVEL_STDOUT),
        format!("from-env\n{}", expected_dir.display())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multi_line_block_is_one_message() {
    let process = shell("printf '5:::first\\nsecond\\n:::\\n3::public\\n'");
    let messages = collect(process.as_ref()).await;

    let framed: Vec<(u16, &str)> = messages
        .iter()
        .filter(|m| !m.meta.is_terminal())
        .map(|m| (m.level(), m.message.as_str()))
        .collect();
    assert_eq!(framed, vec![(5, "first\nsecond"), (3, "public")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stats_of_running_process() {
    let process = system(SystemCommandArguments {
        name: "sleep".into(),
        args: vec!["5".into()],
        ..Default::default()
    });
    let mut rx = process.run().unwrap();

    let stats = process.as_stater().unwrap().stats();
    assert!(stats.rss > 0);

    process
        .as_signaler()
        .unwrap()
        .signal(nix::sys::signal::Signal::SIGKILL)
        .unwrap();

    let mut last = None;
    while let Some(msg) = rx.recv().await {
        last = Some(msg);
    }
    assert_eq!(last.unwrap().meta.code(), 1000 + 128 + 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_extension_renders_and_runs() {
    let extension = Extension {
        exe: "echo".into(),
        args: vec!["{greeting},".into(), "{name}".into()],
        ..Default::default()
    };
    let cmd = Command::new("ext.greet")
        .with_arguments(&json!({"greeting": "hello", "name": "world"}));
    let process = extension.factory()(env(), cmd);

    let messages = collect(process.as_ref()).await;
    assert_eq!(text_at(&messages, LEVEL_STDOUT), "hello, world");
    assert!(messages.last().unwrap().meta.is(Flag::EXIT_SUCCESS));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_extension_stdin_key() {
    let extension = Extension {
        exe: "cat".into(),
        ..Default::default()
    };
    let cmd = Command::new("ext.cat").with_arguments(&json!({"stdin": "piped through"}));
    let process = extension.factory()(env(), cmd);

    let messages = collect(process.as_ref()).await;
    assert_eq!(text_at(&messages, LEVEL_STDOUT), "piped through");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_arguments_fail_run() {
    let cmd = Command::new("core.system").with_arguments(&json!({"name": 12}));
    let process = SystemProcess::factory()(env(), cmd);
    let err = process.run().err().unwrap();
    assert_eq!(err.code(), 400);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs root and namespace support"]
async fn test_container_channel_round_trip() {
    let scratch = tempfile::tempdir().unwrap();
    let log = scratch.path().join("container.log");

    let args = ContainerCommandArguments {
        name: "/bin/sh".into(),
        args: vec![
            "-c".into(),
            "read line <&3; echo \"$line\" >&4; echo logged".into(),
        ],
        host_network: true,
        log: log.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let cmd = Command::new("core.container").with_arguments(&args);
    let process = ContainerProcess::factory()(env(), cmd);

    let mut rx = process.run().unwrap();
    let container = process.as_container().unwrap();
    assert!(container.pid().is_some());

    let mut channel = container.take_channel().unwrap();
    assert!(container.take_channel().is_none());
    channel.send(&json!({"ping": 1})).unwrap();
    let echoed: Value = channel.receive().unwrap();
    assert_eq!(echoed, json!({"ping": 1}));

    let mut last = None;
    while let Some(msg) = rx.recv().await {
        last = Some(msg);
    }
    assert!(last.unwrap().meta.is(Flag::EXIT_SUCCESS));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let logged = std::fs::read_to_string(&log).unwrap();
    assert_eq!(logged.trim(), "logged");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs root and namespace support"]
async fn test_container_binary_is_namespace_init() {
    let scratch = tempfile::tempdir().unwrap();
    let log = scratch.path().join("container.log");

    let args = ContainerCommandArguments {
        name: "/bin/sh".into(),
        args: vec![
            "-c".into(),
            "echo self=$$; sh -c 'echo first'; sh -c 'echo second'".into(),
        ],
        log: log.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let cmd = Command::new("core.container").with_arguments(&args);
    let process = ContainerProcess::factory()(env(), cmd);

    let mut rx = process.run().unwrap();
    let mut last = None;
    while let Some(msg) = rx.recv().await {
        last = Some(msg);
    }
    assert!(last.unwrap().meta.is(Flag::EXIT_SUCCESS));

    let logged = std::fs::read_to_string(&log).unwrap();
    assert_eq!(logged.lines().collect::<Vec<_>>(), vec!["self=1", "first", "second"]);
}
