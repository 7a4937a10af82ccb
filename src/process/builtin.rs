use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use nix::sys::signal::Signal;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

use super::{Process, ProcessEnv, ProcessFactory, Signaler, MESSAGE_BUFFER};
use crate::command::Command;
use crate::error::{Result, CODE_INTERNAL};
use crate::stream::message::{LEVEL_RESULT_JSON, LEVEL_STDOUT};
use crate::stream::{Flag, Message, Meta};

/// An in-process action run as a job.
#[derive(Clone)]
pub enum Runnable {
    Plain(Arc<dyn Fn(&Command) -> Result<Value> + Send + Sync>),
    WithContext(Arc<dyn Fn(&Context) -> Result<Value> + Send + Sync>),
}

impl Runnable {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(&Command) -> Result<Value> + Send + Sync + 'static,
    {
        Runnable::Plain(Arc::new(f))
    }

    pub fn with_context<F>(f: F) -> Self
    where
        F: Fn(&Context) -> Result<Value> + Send + Sync + 'static,
    {
        Runnable::WithContext(Arc::new(f))
    }

    fn call(&self, ctx: &Context) -> Result<Value> {
        match self {
            Runnable::Plain(f) => f(&ctx.command),
            Runnable::WithContext(f) => f(ctx),
        }
    }
}

/// Handle given to actions for streaming intermediate messages.
pub struct Context {
    command: Command,
    tx: mpsc::Sender<Message>,
}

impl Context {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn message(&self, msg: Message) {
        let _ = self.tx.blocking_send(msg);
    }

    /// Logs `text` at `level`, stdout when `None`.
    pub fn log(&self, text: impl Into<String>, level: Option<u16>) {
        self.message(Message::new(level.unwrap_or(LEVEL_STDOUT), text));
    }
}

/// Text of a panic payload.
pub(crate) fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn json_string(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

fn outcome_message(outcome: std::thread::Result<Result<Value>>) -> Message {
    match outcome {
        Ok(Ok(value)) => Message::with_meta(
            Meta::new(LEVEL_RESULT_JSON, Flag::EXIT_SUCCESS),
            value.to_string(),
        ),
        Ok(Err(err)) => {
            let code = match err.code() {
                0 => CODE_INTERNAL,
                code => code,
            };
            Message::with_meta(
                Meta::with_code(code, LEVEL_RESULT_JSON, Flag::EXIT_ERROR),
                json_string(&err.to_string()),
            )
        }
        Err(payload) => {
            let text = panic_text(payload.as_ref());
            error!(panic = %text, "builtin action panicked");
            Message::with_meta(
                Meta::with_code(CODE_INTERNAL, LEVEL_RESULT_JSON, Flag::EXIT_ERROR),
                json_string(&text),
            )
        }
    }
}

/// Runs a registered action on a blocking thread; its return value becomes
/// the single result message.
pub struct BuiltinProcess {
    command: Command,
    runnable: Runnable,
}

impl BuiltinProcess {
    pub fn new(command: Command, runnable: Runnable) -> Self {
        Self { command, runnable }
    }

    pub fn factory(runnable: Runnable) -> ProcessFactory {
        Arc::new(move |_env: ProcessEnv, cmd: Command| {
            Arc::new(BuiltinProcess::new(cmd, runnable.clone())) as Arc<dyn Process>
        })
    }
}

impl Process for BuiltinProcess {
    fn command(&self) -> &Command {
        &self.command
    }

    fn run(&self) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let ctx = Context {
            command: self.command.clone(),
            tx: tx.clone(),
        };
        let runnable = self.runnable.clone();

        tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| runnable.call(&ctx)));
            drop(ctx);
            let _ = tx.blocking_send(outcome_message(outcome));
        });

        Ok(rx)
    }

    fn as_signaler(&self) -> Option<&dyn Signaler> {
        Some(self)
    }
}

impl Signaler for BuiltinProcess {
    /// Actions can't be interrupted; signals are accepted and dropped.
    fn signal(&self, _signal: Signal) -> Result<()> {
        Ok(())
    }
}
