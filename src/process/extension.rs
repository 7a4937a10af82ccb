use std::collections::HashMap;
use std::sync::Arc;

use nix::sys::signal::Signal;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::error;

use super::{Process, ProcessEnv, ProcessFactory, ProcessStats, Signaler, Stater, SystemProcess};
use crate::command::{Command, SystemCommandArguments};
use crate::error::Result;
use crate::stream::Message;

/// Static part of a registered extension.
#[derive(Debug, Clone, Default)]
pub struct Extension {
    pub exe: String,
    pub dir: String,
    /// Argument templates; `{key}` is replaced by the command argument `key`
    /// and a bare `{}` by the whole argument object.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Extension {
    /// Renders the system arguments for one invocation.
    pub fn render(&self, arguments: &Value) -> SystemCommandArguments {
        let mut input = match arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                error!(arguments = %other, "extension arguments must be an object");
                Map::new()
            }
        };

        let stdin = match input.remove("stdin") {
            Some(Value::String(s)) => s,
            Some(other) => {
                error!(stdin = %other, "invalid stdin to extension command, expecting string");
                String::new()
            }
            None => String::new(),
        };

        let args = self
            .args
            .iter()
            .map(|arg| {
                if arg == "{}" {
                    arguments.to_string()
                } else {
                    format_template(arg, &input)
                }
            })
            .collect();

        SystemCommandArguments {
            name: self.exe.clone(),
            dir: self.dir.clone(),
            args,
            env: self.env.clone(),
            stdin,
        }
    }

    pub fn factory(self) -> ProcessFactory {
        let extension = Arc::new(self);
        Arc::new(move |env: ProcessEnv, cmd: Command| {
            let args = extension.render(&cmd.arguments);
            Arc::new(ExtensionProcess {
                system: SystemProcess::new(env, cmd),
                args,
            }) as Arc<dyn Process>
        })
    }
}

fn format_template(template: &str, input: &Map<String, Value>) -> String {
    input.iter().fold(template.to_string(), |acc, (key, value)| {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        acc.replace(&format!("{{{key}}}"), &rendered)
    })
}

/// A registered executable run as a system process with templated arguments.
pub struct ExtensionProcess {
    system: SystemProcess,
    args: SystemCommandArguments,
}

impl Process for ExtensionProcess {
    fn command(&self) -> &Command {
        self.system.command()
    }

    fn run(&self) -> Result<mpsc::Receiver<Message>> {
        self.system.spawn(&self.args)
    }

    fn as_signaler(&self) -> Option<&dyn Signaler> {
        Some(self)
    }

    fn as_stater(&self) -> Option<&dyn Stater> {
        Some(self)
    }
}

impl Signaler for ExtensionProcess {
    fn signal(&self, signal: Signal) -> Result<()> {
        self.system.signal(signal)
    }
}

impl Stater for ExtensionProcess {
    fn stats(&self) -> ProcessStats {
        self.system.stats()
    }
}
