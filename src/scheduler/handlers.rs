use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::Command;
use crate::result::JobResult;
use crate::stream::message::LEVEL_STATSD;
use crate::stream::Message;

/// Average of the samples over the flush period.
pub const OPERATION_AVERAGE: &str = "A";
/// Difference between consecutive samples.
pub const OPERATION_DIFFERENCE: &str = "D";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Sees, and may rewrite, every command before it becomes a job.
pub trait PreHandler: Send + Sync {
    fn pre(&self, cmd: &mut Command);
}

pub trait ResultHandler: Send + Sync {
    fn result(&self, cmd: &Command, result: &JobResult);
}

pub trait MessageHandler: Send + Sync {
    fn message(&self, cmd: &Command, msg: &Message);
}

pub trait StatsHandler: Send + Sync {
    fn stats(&self, operation: &str, key: &str, value: f64, id: &str, tags: &[Tag]);
}

/// One parsed statsd line: `key:value|op[|tag=v,id=x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSample {
    pub operation: String,
    pub key: String,
    pub value: f64,
    pub id: String,
    pub tags: Vec<Tag>,
}

pub fn parse_statsd(line: &str) -> std::result::Result<StatsSample, String> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 2 {
        return Err(format!("expecting data|type[|options], got '{line}'"));
    }

    let (key, value) = parts[0]
        .split_once(':')
        .ok_or_else(|| format!("expecting key:value, got '{}'", parts[0]))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("value is not a number in '{line}'"))?;

    let mut sample = StatsSample {
        operation: parts[1].trim().to_string(),
        key: key.trim().to_string(),
        value,
        id: String::new(),
        tags: Vec::new(),
    };

    if let Some(options) = parts.get(2).filter(|o| !o.is_empty()) {
        for option in options.split(',') {
            let (k, v) = option.split_once('=').unwrap_or((option, ""));
            if k == "id" {
                sample.id = v.to_string();
            } else {
                sample.tags.push(Tag {
                    key: k.to_string(),
                    value: v.to_string(),
                });
            }
        }
    }

    Ok(sample)
}

/// Registered handlers, shared between the manager and its jobs.
#[derive(Default)]
pub struct Handlers {
    pre: RwLock<Vec<Arc<dyn PreHandler>>>,
    result: RwLock<Vec<Arc<dyn ResultHandler>>>,
    message: RwLock<Vec<Arc<dyn MessageHandler>>>,
    stats: RwLock<Vec<Arc<dyn StatsHandler>>>,
}

fn snapshot<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    list.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(handler = kind, "handler panicked");
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre(&self, handler: Arc<dyn PreHandler>) {
        self.pre.write().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    pub fn add_result(&self, handler: Arc<dyn ResultHandler>) {
        self.result.write().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    pub fn add_message(&self, handler: Arc<dyn MessageHandler>) {
        self.message.write().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    pub fn add_stats(&self, handler: Arc<dyn StatsHandler>) {
        self.stats.write().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    pub(crate) fn pre(&self, cmd: &mut Command) {
        for handler in snapshot(&self.pre) {
            handler.pre(cmd);
        }
    }

    pub(crate) fn result(&self, cmd: &Command, result: &JobResult) {
        for handler in snapshot(&self.result) {
            guarded("result", || handler.result(cmd, result));
        }
    }

    /// Feeds statsd lines to the stats handlers, then hands the message to
    /// every message handler.
    pub(crate) fn message(&self, cmd: &Command, msg: &Message) {
        if msg.level() == LEVEL_STATSD {
            match parse_statsd(&msg.message) {
                Ok(sample) => self.aggregate(
                    &sample.operation,
                    &sample.key,
                    sample.value,
                    &sample.id,
                    &sample.tags,
                ),
                Err(e) => warn!(job_id = %cmd.id, error = %e, "invalid statsd message"),
            }
        }

        for handler in snapshot(&self.message) {
            guarded("message", || handler.message(cmd, msg));
        }
    }

    pub fn aggregate(&self, operation: &str, key: &str, value: f64, id: &str, tags: &[Tag]) {
        for handler in snapshot(&self.stats) {
            guarded("stats", || handler.stats(operation, key, value, id, tags));
        }
    }
}
