use std::ops::BitOr;

use serde::{Deserialize, Serialize};

pub const LEVEL_STDOUT: u16 = 1;
pub const LEVEL_STDERR: u16 = 2;
pub const LEVEL_PUBLIC: u16 = 3;
pub const LEVEL_OPERATOR: u16 = 4;
pub const LEVEL_UNKNOWN: u16 = 5;
pub const LEVEL_STRUCTURED: u16 = 6;
pub const LEVEL_WARNING: u16 = 7;
pub const LEVEL_OPS_ERROR: u16 = 8;
pub const LEVEL_CRITICAL: u16 = 9;
pub const LEVEL_STATSD: u16 = 10;
pub const LEVEL_DEBUG: u16 = 11;
pub const LEVEL_RESULT_JSON: u16 = 20;
pub const LEVEL_RESULT_YAML: u16 = 21;
pub const LEVEL_RESULT_TOML: u16 = 22;
pub const LEVEL_RESULT_HRD: u16 = 23;
pub const LEVEL_RESULT_JOB: u16 = 30;

/// Levels whose body is the structured result of a job.
pub const RESULT_LEVELS: [u16; 5] = [
    LEVEL_RESULT_JSON,
    LEVEL_RESULT_YAML,
    LEVEL_RESULT_TOML,
    LEVEL_RESULT_HRD,
    LEVEL_RESULT_JOB,
];

/// Message flags, packed in the low 16 bits of [`Meta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flag(u16);

impl Flag {
    pub const NONE: Flag = Flag(0);
    /// Job output is streamed in real time.
    pub const STREAM: Flag = Flag(1);
    /// Last message of a process that exited successfully.
    pub const EXIT_SUCCESS: Flag = Flag(1 << 1);
    /// Last message of a process that failed.
    pub const EXIT_ERROR: Flag = Flag(1 << 2);

    pub const fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for Flag {
    type Output = Flag;

    fn bitor(self, rhs: Flag) -> Flag {
        Flag(self.0 | rhs.0)
    }
}

/// Packed message metadata.
///
/// Bits 0-15 hold [`Flag`]s, bits 16-31 the level and bits 32-63 an optional
/// status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(u64);

impl Meta {
    pub fn new(level: u16, flags: Flag) -> Self {
        Meta(((level as u64) << 16) | flags.bits() as u64)
    }

    pub fn with_code(code: u32, level: u16, flags: Flag) -> Self {
        Meta(((code as u64) << 32) | Self::new(level, flags).0)
    }

    pub fn from_raw(raw: u64) -> Self {
        Meta(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn level(self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    /// True when the level is one of `levels`.
    pub fn is_level(self, levels: &[u16]) -> bool {
        levels.contains(&self.level())
    }

    /// True when any bit of `flag` is set.
    pub fn is(self, flag: Flag) -> bool {
        (self.0 as u16) & flag.bits() != 0
    }

    pub fn set(self, flag: Flag) -> Meta {
        Meta(self.0 | flag.bits() as u64)
    }

    pub fn code(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The meta without its code half.
    pub fn base(self) -> Meta {
        Meta(self.0 & 0xffff_ffff)
    }

    pub fn is_terminal(self) -> bool {
        self.is(Flag::EXIT_SUCCESS | Flag::EXIT_ERROR)
    }
}

/// A single unit of process output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    /// Nanoseconds since the Unix epoch, stamped when the job forwards it.
    pub epoch: i64,
    pub meta: Meta,
}

impl Message {
    pub fn new(level: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            epoch: 0,
            meta: Meta::new(level, Flag::NONE),
        }
    }

    pub fn with_meta(meta: Meta, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            epoch: 0,
            meta,
        }
    }

    pub fn exit_success() -> Self {
        Self::with_meta(Meta::new(LEVEL_STDOUT, Flag::EXIT_SUCCESS), "")
    }

    pub fn exit_error(code: u32) -> Self {
        Self::with_meta(Meta::with_code(code, LEVEL_STDERR, Flag::EXIT_ERROR), "")
    }

    pub fn level(&self) -> u16 {
        self.meta.level()
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.meta.level(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_packs_level_and_flags() {
        let m = Meta::new(10, Flag::STREAM | Flag::EXIT_SUCCESS);
        assert_eq!(m.level(), 10);
        assert!(m.is(Flag::STREAM));
        assert!(m.is(Flag::EXIT_SUCCESS));
        assert!(!m.is(Flag::EXIT_ERROR));
        assert!(m.is_level(&[10]));
        assert!(!m.is_level(&[20]));
        assert_eq!(m.code(), 0);
    }

    #[test]
    fn meta_with_code_and_base() {
        let m = Meta::with_code(100, 10, Flag::STREAM | Flag::EXIT_ERROR);
        assert_eq!(m.code(), 100);
        assert_eq!(m.level(), 10);
        assert!(m.is_terminal());

        let base = m.base();
        assert_eq!(base.code(), 0);
        assert_eq!(base.level(), 10);
        assert!(base.is(Flag::EXIT_ERROR));
    }

    #[test]
    fn meta_set_adds_flag() {
        let m = Meta::new(LEVEL_STDOUT, Flag::NONE);
        assert!(!m.is(Flag::STREAM));
        let m = m.set(Flag::STREAM);
        assert!(m.is(Flag::STREAM));
        assert_eq!(m.level(), LEVEL_STDOUT);
    }

    #[test]
    fn terminal_messages() {
        assert!(Message::exit_success().meta.is(Flag::EXIT_SUCCESS));
        let err = Message::exit_error(1002);
        assert!(err.meta.is(Flag::EXIT_ERROR));
        assert_eq!(err.meta.code(), 1002);
        assert_eq!(err.level(), LEVEL_STDERR);
    }

    #[test]
    fn message_display_and_serde() {
        let msg = Message::new(LEVEL_DEBUG, "hi");
        assert_eq!(msg.to_string(), "11|hi");

        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, format!(r#"{{"message":"hi","epoch":0,"meta":{}}}"#, 11u64 << 16));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
