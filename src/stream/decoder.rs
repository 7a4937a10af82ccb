use std::io::Read;
use std::sync::OnceLock;

use regex::Regex;

use super::message::{Flag, Message, Meta};

const IO_BUFFER_SIZE: usize = 32 * 1024;
const MULTI_LINE_TERMINATOR: &str = ":::";

fn header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)(:{2,3})(.*)$").expect("static header pattern"))
}

enum Line {
    Plain(String),
    Single(u16, String),
    MultiStart(u16, String),
}

fn classify(line: &str) -> Line {
    let Some(caps) = header_pattern().captures(line) else {
        return Line::Plain(line.to_string());
    };

    let Ok(level) = caps[1].parse::<u16>() else {
        return Line::Plain(line.to_string());
    };

    let body = caps[3].to_string();
    if &caps[2] == ":::" {
        Line::MultiStart(level, body)
    } else {
        Line::Single(level, body)
    }
}

/// Incremental decoder for one output stream of a child process.
///
/// Every call to [`Decoder::feed`] corresponds to one write of the child.
/// Incomplete trailing lines are kept until the next feed. Plain lines are
/// collected into a single message per feed at the stream's default level.
pub struct Decoder {
    level: u16,
    partial: Vec<u8>,
    multi: Option<Message>,
}

impl Decoder {
    pub fn new(level: u16) -> Self {
        Self {
            level,
            partial: Vec::new(),
            multi: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Message> {
        self.partial.extend_from_slice(chunk);

        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();
        let text = String::from_utf8_lossy(&complete[..complete.len() - 1]).into_owned();

        let mut out = Vec::new();
        let mut plain: Vec<String> = Vec::new();
        for line in text.split('\n') {
            self.process_line(line, &mut plain, &mut out);
        }
        self.flush_plain(&mut plain, &mut out);
        out
    }

    /// Flushes whatever is left once the stream reached EOF.
    ///
    /// A trailing line without a newline is processed as a complete line,
    /// and an unterminated multi-line block is emitted as it stands.
    pub fn finish(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        let mut plain = Vec::new();

        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.process_line(&line, &mut plain, &mut out);
        }
        self.flush_plain(&mut plain, &mut out);

        if let Some(multi) = self.multi.take() {
            out.push(multi);
        }
        out
    }

    fn process_line(&mut self, line: &str, plain: &mut Vec<String>, out: &mut Vec<Message>) {
        if line == MULTI_LINE_TERMINATOR {
            if let Some(done) = self.multi.take() {
                out.push(done);
                return;
            }
        }
        if let Some(multi) = self.multi.as_mut() {
            multi.message.push('\n');
            multi.message.push_str(line);
            return;
        }

        match classify(line) {
            Line::Plain(text) => plain.push(text),
            Line::Single(level, body) => {
                self.flush_plain(plain, out);
                out.push(Message::with_meta(Meta::new(level, Flag::NONE), body));
            }
            Line::MultiStart(level, body) => {
                self.flush_plain(plain, out);
                self.multi = Some(Message::with_meta(Meta::new(level, Flag::NONE), body));
            }
        }
    }

    fn flush_plain(&self, plain: &mut Vec<String>, out: &mut Vec<Message>) {
        if plain.is_empty() {
            return;
        }
        out.push(Message::new(self.level, plain.join("\n")));
        plain.clear();
    }
}

/// Reads `source` to EOF, decoding it at `level` and handing every message to
/// `handler`. Blocking; run it on a blocking thread.
pub fn consume<R, F>(mut source: R, level: u16, mut handler: F) -> std::io::Result<()>
where
    R: Read,
    F: FnMut(Message),
{
    let mut decoder = Decoder::new(level);
    let mut buf = vec![0u8; IO_BUFFER_SIZE];

    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                decoder.finish().into_iter().for_each(&mut handler);
                return Err(e);
            }
        };
        decoder.feed(&buf[..n]).into_iter().for_each(&mut handler);
    }

    decoder.finish().into_iter().for_each(&mut handler);
    Ok(())
}
