//! STOMP frame codec.
//!
//! Frames have the shape
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! where `^@` is a NUL byte. Bare end-of-line sequences between frames
//! are heart-beats. Header values are escaped per STOMP 1.2 except in
//! `CONNECT` and `CONNECTED` frames.

use std::time::Duration;

/// The STOMP commands this client sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        match s {
            "CONNECT" => Ok(Self::Connect),
            "CONNECTED" => Ok(Self::Connected),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "DISCONNECT" => Ok(Self::Disconnect),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }

    /// `CONNECT` and `CONNECTED` carry raw header values.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

/// Errors produced while decoding STOMP frames.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown STOMP command {0:?}")]
    UnknownCommand(String),

    #[error("malformed header line {0:?}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),

    #[error("frame is not NUL-terminated")]
    Unterminated,

    #[error("content-length {declared} exceeds body of {available} bytes")]
    ContentLength { declared: usize, available: usize },
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header with this name (repeated headers: first wins).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to wire text, including the trailing NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Build the client `CONNECT` frame.
pub fn connect_frame(host: &str, heart_beat: HeartBeat) -> Frame {
    Frame::new(Command::Connect)
        .with_header("accept-version", "1.2,1.1,1.0")
        .with_header("host", host)
        .with_header("heart-beat", heart_beat.header_value())
}

pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .with_header("id", id)
        .with_header("destination", destination)
        .with_header("ack", "auto")
}

pub fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new(Command::Unsubscribe).with_header("id", id)
}

pub fn disconnect_frame() -> Frame {
    Frame::new(Command::Disconnect)
}

/// Decode every frame contained in one transport message.
///
/// Heart-beat EOLs between frames are skipped, so a message consisting
/// only of heart-beats yields an empty vector.
pub fn decode_frames(text: &str) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut rest = text;

    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remaining) = decode_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn decode_one(text: &str) -> Result<(Frame, &str), FrameError> {
    let (head, after_head) = split_head(text)?;
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command = Command::parse(lines.next().unwrap_or_default())?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if unescape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let declared = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.trim().parse::<usize>().ok());

    let (body, remaining) = match declared {
        Some(len) => {
            let available = after_head.len();
            if len >= available || !after_head.is_char_boundary(len) {
                return Err(FrameError::ContentLength {
                    declared: len,
                    available,
                });
            }
            if after_head.as_bytes()[len] != 0 {
                return Err(FrameError::Unterminated);
            }
            (&after_head[..len], &after_head[len + 1..])
        }
        None => {
            let end = after_head.find('\0').ok_or(FrameError::Unterminated)?;
            (&after_head[..end], &after_head[end + 1..])
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        remaining,
    ))
}

/// Split a frame into its command+header block and everything after the
/// blank line.
fn split_head(text: &str) -> Result<(&str, &str), FrameError> {
    let lf = text.find("\n\n").map(|pos| (pos, 2));
    let crlf = text.find("\r\n\r\n").map(|pos| (pos, 4));
    let (pos, sep) = match (lf, crlf) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => return Err(FrameError::Unterminated),
    };
    Ok((&text[..pos], &text[pos + sep..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Heart-beats
// ---------------------------------------------------------------------------

/// Heart-beat intervals in one direction pair. Zero disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    /// How often this side sends heart-beats.
    pub outgoing: Duration,
    /// How often this side wants to receive heart-beats.
    pub incoming: Duration,
}

impl HeartBeat {
    pub const DISABLED: Self = Self {
        outgoing: Duration::ZERO,
        incoming: Duration::ZERO,
    };

    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    /// Parse a `heart-beat: cx,cy` header value. Unparseable values
    /// disable heart-beating.
    pub fn parse(value: &str) -> Self {
        let mut parts = value.split(',').map(|p| p.trim().parse::<u64>());
        match (parts.next(), parts.next()) {
            (Some(Ok(out)), Some(Ok(inc))) => Self {
                outgoing: Duration::from_millis(out),
                incoming: Duration::from_millis(inc),
            },
            _ => Self::DISABLED,
        }
    }

    /// Negotiate the effective intervals from the client's request and the
    /// server's `CONNECTED` header.
    ///
    /// The client sends every `max(client.outgoing, server.incoming)` and
    /// expects traffic every `max(client.incoming, server.outgoing)`; a zero
    /// on either side disables that direction.
    pub fn negotiate(client: Self, server: Self) -> Self {
        let pick = |a: Duration, b: Duration| {
            if a.is_zero() || b.is_zero() {
                Duration::ZERO
            } else {
                a.max(b)
            }
        };
        Self {
            outgoing: pick(client.outgoing, server.incoming),
            incoming: pick(client.incoming, server.outgoing),
        }
    }
}
