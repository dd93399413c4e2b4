//! STOMP 1.2 frame codec for the text WebSocket channel.

use std::fmt;

/// STOMP command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }

    // Header values of CONNECT/CONNECTED are never escaped.
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame decode error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Malformed header line: {0}")]
    MalformedHeader(String),
    #[error("Invalid escape sequence in header")]
    InvalidEscape,
    #[error("Missing header/body separator")]
    MissingSeparator,
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    /// Create a frame with no headers or body.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header. Repeated headers keep the first occurrence.
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame for a virtual host. Heart-beating is disabled.
    #[must_use]
    pub fn connect(host: &str) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", "1.2,1.1,1.0")
            .header("host", host)
            .header("heart-beat", "0,0")
    }

    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    #[must_use]
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    #[must_use]
    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Serialize to the wire representation, NUL-terminated.
    #[must_use]
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                push_escaped(&mut out, name);
                out.push(':');
                push_escaped(&mut out, value);
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get_header("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from a text message.
    ///
    /// # Errors
    /// Returns error if the text is not a STOMP frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        // Leading EOLs are heart-beats.
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (head, rest) = split_head(text).ok_or(DecodeError::MissingSeparator)?;
        let mut lines = head.lines();
        let command_line = lines.next().ok_or(DecodeError::Empty)?.trim_end_matches('\r');
        let command = Command::parse(command_line)
            .ok_or_else(|| DecodeError::UnknownCommand(command_line.to_string()))?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| DecodeError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Self {
            command,
            headers,
            body: String::new(),
        };

        let body = match frame
            .get_header("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(len) if len <= rest.len() && rest.is_char_boundary(len) => &rest[..len],
            _ => rest.split('\0').next().unwrap_or_default(),
        };
        frame.body = body.to_string();
        Ok(frame)
    }
}

/// Whether a text message is only a heart-beat.
#[must_use]
pub fn is_heartbeat(text: &str) -> bool {
    text.chars().all(|c| c == '\n' || c == '\r')
}

fn split_head(text: &str) -> Option<(&str, &str)> {
    let lf = text.find("\n\n").map(|i| (i, 2));
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    let (idx, sep) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 < b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        // A frame with no headers and no body may end right after the command.
        (None, None) => {
            let end = text.find('\0')?;
            let head = text[..end].trim_end_matches(['\r', '\n']);
            return Some((head, ""));
        }
    };
    Some((&text[..idx], &text[idx + sep..]))
}

fn push_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
}

fn unescape(s: &str) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
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
            _ => return Err(DecodeError::InvalidEscape),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_encoding() {
        let wire = StompFrame::send("/app/execute", r#"{"code":"x"}"#).encode();
        assert_eq!(
            wire,
            "SEND\ndestination:/app/execute\ncontent-type:application/json\ncontent-length:12\n\n{\"code\":\"x\"}\0"
        );
    }

    #[test]
    fn test_message_decoding() {
        let wire = "MESSAGE\ndestination:/topic/execution/abc/output\nsubscription:sub-0\nmessage-id:1\ncontent-length:30\n\n{\"type\":\"stdout\",\"data\":\"1\\n\"}\0";
        let frame = StompFrame::decode(wire).unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get_header("subscription"), Some("sub-0"));
        assert_eq!(frame.body, r#"{"type":"stdout","data":"1\n"}"#);
    }

    #[test]
    fn test_body_without_content_length_stops_at_nul() {
        let frame = StompFrame::decode("ERROR\nmessage:bad\n\noops\0\n").unwrap();
        assert_eq!(frame.command, Command::Error);
        assert_eq!(frame.body, "oops");
    }

    #[test]
    fn test_connected_without_headers() {
        let frame = StompFrame::decode("CONNECTED\n\n\0").unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert!(frame.headers.is_empty());
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_crlf_frames() {
        let frame = StompFrame::decode("\r\nCONNECTED\r\nversion:1.2\r\n\r\n\0").unwrap();
        assert_eq!(frame.get_header("version"), Some("1.2"));
    }

    #[test]
    fn test_header_escaping() {
        let frame = StompFrame::new(Command::Send).header("note", "a:b\nc");
        let wire = frame.encode();
        assert!(wire.contains("note:a\\cb\\nc\n"));
        assert_eq!(StompFrame::decode(&wire).unwrap().get_header("note"), Some("a:b\nc"));
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let wire = StompFrame::connect("localhost:8080").encode();
        assert!(wire.contains("host:localhost:8080\n"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(StompFrame::decode("\n"), Err(DecodeError::Empty));
        assert!(matches!(
            StompFrame::decode("HELLO\n\n\0"),
            Err(DecodeError::UnknownCommand(_))
        ));
        assert!(is_heartbeat("\r\n"));
        assert!(!is_heartbeat("MESSAGE\n"));
    }
}
