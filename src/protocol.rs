//! Line protocol spoken with the automation service.
//!
//! A request is one line: the command name followed by tab-separated fields,
//! some of them `key=value` pairs. The service answers with zero or more
//! payload lines and then a terminator line, either `ACK` or
//! `NAK\t<CODE>\t<message>`. Fields cannot carry tabs or line breaks, so those
//! are rejected before anything is written to the socket.

use std::fmt;

pub const ACK: &str = "ACK";
pub const NAK: &str = "NAK";

/// Sent while a `WAIT_*` request is pending to make the service end it early.
pub const ABORT_LINE: &[u8] = b"ABORT\n";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Field '{field}' contains a tab or line break")]
    InvalidField { field: String },

    #[error("Reply is not valid UTF-8")]
    NotUtf8,

    #[error("Malformed reply line '{0}'")]
    MalformedLine(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCode {
    UnknownAnalyzer,
    InvalidSettings,
    UnknownCapture,
    NoDevice,
    Io,
    Aborted,
    Other(String),
}

impl RemoteCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "UNKNOWN_ANALYZER" => Self::UnknownAnalyzer,
            "INVALID_SETTINGS" => Self::InvalidSettings,
            "UNKNOWN_CAPTURE" => Self::UnknownCapture,
            "NO_DEVICE" => Self::NoDevice,
            "IO" => Self::Io,
            "ABORTED" => Self::Aborted,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::UnknownAnalyzer => "UNKNOWN_ANALYZER",
            Self::InvalidSettings => "INVALID_SETTINGS",
            Self::UnknownCapture => "UNKNOWN_CAPTURE",
            Self::NoDevice => "NO_DEVICE",
            Self::Io => "IO",
            Self::Aborted => "ABORTED",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for RemoteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request line under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    command: &'static str,
    fields: Vec<String>,
}

impl Request {
    pub fn new(command: &'static str) -> Self {
        Self {
            command,
            fields: Vec::new(),
        }
    }

    pub fn command(&self) -> &'static str {
        self.command
    }

    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.fields.push(value.to_string());
        self
    }

    pub fn kv(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.fields.push(format!("{key}={value}"));
        self
    }

    pub fn kv_opt<T: fmt::Display>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.kv(key, value),
            None => self,
        }
    }

    /// Comma separated list, e.g. `digital=0,1,4`.
    pub fn kv_list<T: fmt::Display>(self, key: &str, values: impl IntoIterator<Item = T>) -> Self {
        let joined = values
            .into_iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.kv(key, joined)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut line = String::from(self.command);
        for field in &self.fields {
            if field.contains(['\t', '\n', '\r']) {
                return Err(ProtocolError::InvalidField {
                    field: field.clone(),
                });
            }
            line.push('\t');
            line.push_str(field);
        }
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack {
        payload: Vec<String>,
    },
    Nak {
        code: RemoteCode,
        message: String,
        payload: Vec<String>,
    },
}

impl Reply {
    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack { .. })
    }
}

/// Accumulates bytes from the socket until a full reply is available.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    partial: Vec<u8>,
    payload: Vec<String>,
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes. Returns a reply as soon as its terminator line has
    /// been seen; bytes after the terminator stay buffered for the next reply.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<Reply>, ProtocolError> {
        self.partial.extend_from_slice(bytes);

        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=newline).collect();
            let line = std::str::from_utf8(&raw[..raw.len() - 1])
                .map_err(|_| ProtocolError::NotUtf8)?
                .trim_end_matches('\r');

            if line == ACK {
                return Ok(Some(Reply::Ack {
                    payload: std::mem::take(&mut self.payload),
                }));
            }
            if line == NAK || line.starts_with("NAK\t") {
                let mut parts = line.splitn(3, '\t').skip(1);
                let code = parts
                    .next()
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| ProtocolError::MalformedLine(line.to_string()))?;
                let message = parts.next().unwrap_or_default().to_string();
                return Ok(Some(Reply::Nak {
                    code: RemoteCode::parse(code),
                    message,
                    payload: std::mem::take(&mut self.payload),
                }));
            }
            self.payload.push(line.to_string());
        }

        Ok(None)
    }

    /// Bytes received so far, for timeout diagnostics.
    pub fn pending_text(&self) -> String {
        let mut text = self.payload.join("\n");
        if !self.partial.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.partial));
        }
        text
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.payload.clear();
    }
}

/// Split a payload line on tabs.
pub fn split_fields(line: &str) -> Vec<&str> {
    line.split('\t').collect()
}
