//! Command protocol for host-sandbox communication.
//!
//! ## Wire Format
//!
//! ```text
//! {"cmd_id":"<32-hex>","cmd":"<namespace>.<verb>","reply":false,...fields}\n
//! ```
//!
//! One JSON object per line, in both directions. Three header keys are
//! mandatory; every other key is a command-specific field.
//!
//! | Key      | Type   | Meaning                                         |
//! |----------|--------|-------------------------------------------------|
//! | `cmd`    | string | action name, `<namespace>.<verb>`               |
//! | `cmd_id` | string | correlation token, copied verbatim into replies |
//! | `reply`  | bool   | `true` for replies, `false` for requests        |
//!
//! Replies reuse the request's `cmd` and `cmd_id` and usually carry
//! `success` and, on failure, `reason`.

use serde_json::{Map, Value};

pub const FIELD_CMD: &str = "cmd";
pub const FIELD_CMD_ID: &str = "cmd_id";
pub const FIELD_REPLY: &str = "reply";

/// Name given to commands built without an explicit action.
pub const DEFAULT_CMD: &str = "unknown";

/// Default cap on a single buffered line (1 MiB).
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Protocol error. Always fatal for the sandbox that produced the input.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("command is not a JSON object")]
    NotAnObject,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line too long: {0} bytes")]
    LineTooLong(usize),
}

/// A command field that is absent or has the wrong type.
///
/// Handlers turn these into `success: false` replies; they are never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("'{0}' must be given.")]
    Missing(String),

    #[error("'{field}' must be {expected}.")]
    WrongType {
        field: String,
        expected: &'static str,
    },
}

impl FieldError {
    fn wrong_type(field: &str, expected: &'static str) -> Self {
        Self::WrongType {
            field: field.to_string(),
            expected,
        }
    }
}

/// A single request or reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub cmd_id: String,
    pub cmd: String,
    pub reply: bool,
    fields: Map<String, Value>,
}

impl Command {
    /// Build an outbound request with a fresh id.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd_id: Self::generate_id(),
            cmd: cmd.into(),
            reply: false,
            fields: Map::new(),
        }
    }

    /// A fresh 32-hex-char correlation token.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Start a reply to this command: same `cmd_id` and `cmd`, `reply` set.
    pub fn reply_to(&self) -> Self {
        Self {
            cmd_id: self.cmd_id.clone(),
            cmd: self.cmd.clone(),
            reply: true,
            fields: Map::new(),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a field. Header keys are not fields and are ignored here.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        if is_header(key) {
            return;
        }
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Split `cmd` on the first `.` into `(namespace, verb)`.
    ///
    /// A name without a dot is all namespace and an empty verb.
    pub fn route(&self) -> (&str, &str) {
        self.cmd.split_once('.').unwrap_or((self.cmd.as_str(), ""))
    }

    /// String field; `null` and absent both read as `None`.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>, FieldError> {
        match self.fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(FieldError::wrong_type(key, "a string")),
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str, FieldError> {
        self.get_str(key)?
            .ok_or_else(|| FieldError::Missing(key.to_string()))
    }

    /// Integer field. Floats with a fractional part are rejected.
    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, FieldError> {
        match self.fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| FieldError::wrong_type(key, "an integer")),
            Some(_) => Err(FieldError::wrong_type(key, "an integer")),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, FieldError> {
        match self.fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(FieldError::wrong_type(key, "true or false")),
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::new(DEFAULT_CMD)
    }
}

fn is_header(key: &str) -> bool {
    key == FIELD_CMD || key == FIELD_CMD_ID || key == FIELD_REPLY
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a command as a single JSON object (no trailing newline).
pub fn encode(command: &Command) -> Vec<u8> {
    let mut map = command.fields.clone();
    map.insert(FIELD_CMD_ID.to_string(), Value::from(command.cmd_id.as_str()));
    map.insert(FIELD_CMD.to_string(), Value::from(command.cmd.as_str()));
    map.insert(FIELD_REPLY.to_string(), Value::Bool(command.reply));
    Value::Object(map).to_string().into_bytes()
}

/// Encode a command followed by `\n`.
pub fn encode_line(command: &Command) -> Vec<u8> {
    let mut line = encode(command);
    line.push(b'\n');
    line
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one JSON command.
///
/// Header presence is checked before header types, in the order `cmd`,
/// `cmd_id`, `reply`; the first absent key is reported.
pub fn decode(data: &[u8]) -> Result<Command, ProtocolError> {
    let Value::Object(mut fields) = serde_json::from_slice::<Value>(data)? else {
        return Err(ProtocolError::NotAnObject);
    };

    let cmd = fields.remove(FIELD_CMD);
    let cmd_id = fields.remove(FIELD_CMD_ID);
    let reply = fields.remove(FIELD_REPLY);

    let cmd = cmd.ok_or(ProtocolError::MissingField(FIELD_CMD))?;
    let cmd_id = cmd_id.ok_or(ProtocolError::MissingField(FIELD_CMD_ID))?;
    let reply = reply.ok_or(ProtocolError::MissingField(FIELD_REPLY))?;

    let Value::String(cmd) = cmd else {
        return Err(ProtocolError::InvalidField(FIELD_CMD));
    };
    let Value::String(cmd_id) = cmd_id else {
        return Err(ProtocolError::InvalidField(FIELD_CMD_ID));
    };
    let Value::Bool(reply) = reply else {
        return Err(ProtocolError::InvalidField(FIELD_REPLY));
    };

    Ok(Command {
        cmd_id,
        cmd,
        reply,
        fields,
    })
}

// ---------------------------------------------------------------------------
// LineDecoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Splits a byte stream into lines.
///
/// Blank lines are dropped and a trailing `\r` is stripped.
pub struct LineDecoder {
    buf: Vec<u8>,
    max_line: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_line,
        }
    }

    /// Feed data and extract complete lines.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        let mut offset = 0;

        while let Some(pos) = self
            .buf
            .get(offset..)
            .and_then(|rest| rest.iter().position(|&b| b == b'\n'))
        {
            let end = offset + pos;
            if pos > self.max_line {
                self.buf.clear();
                return Err(ProtocolError::LineTooLong(pos));
            }
            if let Some(line) = self.buf.get(offset..end).and_then(trim_line) {
                lines.push(line.to_vec());
            }
            offset = end + 1;
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset);
        }

        if self.buf.len() > self.max_line {
            let len = self.buf.len();
            self.buf.clear();
            return Err(ProtocolError::LineTooLong(len));
        }

        Ok(lines)
    }

    /// Take whatever is buffered after the stream closed without a final `\n`.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buf);
        trim_line(&rest).map(<[u8]>::to_vec)
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_line(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(line)
    }
}
