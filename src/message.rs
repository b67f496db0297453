//! Parsed syslog message, the unit of everything the server stores and ships.
//!
//! A [`Message`] keeps the raw RFC 5424 encoding it arrived with. The raw
//! bytes are what replication frames, snapshot files, and API responses
//! carry, so a message is never re-encoded after ingest. Only the header
//! fields the server keys and filters on (APP-NAME, PROCID, MSGID) are
//! parsed out; structured data and the free-text body stay opaque.
//!
//! Messages are immutable once constructed and are shared by
//! `Arc<Message>` between ring buffers, subscriber queues, and in-flight
//! snapshots.

use bytes::Bytes;

/// RFC 5424 NILVALUE, a field explicitly marked absent.
pub const NILVALUE: &str = "-";

/// Largest PRI value allowed by RFC 5424 (facility 23, severity 7).
const MAX_PRI: u16 = 191;

/// Errors from parsing an RFC 5424 message header.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed priority tag")]
    InvalidPriority,

    #[error("unsupported syslog version")]
    UnsupportedVersion,

    #[error("missing {0} field")]
    MissingField(&'static str),

    #[error("{0} field is not valid UTF-8")]
    FieldNotUtf8(&'static str),
}

/// An immutable syslog message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    raw: Bytes,
    app_name: String,
    proc_id: Option<String>,
    msg_id: Option<String>,
}

impl Message {
    /// Parses the header of an RFC 5424 encoded message.
    ///
    /// Everything after the MSGID field (structured data and the message
    /// body) is left unparsed inside the retained raw bytes.
    pub fn parse(raw: Bytes) -> Result<Message, ParseError> {
        let mut fields = Fields { rest: &raw };

        let pri_version = fields.next("priority")?;
        parse_pri_version(pri_version)?;

        fields.next("timestamp")?;
        fields.next("hostname")?;
        let app_name = field_str(fields.next("app name")?, "app name")?.to_string();
        let proc_id = optional_str(field_str(fields.next("proc id")?, "proc id")?);
        let msg_id = optional_str(field_str(fields.next("msg id")?, "msg id")?);

        Ok(Message {
            raw,
            app_name,
            proc_id,
            msg_id,
        })
    }

    /// Builds a message with NILVALUE timestamp, hostname, and proc id.
    pub fn new(app_name: &str, body: &str) -> Message {
        Message::with_proc_id(app_name, NILVALUE, body)
    }

    /// Builds a message carrying a PROCID, which query filters match on.
    pub fn with_proc_id(app_name: &str, proc_id: &str, body: &str) -> Message {
        let mut line = format!("<134>1 - - {app_name} {proc_id} - -");
        if !body.is_empty() {
            line.push(' ');
            line.push_str(body);
        }
        Message {
            raw: Bytes::from(line.into_bytes()),
            app_name: app_name.to_string(),
            proc_id: optional_str(proc_id),
            msg_id: None,
        }
    }

    /// The APP-NAME header field, used as the buffer key. The key is
    /// opaque; NILVALUE is a valid key of its own.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn proc_id(&self) -> Option<&str> {
        self.proc_id.as_deref()
    }

    pub fn msg_id(&self) -> Option<&str> {
        self.msg_id.as_deref()
    }

    /// The full RFC 5424 encoding this message arrived with. Cheap to
    /// clone, the underlying storage is shared.
    pub fn encoded(&self) -> Bytes {
        self.raw.clone()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn next(&mut self, name: &'static str) -> Result<&'a [u8], ParseError> {
        if self.rest.is_empty() {
            return Err(ParseError::MissingField(name));
        }
        match self.rest.iter().position(|&b| b == b' ') {
            Some(0) => Err(ParseError::MissingField(name)),
            Some(at) => {
                let field = &self.rest[..at];
                self.rest = &self.rest[at + 1..];
                Ok(field)
            }
            None => {
                let field = self.rest;
                self.rest = &[];
                Ok(field)
            }
        }
    }
}

fn field_str<'a>(field: &'a [u8], name: &'static str) -> Result<&'a str, ParseError> {
    std::str::from_utf8(field).map_err(|_| ParseError::FieldNotUtf8(name))
}

fn optional_str(field: &str) -> Option<String> {
    if field == NILVALUE {
        None
    } else {
        Some(field.to_string())
    }
}

fn parse_pri_version(field: &[u8]) -> Result<(), ParseError> {
    let field = field_str(field, "priority")?;
    let rest = field.strip_prefix('<').ok_or(ParseError::InvalidPriority)?;
    let (pri, version) = rest.split_once('>').ok_or(ParseError::InvalidPriority)?;
    if pri.is_empty() || pri.len() > 3 {
        return Err(ParseError::InvalidPriority);
    }
    let pri: u16 = pri.parse().map_err(|_| ParseError::InvalidPriority)?;
    if pri > MAX_PRI {
        return Err(ParseError::InvalidPriority);
    }
    if version != "1" {
        return Err(ParseError::UnsupportedVersion);
    }
    Ok(())
}
