use crate::error::{PeriodicError, Result};
use crate::protocol::command::Command;
use crate::protocol::NULL_CHAR;

/// A parsed message body: `msg_id NUL command [NUL payload]`.
///
/// `command` is kept as the raw byte so unrecognized commands can be
/// answered with `UNKNOWN` instead of dropping the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_id: Vec<u8>,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_id: &[u8], command: Command, payload: &[u8]) -> Self {
        Self {
            msg_id: msg_id.to_vec(),
            command: command.as_byte(),
            payload: payload.to_vec(),
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let sep = body
            .iter()
            .position(|&b| b == NULL_CHAR)
            .ok_or_else(|| PeriodicError::Protocol("message without command".to_string()))?;
        let msg_id = body[..sep].to_vec();
        let rest = &body[sep + 1..];
        let (&command, rest) = rest
            .split_first()
            .ok_or_else(|| PeriodicError::Protocol("message without command".to_string()))?;
        let payload = match rest.split_first() {
            None => Vec::new(),
            Some((&NULL_CHAR, payload)) => payload.to_vec(),
            Some(_) => {
                return Err(PeriodicError::Protocol(
                    "missing separator before payload".to_string(),
                ))
            }
        };
        Ok(Self {
            msg_id,
            command,
            payload,
        })
    }

    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.msg_id.len() + self.payload.len() + 3);
        buf.extend_from_slice(&self.msg_id);
        buf.push(NULL_CHAR);
        buf.push(self.command);
        if !self.payload.is_empty() {
            buf.push(NULL_CHAR);
            buf.extend_from_slice(&self.payload);
        }
        buf
    }
}

/// Build a response body carrying only a command.
pub fn command_reply(msg_id: &[u8], command: Command) -> Vec<u8> {
    Message::new(msg_id, command, &[]).to_bytes()
}

/// Build a response body carrying raw error text after the message id.
pub fn error_reply(msg_id: &[u8], err: &PeriodicError) -> Vec<u8> {
    let text = err.to_string();
    let mut buf = Vec::with_capacity(msg_id.len() + text.len() + 1);
    buf.extend_from_slice(msg_id);
    buf.push(NULL_CHAR);
    buf.extend_from_slice(text.as_bytes());
    buf
}
