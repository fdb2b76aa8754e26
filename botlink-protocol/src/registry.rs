//! Command registry interface.
//!
//! A higher layer describes each robot command (opcode, reply shape, how to
//! encode parameters and decode the reply). The transport layer treats these
//! rules as opaque: it only needs the resulting [`Command`] and hands the
//! matched [`Response`] back to the entry's decoder.

use crate::message::{Command, Response};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by registry lookups and entry encoders/decoders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command already registered: {0}")]
    DuplicateName(String),

    #[error("invalid parameters for {command}: {reason}")]
    InvalidParams { command: String, reason: String },

    #[error("invalid reply for {command}: {reason}")]
    InvalidReply { command: String, reason: String },
}

/// Turns JSON parameters into a command payload.
pub type EncodeFn = Arc<dyn Fn(&Value) -> Result<Bytes, String> + Send + Sync>;

/// Turns a matched reply into a JSON value.
pub type DecodeFn = Arc<dyn Fn(&Response) -> Result<Value, String> + Send + Sync>;

/// Encode/decode rules for one named command.
#[derive(Clone)]
pub struct CommandEntry {
    name: String,
    opcode: u8,
    reply_opcode: Option<u8>,
    sequenced: bool,
    status_offset: Option<usize>,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl CommandEntry {
    /// Creates an entry replying with the same opcode, sending `{"payload": [..]}`
    /// parameters verbatim and returning the reply payload as a byte array.
    pub fn new(name: impl Into<String>, opcode: u8) -> Self {
        Self {
            name: name.into(),
            opcode,
            reply_opcode: Some(opcode),
            sequenced: false,
            status_offset: None,
            encode: Arc::new(raw_payload),
            decode: Arc::new(|response: &Response| -> Result<Value, String> {
                Ok(json!({ "payload": response.payload().to_vec() }))
            }),
        }
    }

    pub fn with_reply_opcode(mut self, opcode: u8) -> Self {
        self.reply_opcode = Some(opcode);
        self
    }

    pub fn without_response(mut self) -> Self {
        self.reply_opcode = None;
        self
    }

    /// Prefixes the payload with a sequence counter echoed by the reply.
    pub fn sequenced(mut self) -> Self {
        self.sequenced = true;
        self
    }

    pub fn with_status_at(mut self, offset: usize) -> Self {
        self.status_offset = Some(offset);
        self
    }

    pub fn with_encoder<F>(mut self, encode: F) -> Self
    where
        F: Fn(&Value) -> Result<Bytes, String> + Send + Sync + 'static,
    {
        self.encode = Arc::new(encode);
        self
    }

    pub fn with_decoder<F>(mut self, decode: F) -> Self
    where
        F: Fn(&Response) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.decode = Arc::new(decode);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn is_sequenced(&self) -> bool {
        self.sequenced
    }

    pub fn expects_response(&self) -> bool {
        self.reply_opcode.is_some()
    }

    /// Builds the command for `params`.
    ///
    /// `sequence` is only consulted for sequenced entries.
    pub fn build(&self, params: &Value, sequence: Option<u32>) -> Result<Command, RegistryError> {
        let body = (self.encode)(params).map_err(|reason| RegistryError::InvalidParams {
            command: self.name.clone(),
            reason,
        })?;

        let command = match (self.sequenced, sequence) {
            (true, Some(seq)) => Command::sequenced(self.opcode, seq, &body),
            (true, None) => {
                return Err(RegistryError::InvalidParams {
                    command: self.name.clone(),
                    reason: "sequenced command built without a sequence number".to_string(),
                })
            }
            (false, _) => Command::new(self.opcode, body),
        };

        Ok(match self.reply_opcode {
            None => command.without_response(),
            Some(reply) => {
                let command = command.with_reply_opcode(reply);
                match self.status_offset {
                    Some(offset) => command.with_status_at(offset),
                    None => command,
                }
            }
        })
    }

    /// Decodes a matched reply.
    pub fn decode(&self, response: &Response) -> Result<Value, RegistryError> {
        (self.decode)(response).map_err(|reason| RegistryError::InvalidReply {
            command: self.name.clone(),
            reason,
        })
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.name)
            .field("opcode", &self.opcode)
            .field("reply_opcode", &self.reply_opcode)
            .field("sequenced", &self.sequenced)
            .field("status_offset", &self.status_offset)
            .finish_non_exhaustive()
    }
}

/// Default encoder: `null`, `{}` or `{"payload": [u8, ...]}`.
fn raw_payload(params: &Value) -> Result<Bytes, String> {
    let bytes = match params.get("payload") {
        None => return Ok(Bytes::new()),
        Some(Value::Array(items)) => items,
        Some(other) => return Err(format!("payload must be a byte array, got {}", other)),
    };

    bytes
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| format!("payload item {} is not a byte", item))
        })
        .collect::<Result<Vec<u8>, String>>()
        .map(Bytes::from)
}

/// Named command entries.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    entries: BTreeMap<String, CommandEntry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry; names are unique.
    pub fn register(&mut self, entry: CommandEntry) -> Result<(), RegistryError> {
        if self.entries.contains_key(entry.name()) {
            return Err(RegistryError::DuplicateName(entry.name().to_string()));
        }
        self.entries.insert(entry.name().to_string(), entry);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, entry: CommandEntry) -> Result<Self, RegistryError> {
        self.register(entry)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<&CommandEntry, RegistryError> {
        self.entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownCommand(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CorrelationKey, ResponseStatus};
    use crate::packet::Packet;

    fn get_name() -> CommandEntry {
        CommandEntry::new("get_name", 0x01).with_decoder(|response| {
            let name = std::str::from_utf8(response.payload()).map_err(|e| e.to_string())?;
            Ok(json!({ "name": name.trim_end_matches('\0') }))
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = CommandRegistry::new()
            .with(get_name())
            .unwrap()
            .with(CommandEntry::new("turn_off", 0x72).without_response())
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["get_name", "turn_off"]);
        assert_eq!(registry.get("get_name").unwrap().opcode(), 0x01);
        assert!(!registry.get("turn_off").unwrap().expects_response());
        assert_eq!(
            registry.get("fly").unwrap_err(),
            RegistryError::UnknownCommand("fly".to_string())
        );
    }

    #[test]
    fn test_duplicate_name() {
        let mut registry = CommandRegistry::new();
        registry.register(get_name()).unwrap();
        let result = registry.register(CommandEntry::new("get_name", 0x09));
        assert_eq!(
            result,
            Err(RegistryError::DuplicateName("get_name".to_string()))
        );
    }

    #[test]
    fn test_build_default_encoder() {
        let entry = CommandEntry::new("raw", 0x10);

        let cmd = entry.build(&Value::Null, None).unwrap();
        assert!(cmd.payload().is_empty());

        let cmd = entry.build(&json!({ "payload": [1, 2, 255] }), None).unwrap();
        assert_eq!(&cmd.payload()[..], &[1, 2, 255]);

        let err = entry.build(&json!({ "payload": [256] }), None).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParams { .. }));

        let err = entry.build(&json!({ "payload": "abc" }), None).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParams { .. }));
    }

    #[test]
    fn test_build_sequenced_with_status() {
        let entry = CommandEntry::new("move_straight", 0x64)
            .with_reply_opcode(0x65)
            .sequenced()
            .with_status_at(4);

        let cmd = entry.build(&Value::Null, Some(100)).unwrap();
        assert_eq!(cmd.correlation_key(), Some(CorrelationKey::sequenced(0x65, 100)));
        assert_eq!(cmd.reply().unwrap().status_offset, Some(4));
        assert_eq!(&cmd.payload()[..], &[100, 0, 0, 0]);

        assert!(entry.build(&Value::Null, None).is_err());
    }

    #[test]
    fn test_decode_get_name() {
        let entry = get_name();
        let response = Response {
            packet: Packet::new(0x01, &b"Hello"[..]),
            status: ResponseStatus::Success,
        };
        assert_eq!(entry.decode(&response).unwrap(), json!({ "name": "Hello" }));

        let garbage = Response {
            packet: Packet::new(0x01, vec![0xFFu8, 0xFE]),
            status: ResponseStatus::Success,
        };
        assert!(matches!(
            entry.decode(&garbage),
            Err(RegistryError::InvalidReply { .. })
        ));
    }

    #[test]
    fn test_default_decoder() {
        let entry = CommandEntry::new("raw", 0x10);
        let response = Response {
            packet: Packet::new(0x10, vec![7u8, 8]),
            status: ResponseStatus::Success,
        };
        assert_eq!(entry.decode(&response).unwrap(), json!({ "payload": [7, 8] }));
    }
}
