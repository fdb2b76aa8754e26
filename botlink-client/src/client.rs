//! High-level client API.

use crate::connection::Connection;
use crate::error::ClientError;
use botlink_protocol::{
    Command, CommandRegistry, Packet, ProtocolError, RegistryError, Response, ResponseStatus,
};
use bytes::{BufMut, BytesMut};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Bytes of a memory read request: address (u32) and length (u16).
const MEM_READ_REQUEST_SIZE: usize = 6;

/// Bytes preceding the data in a memory read reply: status (u8), length (u16).
const MEM_READ_REPLY_HEADER: usize = 3;

/// Bytes preceding the data in a memory write request.
const MEM_WRITE_REQUEST_HEADER: usize = 6;

/// Execute reply: status (u8), reply length (u16), reply CRC-32 (u32).
const LONG_EXECUTE_REPLY_SIZE: usize = 7;

/// Opcodes of the robot's virtual memory map commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOpcodes {
    pub read: u8,
    pub read_reply: u8,
    pub write: u8,
    pub write_reply: u8,
}

impl Default for MemoryOpcodes {
    fn default() -> Self {
        Self {
            read: 0x01,
            read_reply: 0x02,
            write: 0x03,
            write_reply: 0x04,
        }
    }
}

/// Memory window through which commands too large for one frame are
/// exchanged.
///
/// The whole request frame is written to `address`, the execute command
/// carries its length and CRC-32, and the reply frame is read back from the
/// same window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongCommandArea {
    pub address: u32,
    pub capacity: usize,
    pub execute: u8,
    pub execute_reply: u8,
}

impl Default for LongCommandArea {
    fn default() -> Self {
        Self {
            address: 0x6000,
            capacity: 128,
            execute: 0x7e,
            execute_reply: 0x7f,
        }
    }
}

/// High-level client: named commands from a registry plus memory access.
pub struct Client {
    conn: Arc<Connection>,
    registry: Arc<CommandRegistry>,
    memory: MemoryOpcodes,
    long_commands: LongCommandArea,
}

impl Client {
    /// Creates a client on top of an existing connection.
    pub fn new(conn: Arc<Connection>, registry: CommandRegistry) -> Self {
        Self {
            conn,
            registry: Arc::new(registry),
            memory: MemoryOpcodes::default(),
            long_commands: LongCommandArea::default(),
        }
    }

    pub fn with_memory_opcodes(mut self, memory: MemoryOpcodes) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_long_command_area(mut self, area: LongCommandArea) -> Self {
        self.long_commands = area;
        self
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    // =========================================================================
    // Registry commands
    // =========================================================================

    /// Sends the named command and decodes its reply.
    ///
    /// Fire-and-forget commands return `Value::Null` once queued. A reply
    /// with a non-zero status byte fails with [`ClientError::CommandFailed`].
    pub async fn call(&self, name: &str, params: Value) -> Result<Value, ClientError> {
        let entry = self.registry.get(name)?;
        let sequence = entry.is_sequenced().then(|| self.conn.next_sequence());
        let command = entry.build(&params, sequence)?;

        let response = match self.send(command).await? {
            Some(response) => response,
            None => return Ok(Value::Null),
        };
        check_status(name, &response)?;
        Ok(entry.decode(&response)?)
    }

    /// Sends a command, going through the long-command area when its frame
    /// does not fit on the link.
    pub async fn send(&self, command: Command) -> Result<Option<Response>, ClientError> {
        if command.payload().len() <= self.conn.max_payload_size() {
            self.conn.send(command).await
        } else {
            self.send_long(command).await
        }
    }

    // =========================================================================
    // Long commands
    // =========================================================================

    /// Executes `command` through the long-command area.
    ///
    /// Returns `None` for fire-and-forget commands once the robot has
    /// executed them.
    pub async fn send_long(&self, command: Command) -> Result<Option<Response>, ClientError> {
        let area = self.long_commands;
        let frame = command.to_packet().encode()?;
        if frame.len() > area.capacity {
            return Err(ClientError::LongCommandTooLarge {
                size: frame.len(),
                capacity: area.capacity,
            });
        }

        self.mem_write(area.address, &frame).await?;
        let (reply_len, reply_crc) = self
            .long_execute(frame.len(), crc32fast::hash(&frame))
            .await?;
        debug!(
            opcode = command.opcode(),
            size = frame.len(),
            reply_len,
            "long command executed"
        );

        let Some(reply) = command.reply().copied() else {
            return Ok(None);
        };
        if reply_len > area.capacity {
            return Err(invalid_reply(
                "long_execute",
                &format!("reply of {} bytes overflows the exchange area", reply_len),
            ));
        }

        let reply_frame = self.mem_read(area.address, reply_len).await?;
        let actual = crc32fast::hash(&reply_frame);
        if actual != reply_crc {
            return Err(ClientError::LongReplyCrcMismatch {
                expected: reply_crc,
                actual,
            });
        }

        let packet = Packet::decode(&reply_frame).map_err(ProtocolError::from)?;
        if packet.opcode != reply.key.opcode {
            return Err(ProtocolError::UnexpectedOpcode {
                expected: reply.key.opcode,
                actual: packet.opcode,
            }
            .into());
        }
        Ok(Some(Response::classify(packet, reply.status_offset)?))
    }

    async fn long_execute(&self, length: usize, crc: u32) -> Result<(usize, u32), ClientError> {
        let mut payload = BytesMut::with_capacity(6);
        payload.put_u16_le(length as u16);
        payload.put_u32_le(crc);

        let command = Command::new(self.long_commands.execute, payload.freeze())
            .with_reply_opcode(self.long_commands.execute_reply)
            .with_status_at(0);
        let response = self.request("long_execute", command).await?;

        let reply = response.payload();
        if reply.len() < LONG_EXECUTE_REPLY_SIZE {
            return Err(invalid_reply("long_execute", "reply shorter than its header"));
        }
        let length = u16::from_le_bytes([reply[1], reply[2]]) as usize;
        let crc = u32::from_le_bytes([reply[3], reply[4], reply[5], reply[6]]);
        Ok((length, crc))
    }

    // =========================================================================
    // Memory access
    // =========================================================================

    /// Largest block moved by one memory read request.
    pub fn read_block_size(&self) -> usize {
        self.conn
            .max_payload_size()
            .saturating_sub(MEM_READ_REPLY_HEADER)
    }

    /// Largest block moved by one memory write request.
    pub fn write_block_size(&self) -> usize {
        self.conn
            .max_payload_size()
            .saturating_sub(MEM_WRITE_REQUEST_HEADER)
    }

    /// Reads `length` bytes starting at `address`, one block at a time.
    pub async fn mem_read(&self, address: u32, length: usize) -> Result<Vec<u8>, ClientError> {
        let block_size = self.read_block_size();
        if block_size == 0 || self.conn.max_payload_size() < MEM_READ_REQUEST_SIZE {
            return Err(invalid_params("mem_read", "frame size too small for memory access"));
        }

        let mut data = Vec::with_capacity(length);
        let mut offset = 0;
        while offset < length {
            let block_length = block_size.min(length - offset);
            let block_address = block_address("mem_read", address, offset)?;
            let block = self.mem_read_block(block_address, block_length).await?;
            data.extend_from_slice(&block);
            offset += block_length;
        }
        Ok(data)
    }

    async fn mem_read_block(&self, address: u32, length: usize) -> Result<Vec<u8>, ClientError> {
        let mut payload = BytesMut::with_capacity(MEM_READ_REQUEST_SIZE);
        payload.put_u32_le(address);
        payload.put_u16_le(length as u16);

        let command = Command::new(self.memory.read, payload.freeze())
            .with_reply_opcode(self.memory.read_reply)
            .with_status_at(0);
        let response = self.request("mem_read", command).await?;

        let reply = response.payload();
        if reply.len() < MEM_READ_REPLY_HEADER {
            return Err(invalid_reply("mem_read", "reply shorter than its header"));
        }
        let reported = u16::from_le_bytes([reply[1], reply[2]]) as usize;
        let data = &reply[MEM_READ_REPLY_HEADER..];
        if reported != length || data.len() != length {
            return Err(invalid_reply(
                "mem_read",
                &format!(
                    "asked for {} bytes, reply announced {} and carried {}",
                    length,
                    reported,
                    data.len()
                ),
            ));
        }
        Ok(data.to_vec())
    }

    /// Writes `data` starting at `address`, one block at a time.
    pub async fn mem_write(&self, address: u32, data: &[u8]) -> Result<(), ClientError> {
        let block_size = self.write_block_size();
        if block_size == 0 {
            return Err(invalid_params("mem_write", "frame size too small for memory access"));
        }

        for (index, block) in data.chunks(block_size).enumerate() {
            let block_address = block_address("mem_write", address, index * block_size)?;
            self.mem_write_block(block_address, block).await?;
        }
        Ok(())
    }

    async fn mem_write_block(&self, address: u32, block: &[u8]) -> Result<(), ClientError> {
        let mut payload = BytesMut::with_capacity(MEM_WRITE_REQUEST_HEADER + block.len());
        payload.put_u32_le(address);
        payload.put_u16_le(block.len() as u16);
        payload.put_slice(block);

        let command = Command::new(self.memory.write, payload.freeze())
            .with_reply_opcode(self.memory.write_reply)
            .with_status_at(0);
        self.request("mem_write", command).await?;
        Ok(())
    }

    /// Sends a command that must be answered with a success status.
    async fn request(&self, name: &str, command: Command) -> Result<Response, ClientError> {
        let response = self
            .conn
            .send(command)
            .await?
            .ok_or_else(|| invalid_reply(name, "no reply expected"))?;
        check_status(name, &response)?;
        Ok(response)
    }
}

fn check_status(name: &str, response: &Response) -> Result<(), ClientError> {
    match response.status {
        ResponseStatus::Success => Ok(()),
        ResponseStatus::Failure(code) => Err(ClientError::CommandFailed {
            command: name.to_string(),
            code,
        }),
    }
}

fn block_address(name: &str, address: u32, offset: usize) -> Result<u32, ClientError> {
    u32::try_from(offset)
        .ok()
        .and_then(|offset| address.checked_add(offset))
        .ok_or_else(|| invalid_params(name, "address range overflows"))
}

fn invalid_params(name: &str, reason: &str) -> ClientError {
    RegistryError::InvalidParams {
        command: name.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn invalid_reply(name: &str, reason: &str) -> ClientError {
    RegistryError::InvalidReply {
        command: name.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
