//! Wire protocol messages and their bit-exact encoding
//!
//! Every frame is a 24-byte envelope — magic, NUL-padded command, payload
//! length, and a 4-byte dSHA256 checksum — followed by the payload in the
//! canonical little-endian layout. Unknown commands decode to `None` so a
//! peer speaking a newer dialect does not kill the connection.

use crate::{NetworkError, Result};
use rustcoin_core::block::Block;
use rustcoin_core::codec::{
    read_hash, read_i32_le, read_i64_le, read_u32_le, read_u64_le, read_var_bytes,
    read_varint, write_hash, write_i32_le, write_i64_le, write_u32_le, write_u64_le,
    write_var_bytes, write_varint,
};
use rustcoin_core::transaction::Transaction;
use rustcoin_core::{utils, Hash256};
use std::io::{Cursor, Read, Write};

/// Magic bytes identifying the production network
pub const MAINNET_MAGIC: u32 = 0xD9B4_BEF9;
/// Magic bytes identifying the test network
pub const TESTNET_MAGIC: u32 = 0x0709_110B;

/// Protocol version advertised in handshakes
pub const PROTOCOL_VERSION: u32 = 70001;

/// Frame envelope size: magic + command + length + checksum
pub const HEADER_SIZE: usize = 24;

/// Maximum payload accepted from a peer (32MB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Maximum entries in one inv/getdata vector
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Maximum hashes in a block locator
pub const MAX_LOCATOR_HASHES: u64 = 500;

/// Cap on hashes returned for one getblocks request
pub const GETBLOCKS_LIMIT: usize = 500;

/// Service flags for peer capabilities
pub mod services {
    /// Node can serve full blocks
    pub const NODE_NETWORK: u64 = 1 << 0;
}

/// Inventory item types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    Tx,
    Block,
}

impl InvType {
    pub fn to_u32(self) -> u32 {
        match self {
            InvType::Tx => 1,
            InvType::Block => 2,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(InvType::Tx),
            2 => Some(InvType::Block),
            _ => None,
        }
    }
}

/// Inventory item: type tag plus hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn tx(hash: Hash256) -> Self {
        Self {
            inv_type: InvType::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            inv_type: InvType::Block,
            hash,
        }
    }
}

/// Network address as carried inside a version message (no timestamp)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(ip: [u8; 16], port: u16, services: u64) -> Self {
        Self { services, ip, port }
    }

    /// IPv4 address mapped into the IPv6 wire form
    pub fn from_ipv4(ip: [u8; 4], port: u16, services: u64) -> Self {
        let mut ipv6 = [0u8; 16];
        ipv6[10] = 0xFF;
        ipv6[11] = 0xFF;
        ipv6[12..16].copy_from_slice(&ip);
        Self::new(ipv6, port, services)
    }

    pub fn unspecified() -> Self {
        Self::new([0u8; 16], 0, 0)
    }

    fn encode<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write_u64_le(w, self.services)?;
        w.write_all(&self.ip)?;
        // Port travels big-endian, unlike every other integer
        w.write_all(&self.port.to_be_bytes())
    }

    fn decode<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let services = read_u64_le(r)?;
        let mut ip = [0u8; 16];
        r.read_exact(&mut ip)?;
        let mut port_bytes = [0u8; 2];
        r.read_exact(&mut port_bytes)?;
        Ok(Self {
            services,
            ip,
            port: u16::from_be_bytes(port_bytes),
        })
    }
}

/// Version handshake payload
#[derive(Debug, Clone)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

/// Protocol messages consumed and produced by the node
#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    GetBlocks {
        version: u32,
        locator: Vec<Hash256>,
        hash_stop: Hash256,
    },
    Block(Block),
    Tx(Transaction),
}

impl Message {
    /// Wire command string
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::GetBlocks { .. } => "getblocks",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
        }
    }

    /// Canonical payload bytes
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_payload_to(&mut buf)
            .expect("writing to a Vec cannot fail");
        buf
    }

    fn encode_payload_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            Message::Version(v) => {
                write_u32_le(w, v.version)?;
                write_u64_le(w, v.services)?;
                write_i64_le(w, v.timestamp)?;
                v.addr_recv.encode(w)?;
                v.addr_from.encode(w)?;
                write_u64_le(w, v.nonce)?;
                write_var_bytes(w, v.user_agent.as_bytes())?;
                write_i32_le(w, v.start_height)
            }
            Message::Verack => Ok(()),
            Message::Ping(nonce) | Message::Pong(nonce) => write_u64_le(w, *nonce),
            Message::Inv(items) | Message::GetData(items) => {
                write_varint(w, items.len() as u64)?;
                for item in items {
                    write_u32_le(w, item.inv_type.to_u32())?;
                    write_hash(w, &item.hash)?;
                }
                Ok(())
            }
            Message::GetBlocks {
                version,
                locator,
                hash_stop,
            } => {
                write_u32_le(w, *version)?;
                write_varint(w, locator.len() as u64)?;
                for hash in locator {
                    write_hash(w, hash)?;
                }
                write_hash(w, hash_stop)
            }
            Message::Block(block) => block.encode(w),
            Message::Tx(tx) => tx.encode(w),
        }
    }

    /// Decode a payload for a command. Unknown commands yield `None`.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Option<Message>> {
        let mut r = Cursor::new(payload);
        let message = match command {
            "version" => {
                let version = read_u32_le(&mut r)?;
                let services = read_u64_le(&mut r)?;
                let timestamp = read_i64_le(&mut r)?;
                let addr_recv = NetworkAddress::decode(&mut r)?;
                let addr_from = NetworkAddress::decode(&mut r)?;
                let nonce = read_u64_le(&mut r)?;
                let user_agent_bytes = read_var_bytes(&mut r, 256)?;
                let user_agent = String::from_utf8_lossy(&user_agent_bytes).into_owned();
                let start_height = read_i32_le(&mut r)?;
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    addr_recv,
                    addr_from,
                    nonce,
                    user_agent,
                    start_height,
                })
            }
            "verack" => Message::Verack,
            "ping" => Message::Ping(read_u64_le(&mut r)?),
            "pong" => Message::Pong(read_u64_le(&mut r)?),
            "inv" => Message::Inv(decode_inv_vector(&mut r)?),
            "getdata" => Message::GetData(decode_inv_vector(&mut r)?),
            "getblocks" => {
                let version = read_u32_le(&mut r)?;
                let count = read_varint(&mut r)?;
                if count > MAX_LOCATOR_HASHES {
                    return Err(NetworkError::InvalidMessage(format!(
                        "locator with {count} hashes"
                    )));
                }
                let mut locator = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    locator.push(read_hash(&mut r)?);
                }
                let hash_stop = read_hash(&mut r)?;
                Message::GetBlocks {
                    version,
                    locator,
                    hash_stop,
                }
            }
            "block" => Message::Block(
                Block::decode(&mut r).map_err(|e| NetworkError::InvalidMessage(e.to_string()))?,
            ),
            "tx" => Message::Tx(
                Transaction::decode(&mut r)
                    .map_err(|e| NetworkError::InvalidMessage(e.to_string()))?,
            ),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn decode_inv_vector<R: Read>(r: &mut R) -> Result<Vec<InvItem>> {
    let count = read_varint(r)?;
    if count > MAX_INV_ENTRIES {
        return Err(NetworkError::InvalidMessage(format!(
            "inv vector with {count} entries"
        )));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_tag = read_u32_le(r)?;
        let hash = read_hash(r)?;
        // Unknown inventory types are skipped rather than fatal
        if let Some(inv_type) = InvType::from_u32(type_tag) {
            items.push(InvItem { inv_type, hash });
        }
    }
    Ok(items)
}

/// Parsed frame envelope
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    /// Parse and sanity-check the 24-byte envelope.
    pub fn parse(bytes: &[u8; HEADER_SIZE], expected_magic: u32) -> Result<Self> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != expected_magic {
            return Err(NetworkError::BadMagic(magic));
        }

        let command_bytes = &bytes[4..16];
        let end = command_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(command_bytes.len());
        let command = std::str::from_utf8(&command_bytes[..end])
            .map_err(|_| NetworkError::InvalidMessage("non-ascii command".to_string()))?
            .to_string();

        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        if length as usize > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::InvalidMessage(format!(
                "payload of {length} bytes exceeds limit"
            )));
        }

        let checksum = [bytes[20], bytes[21], bytes[22], bytes[23]];
        Ok(Self {
            command,
            length,
            checksum,
        })
    }

    /// Verify the payload against the envelope checksum.
    pub fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload_checksum(payload) != self.checksum {
            return Err(NetworkError::ChecksumMismatch);
        }
        Ok(())
    }
}

/// First four bytes of dSHA256 over the payload
pub fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    let digest = utils::double_sha256(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Encode a complete frame: envelope plus payload.
pub fn encode_frame(magic: u32, message: &Message) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());

    frame.extend_from_slice(&magic.to_le_bytes());

    let mut command = [0u8; 12];
    let name = message.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    frame.extend_from_slice(&command);

    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload_checksum(&payload));
    frame.extend_from_slice(&payload);
    frame
}
