//! Transaction entities and their canonical serialization

use crate::codec::{
    read_hash, read_i64_le, read_u32_le, read_var_bytes, read_varint, write_hash, write_i64_le,
    write_u32_le, write_var_bytes, write_varint,
};
use crate::{utils, Amount, CoreError, Hash256, OutPoint, Result};
use std::io::{Cursor, Read, Write};

/// Upper bound on a single script, matching the classic interpreter limit
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Upper bound on inputs/outputs accepted from the wire
const MAX_TX_SLOTS: u64 = 100_000;

/// Transaction input, referencing an output of a previous transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(prev_output: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prev_output,
            script_sig,
            sequence: 0xFFFF_FFFF,
        }
    }

    /// Coinbase input: null outpoint, free-form script
    pub fn create_coinbase(coinbase_data: Vec<u8>) -> Self {
        Self {
            prev_output: OutPoint::null(),
            script_sig: coinbase_data,
            sequence: 0xFFFF_FFFF,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.prev_output.is_null()
    }

    fn encode<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write_hash(w, &self.prev_output.txid)?;
        write_u32_le(w, self.prev_output.vout)?;
        write_var_bytes(w, &self.script_sig)?;
        write_u32_le(w, self.sequence)
    }

    fn decode<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let txid = read_hash(r)?;
        let vout = read_u32_le(r)?;
        let script_sig = read_var_bytes(r, MAX_SCRIPT_SIZE)?;
        let sequence = read_u32_le(r)?;
        Ok(Self {
            prev_output: OutPoint::new(txid, vout),
            script_sig,
            sequence,
        })
    }
}

/// Transaction output: an amount locked by a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    fn encode<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write_i64_le(w, self.value)?;
        write_var_bytes(w, &self.script_pubkey)
    }

    fn decode<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let value = read_i64_le(r)?;
        let script_pubkey = read_var_bytes(r, MAX_SCRIPT_SIZE)?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// Complete transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(version: u32, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Coinbase transaction paying `output` (mining reward plus fees)
    pub fn coinbase(coinbase_data: Vec<u8>, output: TxOutput) -> Self {
        Self::new(1, vec![TxInput::create_coinbase(coinbase_data)], vec![output])
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Transaction id: dSHA256 over the canonical serialization
    pub fn txid(&self) -> Hash256 {
        utils::double_sha256(&self.serialize())
    }

    pub fn total_output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.encode(&mut buf)
            .expect("writing to a Vec cannot fail");
        buf
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write_u32_le(w, self.version)?;
        write_varint(w, self.inputs.len() as u64)?;
        for input in &self.inputs {
            input.encode(w)?;
        }
        write_varint(w, self.outputs.len() as u64)?;
        for output in &self.outputs {
            output.encode(w)?;
        }
        write_u32_le(w, self.lock_time)
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let version = read_u32_le(r)?;

        let input_count = read_varint(r)?;
        if input_count > MAX_TX_SLOTS {
            return Err(CoreError::InvalidStructure(format!(
                "transaction claims {input_count} inputs"
            )));
        }
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            inputs.push(TxInput::decode(r)?);
        }

        let output_count = read_varint(r)?;
        if output_count > MAX_TX_SLOTS {
            return Err(CoreError::InvalidStructure(format!(
                "transaction claims {output_count} outputs"
            )));
        }
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            outputs.push(TxOutput::decode(r)?);
        }

        let lock_time = read_u32_le(r)?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Self::decode(&mut Cursor::new(data))
    }
}
