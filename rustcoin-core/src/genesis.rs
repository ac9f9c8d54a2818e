//! Genesis block construction
//!
//! The built-in default is the well-known mainnet genesis; deployments on
//! other networks supply their own genesis bytes through configuration.

use crate::block::{Block, BlockHeader};
use crate::transaction::{Transaction, TxOutput};
use crate::Result;

/// Headline embedded in the mainnet genesis coinbase
const GENESIS_HEADLINE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Uncompressed pubkey paid by the mainnet genesis output
const GENESIS_PUBKEY_HEX: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

/// Display-order hash of the mainnet genesis block
pub const GENESIS_HASH_HEX: &str =
    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

/// Build the mainnet genesis block from its public constants.
pub fn mainnet_genesis() -> Block {
    // scriptSig: push of the compact target, push of 4, push of the headline
    let mut script_sig = vec![0x04, 0xFF, 0xFF, 0x00, 0x1D, 0x01, 0x04];
    script_sig.push(GENESIS_HEADLINE.len() as u8);
    script_sig.extend_from_slice(GENESIS_HEADLINE);

    // scriptPubKey: push of the 65-byte pubkey, OP_CHECKSIG
    let pubkey = hex::decode(GENESIS_PUBKEY_HEX).expect("genesis pubkey constant is valid hex");
    let mut script_pubkey = Vec::with_capacity(67);
    script_pubkey.push(0x41);
    script_pubkey.extend_from_slice(&pubkey);
    script_pubkey.push(0xAC);

    let coinbase = Transaction::coinbase(script_sig, TxOutput::new(50_0000_0000, script_pubkey));
    let merkle_root = Block::merkle_root(std::slice::from_ref(&coinbase));

    let header = BlockHeader::new(
        1,
        crate::ZERO_HASH,
        merkle_root,
        1_231_006_505,
        0x1D00_FFFF,
        2_083_236_893,
    );

    Block::new(header, vec![coinbase])
}

/// Parse a genesis block from configured bytes.
pub fn genesis_from_bytes(bytes: &[u8]) -> Result<Block> {
    Block::deserialize(bytes)
}
