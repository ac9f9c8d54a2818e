//! Script utilities: templates, address derivation, and the verification seam
//!
//! Only standard output templates are recognized (pay-to-pubkey-hash and
//! pay-to-pubkey); everything else is non-standard and stays out of the
//! memory pool. Full signature checking is a pluggable capability behind
//! [`ScriptVerifier`].

use crate::transaction::{Transaction, TxOutput, MAX_SCRIPT_SIZE};
use crate::{utils, CoreError, Result};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Script opcodes used by the standard templates
pub mod opcodes {
    pub const OP_DUP: u8 = 0x76;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_PUSHDATA_20: u8 = 0x14;
    pub const OP_PUSHDATA_33: u8 = 0x21;
    pub const OP_PUSHDATA_65: u8 = 0x41;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_RETURN: u8 = 0x6a;
}

/// Address version byte for pay-to-pubkey-hash
const ADDRESS_VERSION: u8 = 0x00;

/// HASH160: RIPEMD160 over SHA256
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

/// Base58check address for a pubkey hash: version byte, hash160, and the
/// first four bytes of the dSHA256 checksum
pub fn hash160_to_address(pubkey_hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(25);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pubkey_hash);
    let checksum = utils::double_sha256(&payload);
    payload.extend_from_slice(&checksum[..4]);
    bs58::encode(payload).into_string()
}

pub fn pubkey_to_address(pubkey: &[u8]) -> String {
    hash160_to_address(&hash160(pubkey))
}

/// Build a pay-to-pubkey-hash script:
/// `OP_DUP OP_HASH160 <hash160> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(opcodes::OP_DUP);
    script.push(opcodes::OP_HASH160);
    script.push(opcodes::OP_PUSHDATA_20);
    script.extend_from_slice(pubkey_hash);
    script.push(opcodes::OP_EQUALVERIFY);
    script.push(opcodes::OP_CHECKSIG);
    script
}

pub fn is_p2pkh_script(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == opcodes::OP_DUP
        && script[1] == opcodes::OP_HASH160
        && script[2] == opcodes::OP_PUSHDATA_20
        && script[23] == opcodes::OP_EQUALVERIFY
        && script[24] == opcodes::OP_CHECKSIG
}

/// `<pubkey> OP_CHECKSIG` with a 33- or 65-byte key push
pub fn is_p2pk_script(script: &[u8]) -> bool {
    match script.len() {
        35 => script[0] == opcodes::OP_PUSHDATA_33 && script[34] == opcodes::OP_CHECKSIG,
        67 => script[0] == opcodes::OP_PUSHDATA_65 && script[66] == opcodes::OP_CHECKSIG,
        _ => false,
    }
}

/// Derive the base58check address an output pays, for the live-accounting
/// index. Unrecognized templates yield none.
pub fn address_from_script(script: &[u8]) -> Option<String> {
    if is_p2pkh_script(script) {
        let mut pubkey_hash = [0u8; 20];
        pubkey_hash.copy_from_slice(&script[3..23]);
        return Some(hash160_to_address(&pubkey_hash));
    }
    if is_p2pk_script(script) {
        let pubkey = &script[1..script.len() - 1];
        return Some(pubkey_to_address(pubkey));
    }
    None
}

/// True when a script consists only of data pushes, the required shape for a
/// signature script
pub fn is_push_only(script: &[u8]) -> bool {
    let mut i = 0;
    while i < script.len() {
        let op = script[i];
        if op > opcodes::OP_PUSHDATA4 {
            return false;
        }
        let data_len = match op {
            0x4c => {
                // OP_PUSHDATA1
                if i + 1 >= script.len() {
                    return false;
                }
                i += 1;
                script[i] as usize
            }
            0x4d => {
                // OP_PUSHDATA2
                if i + 2 >= script.len() {
                    return false;
                }
                let len = u16::from_le_bytes([script[i + 1], script[i + 2]]) as usize;
                i += 2;
                len
            }
            0x4e => {
                // OP_PUSHDATA4
                if i + 4 >= script.len() {
                    return false;
                }
                let len = u32::from_le_bytes([
                    script[i + 1],
                    script[i + 2],
                    script[i + 3],
                    script[i + 4],
                ]) as usize;
                i += 4;
                len
            }
            n => n as usize,
        };
        i += 1 + data_len;
        if i > script.len() {
            return false;
        }
    }
    true
}

/// Standardness predicate for memory-pool admission
pub fn check_standard(tx: &Transaction) -> Result<()> {
    for (i, input) in tx.inputs.iter().enumerate() {
        if input.script_sig.len() > MAX_SCRIPT_SIZE {
            return Err(CoreError::NonStandard(format!(
                "input {i} script exceeds {MAX_SCRIPT_SIZE} bytes"
            )));
        }
        if !is_push_only(&input.script_sig) {
            return Err(CoreError::NonStandard(format!(
                "input {i} script is not push-only"
            )));
        }
    }
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 {
            return Err(CoreError::NonStandard(format!("output {i} value is negative")));
        }
        if !is_p2pkh_script(&output.script_pubkey) && !is_p2pk_script(&output.script_pubkey) {
            return Err(CoreError::NonStandard(format!(
                "output {i} script template not recognized"
            )));
        }
    }
    Ok(())
}

/// Input verification seam. The chain-and-pool engine calls this for every
/// resolved input; deployments plug in a full interpreter here.
#[async_trait::async_trait]
pub trait ScriptVerifier: Send + Sync {
    async fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_output: &TxOutput,
    ) -> Result<()>;
}

/// Structural verifier: checks the signature script shape against the
/// template of the output it spends, without executing signatures.
#[derive(Debug, Default)]
pub struct StructuralVerifier;

#[async_trait::async_trait]
impl ScriptVerifier for StructuralVerifier {
    async fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_output: &TxOutput,
    ) -> Result<()> {
        let input = tx.inputs.get(input_index).ok_or_else(|| {
            CoreError::Fatal(format!("input index {input_index} out of range"))
        })?;

        if !is_push_only(&input.script_sig) {
            return Err(CoreError::NonStandard(format!(
                "input {input_index} script is not push-only"
            )));
        }

        let script = &prev_output.script_pubkey;
        if is_p2pkh_script(script) {
            // Expect a signature push followed by a pubkey push
            if input.script_sig.is_empty() {
                return Err(CoreError::InvalidStructure(format!(
                    "input {input_index} has an empty signature script"
                )));
            }
            Ok(())
        } else if is_p2pk_script(script) {
            if input.script_sig.is_empty() {
                return Err(CoreError::InvalidStructure(format!(
                    "input {input_index} has an empty signature script"
                )));
            }
            Ok(())
        } else {
            Err(CoreError::NonStandard(format!(
                "input {input_index} spends an unrecognized script template"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxInput;
    use crate::OutPoint;

    #[test]
    fn test_p2pkh_template() {
        let script = p2pkh_script(&[0x11; 20]);
        assert_eq!(script.len(), 25);
        assert!(is_p2pkh_script(&script));
        assert!(!is_p2pk_script(&script));
    }

    #[test]
    fn test_p2pk_template() {
        let mut script = vec![opcodes::OP_PUSHDATA_33];
        script.extend_from_slice(&[0x02; 33]);
        script.push(opcodes::OP_CHECKSIG);
        assert!(is_p2pk_script(&script));
        assert!(!is_p2pkh_script(&script));
    }

    #[test]
    fn test_address_round_trip_shape() {
        let addr = hash160_to_address(&[0u8; 20]);
        // Version byte zero encodes with the conventional leading 1
        assert!(addr.starts_with('1'));
        let decoded = bs58::decode(&addr).into_vec().unwrap();
        assert_eq!(decoded.len(), 25);
        assert_eq!(decoded[0], ADDRESS_VERSION);
    }

    #[test]
    fn test_address_from_script_variants() {
        let pubkey_hash = hash160(&[0x02; 33]);
        let p2pkh = p2pkh_script(&pubkey_hash);
        assert_eq!(
            address_from_script(&p2pkh),
            Some(hash160_to_address(&pubkey_hash))
        );

        let mut p2pk = vec![opcodes::OP_PUSHDATA_33];
        p2pk.extend_from_slice(&[0x02; 33]);
        p2pk.push(opcodes::OP_CHECKSIG);
        // Both templates pay the same key, so the same address
        assert_eq!(address_from_script(&p2pk), address_from_script(&p2pkh));

        assert_eq!(address_from_script(&[opcodes::OP_RETURN]), None);
    }

    #[test]
    fn test_push_only() {
        assert!(is_push_only(&[0x01, 0xAB, 0x02, 0xCD, 0xEF]));
        assert!(is_push_only(&[]));
        // OP_DUP is not a push
        assert!(!is_push_only(&[opcodes::OP_DUP]));
        // Truncated push data
        assert!(!is_push_only(&[0x05, 0x01]));
    }

    #[test]
    fn test_check_standard() {
        let good = Transaction::new(
            1,
            vec![TxInput::new(OutPoint::new([1u8; 32], 0), vec![0x01, 0xAA])],
            vec![TxOutput::new(1000, p2pkh_script(&[0x22; 20]))],
        );
        assert!(check_standard(&good).is_ok());

        let mut bad_out = good.clone();
        bad_out.outputs[0].script_pubkey = vec![opcodes::OP_RETURN, 0x00];
        assert!(matches!(
            check_standard(&bad_out),
            Err(CoreError::NonStandard(_))
        ));

        let mut bad_in = good;
        bad_in.inputs[0].script_sig = vec![opcodes::OP_DUP];
        assert!(matches!(
            check_standard(&bad_in),
            Err(CoreError::NonStandard(_))
        ));
    }

    #[tokio::test]
    async fn test_structural_verifier() {
        let prev = TxOutput::new(1000, p2pkh_script(&[0x22; 20]));
        let tx = Transaction::new(
            1,
            vec![TxInput::new(OutPoint::new([1u8; 32], 0), vec![0x01, 0xAA])],
            vec![TxOutput::new(900, p2pkh_script(&[0x33; 20]))],
        );
        let verifier = StructuralVerifier;
        assert!(verifier.verify_input(&tx, 0, &prev).await.is_ok());

        let unknown_prev = TxOutput::new(1000, vec![opcodes::OP_RETURN]);
        assert!(verifier.verify_input(&tx, 0, &unknown_prev).await.is_err());
    }
}
