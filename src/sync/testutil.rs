//! Fixtures shared by the unit tests.

use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, block, transaction, Amount, BlockHash, CompactTarget, Network, OutPoint, Script,
    ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode, TxOut, Txid, WPubkeyHash, Witness,
};

use crate::sync::domain::derivation::ScriptDeriver;
use crate::sync::domain::wallet::{KeyPurpose, WalletId, WalletState};
use crate::sync::error::Result;

/// Deterministic P2WPKH scripts, no key material involved.
pub struct TestDeriver;

impl ScriptDeriver for TestDeriver {
    fn derive(&self, purpose: KeyPurpose, index: u32) -> Result<ScriptBuf> {
        Ok(test_script(purpose, index))
    }
}

pub fn test_script(purpose: KeyPurpose, index: u32) -> ScriptBuf {
    let mut bytes = [0u8; 20];
    bytes[0] = 0xa0 + purpose.path_index() as u8;
    bytes[1..5].copy_from_slice(&index.to_be_bytes());
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(bytes))
}

/// A script no test wallet derives.
pub fn foreign_script(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20]))
}

pub fn test_wallet(gap_limit: u32) -> WalletState {
    test_wallet_with_id(1, gap_limit)
}

pub fn test_wallet_with_id(id: u64, gap_limit: u32) -> WalletState {
    WalletState::new(WalletId(id), Network::Regtest, gap_limit, Arc::new(TestDeriver))
}

pub fn header_at(height: u32) -> block::Header {
    block::Header {
        version: block::Version::from_consensus(0x2000_0000),
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_700_000_000 + height * 600,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: height,
    }
}

pub fn raw_hex(tx: &Transaction) -> String {
    hex::encode(bitcoin::consensus::serialize(tx))
}

/// Builds transactions with unique txids.
pub struct TestChain {
    counter: u32,
}

impl TestChain {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    fn next_external_outpoint(&mut self) -> OutPoint {
        self.counter += 1;
        let mut bytes = [0xeeu8; 32];
        bytes[..4].copy_from_slice(&self.counter.to_be_bytes());
        OutPoint::new(Txid::from_byte_array(bytes), 0)
    }

    /// A transaction paying `value` to `script` from an unrelated outpoint.
    pub fn pay(&mut self, script: &Script, value: u64) -> Transaction {
        let input = self.next_external_outpoint();
        build_tx(&[input], &[(script, value)])
    }

    /// A transaction spending `inputs` into `outputs`.
    pub fn spend(&mut self, inputs: &[OutPoint], outputs: &[(&Script, u64)]) -> Transaction {
        build_tx(inputs, outputs)
    }
}

pub fn build_tx(inputs: &[OutPoint], outputs: &[(&Script, u64)]) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .iter()
            .map(|op| TxIn {
                previous_output: *op,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(script, value)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: ScriptBuf::from_bytes(script.to_bytes()),
            })
            .collect(),
    }
}
