//! Owned outputs and spend links for one address.
//!
//! Rebuilt from scratch on every reconciliation: a first pass collects the
//! outputs paying to the node's script, a second pass links the inputs that
//! spend them. Both passes read transactions through a [`TransactionView`]
//! so staged results are visible before they are committed.

use std::collections::HashMap;

use bitcoin::{OutPoint, TxIn, TxOut, Txid};

use crate::sync::domain::wallet::{DerivationNode, WalletState};
use crate::sync::error::ConsistencyFault;
use crate::sync::types::{BlockTransaction, HydratedTransaction, NodeOutputs, OwnedOutput, ReferenceSet, SpendingInput};

/// A transaction as seen through a [`TransactionView`].
#[derive(Debug, Clone, Copy)]
pub enum Resolved<'a> {
    Known(&'a BlockTransaction),
    Unfetchable,
}

/// Transactions visible to one reconciliation: staged results first, then
/// the wallet's committed transactions.
#[derive(Clone, Copy)]
pub struct TransactionView<'a> {
    staged: &'a HashMap<Txid, HydratedTransaction>,
    wallet: &'a WalletState,
}

impl<'a> TransactionView<'a> {
    pub fn new(staged: &'a HashMap<Txid, HydratedTransaction>, wallet: &'a WalletState) -> Self {
        Self { staged, wallet }
    }

    pub fn resolve(&self, txid: &Txid) -> Option<Resolved<'a>> {
        match self.staged.get(txid) {
            Some(HydratedTransaction::Fetched(btx)) => Some(Resolved::Known(btx)),
            Some(HydratedTransaction::Unfetchable) => Some(Resolved::Unfetchable),
            None => self.wallet.transaction(txid).map(Resolved::Known),
        }
    }

    pub fn get(&self, txid: &Txid) -> Option<&'a BlockTransaction> {
        match self.resolve(txid) {
            Some(Resolved::Known(btx)) => Some(btx),
            _ => None,
        }
    }

    pub fn prev_output(&self, input: &TxIn) -> Option<&'a TxOut> {
        self.get(&input.previous_output.txid)
            .and_then(|btx| btx.tx.output.get(input.previous_output.vout as usize))
    }
}

pub struct UtxoGraphBuilder<'a> {
    view: TransactionView<'a>,
}

impl<'a> UtxoGraphBuilder<'a> {
    pub fn new(view: TransactionView<'a>) -> Self {
        Self { view }
    }

    /// Rebuilds `node`'s outputs from `references`.
    ///
    /// Every reference must resolve to a fetched transaction. Inputs whose
    /// funding transaction is unknown, or not part of `references`, do not
    /// spend from this node and are skipped.
    pub fn rebuild(&self, node: &DerivationNode, references: &ReferenceSet) -> Result<NodeOutputs, ConsistencyFault> {
        let script = node.script();
        let mut outputs = NodeOutputs::new();
        let mut bodies = Vec::with_capacity(references.len());

        for reference in references.iter() {
            let btx = match self.view.resolve(&reference.txid) {
                Some(Resolved::Known(btx)) => btx,
                Some(Resolved::Unfetchable) => {
                    return Err(ConsistencyFault::UnfetchableTransaction(reference.txid))
                }
                None => return Err(ConsistencyFault::MissingTransaction(reference.txid)),
            };
            bodies.push((reference, btx));

            for (vout, output) in btx.tx.output.iter().enumerate() {
                if output.script_pubkey == *script {
                    outputs.insert(OwnedOutput {
                        outpoint: OutPoint::new(reference.txid, vout as u32),
                        height: reference.height,
                        block_time: btx.block_time,
                        fee: reference.fee,
                        value: output.value,
                        label: None,
                    });
                }
            }
        }

        for (reference, btx) in bodies {
            for (vin, input) in btx.tx.input.iter().enumerate() {
                let prev = input.previous_output;
                let previous = match self.view.resolve(&prev.txid) {
                    None => continue,
                    Some(Resolved::Unfetchable) => {
                        return Err(ConsistencyFault::UnfetchableTransaction(prev.txid))
                    }
                    Some(Resolved::Known(previous)) => previous,
                };
                if !references.contains(&prev.txid) {
                    continue;
                }

                let spent = previous
                    .tx
                    .output
                    .get(prev.vout as usize)
                    .ok_or(ConsistencyFault::OutputIndexOutOfRange(prev))?;
                if spent.script_pubkey != *script {
                    continue;
                }

                outputs.link(
                    prev,
                    SpendingInput {
                        txid: reference.txid,
                        vin: vin as u32,
                        height: reference.height,
                        block_time: btx.block_time,
                        fee: reference.fee,
                        value: spent.value,
                    },
                )?;
            }
        }

        log::trace!(
            "[UTXO] {} has {} outputs, {} unspent",
            node.key(),
            outputs.len(),
            outputs.unspent().count()
        );
        Ok(outputs)
    }
}
