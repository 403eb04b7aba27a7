//! Status-string computation.
//!
//! The server fingerprints a script hash's history as
//! `sha256("txid:height:txid:height:...")`. Recomputing the same value from
//! locally known outputs tells us whether anything changed without fetching
//! the history again.
//!
//! Locally we only know block heights, not positions within a block. Two
//! transactions at the same height are ordered correctly only if one spends
//! the other; otherwise the computed status may differ from the server's,
//! and the history is reported as ambiguous.

use std::collections::{BTreeSet, HashMap};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::Txid;

use crate::sync::types::{comparison_height, NodeOutputs, StatusString, TxReference};

/// Local view of an address's history in server order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHistory {
    pub references: Vec<TxReference>,
    /// Same-height entries whose relative order could not be established.
    pub ambiguous: bool,
}

impl LocalHistory {
    pub fn status(&self) -> Option<StatusString> {
        status_of(&self.references)
    }
}

/// Fingerprint of `references`, taken in the given order. `None` when empty.
pub fn status_of(references: &[TxReference]) -> Option<StatusString> {
    if references.is_empty() {
        return None;
    }

    let mut preimage = String::with_capacity(references.len() * 72);
    for r in references {
        preimage.push_str(&r.txid.to_string());
        preimage.push(':');
        preimage.push_str(&r.height.to_string());
        preimage.push(':');
    }

    let digest = sha256::Hash::hash(preimage.as_bytes());
    Some(StatusString::new(hex::encode(digest.to_byte_array())))
}

struct Entry {
    reference: TxReference,
    /// Spenders of any of this transaction's outputs on the node.
    spent_by: BTreeSet<Txid>,
}

/// Orders the receiving and spending transactions of `outputs` the way the
/// server would.
pub fn local_history(outputs: &NodeOutputs) -> LocalHistory {
    let mut seen: HashMap<Txid, usize> = HashMap::new();
    let mut entries: Vec<Entry> = Vec::new();

    for output in outputs.outputs() {
        let index = *seen.entry(output.outpoint.txid).or_insert_with(|| {
            entries.push(Entry {
                reference: output.reference(),
                spent_by: BTreeSet::new(),
            });
            entries.len() - 1
        });
        if let Some(spender) = outputs.spender(&output.outpoint) {
            entries[index].spent_by.insert(spender.txid);
        }
    }
    for (_, input) in outputs.spends() {
        seen.entry(input.txid).or_insert_with(|| {
            entries.push(Entry {
                reference: input.reference(),
                spent_by: BTreeSet::new(),
            });
            entries.len() - 1
        });
    }

    entries.sort_by(|a, b| {
        comparison_height(a.reference.height)
            .cmp(&comparison_height(b.reference.height))
            .then_with(|| a.reference.txid.cmp(&b.reference.txid))
    });

    let mut ambiguous = false;
    let mut ordered = Vec::with_capacity(entries.len());
    let mut start = 0;
    while start < entries.len() {
        let height = entries[start].reference.height;
        let end = entries[start..]
            .iter()
            .position(|e| e.reference.height != height)
            .map_or(entries.len(), |p| start + p);

        let (group, group_ambiguous) = order_same_height(&entries[start..end]);
        ambiguous |= group_ambiguous;
        ordered.extend(group);
        start = end;
    }

    LocalHistory {
        references: ordered,
        ambiguous,
    }
}

/// Orders one same-height group so that a spent transaction precedes its spender.
fn order_same_height(group: &[Entry]) -> (Vec<TxReference>, bool) {
    if group.len() < 2 {
        return (group.iter().map(|e| e.reference).collect(), false);
    }

    let related = |a: &Entry, b: &Entry| {
        a.spent_by.contains(&b.reference.txid) || b.spent_by.contains(&a.reference.txid)
    };

    let mut ambiguous = false;
    for (i, a) in group.iter().enumerate() {
        for b in &group[i + 1..] {
            if !related(a, b) {
                ambiguous = true;
            }
        }
    }

    let mut remaining: Vec<&Entry> = group.iter().collect();
    let mut ordered = Vec::with_capacity(group.len());
    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .position(|candidate| {
                !remaining
                    .iter()
                    .any(|other| other.spent_by.contains(&candidate.reference.txid))
            })
            .unwrap_or(0);
        ordered.push(remaining.remove(next).reference);
    }

    (ordered, ambiguous)
}
