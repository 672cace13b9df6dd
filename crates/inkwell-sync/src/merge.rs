//! Last-write-wins reconciliation of a local note set with a remote one.

use std::collections::HashMap;

use smol_str::SmolStr;

use crate::cipher::{CipherEnvelope, open_note};
use crate::models::{Note, SealedNote};

/// Result of [`merge`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// The merged set, tombstones excluded. Local order first, then newly
    /// inserted remote notes in remote order.
    pub notes: Vec<Note>,
    pub inserted: Vec<SmolStr>,
    /// Local notes whose content changed because the remote copy won.
    pub updated: Vec<SmolStr>,
    /// Ids removed by a remote tombstone or the hidden id.
    pub removed: Vec<SmolStr>,
    /// Remote records that could not be decrypted; the local value was kept.
    pub skipped: Vec<SmolStr>,
}

impl MergeOutcome {
    /// Whether the merged set differs from the local input.
    pub fn changed(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Whether a remote record stamped `remote_ms` replaces a local one stamped
/// `local_ms`. Ties go to the remote side.
pub fn remote_wins(remote_ms: i64, local_ms: i64) -> bool {
    remote_ms >= local_ms
}

/// Merge `remote` into `local`.
///
/// For each remote record, in order:
/// - the hidden id is dropped from the result outright;
/// - a tombstone removes the local note unless the local copy is newer;
/// - otherwise the record is decrypted (failures are logged and skipped),
///   inserted if unknown, or overlaid onto the local note if not older.
///
/// Notes flagged deleted never appear in the output.
pub fn merge(
    local: Vec<Note>,
    remote: Vec<SealedNote>,
    hidden_id: Option<&str>,
    envelope: &dyn CipherEnvelope,
) -> MergeOutcome {
    merge_with(local, remote, |id| hidden_id == Some(id), envelope)
}

/// [`merge`] with any number of hidden ids.
pub fn merge_with(
    local: Vec<Note>,
    remote: Vec<SealedNote>,
    is_hidden: impl Fn(&str) -> bool,
    envelope: &dyn CipherEnvelope,
) -> MergeOutcome {
    let mut slots: Vec<Option<Note>> = Vec::with_capacity(local.len() + remote.len());
    let mut index: HashMap<SmolStr, usize> = HashMap::with_capacity(local.len());
    for note in local {
        match index.get(&note.id) {
            Some(&at) => slots[at] = Some(note),
            None => {
                index.insert(note.id.clone(), slots.len());
                slots.push(Some(note));
            }
        }
    }

    let mut outcome = MergeOutcome::default();

    for sealed in remote {
        let id = sealed.id.clone();
        let slot = index.get(&id).copied();
        let local_ms = slot
            .and_then(|at| slots[at].as_ref())
            .map(|note| note.modified_ms());

        if is_hidden(id.as_str()) {
            if let Some(at) = slot {
                if slots[at].take().is_some() {
                    outcome.removed.push(id);
                }
            }
            continue;
        }

        if sealed.is_deleted() {
            match (slot, local_ms) {
                (Some(at), Some(local_ms)) if remote_wins(sealed.modified_ms(), local_ms) => {
                    slots[at] = None;
                    outcome.removed.push(id);
                }
                _ => {}
            }
            continue;
        }

        if let Some(local_ms) = local_ms {
            if !remote_wins(sealed.modified_ms(), local_ms) {
                continue;
            }
        }

        let opened = match open_note(envelope, sealed) {
            Ok(note) => note,
            Err(e) => {
                tracing::warn!(note_id = %id, error = %e, "could not decrypt remote note, keeping local copy");
                outcome.skipped.push(id);
                continue;
            }
        };

        if let Some(current) = slot.and_then(|at| slots[at].as_mut()) {
            let before = current.clone();
            current.overlay(opened);
            if *current != before {
                outcome.updated.push(id);
            }
            continue;
        }

        // unknown id, or a slot emptied earlier in this pass
        match slot {
            Some(at) => slots[at] = Some(opened),
            None => {
                index.insert(id.clone(), slots.len());
                slots.push(Some(opened));
            }
        }
        outcome.inserted.push(id);
    }

    outcome.notes = slots
        .into_iter()
        .flatten()
        .filter(|note| !note.is_deleted())
        .collect();
    outcome
}
