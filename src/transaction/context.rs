use crate::config::{IsolationLevel, LockingMode};
use crate::container::{EntryVersion, Metadata};
use crate::interceptors::commands::{Effect, Modification, VersionGuard, WriteKind};
use crate::membership::types::NodeId;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Cluster-wide transaction identity: originating node plus a per-node counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTxId {
    pub node: NodeId,
    pub id: u64,
}

impl GlobalTxId {
    pub fn new(node: NodeId, id: u64) -> Self {
        Self { node, id }
    }
}

impl fmt::Display for GlobalTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}

/// A key as seen by the transaction.
#[derive(Debug, Clone)]
pub(crate) struct ContextEntry {
    pub value: Option<Value>,
    pub metadata: Metadata,
    /// Version of the stored entry this transaction's view started from.
    pub base_version: Option<EntryVersion>,
    pub modified: bool,
    /// The transaction's outcome depends on the stored value.
    pub guarded: bool,
}

/// Originator-side state of one transaction.
#[derive(Debug)]
pub struct TransactionContext {
    pub tx_id: GlobalTxId,
    pub locking_mode: LockingMode,
    pub isolation: IsolationLevel,
    pub write_skew_check: bool,
    pub state: TxState,
    /// Version seen by the first read of each key (repeatable read only).
    pub read_versions: HashMap<String, Option<EntryVersion>>,
    pub(crate) entries: HashMap<String, ContextEntry>,
    pub modifications: Vec<(String, WriteKind)>,
    pub locked_keys: BTreeSet<String>,
    /// Nodes that may hold locks or prepared state for this transaction.
    pub lock_owners: BTreeSet<NodeId>,
}

impl TransactionContext {
    pub fn new(
        tx_id: GlobalTxId,
        locking_mode: LockingMode,
        isolation: IsolationLevel,
        write_skew_check: bool,
    ) -> Self {
        Self {
            tx_id,
            locking_mode,
            isolation,
            write_skew_check,
            state: TxState::Active,
            read_versions: HashMap::new(),
            entries: HashMap::new(),
            modifications: Vec::new(),
            locked_keys: BTreeSet::new(),
            lock_owners: BTreeSet::new(),
        }
    }

    /// Value visible to this transaction, if the key is already in its view.
    pub(crate) fn visible(&self, key: &str) -> Option<&ContextEntry> {
        let entry = self.entries.get(key)?;
        if entry.modified || self.isolation == IsolationLevel::RepeatableRead {
            Some(entry)
        } else {
            None
        }
    }

    pub(crate) fn record_read(&mut self, key: &str, value: Option<Value>, metadata: Metadata, version: Option<EntryVersion>) {
        if self.isolation != IsolationLevel::RepeatableRead {
            return;
        }
        self.read_versions.entry(key.to_string()).or_insert(version);
        self.entries
            .entry(key.to_string())
            .or_insert(ContextEntry {
                value,
                metadata,
                base_version: version,
                modified: false,
                guarded: false,
            });
    }

    /// Starts tracking `key` for a write, unless it is already tracked.
    pub(crate) fn track_for_write(&mut self, key: &str, value: Option<Value>, metadata: Metadata, version: Option<EntryVersion>) {
        self.entries
            .entry(key.to_string())
            .or_insert(ContextEntry {
                value,
                metadata,
                base_version: version,
                modified: false,
                guarded: false,
            });
    }

    pub(crate) fn apply(&mut self, key: &str, kind: WriteKind, effect: Option<Effect>, guard: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            match effect {
                Some(Effect::Store { value, metadata }) => {
                    entry.value = Some(value);
                    entry.metadata = metadata;
                    entry.modified = true;
                }
                Some(Effect::Remove) => {
                    entry.value = None;
                    entry.modified = true;
                }
                None => {}
            }
            entry.guarded |= guard;
        }
        self.modifications.push((key.to_string(), kind));
    }

    /// Overlays this transaction's writes on a snapshot of committed entries.
    pub(crate) fn overlay(&self, committed: Vec<(String, Value)>) -> Vec<(String, Value)> {
        let mut merged: BTreeMap<String, Value> = committed.into_iter().collect();
        for (key, entry) in &self.entries {
            if !entry.modified {
                continue;
            }
            match &entry.value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Final per-key outcome to send at prepare, in key order.
    ///
    /// `guard_all` adds a base-version guard on every written key; used when
    /// eagerly acquired locks were released before preparing again.
    pub(crate) fn build_modifications(&self, guard_all: bool) -> Vec<Modification> {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();

        keys.into_iter()
            .filter_map(|key| {
                let entry = &self.entries[key];
                let effect = entry.modified.then(|| match &entry.value {
                    Some(value) => Effect::Store {
                        value: value.clone(),
                        metadata: entry.metadata,
                    },
                    None => Effect::Remove,
                });

                let guard = if self.write_skew_check && entry.modified {
                    self.read_versions
                        .get(key)
                        .map(|version| VersionGuard { expected: *version })
                } else {
                    None
                }
                .or_else(|| {
                    (entry.guarded || (guard_all && entry.modified)).then_some(VersionGuard {
                        expected: entry.base_version,
                    })
                });

                if effect.is_none() && guard.is_none() {
                    return None;
                }
                Some(Modification {
                    key: key.clone(),
                    effect,
                    guard,
                })
            })
            .collect()
    }
}
