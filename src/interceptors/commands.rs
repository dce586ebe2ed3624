use crate::container::{EntryVersion, Metadata};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The map operation a write performs.
///
/// Conditional kinds are evaluated exactly once, by whoever serializes writes
/// to the key: the primary owner, or the transaction context that will be
/// validated at prepare. Backups only ever see the resulting [`Mutation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteKind {
    Put { value: Value, metadata: Metadata },
    PutIfAbsent { value: Value, metadata: Metadata },
    Replace { value: Value, metadata: Metadata },
    ReplaceIfEquals { expected: Value, value: Value, metadata: Metadata },
    Remove,
    RemoveIfEquals { expected: Value },
}

/// What applying a write does to the stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    Store { value: Value, metadata: Metadata },
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub applied: bool,
    pub previous: Option<Value>,
    pub effect: Option<Effect>,
}

impl WriteKind {
    /// Whether the outcome depends on the value currently stored.
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            WriteKind::PutIfAbsent { .. }
                | WriteKind::Replace { .. }
                | WriteKind::ReplaceIfEquals { .. }
                | WriteKind::RemoveIfEquals { .. }
        )
    }

    /// Decides the outcome of this write against `current`.
    pub fn evaluate(&self, current: Option<&Value>) -> Evaluation {
        let previous = current.cloned();
        let (applied, effect) = match self {
            WriteKind::Put { value, metadata } => (true, Some(store(value, metadata))),
            WriteKind::PutIfAbsent { value, metadata } => match current {
                None => (true, Some(store(value, metadata))),
                Some(_) => (false, None),
            },
            WriteKind::Replace { value, metadata } => match current {
                Some(_) => (true, Some(store(value, metadata))),
                None => (false, None),
            },
            WriteKind::ReplaceIfEquals {
                expected,
                value,
                metadata,
            } => {
                if current == Some(expected) {
                    (true, Some(store(value, metadata)))
                } else {
                    (false, None)
                }
            }
            WriteKind::Remove => match current {
                Some(_) => (true, Some(Effect::Remove)),
                None => (false, None),
            },
            WriteKind::RemoveIfEquals { expected } => {
                if current == Some(expected) {
                    (true, Some(Effect::Remove))
                } else {
                    (false, None)
                }
            }
        };
        Evaluation {
            applied,
            previous,
            effect,
        }
    }
}

fn store(value: &Value, metadata: &Metadata) -> Effect {
    Effect::Store {
        value: value.clone(),
        metadata: *metadata,
    }
}

/// A non-transactional write on one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCommand {
    pub key: String,
    pub kind: WriteKind,
    /// Lock owner identity on the primary.
    pub invocation_id: String,
}

impl WriteCommand {
    pub fn new(key: impl Into<String>, kind: WriteKind) -> Self {
        Self {
            key: key.into(),
            kind,
            invocation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub applied: bool,
    pub previous: Option<Value>,
}

impl From<&Evaluation> for WriteResult {
    fn from(evaluation: &Evaluation) -> Self {
        Self {
            applied: evaluation.applied,
            previous: evaluation.previous.clone(),
        }
    }
}

/// An already validated write as shipped from a primary to its backups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Store {
        value: Value,
        metadata: Metadata,
        version: EntryVersion,
    },
    Remove {
        version: EntryVersion,
    },
}

impl Mutation {
    pub fn version(&self) -> EntryVersion {
        match self {
            Mutation::Store { version, .. } | Mutation::Remove { version } => *version,
        }
    }

    pub fn from_effect(effect: Effect, version: EntryVersion) -> Self {
        match effect {
            Effect::Store { value, metadata } => Mutation::Store {
                value,
                metadata,
                version,
            },
            Effect::Remove => Mutation::Remove { version },
        }
    }
}

/// Version a key must still have when a transaction prepares.
/// `expected: None` means the key must still be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionGuard {
    pub expected: Option<EntryVersion>,
}

/// The final per-key outcome of a transaction, sent to the key's primary at prepare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub key: String,
    /// `None` for keys that are only guarded, e.g. a conditional write that did not apply.
    pub effect: Option<Effect>,
    pub guard: Option<VersionGuard>,
}
