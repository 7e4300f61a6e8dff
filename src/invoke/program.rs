//! Transaction programs: nested conditions with update branches.
//!
//! A program is a [`Statement`]. A statement is either terminal, an [`Update`] with
//! the operations to apply, or nested, an [`If`] whose condition picks exactly one of
//! two sub-statements. That gives compound programs such as
//! `if A then (if B then X else Y) else Z`.

use serde::{Deserialize, Serialize};

use crate::storage::Revision;

/// Comparison used by revision and value conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl CompareOp {
    /// Evaluates `actual <op> target`.
    pub fn compare<T: Ord + ?Sized>(&self, actual: &T, target: &T) -> bool {
        match self {
            CompareOp::Equal => actual == target,
            CompareOp::NotEqual => actual != target,
            CompareOp::Greater => actual > target,
            CompareOp::GreaterOrEqual => actual >= target,
            CompareOp::Less => actual < target,
            CompareOp::LessOrEqual => actual <= target,
        }
    }
}

/// A predicate over the state of one or more keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// The key has a live value.
    Exists(Vec<u8>),

    /// The key never existed or is currently a tombstone.
    NotExists(Vec<u8>),

    /// The key's newest version is a tombstone.
    Tombstone(Vec<u8>),

    /// Compares the revision of the key's newest version (0 if it never existed).
    Revision {
        key: Vec<u8>,
        op: CompareOp,
        revision: Revision,
    },

    /// Compares the key's live value; false when there is no live value.
    Value {
        key: Vec<u8>,
        op: CompareOp,
        value: Vec<u8>,
    },

    And(Box<Condition>, Box<Condition>),

    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn exists(key: impl Into<Vec<u8>>) -> Self {
        Condition::Exists(key.into())
    }

    pub fn not_exists(key: impl Into<Vec<u8>>) -> Self {
        Condition::NotExists(key.into())
    }

    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Condition::Tombstone(key.into())
    }

    pub fn revision(key: impl Into<Vec<u8>>, op: CompareOp, revision: Revision) -> Self {
        Condition::Revision {
            key: key.into(),
            op,
            revision,
        }
    }

    pub fn value(key: impl Into<Vec<u8>>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Condition::Value {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    fn take_children(&mut self, into: &mut Vec<Condition>) {
        if let Condition::And(left, right) | Condition::Or(left, right) = self {
            into.push(std::mem::replace(left.as_mut(), Condition::Exists(Vec::new())));
            into.push(std::mem::replace(right.as_mut(), Condition::Exists(Vec::new())));
        }
    }
}

// Unlinks And/Or chains iteratively; a caller may hand over an arbitrarily deep
// chain that validation then rejects.
impl Drop for Condition {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.take_children(&mut pending);
        while let Some(mut condition) = pending.pop() {
            condition.take_children(&mut pending);
        }
    }
}

/// A primitive mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

impl Operation {
    pub fn put(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Operation::Put {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        }
    }

    pub fn remove(key: impl AsRef<[u8]>) -> Self {
        Operation::Remove {
            key: key.as_ref().to_vec(),
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Put { key, .. } | Operation::Remove { key } => key,
        }
    }
}

/// Terminal branch: operations to apply plus a caller-defined result tag.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub operations: Vec<Operation>,
    pub result: Vec<u8>,
}

impl Update {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            operations,
            result: Vec::new(),
        }
    }

    pub fn with_result(mut self, result: impl Into<Vec<u8>>) -> Self {
        self.result = result.into();
        self
    }
}

/// A conditional node: exactly one of `success` / `failure` runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct If {
    pub condition: Condition,
    pub success: Statement,
    pub failure: Statement,
}

impl If {
    pub fn new(condition: Condition, success: Statement, failure: Statement) -> Self {
        Self {
            condition,
            success,
            failure,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statement {
    Terminal(Update),
    Nested(Box<If>),
}

impl Statement {
    /// Terminal statement with no result tag.
    pub fn update(operations: Vec<Operation>) -> Self {
        Statement::Terminal(Update::new(operations))
    }

    pub fn when(condition: Condition, success: Statement, failure: Statement) -> Self {
        Statement::Nested(Box::new(If::new(condition, success, failure)))
    }
}

impl From<Update> for Statement {
    fn from(update: Update) -> Self {
        Statement::Terminal(update)
    }
}

impl From<If> for Statement {
    fn from(iif: If) -> Self {
        Statement::Nested(Box::new(iif))
    }
}
