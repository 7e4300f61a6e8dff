//! Conditional multi-invoke engine.
//!
//! Evaluation is a pure function of the program and a read-only view of the store:
//! no side effects and no failure path, so every replica applying the same committed
//! entry computes the same batch. Everything that could make a program invalid is
//! rejected by [`ConditionalInvokeEngine::validate`] before the program is proposed.

use thiserror::Error;

use crate::invoke::{Condition, If, Operation, Statement};
use crate::storage::StoreView;

/// Default limit on `If` nesting, and on And/Or nesting within one condition.
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Malformed program: {0}")]
    Malformed(String),
}

/// Outcome of evaluating a program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Branch taken at each level, `true` for success
    pub branch: Vec<bool>,

    /// Operations of the selected terminal, in program order
    pub operations: Vec<Operation>,

    /// Result tag of the selected terminal
    pub result: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
pub struct ConditionalInvokeEngine {
    max_depth: usize,
}

impl Default for ConditionalInvokeEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl ConditionalInvokeEngine {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Rejects programs that could not be evaluated deterministically.
    pub fn validate(&self, program: &Statement) -> Result<(), InvokeError> {
        self.validate_statement(program, 0)
    }

    fn validate_statement(&self, statement: &Statement, depth: usize) -> Result<(), InvokeError> {
        match statement {
            Statement::Terminal(update) => {
                for (i, op) in update.operations.iter().enumerate() {
                    if op.key().is_empty() {
                        return Err(InvokeError::Malformed(format!(
                            "operation {} at depth {} has an empty key",
                            i, depth
                        )));
                    }
                }
                Ok(())
            }
            Statement::Nested(iif) => {
                if depth >= self.max_depth {
                    return Err(InvokeError::Malformed(format!(
                        "nesting exceeds the limit of {}",
                        self.max_depth
                    )));
                }
                validate_condition(&iif.condition, depth, self.max_depth)?;
                self.validate_statement(&iif.success, depth + 1)?;
                self.validate_statement(&iif.failure, depth + 1)
            }
        }
    }

    /// Selects the branch path for `program` against `view` and flattens it.
    pub fn evaluate<V: StoreView + ?Sized>(&self, program: &Statement, view: &V) -> Evaluation {
        let mut evaluation = Evaluation::default();
        let mut current = program;

        loop {
            match current {
                Statement::Terminal(update) => {
                    evaluation.operations.extend(update.operations.iter().cloned());
                    evaluation.result = update.result.clone();
                    return evaluation;
                }
                Statement::Nested(iif) => {
                    let If {
                        condition,
                        success,
                        failure,
                    } = iif.as_ref();
                    let taken = check(condition, view);
                    evaluation.branch.push(taken);
                    current = if taken { success } else { failure };
                }
            }
        }
    }
}

/// Checks keys and the And/Or nesting of `condition` without recursing, so an
/// oversized chain is rejected rather than exhausting the stack.
fn validate_condition(
    condition: &Condition,
    depth: usize,
    max_depth: usize,
) -> Result<(), InvokeError> {
    let mut pending = vec![(condition, 0usize)];

    while let Some((condition, nesting)) = pending.pop() {
        match condition {
            Condition::Exists(key)
            | Condition::NotExists(key)
            | Condition::Tombstone(key)
            | Condition::Revision { key, .. }
            | Condition::Value { key, .. } => {
                if key.is_empty() {
                    return Err(InvokeError::Malformed(format!(
                        "condition at depth {} targets an empty key",
                        depth
                    )));
                }
            }
            Condition::And(left, right) | Condition::Or(left, right) => {
                if nesting >= max_depth {
                    return Err(InvokeError::Malformed(format!(
                        "condition at depth {} nests more than {} levels",
                        depth, max_depth
                    )));
                }
                pending.push((right, nesting + 1));
                pending.push((left, nesting + 1));
            }
        }
    }

    Ok(())
}

/// Evaluates a single condition.
pub fn check<V: StoreView + ?Sized>(condition: &Condition, view: &V) -> bool {
    match condition {
        Condition::Exists(key) => view.latest(key).map_or(false, |e| !e.is_tombstone()),
        Condition::NotExists(key) => view.latest(key).map_or(true, |e| e.is_tombstone()),
        Condition::Tombstone(key) => view.latest(key).map_or(false, |e| e.is_tombstone()),
        Condition::Revision { key, op, revision } => {
            let actual = view.latest(key).map_or(0, |e| e.revision);
            op.compare(&actual, revision)
        }
        Condition::Value { key, op, value } => {
            match view.latest(key).and_then(|e| e.value()) {
                Some(actual) => op.compare(actual, value.as_slice()),
                None => false,
            }
        }
        Condition::And(left, right) => check(left, view) && check(right, view),
        Condition::Or(left, right) => check(left, view) || check(right, view),
    }
}
