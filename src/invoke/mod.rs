pub mod engine;
pub mod program;

pub use engine::{check, ConditionalInvokeEngine, Evaluation, InvokeError, DEFAULT_MAX_DEPTH};
pub use program::{CompareOp, Condition, If, Operation, Statement, Update};
