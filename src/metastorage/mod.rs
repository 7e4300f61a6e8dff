pub mod command;
pub mod state_machine;

pub use command::{CommandError, InvokeResult, MetaCommand};
pub use state_machine::{ApplyOutcome, MetastorageStateMachine, StateMachineError};
