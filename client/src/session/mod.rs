//! Session lifecycle: establishing the agent connection and the live
//! handles (RPC halves, poll timers) that exist while it is up.

mod live;
mod state;

pub use live::{establish, LiveSession};
pub use state::{SessionState, SessionStateMachine, StateTransitionError};
