//! Push-to-talk session
//!
//! A session cycles Idle → Listening → Processing → Speaking → Idle, with
//! Reset reachable from Idle and Error reachable from everywhere. Each state
//! registers its own button listeners, does its work, removes them again, and
//! then fires exactly one trigger.

mod controller;
pub mod machine;

pub use controller::{PendingArguments, Session, SessionParts};
pub use machine::{SessionState, StateMachine, Transition, Trigger};
