//! The delio control kernel: a per-user finite-state machine that gates
//! every side effect of the assistant's cognitive cycle.
//!
//! - [`StateGuard`] owns each user's current state and enforces the
//!   transition table and side-effect matrix.
//! - [`FsmController`] drives one cycle per event through the registered
//!   [`StateHandler`]s, serializing cycles per user.
//! - [`Kernel`] wires both together with the default handlers.

#![deny(unsafe_code)]

pub mod alerts;
pub mod background;
pub mod controller;
pub mod guard;
pub mod handler;
pub mod kernel;
pub mod states;

pub use alerts::{AlertEmitter, AlertSeverity, OperatorAlert};
pub use background::{deliver_reminder, spawn_alert_forwarder, Heartbeat};
pub use controller::{ControllerConfig, FsmController, NotifyOutcome};
pub use guard::{GuardConfig, StateGuard};
pub use handler::{fixed, FnHandler, StateHandler};
pub use kernel::{Kernel, KernelHealth};
pub use states::{default_handlers, register_defaults, HandlerConfig, HandlerDeps};
