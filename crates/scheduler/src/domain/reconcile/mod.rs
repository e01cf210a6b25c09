//! Repairing divergence between task status and the pod store
//!
//! Status updates that signal an anomaly trigger a read of the pod store; the
//! answer is fed through [`decide`], a pure function, so that a store poll and a
//! watch notification carrying the same facts converge on the same outcome.

mod decision;
mod handler;
mod reconciler;

pub use decision::{decide, ReconcileAction, ReconcileCause};
pub use handler::{StatusHandler, StatusOutcome, CREATE_BINDING_FAILURE, TASK_FAILED, TASK_LOST};
pub use reconciler::{Applied, Reconciler};
