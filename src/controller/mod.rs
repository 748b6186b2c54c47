//! Reconciliation controller
//!
//! This module contains the work queue, the action planner and the worker
//! loop that converges platform and database state to declared
//! installations.

mod announcer;
mod finalizers;
mod plan;
mod queue;
mod watch;
mod worker;

pub use announcer::{Announcer, EventAction, EventReason};
pub use finalizers::FINALIZER_NAME;
pub use plan::ActionPlan;
pub use queue::{Command, QueueKey, ReconcileAction, WorkQueue};
pub use watch::{
    watch_endpoints, watch_installations, watch_operator_config, watch_templates,
    OPERATOR_CONFIG_LABEL,
};
pub use worker::{StatefulSetStatus, Worker};
