//! Status subresource of a ClickHouseInstallation

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reconcile lifecycle phase of the installation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ChiPhase {
    #[default]
    Unknown,
    InProgress,
    Completed,
    Deleting,
}

/// Status of a ClickHouseInstallation.
///
/// Counters accumulate over the installation's lifetime; the action and
/// error logs are reset at the start of every reconcile pass.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiStatus {
    #[serde(default)]
    pub phase: ChiPhase,

    #[serde(default)]
    pub clusters_count: i32,
    #[serde(default)]
    pub shards_count: i32,
    #[serde(default)]
    pub hosts_count: i32,

    /// Hosts scheduled for removal by the current action plan
    #[serde(default)]
    pub hosts_to_delete_count: i32,
    #[serde(default)]
    pub added_hosts_count: i32,
    #[serde(default)]
    pub updated_hosts_count: i32,
    #[serde(default)]
    pub deleted_hosts_count: i32,

    /// Human-readable log of the current reconcile pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Pod FQDNs of every host, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fqdns: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ChiStatus {
    /// Mark the start of a reconcile pass.
    pub fn reconcile_start(&mut self, hosts_to_delete: i32) {
        self.phase = ChiPhase::InProgress;
        self.hosts_to_delete_count = hosts_to_delete;
        self.actions.clear();
        self.errors.clear();
        self.touch();
    }

    /// Mark the end of a successful reconcile pass.
    pub fn reconcile_complete(&mut self) {
        self.phase = ChiPhase::Completed;
        self.hosts_to_delete_count = 0;
        self.touch();
    }

    /// Mark the start of installation teardown.
    pub fn delete_start(&mut self) {
        self.phase = ChiPhase::Deleting;
        self.touch();
    }

    pub fn push_action(&mut self, action: impl Into<String>) {
        self.actions
            .push(format!("{} {}", Utc::now().to_rfc3339(), action.into()));
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors
            .push(format!("{} {}", Utc::now().to_rfc3339(), error.into()));
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now().to_rfc3339());
    }
}
