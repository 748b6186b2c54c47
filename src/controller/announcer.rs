//! Event emission for user-visible reconcile transitions
//!
//! Every transition is published as a Kubernetes Event on the installation
//! and mirrored to the log. Publishing is tolerant: a failed event write is
//! logged and never fails the reconcile that produced it.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::{info, warn};

use crate::model::NormalizedChi;

const CONTROLLER_NAME: &str = "clickhouse-operator";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Update,
    Delete,
    Reconcile,
}

impl EventAction {
    fn as_str(&self) -> &'static str {
        match self {
            EventAction::Create => "Create",
            EventAction::Update => "Update",
            EventAction::Delete => "Delete",
            EventAction::Reconcile => "Reconcile",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventReason {
    Started,
    InProgress,
    Completed,
    Failed,
}

impl EventReason {
    fn as_str(&self) -> &'static str {
        match self {
            EventReason::Started => "Started",
            EventReason::InProgress => "InProgress",
            EventReason::Completed => "Completed",
            EventReason::Failed => "Failed",
        }
    }
}

/// Publishes reconcile transitions as Events on the installation
#[derive(Clone)]
pub struct Announcer {
    client: Client,
    reporter: Reporter,
}

impl Announcer {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: CONTROLLER_NAME.to_string(),
                instance: None,
            },
        }
    }

    fn reference(chi: &NormalizedChi) -> ObjectReference {
        ObjectReference {
            api_version: Some("clickhouse.example.com/v1".to_string()),
            kind: Some("ClickHouseInstallation".to_string()),
            name: Some(chi.name.clone()),
            namespace: Some(chi.namespace.clone()),
            uid: chi.uid.clone(),
            ..Default::default()
        }
    }

    /// Emit one event tagged with an action and reason kind.
    pub async fn event(
        &self,
        chi: &NormalizedChi,
        action: EventAction,
        reason: EventReason,
        note: impl Into<String>,
    ) {
        let note = note.into();
        match reason {
            EventReason::Failed => warn!(
                "{}/{}: {}{}: {}",
                chi.namespace,
                chi.name,
                action.as_str(),
                reason.as_str(),
                note
            ),
            _ => info!(
                "{}/{}: {}{}: {}",
                chi.namespace,
                chi.name,
                action.as_str(),
                reason.as_str(),
                note
            ),
        }

        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), Self::reference(chi));
        let event = Event {
            type_: match reason {
                EventReason::Failed => EventType::Warning,
                _ => EventType::Normal,
            },
            reason: format!("{}{}", action.as_str(), reason.as_str()),
            note: Some(note),
            action: action.as_str().to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            warn!(
                "failed to publish event for {}/{}: {}",
                chi.namespace, chi.name, err
            );
        }
    }
}
