//! Kubernetes Event recording for Portage controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Accepted")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "portage-data-upload-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
///
/// All calls are silently ignored; no Kubernetes API interaction.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// This node won the accept race for the record
    pub const ACCEPTED: &str = "Accepted";
    /// The exposer was asked to bring up the hosting pod
    pub const EXPOSED: &str = "Exposed";
    /// The hosting pod is ready on the accepting node
    pub const PREPARED: &str = "Prepared";
    /// A data-path session started
    pub const STARTED: &str = "Started";
    /// The session finished successfully
    pub const COMPLETED: &str = "Completed";
    /// The session or an earlier stage failed
    pub const FAILED: &str = "Failed";
    /// The record was cancelled
    pub const CANCELED: &str = "Canceled";
    /// The record sat in Accepted past the prepare timeout
    pub const PREPARE_TIMEOUT: &str = "PrepareTimeout";
    /// Exposer resources were torn down
    pub const CLEANED_UP: &str = "CleanedUp";
}

/// Well-known event action strings.
pub mod actions {
    /// Emitted from the reconcile loop
    pub const RECONCILE: &str = "Reconcile";
    /// Emitted from a session callback
    pub const SESSION: &str = "Session";
    /// Emitted from finalizer/deletion processing
    pub const FINALIZE: &str = "Finalize";
}
