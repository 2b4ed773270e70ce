//! A control plane that records requests instead of sending them.
//!
//! Used by `strata plan` to show what a mount would do, and by tests to inject
//! failures at chosen requests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_common::StrataResult;

use super::client::ControlPlane;
use super::request::{ModifyRequest, RequestType, ResourceKind};

type FailurePredicate = Box<dyn Fn(&ModifyRequest) -> bool + Send + Sync>;

/// A request seen by a [`RecordingControlPlane`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// The request.
    pub request: ModifyRequest,
    /// Whether it was reported as applied.
    pub succeeded: bool,
}

/// In-memory control plane.
pub struct RecordingControlPlane {
    id: String,
    latency: Option<Duration>,
    log: Mutex<Vec<RecordedRequest>>,
    failures: Mutex<Vec<FailurePredicate>>,
}

impl RecordingControlPlane {
    /// Create a recording control plane for the named environment.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            latency: None,
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Delay every request, to simulate a slow environment.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every request matching `predicate` until [`Self::clear_failures`].
    pub fn fail_when(&self, predicate: impl Fn(&ModifyRequest) -> bool + Send + Sync + 'static) {
        self.failures.lock().push(Box::new(predicate));
    }

    /// Fail every request of the given kind and type.
    pub fn fail_on(&self, kind: ResourceKind, request_type: RequestType) {
        self.fail_when(move |request| {
            request.resource_kind() == kind && request.request_type() == request_type
        });
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Every request received, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> Vec<RecordedRequest> {
        self.log.lock().clone()
    }

    /// Requests that were applied.
    #[must_use]
    pub fn applied(&self) -> Vec<ModifyRequest> {
        self.log
            .lock()
            .iter()
            .filter(|record| record.succeeded)
            .map(|record| record.request.clone())
            .collect()
    }

    /// Number of applied requests of the given kind and type.
    #[must_use]
    pub fn count(&self, kind: ResourceKind, request_type: RequestType) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|record| {
                record.succeeded
                    && record.request.resource_kind() == kind
                    && record.request.request_type() == request_type
            })
            .count()
    }

    /// Wire documents of the applied requests, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if a document fails to serialize.
    pub fn documents(&self) -> StrataResult<Vec<serde_json::Value>> {
        self.applied().iter().map(ModifyRequest::to_document).collect()
    }
}

impl fmt::Debug for RecordingControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingControlPlane")
            .field("id", &self.id)
            .field("latency", &self.latency)
            .field("requests", &self.log.lock().len())
            .field("failure_rules", &self.failures.lock().len())
            .finish()
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    fn id(&self) -> &str {
        &self.id
    }

    async fn modify(&self, request: &ModifyRequest) -> StrataResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let fail = self.failures.lock().iter().any(|predicate| predicate(request));
        self.log.lock().push(RecordedRequest {
            request: request.clone(),
            succeeded: !fail,
        });

        if fail {
            tracing::debug!(environment = %self.id, %request, "Injected control plane failure");
            return Err(request.failed("injected failure"));
        }

        tracing::trace!(environment = %self.id, %request, "Recorded modify request");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{LayerGuid, StrataError};

    #[tokio::test]
    async fn records_in_order() {
        let control = RecordingControlPlane::new("uvm");
        let first = ModifyRequest::RemoveShare {
            name: LayerGuid::derive("a"),
        };
        let second = ModifyRequest::RemoveUnion {
            container_root_path: r"C:\x".to_string(),
        };

        control.modify(&first).await.unwrap();
        control.modify(&second).await.unwrap();

        assert_eq!(control.applied(), vec![first, second]);
        assert_eq!(
            control.count(ResourceKind::RemoteShare, RequestType::Remove),
            1
        );
        assert_eq!(control.documents().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_recorded_but_not_applied() {
        let control = RecordingControlPlane::new("uvm");
        control.fail_on(ResourceKind::UnionFilesystem, RequestType::Remove);

        let request = ModifyRequest::RemoveUnion {
            container_root_path: r"C:\x".to_string(),
        };
        let err = control.modify(&request).await.unwrap_err();
        assert!(matches!(err, StrataError::ControlPlane { .. }));
        assert!(control.applied().is_empty());
        assert_eq!(control.attempts().len(), 1);
        assert!(!control.attempts()[0].succeeded);

        control.clear_failures();
        control.modify(&request).await.unwrap();
        assert_eq!(control.applied().len(), 1);
    }
}
