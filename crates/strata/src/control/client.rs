//! Control plane transport seam.

use std::fmt;

use async_trait::async_trait;
use strata_common::StrataResult;

use super::request::ModifyRequest;

/// Issues modify requests against a running environment.
///
/// Calls block until the environment reports completion. There is no
/// cancellation; a request either succeeds or fails.
#[async_trait]
pub trait ControlPlane: Send + Sync + fmt::Debug {
    /// Identifier of the environment requests are sent to.
    fn id(&self) -> &str;

    /// Apply a modification.
    ///
    /// Failures should be reported as [`strata_common::StrataError::ControlPlane`],
    /// typically built with [`ModifyRequest::failed`].
    async fn modify(&self, request: &ModifyRequest) -> StrataResult<()>;
}
