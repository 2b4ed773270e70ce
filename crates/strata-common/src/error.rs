//! Common error types for the Strata runtime.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StrataError`].
pub type StrataResult<T> = Result<T, StrataError>;

/// Common errors across the Strata runtime.
#[derive(Error, Diagnostic, Debug)]
pub enum StrataError {
    /// Malformed input such as a layer stack that is too short.
    #[error("Invalid request: {message}")]
    #[diagnostic(code(strata::validation))]
    Validation {
        /// What was wrong with the request.
        message: String,
    },

    /// No free slot is left for a resource.
    #[error("No free {resource} available in hosting system {hosting_system}")]
    #[diagnostic(
        code(strata::resource_exhausted),
        help("Unmount workloads from the hosting system to free capacity")
    )]
    ResourceExhausted {
        /// The kind of resource that ran out.
        resource: String,
        /// The hosting system that is full.
        hosting_system: String,
    },

    /// The next free attachment slot lives on a controller the guest cannot use.
    #[error("Too many block attachments for a single controller (next free slot is on controller {controller})")]
    #[diagnostic(
        code(strata::attachment::too_many),
        help("The guest only supports attachments on controller 0")
    )]
    TooManyAttachments {
        /// Controller the allocation would have spilled onto.
        controller: usize,
    },

    /// A modify request against a running environment failed.
    #[error("Control plane {operation} of {resource} failed: {message}")]
    #[diagnostic(code(strata::control_plane))]
    ControlPlane {
        /// The operation requested (Add/Remove).
        operation: String,
        /// The resource addressed by the request.
        resource: String,
        /// The failure reported by the environment.
        message: String,
    },

    /// A share was released that the registry does not track.
    #[error("Share {id} is not registered in hosting system {hosting_system}")]
    #[diagnostic(code(strata::share::not_registered))]
    NotRegistered {
        /// The share identifier.
        id: String,
        /// The hosting system that was searched.
        hosting_system: String,
    },

    /// A resource lookup missed.
    #[error("Not found: {resource}")]
    #[diagnostic(code(strata::not_found))]
    NotFound {
        /// The resource that could not be found.
        resource: String,
    },

    /// A host layer driver primitive failed.
    #[error("Layer driver failed to {operation} {layer}: {message}")]
    #[diagnostic(code(strata::layer_driver))]
    LayerDriver {
        /// The primitive that failed (activate, prepare, ...).
        operation: String,
        /// The layer the primitive was applied to.
        layer: String,
        /// The underlying failure.
        message: String,
    },

    /// Best-effort cleanup finished but some steps failed.
    #[error("{operation} completed with {} error(s): {}", .errors.len(), join_errors(.errors))]
    #[diagnostic(
        code(strata::cleanup),
        help("Resources listed here may have leaked in the hosting system")
    )]
    Cleanup {
        /// The operation that was being cleaned up.
        operation: String,
        /// Every failure observed, in order.
        #[related]
        errors: Vec<StrataError>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(strata::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(strata::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(strata::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(strata::unsupported), help("Host layer mounting requires Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Work that was handed to a background task never reported back.
    #[error("Internal error: {message}")]
    #[diagnostic(code(strata::internal))]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl StrataError {
    /// Shorthand for a [`StrataError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

fn join_errors(errors: &[StrataError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collects failures from best-effort cleanup so that every step still runs.
///
/// Forward provisioning fails fast with `?`. Teardown and rollback instead push
/// each failure here and carry on, then report everything at the end.
#[derive(Debug)]
pub struct CleanupErrors {
    operation: String,
    errors: Vec<StrataError>,
}

impl CleanupErrors {
    /// Start collecting failures for the named operation.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            errors: Vec::new(),
        }
    }

    /// Record a failure.
    pub fn push(&mut self, err: StrataError) {
        tracing::debug!(operation = %self.operation, error = %err, "Recorded cleanup failure");
        self.errors.push(err);
    }

    /// Record the failure of `result`, if any, and return its value otherwise.
    pub fn record<T>(&mut self, result: StrataResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    /// Whether no failure has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of failures recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` if nothing failed, otherwise a [`StrataError::Cleanup`] carrying every failure.
    pub fn into_result(self) -> StrataResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(StrataError::Cleanup {
                operation: self.operation,
                errors: self.errors,
            })
        }
    }
}
