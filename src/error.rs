//! Error types for the startup-scaler operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum Error {
    /// Kubernetes API error
    KubeApi(String),
    /// Invalid or missing opt-in annotations
    Configuration(String),
    /// Target container violates the scaling contract
    Validation(String),
    /// The target container does not exist in the pod spec
    ContainerNotPresent(String),
    /// The container status has not been populated yet
    StatusNotPresent(String),
    /// The container status carries no resource view yet
    ResourcesNotPresent(String),
    /// Resource not found
    NotFound(String),
    /// Error that must not be retried
    Unrecoverable(String),
    /// Serialization error
    Serialization(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            Error::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::ContainerNotPresent(msg) => write!(f, "Container not present: {}", msg),
            Error::StatusNotPresent(msg) => write!(f, "Container status not present: {}", msg),
            Error::ResourcesNotPresent(msg) => {
                write!(f, "Container status resources not present: {}", msg)
            }
            Error::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            Error::Unrecoverable(msg) => write!(f, "Unrecoverable error: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(err.to_string()),
            _ => Error::KubeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Prepends a context line to the message, preserving the error class.
    pub fn context(self, msg: &str) -> Self {
        match self {
            Error::KubeApi(m) => Error::KubeApi(format!("{}: {}", msg, m)),
            Error::Configuration(m) => Error::Configuration(format!("{}: {}", msg, m)),
            Error::Validation(m) => Error::Validation(format!("{}: {}", msg, m)),
            Error::ContainerNotPresent(m) => Error::ContainerNotPresent(format!("{}: {}", msg, m)),
            Error::StatusNotPresent(m) => Error::StatusNotPresent(format!("{}: {}", msg, m)),
            Error::ResourcesNotPresent(m) => {
                Error::ResourcesNotPresent(format!("{}: {}", msg, m))
            }
            Error::NotFound(m) => Error::NotFound(format!("{}: {}", msg, m)),
            Error::Unrecoverable(m) => Error::Unrecoverable(format!("{}: {}", msg, m)),
            Error::Serialization(m) => Error::Serialization(format!("{}: {}", msg, m)),
        }
    }

    /// Metric label used when counting reconcile failures by kind.
    pub fn failure_kind(&self) -> &'static str {
        match self {
            Error::KubeApi(_) => "kube_api",
            Error::Configuration(_) => "configuration",
            Error::Validation(_) | Error::ContainerNotPresent(_) => "validation",
            Error::StatusNotPresent(_) | Error::ResourcesNotPresent(_) => "pre_state",
            Error::NotFound(_) => "not_found",
            Error::Unrecoverable(_) => "unrecoverable",
            Error::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));
    }

    #[test]
    fn test_error_variants() {
        let errors = vec![
            Error::KubeApi("api".to_string()),
            Error::Configuration("config".to_string()),
            Error::Validation("validate".to_string()),
            Error::ContainerNotPresent("container".to_string()),
            Error::StatusNotPresent("status".to_string()),
            Error::ResourcesNotPresent("resources".to_string()),
            Error::NotFound("resource".to_string()),
            Error::Unrecoverable("fatal".to_string()),
            Error::Serialization("serde".to_string()),
        ];

        for err in errors {
            // Ensure Display is implemented
            let _ = format!("{}", err);
        }
    }

    #[test]
    fn test_context_preserves_class() {
        let err = Error::ContainerNotPresent("ghost".to_string()).context("unable to mutate pod");
        assert!(matches!(&err, Error::ContainerNotPresent(m) if m == "unable to mutate pod: ghost"));
        assert_eq!(err.failure_kind(), "validation");
    }

    #[test]
    fn test_failure_kind() {
        assert_eq!(Error::Validation("x".into()).failure_kind(), "validation");
        assert_eq!(
            Error::StatusNotPresent("x".into()).failure_kind(),
            "pre_state"
        );
        assert_eq!(Error::KubeApi("x".into()).failure_kind(), "kube_api");
    }
}
