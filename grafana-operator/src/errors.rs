/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Invalid resource specification, e.g. mutually exclusive content
    /// sources or malformed inline JSON. Retried on the next spec change,
    /// not on a timer.
    #[error("{0}")]
    Validation(String),
    /// All configured content sources were tried and none produced content.
    #[error("{0}")]
    ContentResolution(String),
    /// The Grafana HTTP API rejected a request.
    #[error("Grafana API returned {status}: {message}")]
    GrafanaApi { status: u16, message: String },
    /// A downstream API is temporarily unavailable (503, instance not yet
    /// ready). Reconciliation is retried after a short delay.
    #[error("{0}")]
    TemporarilyUnavailable(String),
    /// HTTP transport errors (timeouts, connection failures).
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Collected errors from concurrent per-instance branches. Successful
    /// branches have already been committed when this is raised.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<ControllerError>),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::Validation(_) => false,
            // Exhausted source chains are retried on the slow path, not in
            // a tight loop.
            ControllerError::ContentResolution(_) => false,
            ControllerError::GrafanaApi { status, .. } => *status >= 500,
            ControllerError::Aggregate(errors) => errors.iter().any(|e| e.is_temporary()),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_temporary() {
        assert!(!ControllerError::Validation("bad spec".to_string()).is_temporary());
        assert!(!ControllerError::ContentResolution("all sources failed".to_string()).is_temporary());
        assert!(ControllerError::TemporarilyUnavailable("503".to_string()).is_temporary());
        assert!(
            ControllerError::GrafanaApi {
                status: 503,
                message: "down".to_string()
            }
            .is_temporary()
        );
        assert!(
            !ControllerError::GrafanaApi {
                status: 412,
                message: "precondition".to_string()
            }
            .is_temporary()
        );
    }

    #[test]
    fn aggregate_is_temporary_if_any_branch_is() {
        let agg = ControllerError::Aggregate(vec![
            ControllerError::Validation("bad".to_string()),
            ControllerError::TemporarilyUnavailable("later".to_string()),
        ]);
        assert!(agg.is_temporary());
        let agg = ControllerError::Aggregate(vec![ControllerError::Validation("bad".to_string())]);
        assert!(!agg.is_temporary());
    }
}
