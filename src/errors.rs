use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy shared by every reconciler. The multi-cluster workers map
/// these onto queue operations: fail-fast errors are dropped, transient ones
/// are rate-limit requeued, invalid configuration surfaces as a condition on
/// the offending object and is never requeued.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists with a different owner: {0}")]
    AlreadyExists(String),

    #[error("uid precondition failed for {0}")]
    UidConflict(String),

    #[error("invalid hierarchy configuration: {0}")]
    InvalidConfig(String),

    #[error("tenant cluster {0} is not synced yet")]
    ClusterNotReady(String),

    #[error("cannot place namespace {0}: {1}")]
    Unschedulable(String, String),

    #[error("rejected by the apiserver")]
    FailFast(#[source] kube::Error),

    #[error("transient apiserver failure")]
    Transient(#[source] kube::Error),

    #[error("kubeconfig for tenant cluster {0} is unusable: {1}")]
    BadKubeconfig(String, String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Buckets a raw client error by apiserver status code.
    pub fn classify(err: kube::Error) -> Error {
        match &err {
            kube::Error::Api(ae) => match ae.code {
                404 => Error::NotFound(ae.message.clone()),
                409 if ae.reason == "Conflict" => Error::UidConflict(ae.message.clone()),
                409 => Error::AlreadyExists(ae.message.clone()),
                400 | 403 | 422 => Error::FailFast(err),
                _ => Error::Transient(err),
            },
            _ => Error::Transient(err),
        }
    }

    /// Fail-fast errors are dropped from the queue instead of retried.
    pub fn is_fail_fast(&self) -> bool {
        matches!(self, Error::FailFast(_) | Error::InvalidConfig(_))
    }

    /// Whether a retry can reasonably succeed without new input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_)
                | Error::ClusterNotReady(_)
                | Error::UidConflict(_)
                | Error::Unschedulable(_, _)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classify_buckets_by_status_code() {
        assert!(matches!(
            Error::classify(api_error(404, "NotFound")),
            Error::NotFound(_)
        ));
        assert!(matches!(
            Error::classify(api_error(409, "Conflict")),
            Error::UidConflict(_)
        ));
        assert!(matches!(
            Error::classify(api_error(409, "AlreadyExists")),
            Error::AlreadyExists(_)
        ));
        assert!(Error::classify(api_error(403, "Forbidden")).is_fail_fast());
        assert!(Error::classify(api_error(400, "BadRequest")).is_fail_fast());
        assert!(Error::classify(api_error(500, "InternalError")).is_retryable());
    }

    #[test]
    fn cluster_not_ready_is_retryable_not_fatal() {
        let err = Error::ClusterNotReady("t1".into());
        assert!(err.is_retryable());
        assert!(!err.is_fail_fast());
    }
}
