use thiserror::Error;

/// Every failure the operator can hit between process start and exit.
///
/// All variants except the cleanup path are fatal; `main` logs them and
/// exits with [`Error::exit_code`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("scheme error: {0}")]
    Scheme(String),
    #[error("kind {0} is not registered in the scheme")]
    UnregisteredKind(String),
    #[error("invalid manager options: {0}")]
    Options(String),
    #[error("unable to resolve cluster connection: {0}")]
    Connection(String),
    #[error("unable to create controller {controller}: {reason}")]
    Registration { controller: String, reason: String },
    #[error("unable to create {kind} {namespace}/{name}: {source}")]
    Bootstrap { kind: String, name: String, namespace: String, #[source] source: Box<Error> },
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists { kind: String, name: String, namespace: String },
    #[error("leader election error: {0}")]
    LeaderElection(String),
    #[error("leader election lost for lease {0}")]
    LeadershipLost(String),
    #[error("runnable {name} failed: {reason}")]
    Runnable { name: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit status for a fatal error. Every fatal path exits 1.
    pub fn exit_code(&self) -> i32 { 1 }

    /// True when the API server rejected a create because the object exists.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409 && ae.reason == "AlreadyExists",
            Self::Bootstrap { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }

    pub fn runnable(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Runnable { name: name.into(), reason: reason.to_string() }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_fatal_error_exits_one() {
        assert_eq!(Error::Scheme("dup".into()).exit_code(), 1);
        assert_eq!(Error::LeadershipLost("lease".into()).exit_code(), 1);
        assert_eq!(Error::runnable("metrics", "bind").exit_code(), 1);
    }

    #[test]
    fn already_exists_is_seen_through_bootstrap_wrapper() {
        let inner = Error::AlreadyExists { kind: "Observability".into(), name: "a".into(), namespace: "b".into() };
        let wrapped = Error::Bootstrap { kind: "Observability".into(), name: "a".into(), namespace: "b".into(), source: Box::new(inner) };
        assert!(wrapped.is_already_exists());
        assert!(!Error::Connection("no kubeconfig".into()).is_already_exists());
    }

    #[test]
    fn api_conflict_is_already_exists() {
        let ae = kube::error::ErrorResponse { status: "Failure".into(), message: "exists".into(), reason: "AlreadyExists".into(), code: 409 };
        assert!(Error::Kube(kube::Error::Api(ae)).is_already_exists());
    }
}
