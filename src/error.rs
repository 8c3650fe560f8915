//! Error types for the tunnel-backed connection lifecycle.

use std::time::Duration;
use thiserror::Error;

/// Failures while establishing or owning the SSH tunnel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("SSH authentication rejected by {endpoint}: {detail}")]
    AuthRejected { endpoint: String, detail: String },

    #[error("SSH endpoint {endpoint} unreachable: {detail}")]
    Unreachable { endpoint: String, detail: String },

    #[error("Remote refused forwarding through {endpoint}: {detail}")]
    Refused { endpoint: String, detail: String },

    #[error("Local endpoint {0} is already bound by an active tunnel")]
    EndpointInUse(String),

    #[error("Cannot bind local endpoint {endpoint}: {detail}")]
    LocalBind { endpoint: String, detail: String },

    #[error("Failed to spawn ssh process: {0}")]
    Spawn(String),

    #[error("SSH tunnel via {endpoint} not ready after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("SSH process for {endpoint} exited with {status}: {detail}")]
    Exited {
        endpoint: String,
        status: String,
        detail: String,
    },

    #[error("Tunnel was closed while opening")]
    Cancelled,

    #[error("Tunnel handle was already opened")]
    AlreadyOpened,
}

const AUTH_PATTERNS: &[&str] = &[
    "permission denied",
    "authentication failed",
    "auth fail",
    "host key verification failed",
    "no supported authentication",
    "too many authentication failures",
    "invalid password",
    "key rejected",
    "publickey denied",
];

const UNREACHABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection timed out",
    "operation timed out",
    "connection reset",
    "network unreachable",
    "network is unreachable",
    "host unreachable",
    "no route to host",
    "could not resolve hostname",
    "name or service not known",
    "temporary failure",
];

const REFUSAL_PATTERNS: &[&str] = &[
    "administratively prohibited",
    "open failed",
    "forwarding failed",
    "could not request local forwarding",
    "port forwarding failed",
];

impl TunnelError {
    /// Classify the stderr of an ssh process that exited before the tunnel was ready.
    pub fn from_ssh_exit(endpoint: &str, status: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let detail = last_meaningful_line(stderr);
        let endpoint = endpoint.to_string();

        if AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
            return TunnelError::AuthRejected { endpoint, detail };
        }
        if lower.contains("address already in use") || lower.contains("cannot listen to port") {
            return TunnelError::LocalBind { endpoint, detail };
        }
        if REFUSAL_PATTERNS.iter().any(|p| lower.contains(p)) {
            return TunnelError::Refused { endpoint, detail };
        }
        if UNREACHABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
            return TunnelError::Unreachable { endpoint, detail };
        }

        TunnelError::Exited {
            endpoint,
            status: status.to_string(),
            detail,
        }
    }
}

fn last_meaningful_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("no diagnostic output")
        .to_string()
}

/// Failures while opening the connection pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid connection target: {0}")]
    InvalidTarget(String),

    #[error("Failed to connect to {target}: {detail}")]
    Connect { target: String, detail: String },

    #[error("Health check against {target} failed: {detail}")]
    HealthCheck { target: String, detail: String },
}

/// Failures while executing a statement. "No rows" is not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query failed: {0}")]
    Execution(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Empty query")]
    EmptyStatement,
}

/// Error returned by a full orchestrator run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Interrupted by termination signal")]
    Interrupted,

    #[error("Orchestrator has already been started")]
    AlreadyStarted,
}

impl RunError {
    /// Startup failures abort before any work was done.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            RunError::Tunnel(_) | RunError::Connection(_) | RunError::AlreadyStarted
        )
    }

    /// Process exit status for this error. A failed query still exits 0.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Query(_) => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_failure() {
        let err = TunnelError::from_ssh_exit(
            "bastion:22",
            "exit status: 255",
            "Warning: Permanently added 'bastion'\ndeploy@bastion: Permission denied (publickey).\n",
        );
        assert!(matches!(err, TunnelError::AuthRejected { .. }));
        assert!(err.to_string().contains("Permission denied (publickey)."));
    }

    #[test]
    fn test_classify_unreachable() {
        let err = TunnelError::from_ssh_exit(
            "10.255.0.1:22",
            "exit status: 255",
            "ssh: connect to host 10.255.0.1 port 22: Connection timed out",
        );
        assert!(matches!(err, TunnelError::Unreachable { .. }));

        let err = TunnelError::from_ssh_exit(
            "nowhere.invalid:22",
            "exit status: 255",
            "ssh: Could not resolve hostname nowhere.invalid: Name or service not known",
        );
        assert!(matches!(err, TunnelError::Unreachable { .. }));
    }

    #[test]
    fn test_classify_remote_refusal() {
        let err = TunnelError::from_ssh_exit(
            "bastion:22",
            "exit status: 255",
            "channel 2: open failed: administratively prohibited: open failed",
        );
        assert!(matches!(err, TunnelError::Refused { .. }));
    }

    #[test]
    fn test_classify_local_bind() {
        let err = TunnelError::from_ssh_exit(
            "bastion:22",
            "exit status: 255",
            "bind [127.0.0.1]:25432: Address already in use\nCould not request local forwarding.",
        );
        assert!(matches!(err, TunnelError::LocalBind { .. }));
    }

    #[test]
    fn test_classify_unknown_exit() {
        let err = TunnelError::from_ssh_exit("bastion:22", "exit status: 1", "");
        assert_eq!(
            err,
            TunnelError::Exited {
                endpoint: "bastion:22".to_string(),
                status: "exit status: 1".to_string(),
                detail: "no diagnostic output".to_string(),
            }
        );
    }

    #[test]
    fn test_run_error_exit_codes() {
        assert_eq!(RunError::Query(QueryError::PoolClosed).exit_code(), 0);
        assert_eq!(RunError::Interrupted.exit_code(), 1);
        assert_eq!(RunError::Tunnel(TunnelError::Cancelled).exit_code(), 1);
        assert_eq!(
            RunError::Connection(ConnectionError::InvalidTarget("x".into())).exit_code(),
            1
        );
    }

    #[test]
    fn test_startup_failure() {
        assert!(RunError::Tunnel(TunnelError::AlreadyOpened).is_startup_failure());
        assert!(
            RunError::Connection(ConnectionError::HealthCheck {
                target: "127.0.0.1:25432".into(),
                detail: "timeout".into()
            })
            .is_startup_failure()
        );
        assert!(!RunError::Query(QueryError::EmptyStatement).is_startup_failure());
        assert!(!RunError::Interrupted.is_startup_failure());
    }
}
