//! SSH tunnel specification types.

use std::fmt;

/// Authentication method for SSH connections
#[derive(Clone, PartialEq, Eq, Default)]
pub enum SshAuthMethod {
    /// Use ssh-agent or system default authentication (recommended)
    #[default]
    Agent,
    /// Password authentication (delivered through SSH_ASKPASS)
    Password(String),
    /// Public key file with optional passphrase
    PublicKey {
        private_key_path: String,
        passphrase: Option<String>,
    },
}

impl SshAuthMethod {
    /// Secret that has to be handed to ssh through askpass, if any.
    pub fn askpass_secret(&self) -> Option<&str> {
        match self {
            SshAuthMethod::Agent => None,
            SshAuthMethod::Password(password) => Some(password),
            SshAuthMethod::PublicKey { passphrase, .. } => passphrase.as_deref(),
        }
    }
}

impl fmt::Debug for SshAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuthMethod::Agent => f.write_str("Agent"),
            SshAuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuthMethod::PublicKey {
                private_key_path,
                passphrase,
            } => f
                .debug_struct("PublicKey")
                .field("private_key_path", private_key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Immutable description of one SSH port forward.
///
/// Built once from configuration and handed to a `TunnelHandle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    ssh_host: String,
    ssh_port: u16,
    ssh_user: String,
    auth_method: SshAuthMethod,
    remote_host: String,
    remote_port: u16,
    local_bind_host: String,
    local_bind_port: u16,
    extra_args: Vec<String>,
}

impl TunnelSpec {
    /// Create a tunnel spec using ssh-agent authentication
    pub fn with_agent(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        ssh_user: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port,
            ssh_user: ssh_user.into(),
            auth_method: SshAuthMethod::Agent,
            remote_host: remote_host.into(),
            remote_port,
            local_bind_host: "127.0.0.1".to_string(),
            local_bind_port: 0,
            extra_args: Vec::new(),
        }
    }

    /// Replace the authentication method
    pub fn with_auth(mut self, auth_method: SshAuthMethod) -> Self {
        self.auth_method = auth_method;
        self
    }

    /// Set the local bind address (port 0 auto-assigns)
    pub fn with_local_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_bind_host = host.into();
        self.local_bind_port = port;
        self
    }

    /// Add extra SSH arguments
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn ssh_user(&self) -> &str {
        &self.ssh_user
    }

    pub fn auth_method(&self) -> &SshAuthMethod {
        &self.auth_method
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_bind_host(&self) -> &str {
        &self.local_bind_host
    }

    pub fn local_bind_port(&self) -> u16 {
        self.local_bind_port
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    /// `host:port` of the SSH server
    pub fn ssh_endpoint(&self) -> String {
        join_host_port(&self.ssh_host, self.ssh_port)
    }

    /// `host:port` of the service as seen from the SSH server
    pub fn remote_endpoint(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }

    /// Requested local `host:port`; port may be 0
    pub fn local_endpoint(&self) -> String {
        join_host_port(&self.local_bind_host, self.local_bind_port)
    }

    /// Build the SSH URL (user@host)
    pub fn ssh_url(&self) -> String {
        if self.ssh_user.is_empty() {
            self.ssh_host.clone()
        } else {
            format!("{}@{}", self.ssh_user, self.ssh_host)
        }
    }
}

/// Inverse of `split_host_port`: IPv6 literals are bracketed again.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split `host[:port]` into its parts. Bracketed IPv6 hosts are accepted.
pub fn split_host_port(address: &str, default_port: u16) -> Result<(String, u16), String> {
    let address = address.trim();
    if address.is_empty() {
        return Err("empty address".to_string());
    }

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 literal in '{}'", address))?;
        (host, tail.strip_prefix(':'))
    } else {
        match address.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (address, None),
        }
    };

    if host.is_empty() {
        return Err(format!("missing host in '{}'", address));
    }

    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}' in '{}'", p, address))?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}
