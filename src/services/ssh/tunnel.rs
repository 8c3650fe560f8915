//! SSH tunnel implementation using system ssh binary.
//!
//! Using the system `ssh` rather than an SSH library keeps the user's
//! `~/.ssh/config`, ssh-agent and ProxyJump setups working unchanged.

use super::askpass::AskpassProxy;
use super::handle::{TunnelChannel, TunnelTransport};
use super::types::{SshAuthMethod, TunnelSpec, join_host_port};
use crate::error::TunnelError;
use futures::StreamExt;
use smol::io::{AsyncBufReadExt, BufReader};
use smol::net::TcpListener;
use smol::process::{Child, Command, Stdio};
use smol::Task;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default time allowed for ssh to authenticate and bind the local port.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_TAIL_LINES: usize = 20;

/// Tunnel transport that spawns `ssh -N -L`.
#[derive(Debug, Clone)]
pub struct SystemSsh {
    program: String,
    open_timeout: Duration,
}

impl Default for SystemSsh {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

impl SystemSsh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

impl TunnelTransport for SystemSsh {
    type Channel = SshTunnel;

    async fn open(&self, spec: &TunnelSpec) -> Result<SshTunnel, TunnelError> {
        SshTunnel::start(spec, &self.program, self.open_timeout).await
    }
}

/// An active SSH tunnel using the system ssh binary with -L port forwarding.
pub struct SshTunnel {
    ssh_url: String,
    local_addr: String,
    process: Child,
    _askpass: Option<(Arc<AskpassProxy>, Task<()>)>,
}

impl SshTunnel {
    /// Spawn `ssh -L` and wait until the local port accepts connections.
    pub async fn start(
        spec: &TunnelSpec,
        program: &str,
        open_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let local_port = if spec.local_bind_port() == 0 {
            find_available_port(spec.local_bind_host()).await?
        } else {
            ensure_port_free(spec.local_bind_host(), spec.local_bind_port()).await?;
            spec.local_bind_port()
        };
        let local_addr = join_host_port(spec.local_bind_host(), local_port);
        let ssh_endpoint = spec.ssh_endpoint();

        let mut cmd = Command::new(program);

        // Kill the ssh process when this handle is dropped
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.args(ssh_args(spec, local_port, open_timeout));

        let askpass = match spec.auth_method().askpass_secret() {
            Some(secret) => {
                let proxy = Arc::new(
                    AskpassProxy::new()
                        .await
                        .map_err(|e| TunnelError::Spawn(format!("askpass setup: {:#}", e)))?,
                );
                cmd.env("SSH_ASKPASS", proxy.script_path());
                cmd.env("SSH_ASKPASS_REQUIRE", "force");
                // Need to detach from terminal for askpass to work
                cmd.env("DISPLAY", ":0");
                let task = proxy.clone().serve_forever(secret.to_string());
                Some((proxy, task))
            }
            None => None,
        };

        tracing::info!(
            "Starting SSH tunnel: ssh -L {}:{} -N {}",
            local_addr,
            spec.remote_endpoint(),
            spec.ssh_url()
        );
        tracing::debug!("Full SSH command: {:?}", cmd);

        let mut process = cmd
            .spawn()
            .map_err(|e| TunnelError::Spawn(e.to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(Vec::<String>::new()));
        if let Some(stderr) = process.stderr.take() {
            let tail = stderr_tail.clone();
            let ssh_url = spec.ssh_url();
            smol::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(result) = lines.next().await {
                    match result {
                        Ok(line) => {
                            tracing::debug!("SSH stderr ({}): {}", ssh_url, line);
                            let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.remove(0);
                            }
                            tail.push(line);
                        }
                        Err(e) => {
                            tracing::debug!("SSH stderr read error: {}", e);
                            break;
                        }
                    }
                }
            })
            .detach();
        }

        let started = Instant::now();
        loop {
            if let Ok(Some(status)) = process.try_status() {
                // Let the stderr reader drain the final lines
                smol::Timer::after(Duration::from_millis(50)).await;
                let stderr = stderr_tail
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .join("\n");
                return Err(TunnelError::from_ssh_exit(
                    &ssh_endpoint,
                    &status.to_string(),
                    &stderr,
                ));
            }

            if smol::net::TcpStream::connect(&local_addr).await.is_ok() {
                break;
            }

            if started.elapsed() >= open_timeout {
                let _ = process.kill();
                return Err(TunnelError::Timeout {
                    endpoint: ssh_endpoint,
                    after: open_timeout,
                });
            }

            smol::Timer::after(READY_POLL_INTERVAL).await;
        }

        Ok(Self {
            ssh_url: spec.ssh_url(),
            local_addr,
            process,
            _askpass: askpass,
        })
    }
}

impl TunnelChannel for SshTunnel {
    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    async fn shutdown(&mut self) {
        tracing::debug!("Shutting down SSH tunnel to {}", self.ssh_url);

        #[cfg(unix)]
        {
            unsafe {
                libc::kill(self.process.id() as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.process.kill();
        }

        let _ = self.process.status().await;
    }

    fn force_close(&mut self) {
        let _ = self.process.kill();
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        // Ensure process is killed when tunnel is dropped
        let _ = self.process.kill();
    }
}

/// Arguments passed to ssh for one forward, destination last.
fn ssh_args(spec: &TunnelSpec, local_port: u16, open_timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "-L".to_string(),
        format!(
            "{}:{}",
            join_host_port(spec.local_bind_host(), local_port),
            spec.remote_endpoint()
        ),
        // Keep connection alive but don't execute a remote command
        "-N".to_string(),
    ];

    let options = [
        "ExitOnForwardFailure=yes".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "ServerAliveInterval=15".to_string(),
        "ServerAliveCountMax=3".to_string(),
        format!("ConnectTimeout={}", open_timeout.as_secs().max(1)),
    ];
    for option in options {
        args.push("-o".to_string());
        args.push(option);
    }

    if spec.ssh_port() != 22 {
        args.push("-p".to_string());
        args.push(spec.ssh_port().to_string());
    }

    match spec.auth_method() {
        SshAuthMethod::Agent => {
            // Never prompt on a terminal we do not own
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        SshAuthMethod::Password(_) => {}
        SshAuthMethod::PublicKey {
            private_key_path, ..
        } => {
            args.push("-i".to_string());
            args.push(private_key_path.clone());
        }
    }

    args.extend(spec.extra_args().iter().cloned());
    args.push(spec.ssh_url());
    args
}

/// Find an available port to bind to
async fn find_available_port(bind_host: &str) -> Result<u16, TunnelError> {
    let endpoint = join_host_port(bind_host, 0);
    let listener = TcpListener::bind(&endpoint)
        .await
        .map_err(|e| TunnelError::LocalBind {
            endpoint: endpoint.clone(),
            detail: e.to_string(),
        })?;
    let port = listener
        .local_addr()
        .map_err(|e| TunnelError::LocalBind {
            endpoint,
            detail: e.to_string(),
        })?
        .port();
    drop(listener);
    Ok(port)
}

/// Fail early when something outside this process already holds the port.
async fn ensure_port_free(bind_host: &str, port: u16) -> Result<(), TunnelError> {
    let endpoint = join_host_port(bind_host, port);
    TcpListener::bind(&endpoint)
        .await
        .map(drop)
        .map_err(|e| TunnelError::LocalBind {
            endpoint,
            detail: e.to_string(),
        })
}
