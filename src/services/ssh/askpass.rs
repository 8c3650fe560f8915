//! Secret delivery to ssh through `SSH_ASKPASS`.
//!
//! The secret never touches disk. A private temp dir holds a Unix socket and
//! a two-line script; ssh runs the script, the script re-invokes this binary
//! with `--askpass <socket>`, and that process prints whatever the socket
//! hands it.
//!
//! Binaries that open tunnels must call [`handle_askpass_mode`] first thing
//! in `main()`.

use anyhow::{Context, Result};
use smol::Task;
use smol::io::AsyncWriteExt;
use smol::net::unix::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const ASKPASS_FLAG: &str = "--askpass";

/// If invoked as `<exe> --askpass <socket>`, print the secret and exit.
pub fn handle_askpass_mode() {
    let mut args = std::env::args().skip_while(|arg| arg != ASKPASS_FLAG);
    if args.next().is_none() {
        return;
    }

    let code = match args.next() {
        Some(socket_path) => match print_secret(Path::new(&socket_path)) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("pgtunnel askpass: {}", e);
                1
            }
        },
        None => {
            eprintln!("pgtunnel askpass: {} requires a socket path", ASKPASS_FLAG);
            1
        }
    };
    std::process::exit(code);
}

#[cfg(unix)]
fn print_secret(socket_path: &Path) -> std::io::Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let mut secret = String::new();
    UnixStream::connect(socket_path)?.read_to_string(&mut secret)?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(secret.as_bytes())?;
    stdout.flush()
}

#[cfg(not(unix))]
fn print_secret(_socket_path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "askpass delivery needs Unix sockets",
    ))
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn askpass_script(exe: &Path, socket_path: &Path) -> String {
    let exe = shell_quote(&exe.to_string_lossy());
    let socket = shell_quote(&socket_path.to_string_lossy());
    format!("#!/bin/sh\nexec {} {} {}\n", exe, ASKPASS_FLAG, socket)
}

/// Single-quote `s` for `/bin/sh`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Socket plus script answering ssh's secret prompts for one tunnel.
pub struct AskpassProxy {
    listener: UnixListener,
    script_path: PathBuf,
    socket_path: PathBuf,
    _dir: TempDir,
}

impl AskpassProxy {
    pub async fn new() -> Result<Self> {
        let dir = TempDir::with_prefix("pgtunnel-ssh-").context("Failed to create askpass dir")?;
        restrict(dir.path(), 0o700)?;

        let socket_path = dir.path().join("askpass.sock");
        let listener = UnixListener::bind(&socket_path).context("Failed to bind askpass socket")?;
        restrict(&socket_path, 0o600)?;

        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        let script_path = dir.path().join("askpass.sh");
        std::fs::write(&script_path, askpass_script(&exe, &socket_path))
            .context("Failed to write askpass script")?;
        restrict(&script_path, 0o700)?;

        tracing::debug!("Askpass proxy ready at {}", socket_path.display());

        Ok(Self {
            listener,
            script_path,
            socket_path,
            _dir: dir,
        })
    }

    /// Value for `SSH_ASKPASS`.
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Answer exactly one prompt.
    pub async fn serve_secret(&self, secret: &str) -> Result<()> {
        let (mut stream, _) = self
            .listener
            .accept()
            .await
            .context("askpass accept failed")?;

        stream.write_all(secret.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        tracing::debug!("Answered ssh secret prompt");
        Ok(())
    }

    /// Answer every prompt until the returned task is dropped. ssh asks again
    /// after a rejected password and once per encrypted key.
    pub fn serve_forever(self: Arc<Self>, secret: String) -> Task<()> {
        smol::spawn(async move {
            while let Ok(()) = self.serve_secret(&secret).await {}
            tracing::warn!("Askpass proxy at {} stopped", self.socket_path.display());
        })
    }
}
