//! End-to-end smoke test against a real ssh server and Postgres.
//!
//! Prerequisites: an sshd on 127.0.0.1:2222 (user `testuser`, password
//! `testpass`) that can reach a Postgres host named `postgres` with
//! `pguser`/`pgpass` and a `testdb` database.
//!
//! Run with:
//!   cargo run --bin tunnel_smoke

use anyhow::{Result, bail};
use pgtunnel::database::{PgCredentials, PoolConfig, SqlxDriver};
use pgtunnel::error::TunnelError;
use pgtunnel::lifecycle::{LifecycleState, Orchestrator};
use pgtunnel::ssh::{
    AskpassProxy, SshAuthMethod, SshTunnel, SystemSsh, TunnelHandle, TunnelSpec, TunnelState,
    handle_askpass_mode,
};
use std::time::Duration;

const SSH_HOST: &str = "127.0.0.1";
const SSH_PORT: u16 = 2222;
const SSH_USER: &str = "testuser";
const SSH_PASS: &str = "testpass";

const PG_REMOTE_HOST: &str = "postgres";
const PG_REMOTE_PORT: u16 = 5432;
const PG_USER: &str = "pguser";
const PG_PASS: &str = "pgpass";
const PG_DB: &str = "testdb";

const LOCAL_PORT: u16 = 25433;

fn password_spec(password: &str) -> TunnelSpec {
    TunnelSpec::with_agent(SSH_HOST, SSH_PORT, SSH_USER, PG_REMOTE_HOST, PG_REMOTE_PORT)
        .with_auth(SshAuthMethod::Password(password.to_string()))
        .with_local_endpoint("127.0.0.1", LOCAL_PORT)
}

fn credentials() -> PgCredentials {
    PgCredentials {
        user: PG_USER.to_string(),
        password: PG_PASS.to_string(),
        database: PG_DB.to_string(),
        ssl_mode: "disable".to_string(),
    }
}

fn main() -> Result<()> {
    // Handle --askpass mode first (before any other initialization)
    handle_askpass_mode();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pgtunnel=debug,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    smol::block_on(async {
        println!("--- Test 1: handle open/close ---");
        test_handle_open_close().await?;

        println!("\n--- Test 2: endpoint registry ---");
        test_endpoint_in_use().await?;

        println!("\n--- Test 3: orchestrated query ---");
        test_orchestrated_query().await?;

        println!("\n--- Test 4: rejected password ---");
        test_rejected_password().await?;

        println!("\n--- Test 5: askpass script ---");
        test_askpass_script().await?;

        println!("\nAll smoke tests passed");
        Ok(())
    })
}

async fn test_handle_open_close() -> Result<()> {
    let handle = TunnelHandle::<SshTunnel>::new(password_spec(SSH_PASS));
    let local_addr = handle.open(&SystemSsh::new()).await?;
    println!("  tunnel listening on {}", local_addr);

    handle.close().await;
    handle.close().await;
    if handle.state().await != TunnelState::Closed {
        bail!("expected Closed after two closes, got {:?}", handle.state().await);
    }

    smol::Timer::after(Duration::from_millis(200)).await;
    if smol::net::TcpStream::connect(&local_addr).await.is_ok() {
        bail!("{} still accepting connections after close", local_addr);
    }
    println!("  ssh process terminated, {} closed", local_addr);
    Ok(())
}

async fn test_endpoint_in_use() -> Result<()> {
    let transport = SystemSsh::new();
    let first = TunnelHandle::<SshTunnel>::new(password_spec(SSH_PASS));
    let second = TunnelHandle::<SshTunnel>::new(password_spec(SSH_PASS));

    first.open(&transport).await?;
    let result = second.open(&transport).await;
    first.close().await;

    match result {
        Err(TunnelError::EndpointInUse(endpoint)) => {
            println!("  second handle rejected: {} in use", endpoint);
            Ok(())
        }
        other => bail!("expected EndpointInUse, got {:?}", other),
    }
}

async fn test_orchestrated_query() -> Result<()> {
    let orchestrator = Orchestrator::new(SystemSsh::new(), SqlxDriver::new(credentials()));

    let sum = orchestrator
        .run(password_spec(SSH_PASS), PoolConfig::default(), async |pool| {
            pool.query_scalar("SELECT 1 + 1").await
        })
        .await?;
    println!("  SELECT 1 + 1 = {}", sum.unwrap_or_default());

    let history = orchestrator.history().await;
    if history.last() != Some(&LifecycleState::Closed) {
        bail!("run did not end closed: {:?}", history);
    }
    println!("  lifecycle: {:?}", history);
    Ok(())
}

async fn test_rejected_password() -> Result<()> {
    let handle = TunnelHandle::<SshTunnel>::new(password_spec("definitely-wrong"));
    let result = handle.open(&SystemSsh::new()).await;
    handle.close().await;

    match result {
        Err(TunnelError::AuthRejected { detail, .. }) => {
            println!("  rejected as expected: {}", detail);
            Ok(())
        }
        other => bail!("expected AuthRejected, got {:?}", other),
    }
}

async fn test_askpass_script() -> Result<()> {
    let proxy = AskpassProxy::new().await?;
    let script = std::fs::read_to_string(proxy.script_path())?;

    if !script.contains("--askpass") {
        bail!("askpass script does not re-invoke the binary");
    }
    if script.contains(SSH_PASS) {
        bail!("askpass script contains the secret");
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::metadata(proxy.script_path())?.permissions();
        if perms.mode() & 0o100 == 0 {
            bail!("askpass script is not executable");
        }
    }
    println!("  askpass script re-invokes the binary and holds no secret");
    Ok(())
}
