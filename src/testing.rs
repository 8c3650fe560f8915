//! In-memory tunnel transport and database driver for tests.
//!
//! Every underlying open, close and query is appended to a shared
//! `EventLog` so tests can assert ordering and call counts directly.

use crate::error::{ConnectionError, QueryError, TunnelError};
use crate::services::database::{DatabaseDriver, PoolConfig, ResultCell, ResultRow};
use crate::services::ssh::{TunnelChannel, TunnelSpec, TunnelTransport, join_host_port};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

pub fn spec_on_port(port: u16) -> TunnelSpec {
    TunnelSpec::with_agent("bastion.test", 22, "deploy", "127.0.0.1", 5432)
        .with_local_endpoint("127.0.0.1", port)
}

pub fn count_row(value: &str) -> ResultRow {
    ResultRow {
        cells: vec![ResultCell {
            column: "count".to_string(),
            type_name: "INT8".to_string(),
            value: value.to_string(),
            is_null: false,
        }],
    }
}

#[derive(Debug, Clone)]
pub struct FakeTransport {
    log: EventLog,
    fail_with: Option<TunnelError>,
    open_delay: Duration,
    shutdown_delay: Duration,
    resolved_port: u16,
}

impl FakeTransport {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_with: None,
            open_delay: Duration::ZERO,
            shutdown_delay: Duration::ZERO,
            resolved_port: 0,
        }
    }

    pub fn failing(mut self, error: TunnelError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    pub fn resolving_port(mut self, port: u16) -> Self {
        self.resolved_port = port;
        self
    }
}

impl TunnelTransport for FakeTransport {
    type Channel = FakeChannel;

    async fn open(&self, spec: &TunnelSpec) -> Result<FakeChannel, TunnelError> {
        self.log.push("tunnel.open");
        smol::Timer::after(self.open_delay).await;
        if let Some(error) = self.fail_with.clone() {
            return Err(error);
        }
        let port = match spec.local_bind_port() {
            0 => self.resolved_port,
            port => port,
        };
        Ok(FakeChannel {
            log: self.log.clone(),
            local_addr: join_host_port(spec.local_bind_host(), port),
            shutdown_delay: self.shutdown_delay,
        })
    }
}

#[derive(Debug)]
pub struct FakeChannel {
    log: EventLog,
    local_addr: String,
    shutdown_delay: Duration,
}

impl TunnelChannel for FakeChannel {
    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    async fn shutdown(&mut self) {
        smol::Timer::after(self.shutdown_delay).await;
        self.log.push("tunnel.close");
    }

    fn force_close(&mut self) {
        self.log.push("tunnel.force_close");
    }
}

#[derive(Debug, Clone)]
pub struct FakeDriver {
    log: EventLog,
    connect_error: Option<ConnectionError>,
    ping_error: Option<ConnectionError>,
    query_error: Option<QueryError>,
    row: Option<ResultRow>,
    connect_delay: Duration,
    query_delay: Duration,
    close_delay: Duration,
}

impl FakeDriver {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            connect_error: None,
            ping_error: None,
            query_error: None,
            row: None,
            connect_delay: Duration::ZERO,
            query_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
        }
    }

    pub fn returning(mut self, row: ResultRow) -> Self {
        self.row = Some(row);
        self
    }

    pub fn failing_connect(mut self, error: ConnectionError) -> Self {
        self.connect_error = Some(error);
        self
    }

    pub fn failing_ping(mut self, error: ConnectionError) -> Self {
        self.ping_error = Some(error);
        self
    }

    pub fn failing_query(mut self, error: QueryError) -> Self {
        self.query_error = Some(error);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }
}

#[derive(Debug)]
pub struct FakeClient {
    pub target: String,
    pub max_open: u32,
}

impl DatabaseDriver for FakeDriver {
    type Client = FakeClient;

    async fn connect(&self, target: &str, config: &PoolConfig) -> Result<FakeClient, ConnectionError> {
        smol::Timer::after(self.connect_delay).await;
        self.log.push("pool.open");
        if let Some(error) = self.connect_error.clone() {
            return Err(error);
        }
        Ok(FakeClient {
            target: target.to_string(),
            max_open: config.max_open,
        })
    }

    async fn ping(&self, _client: &FakeClient) -> Result<(), ConnectionError> {
        self.log.push("pool.ping");
        match self.ping_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn fetch_optional(
        &self,
        _client: &FakeClient,
        _statement: &str,
    ) -> Result<Option<ResultRow>, QueryError> {
        smol::Timer::after(self.query_delay).await;
        self.log.push("pool.query");
        match self.query_error.clone() {
            Some(error) => Err(error),
            None => Ok(self.row.clone()),
        }
    }

    async fn close(&self, _client: FakeClient) {
        smol::Timer::after(self.close_delay).await;
        self.log.push("pool.close");
    }
}
