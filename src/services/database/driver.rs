use super::query::convert_row;
use super::types::{PoolConfig, ResultRow};
use crate::error::{ConnectionError, QueryError};
use crate::services::ssh::split_host_port;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::fmt;
use std::future::Future;
use std::str::FromStr;

/// The database transport a `ConnectionPool` drives.
pub trait DatabaseDriver: Clone {
    type Client;

    /// Open a client to `target` honouring the pool bounds.
    fn connect(
        &self,
        target: &str,
        config: &PoolConfig,
    ) -> impl Future<Output = Result<Self::Client, ConnectionError>>;

    /// Round-trip check that the client is usable.
    fn ping(&self, client: &Self::Client) -> impl Future<Output = Result<(), ConnectionError>>;

    /// Run a statement and return its first row, if any.
    fn fetch_optional(
        &self,
        client: &Self::Client,
        statement: &str,
    ) -> impl Future<Output = Result<Option<ResultRow>, QueryError>>;

    /// Close every connection held by the client.
    fn close(&self, client: Self::Client) -> impl Future<Output = ()>;
}

/// Postgres login for the forwarded database.
#[derive(Clone, PartialEq, Eq)]
pub struct PgCredentials {
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
}

impl fmt::Debug for PgCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// `DatabaseDriver` backed by an sqlx `PgPool`.
#[derive(Debug, Clone)]
pub struct SqlxDriver {
    credentials: PgCredentials,
}

impl SqlxDriver {
    pub fn new(credentials: PgCredentials) -> Self {
        Self { credentials }
    }

    fn connect_options(&self, target: &str) -> Result<PgConnectOptions, ConnectionError> {
        let (host, port) = split_host_port(target, 5432).map_err(ConnectionError::InvalidTarget)?;
        let ssl_mode = PgSslMode::from_str(&self.credentials.ssl_mode).map_err(|e| {
            ConnectionError::InvalidTarget(format!(
                "sslmode '{}': {}",
                self.credentials.ssl_mode, e
            ))
        })?;

        Ok(PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&self.credentials.user)
            .password(&self.credentials.password)
            .database(&self.credentials.database)
            .ssl_mode(ssl_mode))
    }
}

impl DatabaseDriver for SqlxDriver {
    type Client = PgPool;

    async fn connect(&self, target: &str, config: &PoolConfig) -> Result<PgPool, ConnectionError> {
        let options = self.connect_options(target)?;

        let mut pool_opts = PgPoolOptions::new()
            .max_connections(config.max_open)
            .min_connections(config.max_idle.min(config.max_open))
            .idle_timeout(config.idle_timeout);
        if let Some(timeout) = config.acquire_timeout {
            pool_opts = pool_opts.acquire_timeout(timeout);
        }

        pool_opts
            .connect_with(options)
            .await
            .map_err(|e| ConnectionError::Connect {
                target: target.to_string(),
                detail: e.to_string(),
            })
    }

    async fn ping(&self, client: &PgPool) -> Result<(), ConnectionError> {
        let _: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(client)
            .await
            .map_err(|e| {
                let options = client.connect_options();
                ConnectionError::HealthCheck {
                    target: format!("{}:{}", options.get_host(), options.get_port()),
                    detail: e.to_string(),
                }
            })?;
        Ok(())
    }

    async fn fetch_optional(
        &self,
        client: &PgPool,
        statement: &str,
    ) -> Result<Option<ResultRow>, QueryError> {
        match sqlx::query(statement).fetch_optional(client).await {
            Ok(Some(row)) => Ok(Some(convert_row(&row))),
            Ok(None) | Err(sqlx::Error::RowNotFound) => Ok(None),
            Err(sqlx::Error::PoolClosed) => Err(QueryError::PoolClosed),
            Err(e) => Err(QueryError::Execution(e.to_string())),
        }
    }

    async fn close(&self, client: PgPool) {
        client.close().await;
    }
}
