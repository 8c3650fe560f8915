use super::driver::DatabaseDriver;
use super::types::{PoolConfig, QueryOutcome};
use crate::error::{ConnectionError, QueryError};
use async_lock::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Tracing target for slow-query records.
pub const SLOW_QUERY_TARGET: &str = "pgtunnel::slow_query";

/// Pooled client to one database endpoint.
///
/// The client slot is read-locked for the duration of a statement, so
/// `close` waits for in-flight statements instead of cancelling them.
pub struct ConnectionPool<D: DatabaseDriver> {
    driver: D,
    target: String,
    config: PoolConfig,
    client: RwLock<Option<D::Client>>,
    closed: AtomicBool,
    slow_queries: AtomicU64,
}

impl<D: DatabaseDriver> ConnectionPool<D> {
    /// Connect to `target`, health-check immediately, and apply the bounds.
    pub async fn open(
        driver: D,
        target: &str,
        config: PoolConfig,
    ) -> Result<Self, ConnectionError> {
        if config.max_idle > config.max_open {
            tracing::warn!(
                "max_idle ({}) exceeds max_open ({}); idle connections are capped at max_open",
                config.max_idle,
                config.max_open
            );
        }

        let client = driver.connect(target, &config).await.inspect_err(|e| {
            tracing::error!("Error connecting to {}: {}", target, e);
        })?;

        if let Err(e) = driver.ping(&client).await {
            tracing::error!("Health check against {} failed: {}", target, e);
            driver.close(client).await;
            return Err(match e {
                ConnectionError::HealthCheck { detail, .. } => ConnectionError::HealthCheck {
                    target: target.to_string(),
                    detail,
                },
                other => other,
            });
        }

        tracing::info!(
            "Connection pool open on {} (max_idle={}, max_open={})",
            target,
            config.max_idle,
            config.max_open
        );

        Ok(Self {
            driver,
            target: target.to_string(),
            config,
            client: RwLock::new(Some(client)),
            closed: AtomicBool::new(false),
            slow_queries: AtomicU64::new(0),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of statements that crossed the slow-query threshold.
    pub fn slow_query_count(&self) -> u64 {
        self.slow_queries.load(Ordering::Relaxed)
    }

    /// Run one statement and return its first row, or `NoRows`.
    pub async fn execute(&self, statement: &str) -> Result<QueryOutcome, QueryError> {
        let statement = statement.trim();
        if statement.is_empty() {
            return Err(QueryError::EmptyStatement);
        }

        let client_guard = self.client.read().await;
        let client = client_guard.as_ref().ok_or(QueryError::PoolClosed)?;

        let start_time = Instant::now();
        let result = self.driver.fetch_optional(client, statement).await;
        let elapsed = start_time.elapsed();
        drop(client_guard);

        if elapsed > self.config.slow_query_threshold {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                target: SLOW_QUERY_TARGET,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.config.slow_query_threshold.as_millis() as u64,
                statement,
                "Slow query"
            );
        }

        match result {
            Ok(Some(row)) => Ok(QueryOutcome::Row { row, elapsed }),
            Ok(None) => {
                tracing::debug!("Statement returned no rows: {}", statement);
                Ok(QueryOutcome::NoRows { elapsed })
            }
            Err(e) => {
                tracing::error!("Statement failed after {:?}: {}", elapsed, e);
                Err(e)
            }
        }
    }

    /// First cell of the first row; `None` for no rows or NULL.
    pub async fn query_scalar(&self, statement: &str) -> Result<Option<String>, QueryError> {
        Ok(self.execute(statement).await?.into_scalar())
    }

    /// Close all pooled connections. Idempotent and safe to call concurrently.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Connection pool on {} already closed", self.target);
            return;
        }

        let client = self.client.write().await.take();
        if let Some(client) = client {
            self.driver.close(client).await;
            tracing::info!("Connection pool on {} closed", self.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EventLog, FakeDriver, count_row};
    use std::time::Duration;

    const TARGET: &str = "127.0.0.1:25432";

    #[test]
    fn test_open_runs_health_check() {
        smol::block_on(async {
            let log = EventLog::default();
            let pool = ConnectionPool::open(FakeDriver::new(log.clone()), TARGET, PoolConfig::default())
                .await
                .unwrap();

            assert_eq!(pool.target(), TARGET);
            assert_eq!(log.events(), vec!["pool.open", "pool.ping"]);
            pool.close().await;
        });
    }

    #[test]
    fn test_health_check_failure_closes_client() {
        smol::block_on(async {
            let log = EventLog::default();
            let driver = FakeDriver::new(log.clone()).failing_ping(ConnectionError::HealthCheck {
                target: String::new(),
                detail: "server closed the connection".into(),
            });

            let err = ConnectionPool::open(driver, TARGET, PoolConfig::default())
                .await
                .err()
                .unwrap();

            assert_eq!(
                err,
                ConnectionError::HealthCheck {
                    target: TARGET.into(),
                    detail: "server closed the connection".into()
                }
            );
            assert_eq!(log.events(), vec!["pool.open", "pool.ping", "pool.close"]);
        });
    }

    #[test]
    fn test_connect_failure() {
        smol::block_on(async {
            let log = EventLog::default();
            let driver = FakeDriver::new(log.clone()).failing_connect(ConnectionError::Connect {
                target: TARGET.into(),
                detail: "connection refused".into(),
            });
            let result = ConnectionPool::open(driver, TARGET, PoolConfig::default()).await;
            assert!(matches!(result, Err(ConnectionError::Connect { .. })));
            assert_eq!(log.count("pool.ping"), 0);
        });
    }

    #[test]
    fn test_execute_returns_row() {
        smol::block_on(async {
            let log = EventLog::default();
            let driver = FakeDriver::new(log.clone()).returning(count_row("42"));
            let pool = ConnectionPool::open(driver, TARGET, PoolConfig::default())
                .await
                .unwrap();

            let outcome = pool.execute("select count(*) from users").await.unwrap();
            assert_eq!(outcome.row(), Some(&count_row("42")));
            assert_eq!(
                pool.query_scalar("select count(*) from users").await,
                Ok(Some("42".to_string()))
            );
        });
    }

    #[test]
    fn test_no_rows_is_not_an_error() {
        smol::block_on(async {
            let log = EventLog::default();
            let pool = ConnectionPool::open(FakeDriver::new(log), TARGET, PoolConfig::default())
                .await
                .unwrap();

            let outcome = pool
                .execute("select id from users where email = 'nobody@example.com'")
                .await
                .unwrap();
            assert!(outcome.is_no_rows());
        });
    }

    #[test]
    fn test_query_error_surfaces() {
        smol::block_on(async {
            let log = EventLog::default();
            let driver = FakeDriver::new(log)
                .failing_query(QueryError::Execution("relation \"users\" does not exist".into()));
            let pool = ConnectionPool::open(driver, TARGET, PoolConfig::default())
                .await
                .unwrap();

            assert!(matches!(
                pool.execute("select count(*) from users").await,
                Err(QueryError::Execution(_))
            ));
            assert_eq!(pool.execute("   ").await, Err(QueryError::EmptyStatement));
        });
    }

    #[test]
    fn test_execute_after_close() {
        smol::block_on(async {
            let log = EventLog::default();
            let pool = ConnectionPool::open(FakeDriver::new(log.clone()), TARGET, PoolConfig::default())
                .await
                .unwrap();

            pool.close().await;
            pool.close().await;

            assert!(pool.is_closed());
            assert_eq!(log.count("pool.close"), 1);
            assert_eq!(pool.execute("select 1").await, Err(QueryError::PoolClosed));
        });
    }

    #[test]
    fn test_slow_query_recorded_but_returned() {
        smol::block_on(async {
            let log = EventLog::default();
            let driver = FakeDriver::new(log)
                .returning(count_row("42"))
                .with_query_delay(Duration::from_millis(40));
            let pool = ConnectionPool::open(driver, TARGET, PoolConfig::default())
                .await
                .unwrap();

            let outcome = pool.execute("select count(*) from users").await.unwrap();
            assert!(outcome.elapsed() >= Duration::from_millis(20));
            assert_eq!(outcome.into_scalar(), Some("42".to_string()));
            assert_eq!(pool.slow_query_count(), 1);
        });
    }

    #[test]
    fn test_fast_query_not_recorded() {
        smol::block_on(async {
            let log = EventLog::default();
            let config = PoolConfig {
                slow_query_threshold: Duration::from_secs(5),
                ..PoolConfig::default()
            };
            let pool = ConnectionPool::open(FakeDriver::new(log).returning(count_row("1")), TARGET, config)
                .await
                .unwrap();

            pool.execute("select 1").await.unwrap();
            assert_eq!(pool.slow_query_count(), 0);
        });
    }

    #[test]
    fn test_close_waits_for_in_flight_statement() {
        smol::block_on(async {
            let log = EventLog::default();
            let driver = FakeDriver::new(log.clone())
                .returning(count_row("42"))
                .with_query_delay(Duration::from_millis(30));
            let pool = ConnectionPool::open(driver, TARGET, PoolConfig::default())
                .await
                .unwrap();

            let (result, ()) = futures::join!(pool.execute("select count(*) from users"), async {
                smol::Timer::after(Duration::from_millis(5)).await;
                pool.close().await;
            });

            assert!(result.is_ok());
            assert_eq!(
                log.events(),
                vec!["pool.open", "pool.ping", "pool.query", "pool.close"]
            );
        });
    }
}
