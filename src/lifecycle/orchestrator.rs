//! Sequencing of tunnel, pool and work, with a single idempotent cleanup.

use super::signals::ShutdownSignal;
use super::state::{LifecycleState, StateLog};
use crate::error::{QueryError, RunError};
use crate::services::database::{ConnectionPool, DatabaseDriver, PoolConfig};
use crate::services::ssh::{DEFAULT_CLOSE_TIMEOUT, TunnelHandle, TunnelSpec, TunnelTransport};
use async_lock::{Mutex, OnceCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How a run ended, and which exit status it maps to.
#[derive(Debug)]
pub enum RunOutcome<R> {
    Completed(R),
    Failed(RunError),
    Interrupted,
}

impl<R> RunOutcome<R> {
    /// The work's value, only when the run completed without interruption.
    pub fn completed(self) -> Option<R> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// 0 on completion or query failure, 1 on startup failure or interruption.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed(_) => 0,
            RunOutcome::Failed(e) => e.exit_code(),
            RunOutcome::Interrupted => 1,
        }
    }
}

/// Sole owner of the tunnel handle and connection pool for one run.
///
/// Resources are registered in fixed slots as they are acquired; `cleanup`
/// releases whatever is registered, pool before tunnel, exactly once.
pub struct Orchestrator<T: TunnelTransport, D: DatabaseDriver> {
    transport: T,
    driver: D,
    close_timeout: Duration,
    tunnel: OnceCell<TunnelHandle<T::Channel>>,
    pool: OnceCell<ConnectionPool<D>>,
    /// Held while a pool is being opened and registered
    pool_opening: Mutex<()>,
    released: AtomicBool,
    closed: OnceCell<()>,
    state: Mutex<StateLog>,
}

impl<T: TunnelTransport, D: DatabaseDriver> Orchestrator<T, D> {
    pub fn new(transport: T, driver: D) -> Self {
        Self {
            transport,
            driver,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            tunnel: OnceCell::new(),
            pool: OnceCell::new(),
            pool_opening: Mutex::new(()),
            released: AtomicBool::new(false),
            closed: OnceCell::new(),
            state: Mutex::new(StateLog::default()),
        }
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub async fn state(&self) -> LifecycleState {
        self.state.lock().await.current()
    }

    pub async fn history(&self) -> Vec<LifecycleState> {
        self.state.lock().await.history().to_vec()
    }

    pub fn tunnel(&self) -> Option<&TunnelHandle<T::Channel>> {
        self.tunnel.get()
    }

    pub fn pool(&self) -> Option<&ConnectionPool<D>> {
        self.pool.get()
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    async fn transition(&self, next: LifecycleState) {
        self.state.lock().await.advance(next);
    }

    /// Open the tunnel, open the pool on its local endpoint, run `work`, then
    /// release everything. Any failure releases what was opened and returns
    /// the originating error.
    pub async fn run<W, R>(
        &self,
        spec: TunnelSpec,
        pool_config: PoolConfig,
        work: W,
    ) -> Result<R, RunError>
    where
        W: AsyncFnOnce(&ConnectionPool<D>) -> Result<R, QueryError>,
    {
        let result = self.drive(spec, pool_config, work).await;

        if let Err(e) = &result {
            if *e != RunError::Interrupted {
                self.transition(LifecycleState::Failed).await;
                tracing::error!("Run failed: {}", e);
            }
        }

        self.cleanup().await;
        self.wait_closed().await;
        result
    }

    async fn drive<W, R>(
        &self,
        spec: TunnelSpec,
        pool_config: PoolConfig,
        work: W,
    ) -> Result<R, RunError>
    where
        W: AsyncFnOnce(&ConnectionPool<D>) -> Result<R, QueryError>,
    {
        if self.is_released() {
            return Err(RunError::Interrupted);
        }

        let handle = TunnelHandle::new(spec).with_close_timeout(self.close_timeout);
        let tunnel = self
            .tunnel
            .set(handle)
            .await
            .map_err(|_| RunError::AlreadyStarted)?;

        self.transition(LifecycleState::TunnelOpening).await;
        let local_addr = match tunnel.open(&self.transport).await {
            Ok(addr) => addr,
            Err(_) if self.is_released() => return Err(RunError::Interrupted),
            Err(e) => return Err(e.into()),
        };
        self.transition(LifecycleState::TunnelOpen).await;

        if self.is_released() {
            tunnel.close().await;
            return Err(RunError::Interrupted);
        }

        let pool = {
            let _opening = self.pool_opening.lock().await;
            if self.is_released() {
                return Err(RunError::Interrupted);
            }

            self.transition(LifecycleState::PoolOpening).await;
            let pool =
                match ConnectionPool::open(self.driver.clone(), &local_addr, pool_config).await {
                    Ok(pool) => pool,
                    Err(_) if self.is_released() => return Err(RunError::Interrupted),
                    Err(e) => return Err(e.into()),
                };
            match self.pool.set(pool).await {
                Ok(pool) => pool,
                Err(pool) => {
                    pool.close().await;
                    return Err(RunError::AlreadyStarted);
                }
            }
        };

        if self.is_released() {
            // Cleanup owns the registered pool and closes it before the tunnel
            return Err(RunError::Interrupted);
        }

        self.transition(LifecycleState::Ready).await;
        self.transition(LifecycleState::Working).await;

        Ok(work(pool).await?)
    }

    /// Release the pool, then the tunnel. Only the first caller does the
    /// work; later or concurrent callers return immediately.
    pub async fn cleanup(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            tracing::debug!("Cleanup already performed by another path");
            return;
        }

        self.transition(LifecycleState::Closing).await;

        // A pool still connecting must be registered before the tunnel goes
        let opening = self.pool_opening.lock().await;
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        drop(opening);
        if let Some(tunnel) = self.tunnel.get() {
            tunnel.close().await;
        }

        self.transition(LifecycleState::Closed).await;
        let _ = self.closed.set(()).await;
    }

    /// Resolve once some path has finished `cleanup`.
    pub async fn wait_closed(&self) {
        self.closed.wait().await;
    }

    /// Race `run` against a termination signal.
    ///
    /// A signal triggers cleanup immediately; the in-flight statement is not
    /// cancelled but its result is discarded. Returns only after release has
    /// finished on whichever path performed it.
    pub async fn run_until_signal<W, R>(
        &self,
        signal: &ShutdownSignal,
        spec: TunnelSpec,
        pool_config: PoolConfig,
        work: W,
    ) -> RunOutcome<R>
    where
        W: AsyncFnOnce(&ConnectionPool<D>) -> Result<R, QueryError>,
    {
        let interrupted = async {
            signal.recv().await;
            let state = self.state().await;
            tracing::warn!("Shutting down on signal during {}", state);
            self.cleanup().await;
            self.wait_closed().await;
            RunOutcome::Interrupted
        };

        let normal = async {
            match self.run(spec, pool_config, work).await {
                Ok(value) => RunOutcome::Completed(value),
                Err(RunError::Interrupted) => RunOutcome::Interrupted,
                Err(e) => RunOutcome::Failed(e),
            }
        };

        let outcome = smol::future::or(interrupted, normal).await;
        self.wait_closed().await;

        if signal.was_raised() {
            RunOutcome::Interrupted
        } else {
            outcome
        }
    }
}
