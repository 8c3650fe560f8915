//! Owned tunnel handle with idempotent, bounded close.
//!
//! The handle is created in the `Closed` state, moves through `Opening` to
//! `Open` (or `ClosedWithError`), and can be closed from any path any number
//! of times. Only the first close releases the underlying channel.

use super::types::TunnelSpec;
use crate::error::TunnelError;
use async_channel::{Receiver, Sender};
use async_lock::{Mutex, RwLock};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;
use std::time::Duration;

/// Default upper bound for a graceful tunnel shutdown.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Something that can establish a forwarding channel for a `TunnelSpec`.
pub trait TunnelTransport {
    type Channel: TunnelChannel;

    /// Resolve once the channel is ready to carry traffic, or fail.
    fn open(&self, spec: &TunnelSpec) -> impl Future<Output = Result<Self::Channel, TunnelError>>;
}

/// An established forwarding channel.
pub trait TunnelChannel {
    /// Local `host:port` the channel listens on.
    fn local_addr(&self) -> String;

    /// Graceful release. May be abandoned after the close timeout.
    fn shutdown(&mut self) -> impl Future<Output = ()>;

    /// Immediate release, used when `shutdown` overran its budget.
    fn force_close(&mut self);
}

/// Tunnel lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelState {
    /// Open has been requested and is in flight
    Opening,
    /// Tunnel is active and forwarding
    Open { local_addr: String },
    /// Never opened, or released cleanly
    Closed,
    /// Failed to open, or was force-released on close
    ClosedWithError { error: String },
}

impl TunnelState {
    /// Returns true if the tunnel is usable for connections
    pub fn is_open(&self) -> bool {
        matches!(self, TunnelState::Open { .. })
    }

    /// Returns the local address if open
    pub fn local_addr(&self) -> Option<&str> {
        match self {
            TunnelState::Open { local_addr } => Some(local_addr),
            _ => None,
        }
    }
}

static ACTIVE_ENDPOINTS: LazyLock<std::sync::Mutex<HashSet<String>>> =
    LazyLock::new(|| std::sync::Mutex::new(HashSet::new()));

/// Claim on a local endpoint, released on drop.
#[derive(Debug)]
struct EndpointClaim {
    endpoint: String,
}

impl EndpointClaim {
    fn acquire(endpoint: &str) -> Result<Self, TunnelError> {
        let mut active = ACTIVE_ENDPOINTS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(endpoint.to_string()) {
            return Err(TunnelError::EndpointInUse(endpoint.to_string()));
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
        })
    }
}

impl Drop for EndpointClaim {
    fn drop(&mut self) {
        let mut active = ACTIVE_ENDPOINTS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.endpoint);
    }
}

struct OpenChannel<C> {
    channel: C,
    _claim: EndpointClaim,
}

/// Exclusive owner of one tunnel channel.
pub struct TunnelHandle<C> {
    spec: TunnelSpec,
    close_timeout: Duration,
    inner: Mutex<Option<OpenChannel<C>>>,
    state: RwLock<TunnelState>,
    opened: AtomicBool,
    closed: AtomicBool,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

impl<C: TunnelChannel> TunnelHandle<C> {
    pub fn new(spec: TunnelSpec) -> Self {
        let (cancel_tx, cancel_rx) = async_channel::bounded(1);
        Self {
            spec,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            inner: Mutex::new(None),
            state: RwLock::new(TunnelState::Closed),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub async fn state(&self) -> TunnelState {
        self.state.read().await.clone()
    }

    /// Establish the channel and return its local address.
    ///
    /// Blocks until the transport reports the channel ready. Failures are
    /// returned as-is; nothing is retried here. A concurrent `close` abandons
    /// the pending transport open and yields `Cancelled`.
    pub async fn open<T>(&self, transport: &T) -> Result<String, TunnelError>
    where
        T: TunnelTransport<Channel = C>,
    {
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::AlreadyOpened);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Cancelled);
        }

        let early_claim = if self.spec.local_bind_port() != 0 {
            Some(EndpointClaim::acquire(&self.spec.local_endpoint())?)
        } else {
            None
        };

        *self.state.write().await = TunnelState::Opening;
        tracing::info!(
            "Opening SSH tunnel {} -> {} via {}",
            self.spec.local_endpoint(),
            self.spec.remote_endpoint(),
            self.spec.ssh_endpoint()
        );

        let opened = smol::future::or(async { Some(transport.open(&self.spec).await) }, async {
            // Resolves once close() closes the channel
            let _ = self.cancel_rx.recv().await;
            None
        })
        .await;

        let mut channel = match opened {
            Some(Ok(channel)) => channel,
            None => {
                tracing::info!(
                    "Tunnel via {} closed while opening, abandoning",
                    self.spec.ssh_endpoint()
                );
                *self.state.write().await = TunnelState::Closed;
                return Err(TunnelError::Cancelled);
            }
            Some(Err(e)) => {
                tracing::error!("SSH tunnel via {} failed: {}", self.spec.ssh_endpoint(), e);
                *self.state.write().await = TunnelState::ClosedWithError {
                    error: e.to_string(),
                };
                return Err(e);
            }
        };

        let local_addr = channel.local_addr();
        let claim = match early_claim {
            Some(claim) => claim,
            None => match EndpointClaim::acquire(&local_addr) {
                Ok(claim) => claim,
                Err(e) => {
                    channel.force_close();
                    *self.state.write().await = TunnelState::ClosedWithError {
                        error: e.to_string(),
                    };
                    return Err(e);
                }
            },
        };

        let mut inner = self.inner.lock().await;
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!("Tunnel {} closed while opening, releasing", local_addr);
            channel.force_close();
            *self.state.write().await = TunnelState::Closed;
            return Err(TunnelError::Cancelled);
        }
        *inner = Some(OpenChannel {
            channel,
            _claim: claim,
        });
        *self.state.write().await = TunnelState::Open {
            local_addr: local_addr.clone(),
        };
        drop(inner);
        tracing::info!(
            "SSH tunnel established: {} -> {}",
            local_addr,
            self.spec.remote_endpoint()
        );
        Ok(local_addr)
    }

    /// Release the channel. Idempotent and safe to call concurrently; never
    /// waits longer than the close timeout for the channel to shut down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Tunnel to {} already closed", self.spec.ssh_endpoint());
            return;
        }

        let Some(mut open) = self.inner.lock().await.take() else {
            // Wakes an open() still waiting on the transport
            self.cancel_tx.close();
            let mut state = self.state.write().await;
            if *state == TunnelState::Opening {
                *state = TunnelState::Closed;
            }
            tracing::debug!("Tunnel to {} was never opened", self.spec.ssh_endpoint());
            return;
        };

        let timeout = self.close_timeout;
        let graceful = smol::future::or(
            async {
                open.channel.shutdown().await;
                true
            },
            async {
                smol::Timer::after(timeout).await;
                false
            },
        )
        .await;

        if graceful {
            *self.state.write().await = TunnelState::Closed;
            tracing::info!("SSH tunnel to {} closed", self.spec.ssh_endpoint());
        } else {
            tracing::warn!(
                "SSH tunnel to {} did not close within {:?}, forcing",
                self.spec.ssh_endpoint(),
                timeout
            );
            open.channel.force_close();
            *self.state.write().await = TunnelState::ClosedWithError {
                error: format!("close timed out after {:?}", timeout),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EventLog, FakeTransport, spec_on_port};

    #[test]
    fn test_tunnel_state_is_open() {
        assert!(!TunnelState::Opening.is_open());
        assert!(
            TunnelState::Open {
                local_addr: "127.0.0.1:5432".to_string()
            }
            .is_open()
        );
        assert!(!TunnelState::Closed.is_open());
        assert!(
            !TunnelState::ClosedWithError {
                error: "test".to_string()
            }
            .is_open()
        );
    }

    #[test]
    fn test_tunnel_state_local_addr() {
        assert_eq!(TunnelState::Opening.local_addr(), None);
        assert_eq!(
            TunnelState::Open {
                local_addr: "127.0.0.1:5432".to_string()
            }
            .local_addr(),
            Some("127.0.0.1:5432")
        );
        assert_eq!(TunnelState::Closed.local_addr(), None);
    }

    #[test]
    fn test_open_then_close_twice() {
        smol::block_on(async {
            let log = EventLog::default();
            let transport = FakeTransport::new(log.clone());
            let handle = TunnelHandle::new(spec_on_port(41001));

            let addr = handle.open(&transport).await.unwrap();
            assert_eq!(addr, "127.0.0.1:41001");
            assert!(handle.state().await.is_open());

            handle.close().await;
            handle.close().await;

            assert_eq!(handle.state().await, TunnelState::Closed);
            assert_eq!(log.count("tunnel.close"), 1);
            assert_eq!(log.count("tunnel.force_close"), 0);
        });
    }

    #[test]
    fn test_close_never_opened_is_noop() {
        smol::block_on(async {
            let handle = TunnelHandle::<crate::testing::FakeChannel>::new(spec_on_port(41002));
            handle.close().await;
            handle.close().await;
            assert_eq!(handle.state().await, TunnelState::Closed);
        });
    }

    #[test]
    fn test_failed_open_then_close() {
        smol::block_on(async {
            let log = EventLog::default();
            let transport = FakeTransport::new(log.clone()).failing(TunnelError::Unreachable {
                endpoint: "bastion:22".into(),
                detail: "Connection refused".into(),
            });
            let handle = TunnelHandle::new(spec_on_port(41003));

            let err = handle.open(&transport).await.unwrap_err();
            assert!(matches!(err, TunnelError::Unreachable { .. }));
            assert!(matches!(
                handle.state().await,
                TunnelState::ClosedWithError { .. }
            ));

            handle.close().await;
            assert_eq!(log.count("tunnel.close"), 0);

            // The endpoint claim must be released after the failed open
            let again = TunnelHandle::new(spec_on_port(41003));
            assert!(again.open(&FakeTransport::new(log.clone())).await.is_ok());
            again.close().await;
        });
    }

    #[test]
    fn test_endpoint_in_use() {
        smol::block_on(async {
            let log = EventLog::default();
            let transport = FakeTransport::new(log.clone());
            let first = TunnelHandle::new(spec_on_port(41004));
            let second = TunnelHandle::new(spec_on_port(41004));

            first.open(&transport).await.unwrap();
            let err = second.open(&transport).await.unwrap_err();
            assert_eq!(err, TunnelError::EndpointInUse("127.0.0.1:41004".into()));

            first.close().await;
            let third = TunnelHandle::new(spec_on_port(41004));
            assert!(third.open(&transport).await.is_ok());
            third.close().await;
        });
    }

    #[test]
    fn test_open_twice_rejected() {
        smol::block_on(async {
            let log = EventLog::default();
            let transport = FakeTransport::new(log.clone());
            let handle = TunnelHandle::new(spec_on_port(41005));
            handle.open(&transport).await.unwrap();
            assert_eq!(
                handle.open(&transport).await,
                Err(TunnelError::AlreadyOpened)
            );
            handle.close().await;
        });
    }

    #[test]
    fn test_close_timeout_forces_release() {
        smol::block_on(async {
            let log = EventLog::default();
            let transport =
                FakeTransport::new(log.clone()).with_shutdown_delay(Duration::from_secs(5));
            let handle =
                TunnelHandle::new(spec_on_port(41006)).with_close_timeout(Duration::from_millis(20));

            handle.open(&transport).await.unwrap();
            let started = std::time::Instant::now();
            handle.close().await;

            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(log.count("tunnel.close"), 0);
            assert_eq!(log.count("tunnel.force_close"), 1);
            assert!(matches!(
                handle.state().await,
                TunnelState::ClosedWithError { .. }
            ));
        });
    }

    #[test]
    fn test_close_while_opening_cancels() {
        smol::block_on(async {
            let log = EventLog::default();
            let transport =
                FakeTransport::new(log.clone()).with_open_delay(Duration::from_millis(30));
            let handle = TunnelHandle::new(spec_on_port(41007));

            let (opened, ()) = futures::join!(handle.open(&transport), async {
                smol::Timer::after(Duration::from_millis(5)).await;
                handle.close().await;
            });

            assert_eq!(opened, Err(TunnelError::Cancelled));
            // The pending transport open was abandoned before producing a channel
            assert_eq!(log.count("tunnel.force_close"), 0);
            assert_eq!(handle.state().await, TunnelState::Closed);

            // The endpoint claim went with the abandoned open
            let again = TunnelHandle::new(spec_on_port(41007));
            assert!(again.open(&transport).await.is_ok());
            again.close().await;
        });
    }

    #[test]
    fn test_close_while_opening_when_open_is_dropped() {
        smol::block_on(async {
            let log = EventLog::default();
            let transport =
                FakeTransport::new(log.clone()).with_open_delay(Duration::from_millis(40));
            let handle = TunnelHandle::new(spec_on_port(41009));

            smol::future::or(
                async {
                    let _ = handle.open(&transport).await;
                },
                async {
                    smol::Timer::after(Duration::from_millis(10)).await;
                    handle.close().await;
                },
            )
            .await;

            assert_eq!(handle.state().await, TunnelState::Closed);
            assert_eq!(log.count("tunnel.close"), 0);
        });
    }

    #[test]
    fn test_auto_assigned_port_claims_resolved_address() {
        smol::block_on(async {
            let log = EventLog::default();
            let transport = FakeTransport::new(log.clone()).resolving_port(41008);
            let handle = TunnelHandle::new(spec_on_port(0));
            assert_eq!(handle.open(&transport).await.unwrap(), "127.0.0.1:41008");

            let clash = TunnelHandle::new(spec_on_port(41008));
            assert_eq!(
                clash.open(&transport).await,
                Err(TunnelError::EndpointInUse("127.0.0.1:41008".into()))
            );
            handle.close().await;
        });
    }
}
