//! SSH tunneling for reaching a remote database.
//!
//! This module provides:
//! - `TunnelSpec` - Immutable description of one port forward
//! - `TunnelHandle` - Owned tunnel with idempotent, bounded close
//! - `SystemSsh` / `SshTunnel` - Transport backed by the system ssh binary
//! - `AskpassProxy` - Secure password delivery via Unix socket

mod askpass;
mod handle;
mod tunnel;
mod types;

pub use askpass::{AskpassProxy, handle_askpass_mode};
pub use handle::{DEFAULT_CLOSE_TIMEOUT, TunnelChannel, TunnelHandle, TunnelState, TunnelTransport};
pub use tunnel::{DEFAULT_OPEN_TIMEOUT, SshTunnel, SystemSsh};
pub use types::{SshAuthMethod, TunnelSpec, join_host_port, split_host_port};
