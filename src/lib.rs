//! Outline Bridge - static library that routes a host's virtual network
//! interface through a SOCKS5 proxy
//!
//! The host (an iOS/macOS network extension, an Android `VpnService`, a
//! desktop service) owns the TUN device. It hands every IP packet it reads
//! to [`Tunnel::write`] and receives return packets through its
//! [`TunWriter`]. The library terminates TCP in a user-space stack, relays
//! UDP datagrams per flow, and reports failures as [`PlatformError`]s with
//! stable codes.
//!
//! ## What This Library Provides
//! - Client configuration (TOML or `socks5://` URL) and validation
//! - TCP and UDP connectivity probes through the proxy
//! - Tunnel lifecycle with control-channel reconnects
//! - C FFI bindings with opaque handles
//!
//! ## What The Host Must Implement
//! - TUN device creation, routing and DNS configuration
//! - A thread-safe packet sink for the return direction

pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod handle;
pub mod protocol;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export core types for static library interface
pub use client::{new_client, Client};
pub use config::ClientConfig;
pub use connectivity::{check_connectivity, ConnectivityResult};
pub use error::{BridgeError, ErrorCode, PlatformError, Result};
pub use tunnel::{connect_tunnel, TunWriter, Tunnel, TunnelState, TunnelStats};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// C FFI Interface for cross-platform integration
pub mod ffi;
