//! C FFI Interface for the Outline Bridge static library
//!
//! Host applications (Swift, Kotlin, C#, C) drive the library through
//! these functions. Clients and tunnels are referred to by opaque `u64`
//! handles; `0` is never a valid handle. Every fallible call reports
//! either a value or an [`OutlinePlatformError`], never both, and every
//! non-null error must be released with [`outline_platform_error_free`].
//!
//! Calls that need the network block the calling thread on the library's
//! own async runtime. The TUN writer callbacks are invoked from runtime
//! worker threads and must be thread-safe.

#![allow(clippy::missing_safety_doc)]

use std::any::Any;
use std::ffi::{c_void, CStr, CString};
use std::io;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Runtime;

use crate::client::{new_client, Client};
use crate::config::ClientConfig;
use crate::connectivity::check_connectivity;
use crate::error::{BridgeError, ErrorCode, IntoBridgeError, PlatformError};
use crate::handle::{Handle, HandleTable};
use crate::tunnel::{connect_tunnel, TunWriter, Tunnel};

/// The host accepted the packet
pub const OUTLINE_TUN_WRITE_OK: c_int = 0;
/// The host cannot take a packet right now; it will be retried
pub const OUTLINE_TUN_WRITE_WOULD_BLOCK: c_int = 1;

lazy_static::lazy_static! {
    static ref RUNTIME: io::Result<Runtime> = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("outline-bridge")
        .build();
    static ref CLIENTS: Mutex<HandleTable<Client>> = Mutex::new(HandleTable::new());
    static ref TUNNELS: Mutex<HandleTable<Tunnel>> = Mutex::new(HandleTable::new());
}

type FfiResult<T> = std::result::Result<T, PlatformError>;

/// Structured error: namespaced code plus human-readable message
#[repr(C)]
pub struct OutlinePlatformError {
    /// e.g. `ERR_NETWORK.UNREACHABLE`
    pub code: *mut c_char,
    pub message: *mut c_char,
}

/// Result of [`outline_new_client`]; exactly one field is set
#[repr(C)]
pub struct OutlineNewClientResult {
    pub client: u64,
    pub error: *mut OutlinePlatformError,
}

/// Result of [`outline_check_tcp_and_udp_connectivity`]; null means reachable
#[repr(C)]
pub struct OutlineConnectivityResult {
    pub tcp_error: *mut OutlinePlatformError,
    pub udp_error: *mut OutlinePlatformError,
}

/// Result of [`outline_connect_tunnel`]; exactly one field is set
#[repr(C)]
pub struct OutlineConnectTunnelResult {
    pub tunnel: u64,
    pub error: *mut OutlinePlatformError,
}

/// Host sink for packets leaving the tunnel.
///
/// `write` returns [`OUTLINE_TUN_WRITE_OK`], [`OUTLINE_TUN_WRITE_WOULD_BLOCK`]
/// or any other value for a failed write. `close` (optional) is called once
/// when the tunnel closes. `context` is passed back unchanged.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OutlineTunWriter {
    pub context: *mut c_void,
    pub write: Option<unsafe extern "C" fn(context: *mut c_void, packet: *const u8, len: usize) -> c_int>,
    pub close: Option<unsafe extern "C" fn(context: *mut c_void)>,
}

struct FfiTunWriter {
    context: usize,
    write: unsafe extern "C" fn(*mut c_void, *const u8, usize) -> c_int,
    close: Option<unsafe extern "C" fn(*mut c_void)>,
}

impl FfiTunWriter {
    fn from_raw(raw: OutlineTunWriter) -> FfiResult<Self> {
        let write = raw.write.ok_or_else(|| {
            PlatformError::from(BridgeError::TunWriter("write callback is null".to_string()))
        })?;
        Ok(Self {
            context: raw.context as usize,
            write,
            close: raw.close,
        })
    }
}

impl TunWriter for FfiTunWriter {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let rc = unsafe { (self.write)(self.context as *mut c_void, packet.as_ptr(), packet.len()) };
        match rc {
            OUTLINE_TUN_WRITE_OK => Ok(()),
            OUTLINE_TUN_WRITE_WOULD_BLOCK => Err(io::Error::new(io::ErrorKind::WouldBlock, "host TUN busy")),
            other => Err(io::Error::other(format!("host TUN write failed ({other})"))),
        }
    }

    fn close(&self) {
        if let Some(close) = self.close {
            unsafe { close(self.context as *mut c_void) }
        }
    }

    fn identity(&self) -> Option<usize> {
        (self.context != 0).then_some(self.context)
    }
}

fn clients() -> MutexGuard<'static, HandleTable<Client>> {
    CLIENTS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn tunnels() -> MutexGuard<'static, HandleTable<Tunnel>> {
    TUNNELS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn runtime() -> FfiResult<&'static Runtime> {
    let runtime = RUNTIME.as_ref().into_bridge_error("async runtime unavailable")?;
    Ok(runtime)
}

fn lookup_client(raw: u64) -> FfiResult<Arc<Client>> {
    Handle::from_raw(raw)
        .and_then(|handle| clients().get(handle))
        .ok_or_else(|| PlatformError::new(ErrorCode::InternalFault, "invalid client handle"))
}

fn lookup_tunnel(raw: u64) -> FfiResult<Arc<Tunnel>> {
    Handle::from_raw(raw)
        .and_then(|handle| tunnels().get(handle))
        .ok_or_else(|| PlatformError::new(ErrorCode::TunnelClosed, "unknown or released tunnel handle"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run `f`, turning a panic into an internal fault instead of unwinding into C
fn guard<T>(f: impl FnOnce() -> FfiResult<T>) -> FfiResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        log::error!("panic inside FFI call: {message}");
        Err(PlatformError::new(ErrorCode::InternalFault, message))
    })
}

fn to_c_string(value: &str) -> *mut c_char {
    CString::new(value.replace('\0', " "))
        .unwrap_or_default()
        .into_raw()
}

fn into_raw_error(error: PlatformError) -> *mut OutlinePlatformError {
    Box::into_raw(Box::new(OutlinePlatformError {
        code: to_c_string(error.code().as_str()),
        message: to_c_string(error.message()),
    }))
}

fn optional_error(error: Option<PlatformError>) -> *mut OutlinePlatformError {
    error.map_or(ptr::null_mut(), into_raw_error)
}

unsafe fn read_config(config: *const c_char) -> FfiResult<ClientConfig> {
    if config.is_null() {
        return Err(BridgeError::Config("configuration is null".to_string()).into());
    }
    let text = unsafe { CStr::from_ptr(config) }
        .to_str()
        .map_err(|_| BridgeError::Config("configuration is not valid UTF-8".to_string()))?;

    let trimmed = text.trim();
    let config = if trimmed.starts_with("socks5://") || trimmed.starts_with("socks5h://") {
        ClientConfig::from_url(trimmed)?
    } else {
        trimmed.parse::<ClientConfig>()?
    };
    Ok(config)
}

/// Validate a configuration without creating a client
///
/// # Parameters
/// - `config`: TOML configuration or `socks5://` URL
///
/// # Returns
/// - NULL if the configuration is valid
/// - Error otherwise (free with `outline_platform_error_free`)
#[no_mangle]
pub unsafe extern "C" fn outline_validate_config(config: *const c_char) -> *mut OutlinePlatformError {
    let result = guard(|| {
        let config = unsafe { read_config(config) }?;
        config.validate()?;
        Ok(())
    });
    optional_error(result.err())
}

/// Create a client from a configuration
///
/// # Parameters
/// - `config`: TOML configuration or `socks5://[user:pass@]host[:port]` URL
///
/// # Returns
/// - Client handle, or an `ERR_CONFIG.INVALID` error. Nothing is dialed.
#[no_mangle]
pub unsafe extern "C" fn outline_new_client(config: *const c_char) -> OutlineNewClientResult {
    let result = guard(|| {
        let config = unsafe { read_config(config) }?;
        let client = new_client(config)?;
        Ok(clients().insert(Arc::new(client)))
    });
    match result {
        Ok(handle) => OutlineNewClientResult {
            client: handle.to_raw(),
            error: ptr::null_mut(),
        },
        Err(error) => OutlineNewClientResult {
            client: 0,
            error: into_raw_error(error),
        },
    }
}

/// Release a client handle
///
/// Tunnels already opened with the client keep working.
#[no_mangle]
pub unsafe extern "C" fn outline_client_free(client: u64) {
    if let Some(handle) = Handle::from_raw(client) {
        clients().remove(handle);
    }
}

/// Probe TCP and UDP reachability through the client's proxy
///
/// Blocks for at most the configured probe timeouts.
///
/// # Returns
/// - One error slot per protocol; NULL means that protocol works
#[no_mangle]
pub unsafe extern "C" fn outline_check_tcp_and_udp_connectivity(client: u64) -> OutlineConnectivityResult {
    let result = guard(|| {
        let client = lookup_client(client)?;
        Ok(runtime()?.block_on(check_connectivity(&client)))
    });
    match result {
        Ok(result) => OutlineConnectivityResult {
            tcp_error: optional_error(result.tcp),
            udp_error: optional_error(result.udp),
        },
        Err(error) => OutlineConnectivityResult {
            tcp_error: into_raw_error(error.clone()),
            udp_error: into_raw_error(error),
        },
    }
}

/// Open a tunnel that delivers packets to `writer`
///
/// # Parameters
/// - `writer`: host packet sink; its `write` callback is required
/// - `client`: client handle
/// - `udp_enabled`: relay UDP (fixed for the life of the tunnel)
///
/// # Returns
/// - Tunnel handle, or an error (`ERR_TUNNEL.INVALID_TUN_WRITER` when the
///   writer is unusable or already backs a live tunnel)
#[no_mangle]
pub unsafe extern "C" fn outline_connect_tunnel(
    writer: OutlineTunWriter,
    client: u64,
    udp_enabled: bool,
) -> OutlineConnectTunnelResult {
    let result = guard(|| {
        let writer = FfiTunWriter::from_raw(writer)?;
        let client = lookup_client(client)?;
        let tunnel = runtime()?.block_on(connect_tunnel(Arc::new(writer), &client, udp_enabled))?;
        Ok(tunnels().insert(Arc::new(tunnel)))
    });
    match result {
        Ok(handle) => OutlineConnectTunnelResult {
            tunnel: handle.to_raw(),
            error: ptr::null_mut(),
        },
        Err(error) => OutlineConnectTunnelResult {
            tunnel: 0,
            error: into_raw_error(error),
        },
    }
}

/// Submit one IP packet read from the host's virtual interface
///
/// Never blocks. The packet is copied before returning.
///
/// # Returns
/// - NULL on success (including packets dropped under load)
/// - `ERR_TUNNEL.CLOSED` once the tunnel is closing, closed or released
#[no_mangle]
pub unsafe extern "C" fn outline_tunnel_write(tunnel: u64, packet: *const u8, len: usize) -> *mut OutlinePlatformError {
    let result = guard(|| {
        let tunnel = lookup_tunnel(tunnel)?;
        let data: &[u8] = if len == 0 {
            &[]
        } else if packet.is_null() {
            return Err(BridgeError::Internal("packet buffer is null".to_string()).into());
        } else {
            unsafe { slice::from_raw_parts(packet, len) }
        };
        tunnel.write(data)?;
        Ok(())
    });
    optional_error(result.err())
}

/// Whether the tunnel is active
#[no_mangle]
pub unsafe extern "C" fn outline_tunnel_is_connected(tunnel: u64) -> bool {
    guard(|| Ok(lookup_tunnel(tunnel)?.is_connected())).unwrap_or(false)
}

/// Error that ended the tunnel on its own, if any
///
/// # Returns
/// - NULL while the tunnel is healthy or after an explicit close
#[no_mangle]
pub unsafe extern "C" fn outline_tunnel_last_error(tunnel: u64) -> *mut OutlinePlatformError {
    let result = guard(|| Ok(lookup_tunnel(tunnel)?.last_error()));
    match result {
        Ok(error) => optional_error(error),
        Err(error) => into_raw_error(error),
    }
}

/// Close the tunnel, waiting for its relay to stop
///
/// Idempotent: closing an already closed or released tunnel returns NULL.
#[no_mangle]
pub unsafe extern "C" fn outline_tunnel_close(tunnel: u64) -> *mut OutlinePlatformError {
    let result = guard(|| {
        let Ok(tunnel) = lookup_tunnel(tunnel) else {
            return Ok(());
        };
        runtime()?.block_on(tunnel.close());
        Ok(())
    });
    optional_error(result.err())
}

/// Close (if needed) and release a tunnel handle
#[no_mangle]
pub unsafe extern "C" fn outline_tunnel_free(tunnel: u64) {
    let released = Handle::from_raw(tunnel).and_then(|handle| tunnels().remove(handle));
    if let Some(tunnel) = released {
        let _ = guard(|| {
            runtime()?.block_on(tunnel.close());
            Ok(())
        });
    }
}

/// Release an error returned by any `outline_*` function
#[no_mangle]
pub unsafe extern "C" fn outline_platform_error_free(error: *mut OutlinePlatformError) {
    if error.is_null() {
        return;
    }
    let error = unsafe { Box::from_raw(error) };
    for field in [error.code, error.message] {
        if !field.is_null() {
            drop(unsafe { CString::from_raw(field) });
        }
    }
}

/// Get library version
///
/// # Returns
/// - Version string (caller must not free)
#[no_mangle]
pub unsafe extern "C" fn outline_version() -> *const c_char {
    static VERSION_CSTR: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION_CSTR.as_ptr() as *const c_char
}
