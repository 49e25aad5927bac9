//! Proxy client - validated configuration bound to a transport
//!
//! A [`Client`] is created once per configuration and then shared by every
//! connectivity check and tunnel session that uses it. It holds no
//! connection of its own and is immutable after construction, so sharing
//! it needs no locking.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{ProxyTransport, Socks5Transport};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Validated proxy client
///
/// Cloning is cheap; all clones refer to the same configuration and
/// transport.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: Uuid,
    config: ClientConfig,
    transport: Arc<dyn ProxyTransport>,
}

/// Build a client from `config`.
///
/// Validation is offline: nothing is dialed, so an unreachable proxy still
/// yields a client.
///
/// # Errors
/// Returns a configuration error if `config` is malformed or incomplete.
pub fn new_client(config: ClientConfig) -> Result<Client> {
    Client::new(config)
}

impl Client {
    /// Validate `config` and bind it to a SOCKS5 transport
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(Socks5Transport::from_config(&config));
        Self::build(config, transport)
    }

    /// Validate `config` and bind it to a caller-supplied transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn ProxyTransport>) -> Result<Self> {
        config.validate()?;
        Self::build(config, transport)
    }

    fn build(config: ClientConfig, transport: Arc<dyn ProxyTransport>) -> Result<Self> {
        let id = Uuid::new_v4();
        log::debug!("client {id} created for {}", transport.describe());
        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                config,
                transport,
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn ProxyTransport> {
        &self.inner.transport
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("proxy", &self.inner.transport.describe())
            .finish_non_exhaustive()
    }
}
