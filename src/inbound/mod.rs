//! Inbound listeners
//!
//! Listeners only terminate the client-side handshake. Each accepted
//! connection is handed to the executor as a [`ConnContext`] over a channel.

mod http;
mod mixed;
mod socks5;

pub use mixed::MixedListener;

use crate::common::Metadata;
use crate::outbound::ProxyConnection;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// One accepted inbound connection, handshake already answered
pub struct ConnContext {
    pub id: Uuid,
    pub metadata: Metadata,
    pub stream: Box<dyn ProxyConnection>,
}

impl ConnContext {
    pub fn new(metadata: Metadata, stream: Box<dyn ProxyConnection>) -> Self {
        ConnContext {
            id: Uuid::new_v4(),
            metadata,
            stream,
        }
    }
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnContext")
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Username/password pair accepted by a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Trait for inbound listeners
#[async_trait]
pub trait InboundListener: Send + Sync {
    fn name(&self) -> &str;

    /// Accept connections until stopped
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}
