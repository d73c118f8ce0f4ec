//! Session handle and connector traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use wahub_core::{CredentialBlob, PhoneNumber, SessionKey};

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::ProtocolEvent;

/// The ordered event stream of one session socket.
pub type EventStream = mpsc::Receiver<ProtocolEvent>;

/// Egress proxy a session socket dials through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Proxy IP.
    pub ip: String,
    /// Proxy port.
    pub port: u16,
}

/// Everything a driver needs to open one session socket.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Session identity.
    pub key: SessionKey,
    /// Stored credentials; `None` forces a fresh QR pairing.
    pub blob: Option<CredentialBlob>,
    /// Egress proxy; `None` only in proxyless deployments.
    pub proxy: Option<ProxyEndpoint>,
    /// Browser name shown on the paired phone.
    pub browser_name: String,
}

/// A live session socket.
///
/// Event delivery happens on the stream returned by the connector; the
/// handle only carries the imperative surface.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Send a message; returns the protocol-assigned message id.
    async fn send(&self, to: &PhoneNumber, content: &Value) -> ProtocolResult<String>;

    /// Protocol-level logout, invalidating the credential blob.
    async fn logout(&self) -> ProtocolResult<()>;

    /// Close the socket without logging out (credentials stay valid).
    async fn close(&self) -> ProtocolResult<()>;

    /// Whether the socket is currently open. This is the "actual socket"
    /// view the reconciliation loop compares against.
    fn is_open(&self) -> bool;
}

/// Opens session sockets.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    /// Open a socket and return its handle plus its event stream.
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> ProtocolResult<(Arc<dyn ProtocolSession>, EventStream)>;
}

/// A connector for deployments where no protocol driver is linked.
///
/// Every connect fails; the rest of the service (recovery scan, the
/// coordinator, reconciliation of leftover projections) still runs.
#[derive(Debug, Default)]
pub struct NullConnector;

#[async_trait]
impl ProtocolConnector for NullConnector {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> ProtocolResult<(Arc<dyn ProtocolSession>, EventStream)> {
        Err(ProtocolError::ConnectionFailed(format!(
            "no protocol driver linked (session {})",
            options.key
        )))
    }
}
