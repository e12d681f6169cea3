//! UDP collector shared by every capability.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowwatch_core::{
    BindConfig, BindError, Capability, CloseHandle, CloseSignal, Collector, Decoder, RawDatagram,
};
use flowwatch_types::ProtocolTag;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Pause after a failed receive so a persistent socket error cannot spin the loop.
pub const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Sleep for `delay` unless the collector is closed first. Returns true on close.
async fn back_off(signal: &mut CloseSignal, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = signal.closed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Receives datagrams on a bound UDP socket until closed.
pub struct UdpCollector {
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
    close: CloseHandle,
    signal: CloseSignal,
}

impl UdpCollector {
    pub fn new() -> Self {
        let close = CloseHandle::new();
        Self {
            socket: None,
            buf: Vec::new(),
            signal: close.signal(),
            close,
        }
    }
}

impl Default for UdpCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UdpCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpCollector")
            .field("local_addr", &self.socket.as_ref().and_then(|s| s.local_addr().ok()))
            .field("closed", &self.close.is_closed())
            .finish()
    }
}

enum Received {
    Closed,
    Datagram(usize, SocketAddr),
    Failed(std::io::Error),
}

#[async_trait]
impl Collector for UdpCollector {
    async fn listen(&mut self, bind: &BindConfig) -> Result<SocketAddr, BindError> {
        let socket = UdpSocket::bind(&bind.addr)
            .await
            .map_err(|e| BindError::new(&bind.addr, e))?;
        let local = socket
            .local_addr()
            .map_err(|e| BindError::new(&bind.addr, e))?;
        self.buf = vec![0u8; bind.recv_buffer.max(1)];
        self.socket = Some(socket);
        debug!(addr = %local, "udp collector bound");
        Ok(local)
    }

    async fn recv(&mut self) -> Option<RawDatagram> {
        loop {
            let socket = self.socket.as_ref()?;
            let outcome = tokio::select! {
                biased;
                _ = self.signal.closed() => Received::Closed,
                result = socket.recv_from(&mut self.buf) => match result {
                    Ok((len, peer)) => Received::Datagram(len, peer),
                    Err(e) => Received::Failed(e),
                },
            };

            match outcome {
                Received::Closed => {
                    // Releases the port as soon as the collector is closed.
                    self.socket = None;
                    return None;
                }
                Received::Datagram(len, peer) => {
                    return Some(RawDatagram::now(peer, self.buf[..len].to_vec()));
                }
                Received::Failed(e) => {
                    // ICMP port-unreachable and friends surface here on some platforms.
                    warn!(error = %e, backoff = ?RECV_ERROR_BACKOFF, "udp receive failed");
                    if back_off(&mut self.signal, RECV_ERROR_BACKOFF).await {
                        self.socket = None;
                        return None;
                    }
                }
            }
        }
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

/// Builds a fresh decoder for each run.
pub type DecoderFactory = Arc<dyn Fn(&str) -> Box<dyn Decoder> + Send + Sync>;

/// A capability made of a [`UdpCollector`] and a protocol decoder.
#[derive(Clone)]
pub struct UdpCapability {
    identifier: String,
    protocol: ProtocolTag,
    default_bind: String,
    decoder: DecoderFactory,
}

impl UdpCapability {
    pub fn new<F>(
        identifier: impl Into<String>,
        protocol: ProtocolTag,
        default_bind: impl Into<String>,
        decoder: F,
    ) -> Self
    where
        F: Fn(&str) -> Box<dyn Decoder> + Send + Sync + 'static,
    {
        Self {
            identifier: identifier.into(),
            protocol,
            default_bind: default_bind.into(),
            decoder: Arc::new(decoder),
        }
    }
}

impl fmt::Debug for UdpCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpCapability")
            .field("identifier", &self.identifier)
            .field("protocol", &self.protocol)
            .field("default_bind", &self.default_bind)
            .finish()
    }
}

impl Capability for UdpCapability {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn protocol(&self) -> ProtocolTag {
        self.protocol
    }

    fn default_bind(&self) -> BindConfig {
        BindConfig::new(self.default_bind.clone())
    }

    fn collector(&self) -> Box<dyn Collector> {
        Box::new(UdpCollector::new())
    }

    fn decoder(&self) -> Box<dyn Decoder> {
        (self.decoder)(&self.identifier)
    }
}
