// network/transport.rs - Per-agent listening endpoint

use actix::Recipient;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{frame_codec, WireFormat};
use super::TransportError;
use crate::acl_message::Address;
use crate::actor::DeliverMessage;
use crate::observability;

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Frame payload encoding; every agent of a deployment must agree
    pub wire_format: WireFormat,

    /// Outbound connect timeout
    pub connect_timeout_ms: u64,

    /// Per-frame write timeout
    pub write_timeout_ms: u64,

    /// Largest accepted frame
    pub max_frame_bytes: usize,

    /// Outbound links with nothing to send for this long are closed
    pub idle_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Json,
            connect_timeout_ms: 3_000,
            write_timeout_ms: 3_000,
            max_frame_bytes: 1024 * 1024,
            idle_timeout_ms: 60_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Endpoint lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Idle,
    Bound,
    Listening,
    Stopped,
}

/// Listening socket of one agent.
///
/// Accepted connections stay open for any number of frames; each decoded
/// message is pushed into the owning agent's inbox in arrival order.
pub struct TransportEndpoint {
    address: Address,
    config: TransportConfig,
    status: EndpointStatus,
    pending: Option<std::net::TcpListener>,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    connections: Arc<AtomicUsize>,
}

impl TransportEndpoint {
    pub fn new(address: Address, config: TransportConfig) -> Self {
        Self {
            address,
            config,
            status: EndpointStatus::Idle,
            pending: None,
            local_addr: None,
            cancel: CancellationToken::new(),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve the agent's port.
    ///
    /// Done synchronously so that a port clash surfaces to whoever spawns
    /// the agent. Calling it again after a successful bind is a no-op.
    pub fn bind(&mut self) -> Result<SocketAddr, TransportError> {
        match self.status {
            EndpointStatus::Bound | EndpointStatus::Listening => {
                return self.local_addr.ok_or(TransportError::Stopped);
            }
            EndpointStatus::Stopped => return Err(TransportError::Stopped),
            EndpointStatus::Idle => {}
        }

        let target = self.address.socket_addr();
        let bind_error = |e: std::io::Error| TransportError::Bind {
            addr: target.clone(),
            reason: e.to_string(),
        };
        let listener = std::net::TcpListener::bind(&target).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        self.pending = Some(listener);
        self.local_addr = Some(local);
        self.status = EndpointStatus::Bound;
        debug!(agent = %self.address, %local, "Endpoint bound");
        Ok(local)
    }

    /// Start accepting connections; frames go to `inbox`.
    ///
    /// Must run inside a Tokio runtime. Idempotent while listening.
    pub fn listen(&mut self, inbox: Recipient<DeliverMessage>) -> Result<SocketAddr, TransportError> {
        match self.status {
            EndpointStatus::Listening => return self.local_addr.ok_or(TransportError::Stopped),
            EndpointStatus::Stopped => return Err(TransportError::Stopped),
            EndpointStatus::Idle => {
                self.bind()?;
            }
            EndpointStatus::Bound => {}
        }

        let std_listener = self.pending.take().ok_or(TransportError::Stopped)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local = self.local_addr.ok_or(TransportError::Stopped)?;

        tokio::spawn(accept_loop(
            listener,
            inbox,
            self.cancel.clone(),
            ConnectionSettings {
                agent: self.address.name.clone(),
                format: self.config.wire_format,
                max_frame_bytes: self.config.max_frame_bytes,
                connections: self.connections.clone(),
            },
        ));

        self.status = EndpointStatus::Listening;
        info!(agent = %self.address, %local, "Listening");
        Ok(local)
    }

    /// Close the port and abort every accepted connection. Idempotent.
    pub fn stop(&mut self) {
        if self.status == EndpointStatus::Stopped {
            return;
        }
        self.cancel.cancel();
        self.pending = None;
        self.status = EndpointStatus::Stopped;
        info!(agent = %self.address, "Endpoint stopped");
    }

    pub fn is_listening(&self) -> bool {
        self.status == EndpointStatus::Listening
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TransportEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
struct ConnectionSettings {
    agent: String,
    format: WireFormat,
    max_frame_bytes: usize,
    connections: Arc<AtomicUsize>,
}

async fn accept_loop(
    listener: TcpListener,
    inbox: Recipient<DeliverMessage>,
    cancel: CancellationToken,
    settings: ConnectionSettings,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(agent = %settings.agent, %peer, "Accepted connection");
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        inbox.clone(),
                        cancel.child_token(),
                        settings.clone(),
                    ));
                }
                Err(e) => {
                    warn!(agent = %settings.agent, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!(agent = %settings.agent, "Accept loop finished");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    inbox: Recipient<DeliverMessage>,
    cancel: CancellationToken,
    settings: ConnectionSettings,
) {
    settings.connections.fetch_add(1, Ordering::Relaxed);
    let mut frames = FramedRead::new(stream, frame_codec(settings.max_frame_bytes));

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            None => {
                debug!(agent = %settings.agent, %peer, "Peer closed connection");
                break;
            }
            Some(Ok(payload)) => match settings.format.decode(&payload) {
                Ok(message) => {
                    observability::record_message_received(
                        message.performative.as_str(),
                        message.protocol.as_str(),
                    );
                    // Awaiting the handoff keeps this connection's frames in order.
                    if inbox.send(DeliverMessage { message }).await.is_err() {
                        debug!(agent = %settings.agent, "Inbox closed, dropping connection");
                        break;
                    }
                }
                Err(e) => {
                    warn!(agent = %settings.agent, %peer, error = %e, "Dropping undecodable frame");
                    observability::record_message_dropped("decode");
                }
            },
            Some(Err(e)) => {
                warn!(agent = %settings.agent, %peer, error = %e, "Framing error, closing connection");
                break;
            }
        }
    }

    settings.connections.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl_message::{AclMessage, Performative, ProtocolType};
    use actix::prelude::*;
    use bytes::Bytes;
    use futures::SinkExt;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::FramedWrite;

    /// Stands in for an agent inbox
    struct Inbox {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Actor for Inbox {
        type Context = Context<Self>;
    }

    impl Handler<DeliverMessage> for Inbox {
        type Result = ();

        fn handle(&mut self, msg: DeliverMessage, _ctx: &mut Self::Context) {
            self.seen.lock().push(msg.message.content);
        }
    }

    fn listening_endpoint(seen: Arc<Mutex<Vec<String>>>) -> (TransportEndpoint, SocketAddr) {
        let mut endpoint =
            TransportEndpoint::new(Address::new("inbox", "127.0.0.1", free_port()), TransportConfig::default());
        let inbox = Inbox { seen }.start();
        let local = endpoint.listen(inbox.recipient()).unwrap();
        (endpoint, local)
    }

    fn frame(content: &str) -> Bytes {
        let message = AclMessage::new(Performative::Inform, ProtocolType::Subscribe)
            .with_sender(Address::local("peer", 1))
            .with_receiver(Address::local("inbox", 2))
            .with_content(content);
        WireFormat::Json.encode(&message).unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap()
    }

    #[test]
    fn test_bind_is_idempotent() {
        let mut endpoint =
            TransportEndpoint::new(Address::new("a", "127.0.0.1", free_port()), TransportConfig::default());
        let first = endpoint.bind().unwrap();
        let second = endpoint.bind().unwrap();
        assert_eq!(first, second);
        assert_eq!(endpoint.status(), EndpointStatus::Bound);
        assert!(!endpoint.is_listening());
    }

    #[test]
    fn test_port_clash_is_reported() {
        let port = free_port();
        let mut first = TransportEndpoint::new(Address::new("a", "127.0.0.1", port), TransportConfig::default());
        first.bind().unwrap();

        let mut second = TransportEndpoint::new(Address::new("b", "127.0.0.1", port), TransportConfig::default());
        assert!(matches!(second.bind(), Err(TransportError::Bind { .. })));
    }

    #[test]
    fn test_stop_releases_port_and_is_idempotent() {
        let port = free_port();
        let mut endpoint = TransportEndpoint::new(Address::new("a", "127.0.0.1", port), TransportConfig::default());
        endpoint.bind().unwrap();
        endpoint.stop();
        endpoint.stop();
        assert_eq!(endpoint.status(), EndpointStatus::Stopped);
        assert_eq!(endpoint.bind(), Err(TransportError::Stopped));

        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.wire_format, WireFormat::Json);
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
    }

    #[actix_rt::test]
    async fn test_bad_frame_does_not_close_connection() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (endpoint, local) = listening_endpoint(seen.clone());

        let stream = TcpStream::connect(local).await.unwrap();
        let mut sink = FramedWrite::new(stream, frame_codec(1024 * 1024));
        sink.send(Bytes::from_static(b"{garbage")).await.unwrap();
        sink.send(frame("after-bad")).await.unwrap();

        assert!(wait_until(|| !seen.lock().is_empty()).await);
        assert_eq!(*seen.lock(), vec!["after-bad".to_string()]);
        assert_eq!(endpoint.active_connections(), 1);
    }

    #[actix_rt::test]
    async fn test_stop_aborts_accepted_connections() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (mut endpoint, local) = listening_endpoint(seen.clone());

        let stream = TcpStream::connect(local).await.unwrap();
        let mut sink = FramedWrite::new(stream, frame_codec(1024 * 1024));
        sink.send(frame("hello")).await.unwrap();
        assert!(wait_until(|| seen.lock().len() == 1).await);

        endpoint.stop();

        let mut stream = sink.into_inner();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0))));
        assert!(wait_until(|| endpoint.active_connections() == 0).await);
    }
}
