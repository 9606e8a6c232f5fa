// network/routing.rs - Outbound message routing

use bytes::Bytes;
use futures::SinkExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::frame_codec;
use super::transport::TransportConfig;
use super::TransportError;
use crate::acl_message::{AclMessage, Address};

/// A frame waiting for its link, plus the caller's completion slot
struct Outgoing {
    frame: Bytes,
    done: oneshot::Sender<Result<(), TransportError>>,
}

type LinkTable = HashMap<String, mpsc::UnboundedSender<Outgoing>>;

/// Outbound side of an agent's transport.
///
/// Keeps one connection per peer `host:port`, opened on first use. Frames to
/// the same peer are written in the order `deliver` was called. A link is
/// torn down when it fails to connect or write, when the peer closes its
/// side, or after `idle_timeout` with nothing to send; the next delivery
/// dials again.
pub struct Dialer {
    agent: String,
    config: TransportConfig,
    links: Arc<Mutex<LinkTable>>,
    cancel: CancellationToken,
}

impl Dialer {
    pub fn new(agent: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            agent: agent.into(),
            config,
            links: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue `message` for `receiver`.
    ///
    /// Encoding and queueing happen now; the returned future resolves once
    /// the frame is written or the delivery has failed. Dropping the future
    /// does not withdraw the frame. Must be called inside a Tokio runtime.
    pub fn deliver(
        &self,
        receiver: &Address,
        message: &AclMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + use<> {
        let queued = if self.cancel.is_cancelled() {
            Err(TransportError::Stopped)
        } else {
            self.config
                .wire_format
                .encode(message)
                .map_err(TransportError::from)
                .map(|frame| self.enqueue(receiver.socket_addr(), frame))
        };

        async move {
            match queued?.await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Aborted),
            }
        }
    }

    /// Abort in-flight deliveries and close every outbound connection
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.links.lock().clear();
    }

    /// Peers with an open (or opening) link
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    fn enqueue(&self, target: String, frame: Bytes) -> oneshot::Receiver<Result<(), TransportError>> {
        let (done, rx) = oneshot::channel();
        let mut outgoing = Outgoing { frame, done };

        let mut links = self.links.lock();
        if let Some(link) = links.get(&target) {
            match link.send(outgoing) {
                Ok(()) => return rx,
                // The link task has exited; fall through and dial again.
                Err(mpsc::error::SendError(returned)) => outgoing = returned,
            }
        }

        let (tx, queue) = mpsc::unbounded_channel();
        if tx.send(outgoing).is_err() {
            return rx;
        }
        links.insert(target.clone(), tx);
        drop(links);

        debug!(agent = %self.agent, peer = %target, "Opening outbound link");
        tokio::spawn(run_link(
            self.agent.clone(),
            target,
            queue,
            self.config.clone(),
            self.cancel.child_token(),
            self.links.clone(),
        ));
        rx
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why a link task stopped
enum LinkEnd {
    /// Dialer shut down or dropped
    Cancelled,
    /// Nothing to send for the idle timeout
    Idle,
    /// Peer closed its side
    PeerClosed,
    Failed(TransportError),
}

async fn run_link(
    agent: String,
    target: String,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    config: TransportConfig,
    cancel: CancellationToken,
    links: Arc<Mutex<LinkTable>>,
) {
    let end = drive_link(&agent, &target, &mut queue, &config, &cancel).await;
    let pending_error = match &end {
        LinkEnd::Failed(e) => e.clone(),
        LinkEnd::Cancelled | LinkEnd::Idle | LinkEnd::PeerClosed => TransportError::Aborted,
    };
    fail_pending(&mut queue, pending_error);

    // Our queue is closed now; a sender that is not closed belongs to a newer link.
    let mut links = links.lock();
    if links.get(&target).is_some_and(|tx| tx.is_closed()) {
        links.remove(&target);
    }
    drop(links);

    match end {
        LinkEnd::Idle => debug!(%agent, peer = %target, "Outbound link idle, closed"),
        LinkEnd::PeerClosed => debug!(%agent, peer = %target, "Peer went away, outbound link closed"),
        _ => debug!(%agent, peer = %target, "Outbound link closed"),
    }
}

async fn drive_link(
    agent: &str,
    target: &str,
    queue: &mut mpsc::UnboundedReceiver<Outgoing>,
    config: &TransportConfig,
    cancel: &CancellationToken,
) -> LinkEnd {
    let connect = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(target));
    let stream = tokio::select! {
        _ = cancel.cancelled() => return LinkEnd::Cancelled,
        connected = connect => match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%agent, peer = %target, error = %e, "Connect failed");
                return LinkEnd::Failed(TransportError::Connect {
                    addr: target.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(%agent, peer = %target, "Connect timed out");
                return LinkEnd::Failed(TransportError::Timeout(target.to_string()));
            }
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%agent, error = %e, "Could not set TCP_NODELAY");
    }

    // Peers never write on this connection; a readable half means EOF or reset.
    let (mut reader, writer) = stream.into_split();
    let mut sink = FramedWrite::new(writer, frame_codec(config.max_frame_bytes));
    let mut scratch = [0u8; 64];

    loop {
        let outgoing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LinkEnd::Cancelled,
            next = queue.recv() => match next {
                Some(outgoing) => outgoing,
                None => return LinkEnd::Cancelled,
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => return LinkEnd::PeerClosed,
                Ok(_) => continue,
            },
            _ = tokio::time::sleep(config.idle_timeout()) => return LinkEnd::Idle,
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Aborted),
            written = tokio::time::timeout(config.write_timeout(), sink.send(outgoing.frame)) => {
                match written {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
                    Err(_) => Err(TransportError::Timeout(target.to_string())),
                }
            }
        };

        match written {
            Ok(()) => {
                let _ = outgoing.done.send(Ok(()));
            }
            Err(e) => {
                warn!(%agent, peer = %target, error = %e, "Write failed, closing link");
                let _ = outgoing.done.send(Err(e.clone()));
                return LinkEnd::Failed(e);
            }
        }
    }
}

fn fail_pending(queue: &mut mpsc::UnboundedReceiver<Outgoing>, error: TransportError) {
    queue.close();
    while let Ok(outgoing) = queue.try_recv() {
        let _ = outgoing.done.send(Err(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl_message::{Performative, ProtocolType};
    use crate::network::WireFormat;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn message(content: &str) -> AclMessage {
        AclMessage::new(Performative::Inform, ProtocolType::Subscribe)
            .with_sender(Address::local("pub", 1))
            .with_receiver(Address::local("sub", 2))
            .with_content(content)
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap();
        let dialer = Dialer::new("tester", TransportConfig::default());
        let result = dialer
            .deliver(&Address::new("ghost", "127.0.0.1", port), &message("x"))
            .await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_frames_reuse_one_connection_in_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = Address::new("peer", "127.0.0.1", port);

        let dialer = Dialer::new("tester", TransportConfig::default());
        let first = dialer.deliver(&target, &message("one"));
        let second = dialer.deliver(&target, &message("two"));
        let third = dialer.deliver(&target, &message("three"));

        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, frame_codec(1024 * 1024));

        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
        assert!(third.await.is_ok());
        assert_eq!(dialer.link_count(), 1);

        let mut contents = Vec::new();
        for _ in 0..3 {
            let payload = frames.next().await.unwrap().unwrap();
            contents.push(WireFormat::Json.decode(&payload).unwrap().content);
        }
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    async fn wait_for_links(dialer: &Dialer, expected: usize) -> usize {
        for _ in 0..100 {
            if dialer.link_count() == expected {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        dialer.link_count()
    }

    #[tokio::test]
    async fn test_links_to_departed_peers_are_released() {
        let dialer = Dialer::new("tester", TransportConfig::default());
        for n in 0..5 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let peer = Address::new(format!("job_{n}"), "127.0.0.1", port);

            dialer.deliver(&peer, &message("agree")).await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut frames = FramedRead::new(stream, frame_codec(1024 * 1024));
            assert!(frames.next().await.is_some());
            // Peer leaves: socket and listener both go away.
        }

        assert_eq!(wait_for_links(&dialer, 0).await, 0);
    }

    #[tokio::test]
    async fn test_idle_link_is_released_and_redialed() {
        let config = TransportConfig {
            idle_timeout_ms: 50,
            ..TransportConfig::default()
        };
        let dialer = Dialer::new("tester", config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = Address::new("quiet", "127.0.0.1", port);

        dialer.deliver(&peer, &message("one")).await.unwrap();
        let (_first, _) = listener.accept().await.unwrap();
        assert_eq!(wait_for_links(&dialer, 0).await, 0);

        dialer.deliver(&peer, &message("two")).await.unwrap();
        let (second, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(second, frame_codec(1024 * 1024));
        let payload = frames.next().await.unwrap().unwrap();
        assert_eq!(WireFormat::Json.decode(&payload).unwrap().content, "two");
    }

    #[tokio::test]
    async fn test_deliver_after_shutdown_fails() {
        let dialer = Dialer::new("tester", TransportConfig::default());
        dialer.shutdown();
        let result = dialer.deliver(&Address::local("x", 1), &message("late")).await;
        assert_eq!(result, Err(TransportError::Stopped));
    }
}
