//! Inbound frame listener
//!
//! Runs on its own task with exclusive use of the read half. Each frame is
//! decoded into entities which are logged and forwarded to the client's
//! event channel. Decode failures are logged and the frame is dropped; read
//! failures end the listener without touching the writer.

use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use super::{ClientEvent, NetworkConfig, ShutdownListener};
use crate::protocol::{decode_state, CodecError, Entity, FrameReader};

/// Why the listener stopped
#[derive(Debug)]
pub enum ListenerExit {
    /// Peer closed the stream between frames
    PeerClosed,
    /// Shutdown signal observed
    Cancelled,
    /// Short read, stall or oversized frame
    Failed(CodecError),
}

/// Summary returned when the listener stops
#[derive(Debug)]
pub struct ListenerReport {
    pub exit: ListenerExit,
    pub frames_received: u64,
    pub entities_received: u64,
    pub bytes_read: u64,
}

pub struct Listener<R> {
    frames: FrameReader<R>,
    read_timeout: Duration,
    events: Option<mpsc::Sender<ClientEvent>>,
    frames_received: u64,
    entities_received: u64,
}

impl<R: AsyncRead + Unpin> Listener<R> {
    pub fn new(reader: R, config: &NetworkConfig) -> Self {
        Self {
            frames: FrameReader::new(reader, config.length_prefix),
            read_timeout: config.read_timeout,
            events: None,
            frames_received: 0,
            entities_received: 0,
        }
    }

    /// Forward decoded entities to `events`
    pub fn with_events(mut self, events: mpsc::Sender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Read frames until the peer closes, a read fails or shutdown is raised
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> ListenerReport {
        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => break ListenerExit::Cancelled,
                next = self.frames.next_frame(self.read_timeout) => next,
            };

            match next {
                Ok(Some(body)) if body.is_empty() => {
                    tracing::trace!("Skipping empty frame");
                }
                Ok(Some(body)) => self.dispatch(&body),
                Ok(None) => break ListenerExit::PeerClosed,
                Err(e) => break ListenerExit::Failed(e),
            }
        };

        match &exit {
            ListenerExit::Failed(e) => tracing::warn!("Listener error: {}", e),
            other => tracing::debug!("Listener stopped: {:?}", other),
        }

        if let Some(events) = &self.events {
            let reason = match &exit {
                ListenerExit::PeerClosed => "Connection closed by server".to_string(),
                ListenerExit::Cancelled => "Shutdown requested".to_string(),
                ListenerExit::Failed(e) => format!("Read error: {}", e),
            };
            let _ = events.try_send(ClientEvent::Disconnected { reason });
        }

        ListenerReport {
            exit,
            frames_received: self.frames_received,
            entities_received: self.entities_received,
            bytes_read: self.frames.bytes_read(),
        }
    }

    fn dispatch(&mut self, body: &[u8]) {
        self.frames_received += 1;
        tracing::debug!("Received {} byte message", body.len());

        let entities = match decode_state(body) {
            Ok(entities) => entities,
            Err(e) => {
                tracing::warn!("Error processing message: {}", e);
                return;
            }
        };

        for entity in entities {
            self.entities_received += 1;
            log_entity(&entity);

            if let Some(events) = &self.events {
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    events.try_send(ClientEvent::EntityReceived { entity })
                {
                    tracing::debug!("Event channel full, dropping inbound entity");
                }
            }
        }
    }
}

fn log_entity(entity: &Entity) {
    match entity {
        Entity::Node(node) => tracing::info!(
            "Received Node: ID {} at ({:.2}, {:.2}, {:.2})",
            node.id,
            node.position.x,
            node.position.y,
            node.position.z
        ),
        other => tracing::info!(
            "Received {:?}: {} (ID: {})",
            other.kind(),
            other.name().unwrap_or_default(),
            other.id()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Shutdown;
    use crate::protocol::{
        encode_state, FrameEncoder, LengthPrefix, Node, Presenter, SubscriptionMask,
        SubscriptionRate, Vec3, Vec4,
    };
    use bytes::{BufMut, BytesMut};
    use tokio::io::AsyncWriteExt;

    fn config() -> NetworkConfig {
        NetworkConfig {
            read_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn node(id: u64, x: f32) -> Entity {
        Entity::Node(Node {
            id,
            position: Vec3::new(x, 0.0, 0.0),
            rotation: Vec4::IDENTITY,
            velocity: Vec3::ZERO,
            error: 0.0,
        })
    }

    fn framed(entities: &[Entity], buf: &mut BytesMut) {
        let body = encode_state(entities).unwrap();
        FrameEncoder::new(LengthPrefix::Exclusive)
            .encode(&body, buf)
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispatches_entities_until_peer_closes() {
        let presenter = Entity::Presenter(Presenter {
            id: 3,
            name: "desk".to_string(),
            subscription: SubscriptionMask::from_bits(0b11),
            rate: SubscriptionRate::Full,
        });

        let mut wire = BytesMut::new();
        framed(&[node(1, 0.5)], &mut wire);
        wire.put_u32_le(0);
        framed(&[presenter.clone(), node(2, 1.5)], &mut wire);
        // Garbage body is logged and dropped, the stream continues
        wire.put_u32_le(3);
        wire.put_slice(&[0xFF, 0xFF, 0xFF]);
        framed(&[node(3, 2.5)], &mut wire);

        let mock = tokio_test::io::Builder::new().read(&wire).build();
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();

        let report = Listener::new(mock, &config())
            .with_events(tx)
            .run(shutdown.subscribe())
            .await;

        assert!(matches!(report.exit, ListenerExit::PeerClosed));
        assert_eq!(report.frames_received, 4);
        assert_eq!(report.entities_received, 4);
        assert_eq!(report.bytes_read, wire.len() as u64);

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        let entities: Vec<Entity> = received
            .iter()
            .filter_map(|e| match e {
                ClientEvent::EntityReceived { entity } => Some(entity.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(entities, vec![node(1, 0.5), presenter, node(2, 1.5), node(3, 2.5)]);
        assert!(matches!(
            received.last(),
            Some(ClientEvent::Disconnected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_body_resolves_within_deadline() {
        let (mut peer, local) = tokio::io::duplex(256);
        let mut wire = BytesMut::new();
        wire.put_u32_le(64);
        wire.put_slice(&[0u8; 8]);
        peer.write_all(&wire).await.unwrap();

        let shutdown = Shutdown::new();
        let started = tokio::time::Instant::now();
        let report = Listener::new(local, &config())
            .run(shutdown.subscribe())
            .await;

        assert!(matches!(
            report.exit,
            ListenerExit::Failed(CodecError::Timeout)
        ));
        assert!(started.elapsed() <= Duration::from_millis(250));
        drop(peer);
    }

    #[tokio::test]
    async fn test_peer_close_mid_frame() {
        let (mut peer, local) = tokio::io::duplex(256);
        let mut wire = BytesMut::new();
        wire.put_u32_le(64);
        wire.put_slice(&[0u8; 8]);
        peer.write_all(&wire).await.unwrap();
        drop(peer);

        let report = Listener::new(local, &config())
            .run(Shutdown::new().subscribe())
            .await;
        assert!(matches!(
            report.exit,
            ListenerExit::Failed(CodecError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_idle_read() {
        let (_peer, local) = tokio::io::duplex(256);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(Listener::new(local, &config()).run(shutdown.subscribe()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.exit, ListenerExit::Cancelled));
    }
}
