//! HIVE Client
//!
//! Connects to a HIVE server, runs the inbound listener on its own task and
//! drives the update scheduler over the session until shutdown.

use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    Listener, ListenerReport, NetworkConfig, Session, SessionError, SessionState, SessionStats,
    Shutdown,
};
use crate::protocol::Entity;
use crate::simulation::{SchedulerError, SchedulerReport, UpdateScheduler};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Not connected")]
    NotConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Entity decoded from an inbound frame
    EntityReceived { entity: Entity },
    /// Listener stopped
    Disconnected { reason: String },
}

/// HIVE Client
pub struct Client {
    /// Outbound half of the connection
    session: Session,
    /// Shared by the listener and the scheduler
    shutdown: Shutdown,
    /// Listener task
    listener: Option<JoinHandle<ListenerReport>>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl Client {
    /// Connect, send the handshake and start listening
    pub async fn connect(host: &str, port: u16, config: &NetworkConfig) -> ClientResult<Self> {
        let session = Session::connect(host, port, config).await?;
        Ok(Self::start(session, config))
    }

    /// Connect to a resolved address
    pub async fn connect_addr(addr: SocketAddr, config: &NetworkConfig) -> ClientResult<Self> {
        let session = Session::connect_addr(addr, config).await?;
        Ok(Self::start(session, config))
    }

    fn start(mut session: Session, config: &NetworkConfig) -> Self {
        let shutdown = Shutdown::new();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

        let listener = session.take_reader().map(|reader| {
            let listener = Listener::new(reader, config).with_events(event_tx);
            tokio::spawn(listener.run(shutdown.subscribe()))
        });

        Self {
            session,
            shutdown,
            listener,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Handle that stops both the scheduler and the listener
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Get the current state
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    /// Get outbound statistics
    pub fn stats(&self) -> &SessionStats {
        self.session.stats()
    }

    /// Run the scheduler until shutdown or connection loss, then close
    pub async fn run(&mut self, scheduler: &mut UpdateScheduler) -> ClientResult<SchedulerReport> {
        if self.state() == SessionState::Closed {
            return Err(ClientError::NotConnected);
        }

        let mut shutdown = self.shutdown.subscribe();
        let result = scheduler.run(&mut self.session, &mut shutdown).await;

        self.close().await;
        scheduler.mark_closed();

        Ok(result?)
    }

    /// Stop the listener and release the socket
    ///
    /// Returns the listener's report on the first call and `None` afterwards.
    pub async fn close(&mut self) -> Option<ListenerReport> {
        if self.state() == SessionState::Closed {
            return None;
        }
        self.shutdown.trigger();

        let report = match self.listener.take() {
            Some(handle) => match handle.await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!("Listener task failed: {}", e);
                    None
                }
            },
            None => None,
        };

        if let Some(report) = &report {
            tracing::debug!(
                "Listener exited ({:?}) after {} frames, {} entities, {} bytes",
                report.exit,
                report.frames_received,
                report.entities_received,
                report.bytes_read
            );
        }

        self.session.close().await;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        decode_state, encode_state, FrameEncoder, LengthPrefix, Node, SubscriptionRate, Vec3,
        Vec4, MAGIC_NUMBER,
    };
    use crate::simulation::{SchedulerConfig, SchedulerState, VirtualRobot};
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn echo_node() -> Entity {
        Entity::Node(Node {
            id: 99,
            position: Vec3::new(0.25, 0.5, 0.75),
            rotation: Vec4::IDENTITY,
            velocity: Vec3::ZERO,
            error: 0.0,
        })
    }

    #[tokio::test]
    async fn test_client_streams_and_receives() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut socket, _) = server.accept().await.unwrap();
            let magic = socket.read_u32_le().await.unwrap();

            let len = socket.read_u32_le().await.unwrap() as usize;
            let mut first = vec![0u8; len];
            socket.read_exact(&mut first).await.unwrap();

            let mut reply = BytesMut::new();
            let body = encode_state(&[echo_node()]).unwrap();
            FrameEncoder::new(LengthPrefix::Exclusive)
                .encode(&body, &mut reply)
                .unwrap();
            socket.write_all(&reply).await.unwrap();

            let mut rest = Vec::new();
            socket.read_to_end(&mut rest).await.unwrap();
            (magic, first, rest.len())
        });

        let mut client = Client::connect_addr(addr, &NetworkConfig::default())
            .await
            .unwrap();
        let mut events = client.take_event_receiver().unwrap();
        assert!(client.take_event_receiver().is_none());

        let mut scheduler = UpdateScheduler::new(
            SchedulerConfig {
                update_interval: Duration::from_millis(20),
                settle_delay: Duration::from_millis(10),
                rate: SubscriptionRate::Half,
            },
            VirtualRobot::fleet(1, 7),
        );

        let shutdown = client.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            shutdown.trigger();
        });

        let report = client.run(&mut scheduler).await.unwrap();
        assert_eq!(report.registered, 1);
        assert!(report.ticks >= 1);
        assert_eq!(report.send_failures, 0);
        assert_eq!(scheduler.state(), SchedulerState::Closed);
        assert_eq!(client.state(), SessionState::Closed);

        let (magic, first, rest) = server_task.await.unwrap();
        assert_eq!(magic, MAGIC_NUMBER);
        match decode_state(&first).unwrap().as_slice() {
            [Entity::Robot(robot)] => {
                assert_eq!(robot.id, 7);
                assert_eq!(robot.name, "VirtualRobot_1");
            }
            other => panic!("expected one robot, got {:?}", other),
        }
        assert!(rest > 0);

        let mut received = false;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::EntityReceived { entity } = event {
                assert_eq!(entity, echo_node());
                received = true;
            }
        }
        assert!(received);

        assert!(client.close().await.is_none());
        assert!(matches!(
            client.run(&mut scheduler).await,
            Err(ClientError::NotConnected)
        ));
    }
}
