//! Update scheduler
//!
//! Registers every robot once, waits for the server to settle, then streams
//! one pose update per robot on a fixed interval until shutdown.

use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::VirtualRobot;
use crate::config::SimulationConfig;
use crate::network::{FrameSink, SessionError, ShutdownListener};
use crate::protocol::{encode_state, Entity, SubscriptionRate};

/// Scheduler errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Connection lost: {0}")]
    ConnectionLost(SessionError),
}

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RegisteringEntities,
    Streaming,
    Draining,
    Closed,
}

/// Scheduler timing and registration settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between pose updates
    pub update_interval: Duration,
    /// Pause between registration and the first update
    pub settle_delay: Duration,
    /// Rate requested in each robot registration
    pub rate: SubscriptionRate,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_millis(500),
            settle_delay: Duration::from_millis(500),
            rate: SubscriptionRate::Half,
        }
    }
}

impl From<&SimulationConfig> for SchedulerConfig {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            update_interval: Duration::from_millis(config.update_interval_ms.max(1)),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            rate: config.rate,
        }
    }
}

/// How a send pass ended
enum PassOutcome {
    Complete,
    /// Shutdown observed before or during a send
    Cancelled,
    /// At least one send failed
    Lost(SessionError),
}

/// Counters for one scheduler run
#[derive(Debug, Default, Clone)]
pub struct SchedulerReport {
    /// Robots whose registration frame was sent
    pub registered: usize,
    /// Update ticks processed
    pub ticks: u64,
    /// Frames handed to the sink successfully
    pub frames_sent: u64,
    /// Entities that failed to encode or send
    pub send_failures: u64,
}

pub struct UpdateScheduler {
    config: SchedulerConfig,
    robots: Vec<VirtualRobot>,
    state: SchedulerState,
    report: SchedulerReport,
}

impl UpdateScheduler {
    pub fn new(config: SchedulerConfig, robots: Vec<VirtualRobot>) -> Self {
        Self {
            config,
            robots,
            state: SchedulerState::Idle,
            report: SchedulerReport::default(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn robots(&self) -> &[VirtualRobot] {
        &self.robots
    }

    /// Called by the driver once the session is released
    pub fn mark_closed(&mut self) {
        self.state = SchedulerState::Closed;
    }

    /// Register the fleet and stream updates until `shutdown` is raised
    ///
    /// Returns [`SchedulerError::ConnectionLost`] after the first pass in
    /// which a send failed. The scheduler is left in `Draining` either way.
    pub async fn run<S: FrameSink + ?Sized>(
        &mut self,
        sink: &mut S,
        shutdown: &mut ShutdownListener,
    ) -> Result<SchedulerReport, SchedulerError> {
        self.report = SchedulerReport::default();

        if shutdown.is_shutdown() {
            return Ok(self.drain());
        }

        self.state = SchedulerState::RegisteringEntities;
        tracing::info!("Registering {} robots", self.robots.len());

        let registrations: Vec<Entity> = self
            .robots
            .iter()
            .map(|robot| robot.registration(self.config.rate))
            .collect();
        let sent_before = self.report.frames_sent;
        let outcome = self.send_pass(sink, &registrations, shutdown).await;
        self.report.registered = (self.report.frames_sent - sent_before) as usize;
        match outcome {
            PassOutcome::Complete => {}
            PassOutcome::Cancelled => return Ok(self.drain()),
            PassOutcome::Lost(e) => {
                self.drain();
                return Err(SchedulerError::ConnectionLost(e));
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.recv() => return Ok(self.drain()),
            _ = tokio::time::sleep(self.config.settle_delay) => {}
        }

        self.state = SchedulerState::Streaming;
        let period = self.config.update_interval.max(Duration::from_millis(1));
        tracing::info!("Streaming updates every {:?}", period);

        let start = Instant::now();
        let mut ticker = interval_at(start + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let tick = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                tick = ticker.tick() => tick,
            };

            let t = tick.duration_since(start).as_secs_f64();
            let updates: Vec<Entity> = self.robots.iter().map(|r| r.node_update(t)).collect();
            self.report.ticks += 1;

            match self.send_pass(sink, &updates, shutdown).await {
                PassOutcome::Complete => {}
                PassOutcome::Cancelled => break,
                PassOutcome::Lost(e) => {
                    self.drain();
                    return Err(SchedulerError::ConnectionLost(e));
                }
            }
            tracing::info!(
                "Sent tick {} of node updates ({} robots)",
                self.report.ticks,
                updates.len()
            );
        }

        Ok(self.drain())
    }

    fn drain(&mut self) -> SchedulerReport {
        self.state = SchedulerState::Draining;
        tracing::info!(
            "Scheduler draining after {} ticks ({} frames sent, {} failures)",
            self.report.ticks,
            self.report.frames_sent,
            self.report.send_failures
        );
        self.report.clone()
    }

    /// Send one frame per entity in order
    ///
    /// Every entity is attempted and the first send error is kept. Shutdown
    /// stops the pass before the next entity or aborts a blocked send; the
    /// outbound stream may then end mid-frame, so the caller only drains.
    async fn send_pass<S: FrameSink + ?Sized>(
        &mut self,
        sink: &mut S,
        entities: &[Entity],
        shutdown: &mut ShutdownListener,
    ) -> PassOutcome {
        let mut lost = None;

        for entity in entities {
            if shutdown.is_shutdown() {
                return lost.map_or(PassOutcome::Cancelled, PassOutcome::Lost);
            }

            let body = match encode_state(std::slice::from_ref(entity)) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("Failed to encode {:?} {}: {}", entity.kind(), entity.id(), e);
                    self.report.send_failures += 1;
                    continue;
                }
            };

            let sent = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::warn!("Send of {:?} {} aborted by shutdown", entity.kind(), entity.id());
                    return lost.map_or(PassOutcome::Cancelled, PassOutcome::Lost);
                }
                sent = sink.send_frame(&body) => sent,
            };

            match sent {
                Ok(()) => {
                    self.report.frames_sent += 1;
                    log_sent(entity);
                }
                Err(e) => {
                    tracing::error!("Failed to send {:?} {}: {}", entity.kind(), entity.id(), e);
                    self.report.send_failures += 1;
                    if lost.is_none() {
                        lost = Some(e);
                    }
                }
            }
        }

        lost.map_or(PassOutcome::Complete, PassOutcome::Lost)
    }
}

fn log_sent(entity: &Entity) {
    match entity {
        Entity::Robot(robot) => {
            tracing::info!("Created robot {} (ID: {})", robot.name, robot.id);
            tracing::debug!("Subscriptions: {}", robot.subscription);
        }
        Entity::Node(node) => tracing::debug!(
            "Updated node {}: ({:.2}, {:.2}, {:.2})",
            node.id,
            node.position.x,
            node.position.y,
            node.position.z
        ),
        other => tracing::debug!("Sent {:?} {}", other.kind(), other.id()),
    }
}
