use crate::game::{LocalMover, RemoteEntities};
use crate::reconciliation::{ReconcileConfig, ReconcileStep, ReconciliationEngine};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{EntitySnapshot, Packet, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep};

/// Distance within which another entity becomes our focus
pub const FOCUS_RANGE: f32 = 8.0;

const SIMULATION_DT: f32 = 1.0 / 60.0;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    /// Artificial latency added to each direction, split in half
    pub fake_ping_ms: u64,
    /// How often predicted positions are proposed
    pub send_interval: Duration,
    pub walk_speed: f32,
    pub turn_interval: f32,
    pub seed: u64,
    /// Stop after this long; `None` runs until interrupted
    pub run_for: Option<Duration>,
    pub reconcile: ReconcileConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8080".to_string(),
            fake_ping_ms: 0,
            send_interval: Duration::from_millis(50),
            walk_speed: 5.0,
            turn_interval: 3.0,
            seed: 1,
            run_for: None,
            reconcile: ReconcileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    pub committed: u32,
    pub rejected: u32,
    pub corrections: u32,
    pub snaps: u32,
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    client_id: Option<u32>,
    connected: bool,

    engine: Option<ReconciliationEngine>,
    mover: LocalMover,
    remote: RemoteEntities,
    focus: Option<u32>,

    config: ClientConfig,
    started: Instant,
    stats: ClientStats,
}

impl Client {
    pub async fn new(config: ClientConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = config.server_addr.parse()?;
        let mover = LocalMover::new(config.walk_speed, config.turn_interval, config.seed);

        Ok(Client {
            socket,
            server_addr,
            client_id: None,
            connected: false,
            engine: None,
            mover,
            remote: RemoteEntities::new(),
            focus: None,
            config,
            started: Instant::now(),
            stats: ClientStats::default(),
        })
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn engine(&self) -> Option<&ReconciliationEngine> {
        self.engine.as_ref()
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server...");

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        self.send_packet(&packet).await?;

        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.config.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.config.fake_ping_ms / 2)).await;
        }

        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    fn apply_own_state(&mut self, state: &EntitySnapshot) {
        if let Some(engine) = self.engine.as_mut() {
            let was_reconciling = engine.is_reconciling();
            engine.on_authoritative(state.position);
            if !was_reconciling && engine.is_reconciling() {
                self.stats.corrections += 1;
            }
        }
    }

    pub async fn handle_packet(&mut self, packet: Packet) {
        let now = self.now();
        match packet {
            Packet::Connected { client_id, entity } => {
                info!(
                    "Connected! Client ID: {}, spawned at ({:.1}, {:.1}, {:.1})",
                    client_id, entity.position.x, entity.position.y, entity.position.z
                );
                self.client_id = Some(client_id);
                self.connected = true;
                self.engine = Some(ReconciliationEngine::new(
                    self.config.reconcile,
                    entity.position,
                ));
            }

            Packet::MoveCommitted { move_id, state } => {
                self.stats.committed += 1;
                if let Some(engine) = self.engine.as_mut() {
                    let was_reconciling = engine.is_reconciling();
                    engine.on_commit(move_id, state.position, now);
                    if !was_reconciling && engine.is_reconciling() {
                        self.stats.corrections += 1;
                    }
                }
            }

            Packet::MoveRejected {
                move_id,
                reason,
                state,
            } => {
                self.stats.rejected += 1;
                warn!("Move {} rejected: {}", move_id, reason.as_str());
                if let Some(engine) = self.engine.as_mut() {
                    let was_reconciling = engine.is_reconciling();
                    engine.on_rejection(move_id, state.position, now);
                    if !was_reconciling && engine.is_reconciling() {
                        self.stats.corrections += 1;
                    }
                }
            }

            Packet::EntityState { state } => {
                if Some(state.entity_id) == self.client_id {
                    self.apply_own_state(&state);
                } else {
                    self.remote.apply_entity(state);
                }
            }

            Packet::WorldState { tick, entities, .. } => {
                if let Some(own) = self.remote.apply_world_state(tick, entities, self.client_id) {
                    self.apply_own_state(&own);
                }
            }

            Packet::SurfaceResult { step, ok, message } => {
                debug!("Surface result for {:?}: ok={} {}", step, ok, message);
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.client_id = None;
                self.engine = None;
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
    }

    /// One simulation step: predict locally, then advance any correction.
    pub fn simulate(&mut self, dt: f32) {
        if let Some(engine) = self.engine.as_mut() {
            if engine.can_transmit() {
                let predicted = self.mover.step(engine.local_position(), dt);
                engine.predict(predicted, dt);
            }

            if engine.tick(dt) == ReconcileStep::Snapped {
                self.stats.snaps += 1;
            }
        }
    }

    async fn send_proposal(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.connected {
            return Ok(());
        }

        let now = self.now();
        let pending = match self.engine.as_mut().and_then(|e| e.outgoing(now)) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let packet = Packet::ProposeMove {
            move_id: pending.move_id,
            position: pending.position,
            rotation: self.mover.rotation(),
            animation: self.mover.animation(),
        };
        self.send_packet(&packet).await
    }

    async fn update_focus(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let position = match self.engine.as_ref() {
            Some(engine) => engine.local_position(),
            None => return Ok(()),
        };

        let candidate = self.remote.nearest_within(position, FOCUS_RANGE);
        if candidate == self.focus {
            return Ok(());
        }

        if let Some(previous) = self.focus.take() {
            self.send_packet(&Packet::FocusExit { target: previous })
                .await?;
        }
        if let Some(target) = candidate {
            info!("Focusing entity {}", target);
            self.send_packet(&Packet::FocusEnter { target }).await?;
            self.focus = Some(target);
        }
        Ok(())
    }

    fn log_status(&self) {
        if let Some(engine) = &self.engine {
            let position = engine.local_position();
            info!(
                "pos ({:.1}, {:.1}, {:.1}) reconciling={} pending={} rtt={:.0}ms committed={} rejected={} corrections={} snaps={} others={}",
                position.x,
                position.y,
                position.z,
                engine.is_reconciling(),
                engine.pending().len(),
                engine.expected_rtt() * 1000.0,
                self.stats.committed,
                self.stats.rejected,
                self.stats.corrections,
                self.stats.snaps,
                self.remote.len()
            );
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut simulation_interval = interval(Duration::from_secs_f32(SIMULATION_DT));
        let mut send_interval = interval(self.config.send_interval);
        let mut status_interval = interval(Duration::from_secs(2));
        let deadline = self.config.run_for.map(|d| Instant::now() + d);

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                break;
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.config.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.config.fake_ping_ms / 2)).await;
                            }

                            if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                                self.handle_packet(packet).await;
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = simulation_interval.tick() => {
                    self.simulate(SIMULATION_DT);
                },

                _ = send_interval.tick() => {
                    if let Err(e) = self.send_proposal().await {
                        error!("Error sending proposal: {}", e);
                    }
                },

                _ = status_interval.tick() => {
                    if let Err(e) = self.update_focus().await {
                        error!("Error updating focus: {}", e);
                    }
                    self.log_status();
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                },
            }
        }

        if self.connected {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{RejectReason, Vec3};

    async fn connected_client() -> Client {
        let config = ClientConfig {
            reconcile: ReconcileConfig {
                expected_rtt: 0.3,
                ..ReconcileConfig::default()
            },
            ..ClientConfig::default()
        };
        let mut client = Client::new(config).await.unwrap();
        client
            .handle_packet(Packet::Connected {
                client_id: 4,
                entity: EntitySnapshot::new(4, Vec3::ZERO, Vec3::ZERO),
            })
            .await;
        client
    }

    #[tokio::test]
    async fn test_connected_creates_engine() {
        let client = connected_client().await;
        assert_eq!(client.client_id(), Some(4));
        assert!(client.is_connected());
        assert_eq!(client.engine().unwrap().local_position(), Vec3::ZERO);
    }

    #[tokio::test]
    async fn test_simulation_walks_forward() {
        let mut client = connected_client().await;
        for _ in 0..30 {
            client.simulate(SIMULATION_DT);
        }
        let engine = client.engine().unwrap();
        assert!(engine.local_position().distance(&Vec3::ZERO) > 2.0);
        assert!(!engine.is_reconciling());
    }

    #[tokio::test]
    async fn test_rejection_starts_correction() {
        let mut client = connected_client().await;
        for _ in 0..60 {
            client.simulate(SIMULATION_DT);
        }

        client
            .handle_packet(Packet::MoveRejected {
                move_id: 1,
                reason: RejectReason::SpeedViolation,
                state: EntitySnapshot::new(4, Vec3::ZERO, Vec3::ZERO),
            })
            .await;

        assert_eq!(client.stats().rejected, 1);
        assert_eq!(client.stats().corrections, 1);
        assert!(client.engine().unwrap().is_reconciling());

        let mut ticks = 0;
        while client.engine().unwrap().is_reconciling() {
            client.simulate(SIMULATION_DT);
            ticks += 1;
            assert!(ticks < 200);
        }
        assert!(client.engine().unwrap().local_position().distance(&Vec3::ZERO) < 1.0);
    }

    #[tokio::test]
    async fn test_world_state_updates_remote_view() {
        let mut client = connected_client().await;
        client
            .handle_packet(Packet::WorldState {
                tick: 3,
                timestamp: 0,
                entities: vec![
                    EntitySnapshot::new(4, Vec3::ZERO, Vec3::ZERO),
                    EntitySnapshot::new(5, Vec3::new(2.0, 0.0, 0.0), Vec3::ZERO),
                ],
            })
            .await;

        assert_eq!(client.remote.len(), 1);
        assert!(!client.engine().unwrap().is_reconciling());
    }

    #[tokio::test]
    async fn test_disconnected_drops_engine() {
        let mut client = connected_client().await;
        client
            .handle_packet(Packet::Disconnected {
                reason: "timeout".to_string(),
            })
            .await;
        assert!(!client.is_connected());
        assert!(client.engine().is_none());
    }
}
