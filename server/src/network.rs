//! Server network layer handling UDP communications and the authority loop

use crate::authority::{AuthorityController, Broadcast, MoveProposal, WorldSession};
use crate::client_manager::{ClientManager, CLIENT_TIMEOUT};
use crate::config::ServerConfig;
use crate::error::SurfaceError;
use crate::motion::MotionValidator;
use crate::surface::{SurfaceConfig, SurfaceSample};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{timestamp_millis, Packet, SurfaceStep, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: u32,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<u32>,
    },
}

/// Main server coordinating networking and movement authority
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    config: ServerConfig,
    authority: AuthorityController,
    session: WorldSession,
    started: Instant,
    tick: u32,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
    authority_rx: mpsc::UnboundedReceiver<Broadcast>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let (authority_tx, authority_rx) = mpsc::unbounded_channel();

        let mut authority = AuthorityController::new(
            MotionValidator::new(config.max_speed),
            config.strict_surface,
            authority_tx,
        );

        if let Some(path) = &config.surface_export {
            let stats = authority.load_surface_export(path)?;
            info!(
                "Surface ready: {} samples, {} cells",
                stats.sample_count, stats.cell_count
            );
        } else if config.strict_surface {
            warn!("Strict surface mode with no surface loaded: every move will be rejected");
        } else {
            warn!("No surface loaded, surface validation disabled until one is committed");
        }

        let session = WorldSession::new(config.spawn_position, config.spawn_rotation);

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            config,
            authority,
            session,
            started: Instant::now(),
            tick: 0,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
            authority_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Server-measured seconds since startup; the only clock the
    /// validators trust.
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }

                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(CLIENT_TIMEOUT)
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<u32>) {
        if let Err(e) = self
            .game_tx
            .send(GameMessage::BroadcastPacket { packet, exclude })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    async fn client_addr(&self, client_id: u32) -> Option<SocketAddr> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|c| c.addr)
    }

    async fn client_for(&self, addr: SocketAddr) -> Option<u32> {
        let mut clients = self.clients.write().await;
        let client_id = clients.find_client_by_addr(addr)?;
        clients.touch(client_id);
        Some(client_id)
    }

    async fn drop_client(&mut self, client_id: u32) {
        {
            let mut clients = self.clients.write().await;
            clients.remove_client(&client_id);
        }
        self.authority.remove_entity(&mut self.session, client_id);
    }

    /// Routes incoming packets to the authority and connection bookkeeping
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Protocol version mismatch".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // Remove existing connection if present
                let existing_client_id = {
                    let clients = self.clients.read().await;
                    clients.find_client_by_addr(addr)
                };

                if let Some(existing_id) = existing_client_id {
                    info!("Removing existing client {} from {}", existing_id, addr);
                    self.drop_client(existing_id).await;
                }

                let is_admin = self.config.is_admin_host(&addr.ip());
                let client_id = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr, is_admin)
                };

                if let Some(client_id) = client_id {
                    let now = self.now();
                    let entity = self
                        .authority
                        .register_entity(&mut self.session, client_id, now);
                    self.send_packet(
                        Packet::Connected {
                            client_id,
                            entity: entity.clone(),
                        },
                        addr,
                    );
                    self.broadcast_packet(Packet::EntityState { state: entity }, Some(client_id));
                } else {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Server full".to_string(),
                        },
                        addr,
                    );
                }
            }

            Packet::ProposeMove {
                move_id,
                position,
                rotation,
                animation,
            } => {
                let Some(client_id) = self.client_for(addr).await else {
                    debug!("Move proposal from unknown address {}", addr);
                    return;
                };

                let proposal = MoveProposal {
                    move_id,
                    position,
                    rotation,
                    animation,
                };
                let now = self.now();
                if self
                    .authority
                    .propose_move(&mut self.session, client_id, proposal, now)
                    .is_err()
                {
                    let mut clients = self.clients.write().await;
                    clients.record_rejection(client_id);
                }
            }

            Packet::FocusEnter { target } => {
                if let Some(client_id) = self.client_for(addr).await {
                    self.session.enter_focus(client_id, target);
                }
            }

            Packet::FocusExit { target } => {
                if let Some(client_id) = self.client_for(addr).await {
                    self.session.exit_focus(client_id, target);
                }
            }

            Packet::SurfaceSetConfig {
                cell_size,
                vertical_tolerance,
                origin_x,
                origin_z,
            } => {
                let config = SurfaceConfig::new(cell_size, vertical_tolerance, origin_x, origin_z);
                let result = self
                    .require_admin(addr)
                    .await
                    .and_then(|_| self.authority.set_surface_config(config));
                self.reply_surface(
                    SurfaceStep::Config,
                    result.map(|_| "config set".to_string()),
                    addr,
                );
            }

            Packet::SurfaceUploadPoint {
                position,
                grid_x,
                grid_z,
            } => {
                let sample = SurfaceSample::new(position, grid_x, grid_z);
                let result = self
                    .require_admin(addr)
                    .await
                    .and_then(|_| self.authority.upload_surface_point(sample));
                // Bulk uploads only hear back on failure.
                if result.is_err() {
                    self.reply_surface(SurfaceStep::Point, result.map(|_| String::new()), addr);
                }
            }

            Packet::SurfaceClear => {
                let result = self.require_admin(addr).await.map(|_| {
                    self.authority.clear_surface();
                    "surface cleared".to_string()
                });
                self.reply_surface(SurfaceStep::Clear, result, addr);
            }

            Packet::SurfaceCommit => {
                let result = self
                    .require_admin(addr)
                    .await
                    .and_then(|_| self.authority.commit_surface())
                    .map(|stats| {
                        format!(
                            "{} samples in {} cells",
                            stats.sample_count, stats.cell_count
                        )
                    });
                self.reply_surface(SurfaceStep::Commit, result, addr);
            }

            Packet::Disconnect => {
                let client_id = {
                    let clients = self.clients.read().await;
                    clients.find_client_by_addr(addr)
                };

                if let Some(client_id) = client_id {
                    self.drop_client(client_id).await;
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }

        self.forward_authority_broadcasts().await;
    }

    async fn require_admin(&self, addr: SocketAddr) -> Result<(), SurfaceError> {
        let clients = self.clients.read().await;
        match clients.find_client_by_addr(addr) {
            Some(client_id) if clients.is_admin(client_id) => Ok(()),
            _ => {
                warn!("Refused surface ingestion from non-admin {}", addr);
                Err(SurfaceError::Unauthorized)
            }
        }
    }

    fn reply_surface(
        &self,
        step: SurfaceStep,
        result: Result<String, SurfaceError>,
        addr: SocketAddr,
    ) {
        let packet = match result {
            Ok(message) => Packet::SurfaceResult {
                step,
                ok: true,
                message,
            },
            Err(e) => Packet::SurfaceResult {
                step,
                ok: false,
                message: e.to_string(),
            },
        };
        self.send_packet(packet, addr);
    }

    /// Turns authority outcomes into datagrams: the proposer gets the
    /// verdict, everyone else gets the resulting state.
    async fn forward_authority_broadcasts(&mut self) {
        while let Ok(message) = self.authority_rx.try_recv() {
            let (owner, reply, state) = match message {
                Broadcast::Committed { move_id, state } => (
                    state.entity_id,
                    Packet::MoveCommitted {
                        move_id,
                        state: state.clone(),
                    },
                    state,
                ),
                Broadcast::Rejected {
                    move_id,
                    reason,
                    state,
                } => (
                    state.entity_id,
                    Packet::MoveRejected {
                        move_id,
                        reason,
                        state: state.clone(),
                    },
                    state,
                ),
            };

            if let Some(addr) = self.client_addr(owner).await {
                self.send_packet(reply, addr);
            }
            self.broadcast_packet(Packet::EntityState { state }, Some(owner));
        }
    }

    /// Broadcasts every entity's public state for late joiners and lost packets
    async fn broadcast_world_state(&mut self) {
        let client_count = {
            let clients = self.clients.read().await;
            clients.len()
        };

        if client_count == 0 {
            return;
        }

        let packet = Packet::WorldState {
            tick: self.tick,
            timestamp: timestamp_millis(),
            entities: self.session.snapshots(),
        };

        self.broadcast_packet(packet, None);
    }

    /// Applies one message from the network tasks; false means shut down.
    async fn handle_message(&mut self, message: Option<ServerMessage>) -> bool {
        match message {
            Some(ServerMessage::PacketReceived { packet, addr }) => {
                self.handle_packet(packet, addr).await;
                true
            }
            Some(ServerMessage::ClientTimeout { client_id }) => {
                info!("Client {} timed out", client_id);
                self.authority.remove_entity(&mut self.session, client_id);
                true
            }
            Some(ServerMessage::Shutdown) | None => false,
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.config.tick_duration);
        let ticks_per_report = (Duration::from_secs(10).as_secs_f64()
            / self.config.tick_duration.as_secs_f64())
        .ceil()
        .max(1.0) as u32;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    if !self.handle_message(message).await {
                        info!("Server shutting down");
                        break;
                    }
                },

                _ = tick_interval.tick() => {
                    self.tick = self.tick.wrapping_add(1);
                    self.broadcast_world_state().await;

                    if self.tick % ticks_per_report == 0 && !self.session.is_empty() {
                        let stats = self.authority.surface_stats();
                        debug!(
                            "Tick {}: {} entities, surface {} samples / {} cells",
                            self.tick,
                            self.session.len(),
                            stats.sample_count,
                            stats.cell_count
                        );
                    }
                },
            }
        }

        Ok(())
    }
}
