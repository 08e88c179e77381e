//! Integration tests for the movement authority and reconciling client
//!
//! These tests validate cross-component interactions and real network behavior.

use bincode::{deserialize, serialize};
use client::game::LocalMover;
use client::reconciliation::{ReconcileConfig, ReconcileStep, ReconciliationEngine};
use server::authority::{AuthorityController, Broadcast, MoveProposal, WorldSession};
use server::error::MoveRejection;
use server::motion::MotionValidator;
use server::surface::{SurfaceConfig, SurfaceSample};
use shared::{
    EntitySnapshot, Packet, RejectReason, Vec3, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION, SNAP_DISTANCE,
};
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Controller with a walkable strip of samples along x at z = 1, one per
/// two-unit cell.
fn strip_controller() -> (AuthorityController, mpsc::UnboundedReceiver<Broadcast>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut authority = AuthorityController::new(MotionValidator::default(), false, tx);

    authority
        .set_surface_config(SurfaceConfig::new(2.0, 2.0, 0.0, 0.0))
        .unwrap();
    for i in -20..20 {
        let x = 2.0 * i as f32 + 1.0;
        authority
            .upload_surface_point(SurfaceSample::new(Vec3::new(x, 0.0, 1.0), i, 0))
            .unwrap();
    }
    authority.commit_surface().unwrap();

    (authority, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Broadcast>) -> Vec<Broadcast> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests packet serialization round-trip for network protocol validation
    #[tokio::test]
    async fn packet_serialization_roundtrip() {
        let test_packets = vec![
            Packet::Connect {
                client_version: PROTOCOL_VERSION,
            },
            Packet::ProposeMove {
                move_id: 42,
                position: Vec3::new(1.0, 2.0, 3.0),
                rotation: Vec3::ZERO,
                animation: Default::default(),
            },
            Packet::MoveCommitted {
                move_id: 42,
                state: EntitySnapshot::new(1, Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO),
            },
            Packet::SurfaceUploadPoint {
                position: Vec3::new(1.0, 0.0, 1.0),
                grid_x: 0,
                grid_z: 0,
            },
            Packet::Disconnected {
                reason: "Test".to_string(),
            },
        ];

        for packet in test_packets {
            let serialized = serialize(&packet).unwrap();
            let deserialized: Packet = deserialize(&serialized).unwrap();

            match (&packet, &deserialized) {
                (Packet::Connect { .. }, Packet::Connect { .. }) => {}
                (Packet::ProposeMove { .. }, Packet::ProposeMove { .. }) => {}
                (Packet::MoveCommitted { .. }, Packet::MoveCommitted { .. }) => {}
                (Packet::SurfaceUploadPoint { .. }, Packet::SurfaceUploadPoint { .. }) => {}
                (Packet::Disconnected { .. }, Packet::Disconnected { .. }) => {}
                _ => panic!("Packet type mismatch after serialization"),
            }
        }
    }

    /// Tests real UDP socket communication
    #[tokio::test]
    async fn udp_socket_communication() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind server socket");
        let server_addr = server_socket.local_addr().unwrap();

        // Echo server
        let server_socket_clone = server_socket.try_clone().unwrap();
        thread::spawn(move || {
            let mut buf = [0; 1024];
            if let Ok((size, client_addr)) = server_socket_clone.recv_from(&mut buf) {
                let _ = server_socket_clone.send_to(&buf[..size], client_addr);
            }
        });

        sleep(Duration::from_millis(10)).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind client socket");
        client_socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();

        let test_packet = Packet::FocusEnter { target: 7 };
        let serialized = serialize(&test_packet).unwrap();

        client_socket.send_to(&serialized, server_addr).unwrap();

        let mut buf = [0; 1024];
        let (size, _) = client_socket.recv_from(&mut buf).unwrap();
        let received_packet: Packet = deserialize(&buf[..size]).unwrap();

        match received_packet {
            Packet::FocusEnter { target } => assert_eq!(target, 7),
            _ => panic!("Wrong packet type received"),
        }
    }

    /// Tests that garbage on the wire is refused rather than misread
    #[test]
    fn malformed_packet_handling() {
        let malformed_data = vec![
            vec![],
            vec![0xFF; 4],
            vec![0x01, 0x02, 0x03],
            vec![0xFF; 512],
        ];

        for data in malformed_data {
            assert!(deserialize::<Packet>(&data).is_err());
        }
    }
}

/// AUTHORITY INTEGRATION TESTS
mod authority_tests {
    use super::*;

    /// Legal movement along the strip commits and advances the baseline
    #[test]
    fn walk_along_surface() {
        let (mut authority, mut rx) = strip_controller();
        let mut session = WorldSession::new(Vec3::new(1.0, 0.0, 1.0), Vec3::ZERO);
        authority.register_entity(&mut session, 1, 0.0);

        let mut now = 0.0;
        for step in 1..=20u32 {
            now += 0.1;
            let position = Vec3::new(1.0 + step as f32 * 0.5, 0.0, 1.0);
            let state = authority
                .propose_move(&mut session, 1, MoveProposal::at(step, position), now)
                .unwrap();
            assert_eq!(state.position, position);
        }

        let motion = session.motion_state(1).unwrap();
        assert_eq!(motion.last_valid_position, Vec3::new(11.0, 0.0, 1.0));
        assert_eq!(drain(&mut rx).len(), 20);
    }

    /// Leaving the surface is rejected and the old state is re-asserted
    #[test]
    fn step_off_surface() {
        let (mut authority, mut rx) = strip_controller();
        let mut session = WorldSession::new(Vec3::new(1.0, 0.0, 1.0), Vec3::ZERO);
        authority.register_entity(&mut session, 1, 0.0);

        let result = authority.propose_move(
            &mut session,
            1,
            MoveProposal::at(1, Vec3::new(1.0, 0.0, 6.0)),
            1.0,
        );
        assert_eq!(result, Err(MoveRejection::OffSurface));

        match drain(&mut rx).as_slice() {
            [Broadcast::Rejected { move_id, reason, state }] => {
                assert_eq!(*move_id, 1);
                assert_eq!(*reason, RejectReason::OffSurface);
                assert_eq!(state.position, Vec3::new(1.0, 0.0, 1.0));
            }
            other => panic!("unexpected broadcasts {:?}", other),
        }
    }

    /// A fast mover is caught by the speed check even on the surface
    #[test]
    fn sprint_is_rejected() {
        let (mut authority, _rx) = strip_controller();
        let mut session = WorldSession::new(Vec3::new(1.0, 0.0, 1.0), Vec3::ZERO);
        authority.register_entity(&mut session, 1, 0.0);

        authority
            .propose_move(&mut session, 1, MoveProposal::at(1, Vec3::new(3.0, 0.0, 1.0)), 1.0)
            .unwrap();
        let result = authority.propose_move(
            &mut session,
            1,
            MoveProposal::at(2, Vec3::new(15.0, 0.0, 1.0)),
            2.0,
        );

        assert!(matches!(result, Err(MoveRejection::SpeedViolation { .. })));
        assert_eq!(session.snapshot(1).unwrap().position, Vec3::new(3.0, 0.0, 1.0));
    }

    /// Entities never touch each other's state
    #[test]
    fn entities_are_independent() {
        let (mut authority, _rx) = strip_controller();
        let mut session = WorldSession::new(Vec3::new(1.0, 0.0, 1.0), Vec3::ZERO);
        authority.register_entity(&mut session, 1, 0.0);
        authority.register_entity(&mut session, 2, 0.0);

        authority
            .propose_move(&mut session, 1, MoveProposal::at(1, Vec3::new(3.0, 0.0, 1.0)), 1.0)
            .unwrap();
        let _ = authority.propose_move(
            &mut session,
            2,
            MoveProposal::at(1, Vec3::new(1.0, 0.0, 30.0)),
            1.0,
        );

        assert_eq!(session.snapshot(1).unwrap().position, Vec3::new(3.0, 0.0, 1.0));
        assert_eq!(session.snapshot(2).unwrap().position, Vec3::new(1.0, 0.0, 1.0));
        assert!(session.motion_state(2).is_none());
    }
}

/// CLIENT AGAINST AUTHORITY
mod reconciliation_tests {
    use super::*;

    /// A client walking faster than the server allows gets rubber-banded
    /// back without ever drifting far enough to snap.
    #[test]
    fn speeding_client_is_pulled_back() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut authority = AuthorityController::new(MotionValidator::default(), false, tx);
        let mut session = WorldSession::new(Vec3::ZERO, Vec3::ZERO);
        authority.register_entity(&mut session, 1, 0.0);

        let mut engine = ReconciliationEngine::new(ReconcileConfig::default(), Vec3::ZERO);
        let mut mover = LocalMover::new(15.0, 1000.0, 3);

        let dt = 1.0 / 60.0;
        let mut now = 0.0f64;
        let mut committed = 0;
        let mut rejected = 0;
        let mut snaps = 0;

        for tick in 1..=600 {
            now += dt as f64;
            if engine.can_transmit() {
                let predicted = mover.step(engine.local_position(), dt);
                engine.predict(predicted, dt);
            }
            if engine.tick(dt) == ReconcileStep::Snapped {
                snaps += 1;
            }

            if tick % 3 != 0 {
                continue;
            }
            if let Some(pending) = engine.outgoing(now) {
                let proposal = MoveProposal::at(pending.move_id, pending.position);
                match authority.propose_move(&mut session, 1, proposal, now) {
                    Ok(state) => {
                        committed += 1;
                        engine.on_commit(pending.move_id, state.position, now);
                    }
                    Err(_) => {
                        rejected += 1;
                        let state = session.snapshot(1).unwrap().position;
                        engine.on_rejection(pending.move_id, state, now);
                    }
                }
            }
        }

        assert!(committed > 0);
        assert!(rejected > 0);
        assert_eq!(snaps, 0);
        let authoritative = session.snapshot(1).unwrap().position;
        assert!(engine.local_position().distance(&authoritative) < SNAP_DISTANCE);
    }

    /// An honest client within the speed limit is never corrected
    #[test]
    fn honest_client_is_never_corrected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut authority = AuthorityController::new(MotionValidator::default(), false, tx);
        let mut session = WorldSession::new(Vec3::ZERO, Vec3::ZERO);
        authority.register_entity(&mut session, 1, 0.0);

        let mut engine = ReconciliationEngine::new(ReconcileConfig::default(), Vec3::ZERO);
        let mut mover = LocalMover::new(6.0, 0.5, 11);

        let dt = 1.0 / 60.0;
        let mut now = 0.0f64;
        for tick in 1..=300 {
            now += dt as f64;
            let predicted = mover.step(engine.local_position(), dt);
            engine.predict(predicted, dt);
            engine.tick(dt);

            if tick % 3 == 0 {
                let pending = engine.outgoing(now).unwrap();
                let state = authority
                    .propose_move(
                        &mut session,
                        1,
                        MoveProposal::at(pending.move_id, pending.position),
                        now,
                    )
                    .unwrap();
                engine.on_commit(pending.move_id, state.position, now);
            }
            assert!(!engine.is_reconciling());
        }
    }
}

/// END-TO-END OVER UDP
mod server_tests {
    use super::*;
    use server::config::ServerConfig;
    use server::network::Server;
    use tokio::net::UdpSocket as AsyncUdpSocket;
    use tokio::time::timeout;

    async fn test_server() -> Server {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        Server::new(config).await.unwrap()
    }

    /// Waits for the first packet accepted by `pick`, skipping the rest.
    async fn recv_matching<T>(socket: &AsyncUdpSocket, pick: impl Fn(Packet) -> Option<T>) -> T {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for server")
                .unwrap();
            if let Some(found) = deserialize::<Packet>(&buf[..len]).ok().and_then(&pick) {
                return found;
            }
        }
    }

    async fn send(socket: &AsyncUdpSocket, packet: &Packet, to: std::net::SocketAddr) {
        socket.send_to(&serialize(packet).unwrap(), to).await.unwrap();
    }

    #[tokio::test]
    async fn propose_and_commit_over_udp() {
        let mut server = test_server().await;
        let server_addr = server.local_addr().unwrap();

        let player = async {
            let socket = AsyncUdpSocket::bind("127.0.0.1:0").await.unwrap();
            send(
                &socket,
                &Packet::Connect {
                    client_version: PROTOCOL_VERSION,
                },
                server_addr,
            )
            .await;
            let entity = recv_matching(&socket, |p| match p {
                Packet::Connected { entity, .. } => Some(entity),
                _ => None,
            })
            .await;

            sleep(Duration::from_millis(100)).await;
            let target = entity.position + Vec3::new(0.5, 0.0, 0.0);
            send(
                &socket,
                &Packet::ProposeMove {
                    move_id: 9,
                    position: target,
                    rotation: Vec3::ZERO,
                    animation: Default::default(),
                },
                server_addr,
            )
            .await;

            let (move_id, state) = recv_matching(&socket, |p| match p {
                Packet::MoveCommitted { move_id, state } => Some((move_id, state)),
                _ => None,
            })
            .await;
            assert_eq!(move_id, 9);
            assert_eq!(state.position, target);

            let world = recv_matching(&socket, |p| match p {
                Packet::WorldState { entities, .. } => Some(entities),
                _ => None,
            })
            .await;
            assert!(world.iter().any(|e| e.position == target));
        };

        tokio::select! {
            _ = server.run() => panic!("server stopped early"),
            _ = player => {},
        }
    }

    #[tokio::test]
    async fn uploaded_surface_gates_moves() {
        let mut server = test_server().await;
        let server_addr = server.local_addr().unwrap();

        let admin = async {
            let socket = AsyncUdpSocket::bind("127.0.0.1:0").await.unwrap();
            send(
                &socket,
                &Packet::Connect {
                    client_version: PROTOCOL_VERSION,
                },
                server_addr,
            )
            .await;
            recv_matching(&socket, |p| match p {
                Packet::Connected { client_id, .. } => Some(client_id),
                _ => None,
            })
            .await;

            send(
                &socket,
                &Packet::SurfaceSetConfig {
                    cell_size: 2.0,
                    vertical_tolerance: 2.0,
                    origin_x: 0.0,
                    origin_z: 0.0,
                },
                server_addr,
            )
            .await;
            let ok = recv_matching(&socket, |p| match p {
                Packet::SurfaceResult { ok, .. } => Some(ok),
                _ => None,
            })
            .await;
            assert!(ok);

            send(
                &socket,
                &Packet::SurfaceUploadPoint {
                    position: Vec3::new(1.0, 0.0, 1.0),
                    grid_x: 0,
                    grid_z: 0,
                },
                server_addr,
            )
            .await;
            send(&socket, &Packet::SurfaceCommit, server_addr).await;
            let ok = recv_matching(&socket, |p| match p {
                Packet::SurfaceResult { ok, .. } => Some(ok),
                _ => None,
            })
            .await;
            assert!(ok);

            sleep(Duration::from_millis(50)).await;
            send(
                &socket,
                &Packet::ProposeMove {
                    move_id: 1,
                    position: Vec3::new(0.0, 0.0, 9.0),
                    rotation: Vec3::ZERO,
                    animation: Default::default(),
                },
                server_addr,
            )
            .await;
            let reason = recv_matching(&socket, |p| match p {
                Packet::MoveRejected { reason, .. } => Some(reason),
                _ => None,
            })
            .await;
            assert_eq!(reason, RejectReason::OffSurface);
        };

        tokio::select! {
            _ = server.run() => panic!("server stopped early"),
            _ = admin => {},
        }
    }

    #[tokio::test]
    async fn headless_client_walks_against_server() {
        let mut server = test_server().await;
        let server_addr = server.local_addr().unwrap();

        let config = client::network::ClientConfig {
            server_addr: server_addr.to_string(),
            walk_speed: 4.0,
            run_for: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let mut player = client::network::Client::new(config).await.unwrap();

        tokio::select! {
            _ = server.run() => panic!("server stopped early"),
            result = player.run() => result.unwrap(),
        }

        assert!(player.stats().committed > 0);
        assert_eq!(player.stats().snaps, 0);
    }
}
