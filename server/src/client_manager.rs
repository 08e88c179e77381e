//! Client connection management for the movement authority server
//!
//! This module handles the server-side bookkeeping of connected clients:
//! - Client connection lifecycle (connect, disconnect, timeout)
//! - Address lookup for routing incoming packets to an entity
//! - Admin flagging for surface ingestion
//! - Client capacity management
//!
//! Each client controls exactly one entity whose id equals the client id.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Idle time after which a client is dropped
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected client
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier, also the id of its entity
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Whether this connection may touch the surface grid
    pub is_admin: bool,
    /// Number of proposals rejected since connecting
    pub rejected_moves: u32,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr, is_admin: bool) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            is_admin,
            rejected_moves: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if nothing arrived from this client within `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Owns the roster of connected clients and enforces the capacity limit
pub struct ClientManager {
    clients: HashMap<u32, Client>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Returns Some(client_id) if successful, None if server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr, is_admin: bool) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!(
            "Client {} connected from {}{}",
            client_id,
            addr,
            if is_admin { " (admin)" } else { "" }
        );
        self.clients
            .insert(client_id, Client::new(client_id, addr, is_admin));

        Some(client_id)
    }

    /// Returns true if the client was found and removed.
    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!(
                "Client {} disconnected ({} rejected moves)",
                client.id, client.rejected_moves
            );
            true
        } else {
            false
        }
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: u32) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Marks the client as active. Returns false if the client ID is invalid.
    pub fn touch(&mut self, client_id: u32) -> bool {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.touch();
            true
        } else {
            false
        }
    }

    pub fn record_rejection(&mut self, client_id: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.rejected_moves += 1;
        }
    }

    pub fn is_admin(&self, client_id: u32) -> bool {
        self.clients
            .get(&client_id)
            .map(|c| c.is_admin)
            .unwrap_or(false)
    }

    /// Removes clients idle past `timeout` and returns their IDs so the
    /// caller can discard their entities.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<u32> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Used for broadcasting state to every connected client.
    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = Client::new(1, test_addr(), false);

        assert_eq!(client.id, 1);
        assert_eq!(client.addr, test_addr());
        assert!(!client.is_admin);
        assert_eq!(client.rejected_moves, 0);
    }

    #[test]
    fn test_client_timeout() {
        let mut client = Client::new(1, test_addr(), false);

        assert!(!client.is_timed_out(Duration::from_secs(1)));

        client.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(client.is_timed_out(Duration::from_secs(1)));

        client.touch();
        assert!(!client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_multiple_clients() {
        let mut manager = ClientManager::new(3);

        let client_id1 = manager.add_client(test_addr(), false).unwrap();
        let client_id2 = manager.add_client(test_addr2(), true).unwrap();

        assert_eq!(client_id1, 1);
        assert_eq!(client_id2, 2);
        assert_eq!(manager.len(), 2);
        assert!(!manager.is_admin(client_id1));
        assert!(manager.is_admin(client_id2));
        assert!(!manager.is_admin(999));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1);

        assert!(manager.add_client(test_addr(), false).is_some());
        assert!(manager.add_client(test_addr2(), false).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = ClientManager::new(2);
        let client_id = manager.add_client(test_addr(), false).unwrap();

        assert!(manager.remove_client(&client_id));
        assert!(!manager.remove_client(&client_id));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_find_client_by_addr() {
        let mut manager = ClientManager::new(2);

        let client_id1 = manager.add_client(test_addr(), false).unwrap();
        let _client_id2 = manager.add_client(test_addr2(), false).unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(client_id1));

        let unknown_addr: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_client_by_addr(unknown_addr), None);
    }

    #[test]
    fn test_record_rejection() {
        let mut manager = ClientManager::new(2);
        let client_id = manager.add_client(test_addr(), false).unwrap();

        manager.record_rejection(client_id);
        manager.record_rejection(client_id);
        manager.record_rejection(999);

        assert_eq!(manager.get(client_id).unwrap().rejected_moves, 2);
    }

    #[test]
    fn test_check_timeouts_removes_idle_clients() {
        let mut manager = ClientManager::new(3);
        let stale = manager.add_client(test_addr(), false).unwrap();
        let fresh = manager.add_client(test_addr2(), false).unwrap();

        manager.clients.get_mut(&stale).unwrap().last_seen =
            Instant::now() - Duration::from_secs(10);

        let removed = manager.check_timeouts(CLIENT_TIMEOUT);
        assert_eq!(removed, vec![stale]);
        assert!(manager.get(fresh).is_some());
        assert_eq!(manager.len(), 1);
        assert!(!manager.touch(stale));
        assert!(manager.touch(fresh));
    }
}
