//! Server configuration assembled from command-line flags

use shared::{Vec3, MAX_SPEED};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the UDP socket binds to
    pub bind_addr: String,
    pub tick_duration: Duration,
    pub max_clients: usize,
    pub max_speed: f32,
    /// Reject every move while no surface grid is installed, instead of
    /// skipping the surface check.
    pub strict_surface: bool,
    /// Baked surface export loaded at startup
    pub surface_export: Option<PathBuf>,
    pub spawn_position: Vec3,
    pub spawn_rotation: Vec3,
    /// Hosts allowed to upload or clear the surface over the network
    pub admin_hosts: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            tick_duration: Duration::from_millis(50),
            max_clients: 32,
            max_speed: MAX_SPEED,
            strict_surface: false,
            surface_export: None,
            spawn_position: Vec3::ZERO,
            spawn_rotation: Vec3::ZERO,
            admin_hosts: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }
}

impl ServerConfig {
    pub fn is_admin_host(&self, host: &IpAddr) -> bool {
        self.admin_hosts.contains(host)
    }
}

/// Parses `x,y,z` into a vector.
pub fn parse_vec3(value: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(format!("expected x,y,z but got '{}'", value));
    }

    let mut coords = [0.0f32; 3];
    for (slot, part) in coords.iter_mut().zip(&parts) {
        *slot = part
            .parse::<f32>()
            .map_err(|e| format!("invalid coordinate '{}': {}", part, e))?;
    }

    Ok(Vec3::new(coords[0], coords[1], coords[2]))
}
