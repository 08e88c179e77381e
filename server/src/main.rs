use clap::Parser;
use log::info;
use server::config::{parse_vec3, ServerConfig};
use server::network::Server;
use shared::{Vec3, MAX_SPEED};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// World snapshot broadcasts per second
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// Movement speed limit in units per second
    #[arg(long, default_value_t = MAX_SPEED)]
    max_speed: f32,

    /// Baked walkable-surface export (JSON)
    #[arg(short, long)]
    surface: Option<PathBuf>,

    /// Reject all moves while no surface is loaded
    #[arg(long)]
    strict_surface: bool,

    /// Spawn position as x,y,z
    #[arg(long, value_parser = parse_vec3, default_value = "0,0,0")]
    spawn: Vec3,

    /// Host allowed to upload the surface over the network (repeatable)
    #[arg(long = "admin", default_value = "127.0.0.1")]
    admins: Vec<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        tick_duration: Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64),
        max_clients: args.max_clients,
        max_speed: args.max_speed,
        strict_surface: args.strict_surface,
        surface_export: args.surface,
        spawn_position: args.spawn,
        admin_hosts: args.admins,
        ..ServerConfig::default()
    };

    info!(
        "Starting server: speed limit {:.1} u/s, {} max clients",
        config.max_speed, config.max_clients
    );

    let mut server = Server::new(config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
