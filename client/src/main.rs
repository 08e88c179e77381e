mod game;
mod network;
mod reconciliation;

use clap::Parser;
use log::info;
use network::{Client, ClientConfig};
use reconciliation::ReconcileConfig;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Walking speed in units per second
    #[arg(long, default_value = "5.0")]
    speed: f32,

    /// Seconds between heading changes
    #[arg(long, default_value = "3.0")]
    turn_every: f32,

    /// Proposals sent per second
    #[arg(long, default_value = "20")]
    send_rate: u64,

    /// Initial round trip estimate in milliseconds
    #[arg(long, default_value = "100")]
    rtt: u64,

    /// Extra slack before a correction starts, in world units
    #[arg(long, default_value = "1.5", value_parser = parse_positive)]
    margin: f32,

    /// Correction spring frequency
    #[arg(long, default_value = "10.0", value_parser = parse_positive)]
    correction_rate: f32,

    /// Stop after this many seconds (0 runs until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Seed for the walker's heading changes
    #[arg(long, default_value = "1")]
    seed: u64,
}

fn parse_positive(value: &str) -> Result<f32, String> {
    let parsed: f32 = value
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", value, e))?;
    if parsed.is_finite() && parsed > 0.0 {
        Ok(parsed)
    } else {
        Err(format!("expected a positive number but got {}", value))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }
    info!("Walking at {:.1} u/s", args.speed);

    let config = ClientConfig {
        server_addr: args.server,
        fake_ping_ms: args.fake_ping,
        send_interval: Duration::from_millis(1000 / args.send_rate.max(1)),
        walk_speed: args.speed,
        turn_interval: args.turn_every,
        seed: args.seed,
        run_for: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
        reconcile: ReconcileConfig {
            expected_rtt: args.rtt as f64 / 1000.0,
            safety_margin: args.margin,
            correction_rate: args.correction_rate,
            ..ReconcileConfig::default()
        },
    };

    let mut client = Client::new(config).await?;
    client.run().await?;

    Ok(())
}
