//! Uploads a baked surface export to a running server over the admin path.

use bincode::{deserialize, serialize};
use clap::Parser;
use log::{error, info, warn};
use server::surface::SurfaceExport;
use shared::{Packet, SurfaceStep, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to upload to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,

    /// Surface export (JSON)
    export: PathBuf,

    /// Points sent before pausing briefly, to avoid flooding the socket
    #[arg(long, default_value = "256")]
    batch: usize,
}

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

async fn send(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    socket.send_to(&serialize(packet)?, addr).await?;
    Ok(())
}

/// Tally of server replies to one upload
#[derive(Debug, Default)]
struct UploadReport {
    point_failures: usize,
    committed: Option<Result<String, String>>,
}

impl UploadReport {
    /// Records one reply; returns true once the commit has been answered.
    fn record(&mut self, step: SurfaceStep, ok: bool, message: String) -> bool {
        match (step, ok) {
            (SurfaceStep::Commit, true) => {
                info!("Surface committed: {}", message);
                self.committed = Some(Ok(message));
                true
            }
            (SurfaceStep::Commit, false) => {
                error!("Surface commit failed: {}", message);
                self.committed = Some(Err(message));
                true
            }
            (_, false) => {
                error!("Surface upload error: {}", message);
                self.point_failures += 1;
                false
            }
            (_, true) => false,
        }
    }

    fn finish(self) -> Result<String, Box<dyn std::error::Error>> {
        match self.committed {
            Some(Ok(_)) if self.point_failures > 0 => Err(format!(
                "{} points were refused; the committed surface is incomplete",
                self.point_failures
            )
            .into()),
            Some(Ok(summary)) => Ok(summary),
            Some(Err(message)) => Err(message.into()),
            None => Err("no reply to the surface commit".into()),
        }
    }
}

/// Waits for the next surface reply, skipping state broadcasts.
async fn await_surface_result(
    socket: &UdpSocket,
) -> Result<(SurfaceStep, bool, String), Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, _) = timeout(REPLY_TIMEOUT, socket.recv_from(&mut buf)).await??;
        match deserialize::<Packet>(&buf[..len]) {
            Ok(Packet::SurfaceResult { step, ok, message }) => return Ok((step, ok, message)),
            Ok(Packet::Disconnected { reason }) => return Err(reason.into()),
            Ok(_) => continue,
            Err(e) => warn!("Undecodable reply: {}", e),
        }
    }
}

async fn connect(socket: &UdpSocket, addr: SocketAddr) -> Result<u32, Box<dyn std::error::Error>> {
    send(
        socket,
        &Packet::Connect {
            client_version: PROTOCOL_VERSION,
        },
        addr,
    )
    .await?;

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, _) = timeout(REPLY_TIMEOUT, socket.recv_from(&mut buf)).await??;
        match deserialize::<Packet>(&buf[..len]) {
            Ok(Packet::Connected { client_id, .. }) => return Ok(client_id),
            Ok(Packet::Disconnected { reason }) => return Err(reason.into()),
            _ => continue,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let data = std::fs::read_to_string(&args.export)?;
    let export: SurfaceExport = serde_json::from_str(&data)?;
    info!(
        "Uploading {} samples from {}",
        export.points.len(),
        args.export.display()
    );

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let client_id = connect(&socket, args.server).await?;
    info!("Connected as client {}", client_id);

    send(&socket, &Packet::SurfaceClear, args.server).await?;
    let (_, ok, message) = await_surface_result(&socket).await?;
    if !ok {
        return Err(message.into());
    }

    let config = export.config;
    send(
        &socket,
        &Packet::SurfaceSetConfig {
            cell_size: config.cell_size,
            vertical_tolerance: config.vertical_tolerance,
            origin_x: config.origin_x,
            origin_z: config.origin_z,
        },
        args.server,
    )
    .await?;
    let (_, ok, message) = await_surface_result(&socket).await?;
    if !ok {
        return Err(message.into());
    }

    for (i, sample) in export.points.iter().enumerate() {
        send(
            &socket,
            &Packet::SurfaceUploadPoint {
                position: sample.position,
                grid_x: sample.grid_x,
                grid_z: sample.grid_z,
            },
            args.server,
        )
        .await?;

        if (i + 1) % args.batch.max(1) == 0 {
            sleep(Duration::from_millis(2)).await;
        }
    }

    send(&socket, &Packet::SurfaceCommit, args.server).await?;
    // Point failures arrive before the commit reply.
    let mut report = UploadReport::default();
    loop {
        let (step, ok, message) = await_surface_result(&socket).await?;
        if report.record(step, ok, message) {
            break;
        }
    }

    send(&socket, &Packet::Disconnect, args.server).await?;
    let summary = report.finish()?;
    info!("Upload complete: {}", summary);
    Ok(())
}
