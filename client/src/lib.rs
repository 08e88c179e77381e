//! # Movement Client Library
//!
//! Headless client for the movement authority server. It predicts its own
//! entity locally, proposes positions to the server, and reconciles toward
//! whatever the server reports as authoritative.
//!
//! ## Module Organization
//!
//! ### Reconciliation (`reconciliation`)
//! The correction engine: trigger thresholds derived from speed and round
//! trip time, critically damped easing, teleport snapping, and the bounded
//! queue of in-flight moves.
//!
//! ### Game (`game`)
//! A scripted walker that stands in for player input, plus the last known
//! state of every other entity.
//!
//! ### Network (`network`)
//! UDP connection to the server and the client loop tying prediction,
//! correction and transmission together.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::network::{Client, ClientConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = Client::new(ClientConfig::default()).await?;
//! client.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod game;
pub mod network;
pub mod reconciliation;
