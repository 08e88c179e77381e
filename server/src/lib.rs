//! # Movement Authority Server Library
//!
//! Server-authoritative movement for networked entities. Clients propose new
//! positions; the server checks each one against a baked walkable-surface
//! map and a speed bound before it becomes the entity's authoritative state.
//!
//! ## Validation Pipeline
//!
//! Each proposal is evaluated exactly once, in arrival order per entity:
//!
//! 1. **Surface** (`surface`): the position must lie near a baked walkable
//!    sample, found through a cell-hashed grid and a 3x3 neighbourhood sweep.
//! 2. **Motion** (`motion`): the speed implied by the distance from the last
//!    accepted position, over server-measured elapsed time, must not exceed
//!    the limit. Non-positive elapsed time is a stale update.
//! 3. **Commit or reject** (`authority`): a commit writes the public state
//!    and the motion baseline; a reject writes nothing and re-asserts the
//!    current state so the client can converge.
//!
//! ## Module Organization
//!
//! - `surface`: surface config, samples, ingestion staging and the grid
//! - `motion`: per-entity motion baseline and the speed check
//! - `authority`: the controller and the `WorldSession` context it mutates
//! - `error`: rejection and ingestion error kinds
//! - `config`: server configuration
//! - `client_manager`: connection roster, timeouts and admin flags
//! - `network`: UDP transport and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         surface_export: Some("level_surface.json".into()),
//!         ..ServerConfig::default()
//!     };
//!
//!     let mut server = Server::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! The authority and the session are owned by the single main loop, so
//! every proposal is applied atomically with respect to its entity. The
//! installed grid is an `Arc<SurfaceGrid>` and is never mutated; reloading
//! swaps in a freshly built grid.

pub mod authority;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod motion;
pub mod network;
pub mod surface;
