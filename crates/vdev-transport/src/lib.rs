//! # vdev-transport
//!
//! Multiplexed request/response protocol client for vdev device channels
//! (agent, network monitor, netdump): one persistent WebSocket carrying many
//! concurrent logical operations, correlated by integer request ids.
//!
//! ## Features
//!
//! - **Request-Response**: `(type, op, params)` commands resolved by
//!   correlation id, including multi-frame progress commands
//! - **Binary Streaming**: upload/download of arbitrary-length byte
//!   sequences over per-id binary frames
//! - **Subscriptions**: long-lived requests (crash-log watch) that emit
//!   events indefinitely on one id
//! - **Auto-Reconnection**: configurable delay policy, endpoint re-resolved
//!   per attempt
//! - **Keepalive**: ping/pong liveness with a watchdog timeout
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────────────┐     ┌──────────────┐
//! │ AgentClient │────▶│ connection driver │────▶│    device    │
//! │   (Clone)   │     │ (background task) │     │   channel    │
//! └─────────────┘     └─────────┬─────────┘     └──────────────┘
//!                               │
//!                     ┌─────────▼─────────┐
//!                     │   PendingStore    │
//!                     │  (id -> handler)  │
//!                     └───────────────────┘
//! ```
//!
//! The driver task exclusively owns the socket, the pending-request map, and
//! the keepalive state; handles talk to it over channels. Concurrency comes
//! from interleaving request ids on one socket, not from parallel protocol
//! logic.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use vdev_transport::{AgentClient, AgentConfig, StaticEndpoint};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = StaticEndpoint::new("wss://devices.example.com/agent");
//!     let (client, _events) = AgentClient::new(endpoint, AgentConfig::default())?;
//!
//!     // connection opens lazily on first use
//!     let apps = client.app_list().await?;
//!     println!("installed: {apps}");
//!
//!     client.upload_bytes("/tmp/payload.bin", &b"data"[..]).await?;
//!     let bytes = client.download("/tmp/payload.bin").await?.read_to_end().await?;
//!     assert_eq!(&bytes[..], b"data");
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! A crash subscription never completes and permanently occupies one request
//! id; run it on a second [`AgentClient`] when the same workflow also issues
//! blocking commands.
//!
//! # Module Structure
//!
//! - [`codec`]: the two wire frame shapes (JSON control, tagged binary)
//! - [`config`]: connection configuration and reconnect policy
//! - [`connection`]: driver task, state machine, keepalive, dispatch
//! - [`crash`]: crash-log subscription channel
//! - [`endpoint`]: async URL discovery seam
//! - [`error`]: error taxonomy
//! - [`pending`]: id allocation and the pending-request store
//! - [`transfer`]: binary upload/download and command veneers

pub mod codec;
pub mod config;
pub mod connection;
pub mod crash;
pub mod endpoint;
pub mod error;
pub mod pending;
pub mod transfer;

pub use codec::{BINARY_HEADER_LEN, Frame};
pub use config::{AgentConfig, ReconnectPolicy};
pub use connection::{AgentClient, ConnectionEpoch, ConnectionState, Event, EventStream};
pub use crash::{CrashReport, CrashStream};
pub use endpoint::{EndpointFn, EndpointProvider, StaticEndpoint};
pub use error::{AgentError, AgentResult};
pub use pending::{Completion, FrameHandler};
pub use transfer::DownloadStream;
