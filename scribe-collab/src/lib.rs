//! # scribe-collab: Real-time collaboration layer for Scribe
//!
//! Provides WebSocket-based multiplayer text editing on top of the OT engine
//! in `scribe-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │    JSON events     │ (central)   │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐
//! │  OtClient   │                    │ Room task   │
//! │ (pending    │                    │ (Session,   │
//! │  ops)       │                    │  authority) │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                   ┌───────┴───────┐
//!                                   │ BroadcastGroup│
//!                                   │ (fan-out)     │
//!                                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: `{name, data}` JSON events
//! - [`broadcast`]: per-room fan-out with lag detection
//! - [`room`]: one actor task per document, owning its session
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client and its OT state machine

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Echo, Outbound};
pub use client::{ConnectionState, OtClient, SyncClient, SyncEvent};
pub use protocol::{ClientEvent, DocSnapshot, Envelope, ProtocolError, ServerEvent};
pub use room::{DocumentHandle, RoomConfig, RoomManager};
pub use server::{document_name, ServerConfig, ServerStats, SyncServer, DEFAULT_DOCUMENT};
