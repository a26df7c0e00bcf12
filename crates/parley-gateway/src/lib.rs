//! Real-time direct-message gateway: authenticated WebSocket connections,
//! live delivery to online users, typing indicators and read receipts.

pub mod auth;
pub mod connection;
pub mod receipts;
pub mod registry;
pub mod router;
pub mod store;
pub mod typing;
