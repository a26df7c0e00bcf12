//! Shared wire and domain types for the Parley chat gateway.

pub mod api;
pub mod frames;
pub mod models;
