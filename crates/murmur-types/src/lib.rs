//! Shared data model and wire types for the murmur chat gateway.

pub mod api;
pub mod events;
pub mod models;
