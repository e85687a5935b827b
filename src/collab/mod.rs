//! Real-time collaboration rooms.
//!
//! - `db`: SQLite persistence for users, sessions, rooms, memberships and logs
//! - `auth`: session tokens and per-connection identity
//! - `registry`: room lifecycle and membership, serialized per room
//! - `presence`: live connections and per-room fan-out
//! - `engine`: handlers for every room event
//! - `sandbox`: isolated code execution
//! - `recorder`: background activity/chat log writer
//! - `assistant`: optional Ollama relay
//! - `api`, `ws`, `server`: HTTP surface

pub mod api;
pub mod assistant;
pub mod auth;
pub mod db;
pub mod engine;
pub mod presence;
pub mod recorder;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod ws;
