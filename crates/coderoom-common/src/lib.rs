//! Shared domain types for the coderoom collaboration server.
//!
//! `models` holds the persisted and derived records (users, rooms, roster
//! entries, activity and chat rows); `events` holds the inbound and outbound
//! websocket events exchanged with clients.

pub mod events;
pub mod models;

pub use events::{ClientEvent, ServerEvent};
pub use models::*;
