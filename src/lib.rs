pub mod collab;
pub mod config;
pub mod errors;
pub mod logging;
