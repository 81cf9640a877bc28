//! Shared types for the katko break player: wire protocol, configuration,
//! slot selection and the directory-listing client.

pub mod config;
pub mod listing;
pub mod platform;
pub mod protocol;
pub mod slot;
pub mod state;
