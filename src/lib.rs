//! Bounce relay: detects delivery failures and resends through alternate senders.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod status;
pub mod store;
