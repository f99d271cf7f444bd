//! Persistence for the bounce state document and the deal ledger.

pub mod deals;
pub mod state;

pub use deals::{DealLookup, JsonDealLedger};
pub use state::{JsonStateStore, StateStore};
