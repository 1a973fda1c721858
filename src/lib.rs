//! Rent vs Buy Vault — conversion funnel client.

pub mod config;
pub mod connectivity;
pub mod document;
pub mod error;
pub mod funnel;
pub mod safety;
pub mod service;
