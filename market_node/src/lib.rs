//! Buy My Behavior marketplace node
//!
//! Profiles, scenario catalog, order lifecycle, dispute voting and USDT escrow
//! settlement behind an axum HTTP surface with a realtime change feed.

pub mod api;
pub mod config;
pub mod events;
pub mod market;
pub mod monitoring;
pub mod payment;
pub mod policy;
pub mod storage;

pub use config::NodeConfig;
pub use market::service::MarketService;
