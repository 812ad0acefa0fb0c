pub mod dispute;
pub mod error;
pub mod order_lifecycle;
pub mod payout;
pub mod service;
pub mod types;
pub mod validation;

pub use error::{MarketError, MarketResult};
pub use order_lifecycle::{Actor, OrderAction};
pub use types::{GeoPoint, Order, OrderId, OrderStatus, Profile, Scenario, ScenarioId, UserId, VoteSide};
