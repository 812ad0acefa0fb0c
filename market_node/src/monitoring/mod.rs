pub mod expiry;

pub use expiry::ExpiryMonitor;
