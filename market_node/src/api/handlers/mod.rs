pub mod disputes;
pub mod orders;
pub mod payments;
pub mod profiles;
pub mod rpc;
pub mod scenarios;
pub mod storage;
