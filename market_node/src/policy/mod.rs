pub mod session;

pub use session::{AuthUser, SessionError, SessionValidator};
