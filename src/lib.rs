pub mod auctions;
pub mod auth;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod session;
pub mod store;
pub mod users;

pub use auth::lifecycle::{AuthError, AuthLifecycle, AuthPhase, LoginOutcome, VerifyOutcome};
pub use gateway::Gateway;
pub use session::SessionHandle;
pub use store::{Session, SessionStore, UserSummary};
