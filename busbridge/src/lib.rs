pub mod agent;
pub mod discovery;
pub mod forward;
pub mod introspect;
pub mod managed;
pub mod mirror;
pub mod proxy;
pub mod signals;
pub mod state;

pub use proxy::{Proxy, ShutdownReason};
pub use state::ProxyState;
