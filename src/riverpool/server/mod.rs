pub mod transport;
mod listener;
pub mod cancel;
pub mod startup;
mod service;

pub use transport::{connect, Transport};
pub use listener::Listener;
pub use cancel::{CancelRegistry, CancelTarget};
pub use service::{run_session, PoolService, Shared};
