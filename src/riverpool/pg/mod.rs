pub mod protocol;
pub mod sql;
pub mod stream;
pub mod node_set;
pub mod node_status;
pub mod backend_set;
pub mod simple_query;
pub mod relcache;
pub mod query_context;
pub mod sent_message;
pub mod session_context;
pub mod reconciler;
pub mod dispatch;
mod backend_response;
mod frontend_request;
pub mod parallel;
pub mod reporting;

pub use stream::{Peer, PoolStream};
pub use node_set::NodeSet;
pub use node_status::{NodeStatus, NodeStatusTable};
pub use backend_set::{BackendSet, Routing};
pub use session_context::SessionContext;
pub use dispatch::{DispatchState, Dispatcher, ResetOutcome, Timings};
