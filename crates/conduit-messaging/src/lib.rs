//! conduit-messaging — the messaging core.
//!
//! Block transfer connections, the peer queue registry, the broker
//! dispatching backend, the client-side forwarding backend, the async block
//! executor, the authorization cache, and the chunk storage plane.

pub mod authorization;
pub mod backend;
pub mod broker;
pub mod control;
pub mod dispatch;
pub mod executor;
pub mod forwarding;
pub mod queue;
pub mod storage;
pub mod transfer;

pub use backend::{BackendProcessing, BackendRequest, CommandId, OperationId, Task};
pub use control::{ControlToken, ControlTokenSource};
pub use dispatch::BrokerDispatchingBackend;
pub use forwarding::ForwardingBackend;
pub use queue::{MessageBlockCompletionQueue, PeerQueueRegistry};
pub use storage::ChunkStorage;
