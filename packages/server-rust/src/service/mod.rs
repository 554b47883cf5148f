//! RPC-side call handling.
//!
//! 1. **Calls** (`call`): envelopes for both call kinds and the message capability
//! 2. **Middleware** (`middleware`): interceptor units and the chain composer
//! 3. **Pipeline** (`rpc`, `stream`): tonic entry points running calls through the chain
//! 4. **Status** (`status`): taxonomy, RPC and HTTP status mapping
//! 5. **Propagation** (`propagate`): the caller's credential on outbound calls
//! 6. **Health** (`health`): the standard health service

pub mod call;
pub mod health;
pub mod middleware;
pub mod propagate;
pub mod rpc;
pub mod status;
pub mod stream;

pub use call::{CallMessage, MethodInfo, ServerStream, StreamCall, UnaryCall, UnaryReply};
pub use health::HealthService;
pub use middleware::{CallChain, ChainBuilder, Next, ServerMiddleware};
pub use propagate::BearerPropagation;
pub use rpc::{parse_grpc_timeout, Pipeline, ResponseStream};
pub use status::{context_done_status, http_status, taxonomy_code, IntoStatus};
pub use stream::RpcStream;
