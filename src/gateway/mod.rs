//! HTTP gateway: router, decision-pipeline middleware, upstream proxy,
//! and the server runtime.

pub mod middleware;
pub mod proxy;
pub mod router;
pub mod server;

pub use router::{GatewayState, create_router};
pub use server::Gateway;
