//! Request/response RPC over TCP.
//!
//! Every connection carries frames from [rpc_tester_codec]. A client tags each request with a
//! message id and may have any number of requests in flight; the server looks up the handler for
//! the request's verb and answers with a response frame, or an error frame if the verb is unknown
//! or the payload does not decode.

mod client;
mod error;
mod incoming;
mod protocol;
mod server;

pub use client::{ClientOptions, RpcClient};
pub use error::RpcError;
pub use incoming::{ConnectionDistributor, Incoming};
pub use protocol::RpcProtocol;
pub use server::{RpcServer, ServerOptions};
