//! Remote control protocol
//!
//! Every cluster member exposes the same small set of operations. In
//! process they are a [`RemoteClient`] trait object; across hosts they are
//! JSON over HTTP, one route per operation ([`ControlClient`] and
//! [`ControlServer`]).
//!
//! ```text
//! coordinator                                 remote slicer
//!   ControlClient --POST /start_node {"port"}--> ControlServer --> LocalNodeHandler
//!                 <--{"status":"ok"}-----------
//! ```

pub mod client;
pub mod server;

pub use client::{ControlClient, HttpConnector};
pub use server::ControlServer;

use crate::error::{RpcError, RpcResult};
use crate::node::NodeAddress;
use crate::process::LogLine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Control capability bound to one cluster member
pub trait RemoteClient: Send + Sync {
    /// Launch a worker listening on `port`
    fn start_node(&self, port: u16) -> RpcResult<()>;

    /// Launch the switch
    fn start_switch(&self) -> RpcResult<()>;

    /// Launch the replay client
    fn start_client(&self) -> RpcResult<()>;

    /// Forward this member's process output to the master on `master_host`
    fn start_logging(&self, master_host: &str) -> RpcResult<()>;

    /// Process-table lines for worker processes on this member
    fn poll_stats(&self) -> RpcResult<String>;

    /// Deliver one forwarded log line
    fn receive_log(&self, line: LogLine) -> RpcResult<()>;

    /// Stop the member's processes and its handler
    fn shutdown(&self) -> RpcResult<()>;
}

/// Creates clients for control addresses
pub trait Connector: Send + Sync {
    fn connect(&self, addr: &NodeAddress) -> RpcResult<Arc<dyn RemoteClient>>;
}

/// One control operation
///
/// Each operation is posted to its own route; the payload, if any, is the
/// JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    StartNode { port: u16 },
    StartSwitch,
    StartClient,
    StartLogging { host: String },
    PollStats,
    ReceiveLog { line: LogLine },
    Shutdown,
}

impl Request {
    /// Route serving this operation
    pub fn route(&self) -> &'static str {
        match self {
            Request::StartNode { .. } => "/start_node",
            Request::StartSwitch => "/start_switch",
            Request::StartClient => "/start_client",
            Request::StartLogging { .. } => "/start_logging",
            Request::PollStats => "/poll_stats",
            Request::ReceiveLog { .. } => "/receive_log",
            Request::Shutdown => "/shutdown",
        }
    }

    /// JSON body posted to [`Request::route`]
    pub fn body(&self) -> serde_json::Value {
        match self {
            Request::StartNode { port } => json!({ "port": port }),
            Request::StartLogging { host } => json!({ "host": host }),
            Request::ReceiveLog { line } => json!(line),
            _ => json!({}),
        }
    }
}

/// Result of a control operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Stats { text: String },
    Error { message: String },
}

impl Response {
    fn from_unit(result: RpcResult<()>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }

    /// Interpret a response to a request without a payload
    pub fn into_unit(self) -> RpcResult<()> {
        match self {
            Response::Ok => Ok(()),
            Response::Error { message } => Err(RpcError::Remote(message)),
            Response::Stats { .. } => Err(RpcError::Protocol("unexpected stats response".into())),
        }
    }

    /// Interpret a response to a stats request
    pub fn into_stats(self) -> RpcResult<String> {
        match self {
            Response::Stats { text } => Ok(text),
            Response::Error { message } => Err(RpcError::Remote(message)),
            Response::Ok => Err(RpcError::Protocol("missing stats payload".into())),
        }
    }
}

/// Execute a request against a local target
pub fn dispatch(target: &dyn RemoteClient, request: Request) -> Response {
    match request {
        Request::StartNode { port } => Response::from_unit(target.start_node(port)),
        Request::StartSwitch => Response::from_unit(target.start_switch()),
        Request::StartClient => Response::from_unit(target.start_client()),
        Request::StartLogging { host } => Response::from_unit(target.start_logging(&host)),
        Request::PollStats => match target.poll_stats() {
            Ok(text) => Response::Stats { text },
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        },
        Request::ReceiveLog { line } => Response::from_unit(target.receive_log(line)),
        Request::Shutdown => Response::from_unit(target.shutdown()),
    }
}
