//! HTTP client for the control protocol

use crate::error::{RpcError, RpcResult};
use crate::node::NodeAddress;
use crate::process::LogLine;
use crate::rpc::{Connector, RemoteClient, Request, Response};
use reqwest::blocking::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Control-protocol client for one cluster member
///
/// Connections are pooled by the underlying client and re-established
/// transparently after a failure.
pub struct ControlClient {
    addr: NodeAddress,
    base: String,
    http: Client,
}

impl ControlClient {
    /// Create a client and check that the member answers
    pub fn connect(addr: &NodeAddress, timeout: Duration) -> RpcResult<Self> {
        let http = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let client = Self {
            addr: addr.clone(),
            base: format!("http://{}:{}", addr.host, addr.port),
            http,
        };

        client
            .http
            .get(format!("{}/health", client.base))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| RpcError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        debug!(addr = %client.addr, "Control client connected");
        Ok(client)
    }

    pub fn address(&self) -> &NodeAddress {
        &self.addr
    }

    fn call(&self, request: &Request) -> RpcResult<Response> {
        let transport = |e: reqwest::Error| RpcError::Transport {
            addr: self.addr.to_string(),
            reason: e.to_string(),
        };

        let reply = self
            .http
            .post(format!("{}{}", self.base, request.route()))
            .json(&request.body())
            .send()
            .map_err(transport)?;

        let status = reply.status();
        let body = reply.text().map_err(transport)?;
        match serde_json::from_str::<Response>(&body) {
            Ok(response) => Ok(response),
            Err(_) if !status.is_success() => Err(RpcError::Protocol(format!(
                "{} answered {}: {}",
                request.route(),
                status,
                body.trim()
            ))),
            Err(e) => Err(RpcError::Protocol(e.to_string())),
        }
    }
}

impl RemoteClient for ControlClient {
    fn start_node(&self, port: u16) -> RpcResult<()> {
        self.call(&Request::StartNode { port })?.into_unit()
    }

    fn start_switch(&self) -> RpcResult<()> {
        self.call(&Request::StartSwitch)?.into_unit()
    }

    fn start_client(&self) -> RpcResult<()> {
        self.call(&Request::StartClient)?.into_unit()
    }

    fn start_logging(&self, master_host: &str) -> RpcResult<()> {
        self.call(&Request::StartLogging {
            host: master_host.to_string(),
        })?
        .into_unit()
    }

    fn poll_stats(&self) -> RpcResult<String> {
        self.call(&Request::PollStats)?.into_stats()
    }

    fn receive_log(&self, line: LogLine) -> RpcResult<()> {
        self.call(&Request::ReceiveLog { line })?.into_unit()
    }

    fn shutdown(&self) -> RpcResult<()> {
        self.call(&Request::Shutdown)?.into_unit()
    }
}

/// Connector producing [`ControlClient`]s
#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Connector for HttpConnector {
    fn connect(&self, addr: &NodeAddress) -> RpcResult<Arc<dyn RemoteClient>> {
        Ok(Arc::new(ControlClient::connect(addr, self.timeout)?))
    }
}
