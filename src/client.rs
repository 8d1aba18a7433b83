use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::cipher::{CipherBoundary, Message};
use crate::config::ClientConfig;
use crate::envelope::{Action, Envelope};
use crate::error::{DispatchError, DispatchResult};
use crate::orchestration::{ServiceRequest, ServiceResponse, CODE_NOT_FOUND, CODE_OK, STATUS_FAILED};
use crate::transport::send_request;

/// Client for the requests that an orchestration sends to its peers (and that local service
///  applications send to their orchestration).
///
/// Every call is a single round trip on a socket of its own, without retry. A call fails fast
///  with [DispatchError::KeyNotConfigured] if there is no key, without touching the network.
pub struct RpcClient {
    config: ClientConfig,
    cipher: Arc<dyn CipherBoundary>,
}

impl RpcClient {
    pub fn new(config: ClientConfig, cipher: Arc<dyn CipherBoundary>) -> RpcClient {
        RpcClient {
            config,
            cipher,
        }
    }

    /// Asks the orchestration at `target` to execute a service. A `"Failed"` status in the reply
    ///  is reported as [DispatchError::RemoteOperationFailed], a peer without orchestration API
    ///  or key as [DispatchError::NotConfigured].
    #[instrument(skip(self, app_info))]
    pub async fn execute_remote(&self, app_info: &Message, target: &str) -> DispatchResult<()> {
        let reply = self.round_trip(Action::ServiceExecution, app_info, target).await?;
        Self::check_code(&reply, target)?;

        if reply.get("Status").and_then(Value::as_str) == Some(STATUS_FAILED) {
            return Err(DispatchError::RemoteOperationFailed(format!("execution failed on {}: {:?}", target, reply)));
        }
        Ok(())
    }

    #[instrument(skip(self, notification))]
    pub async fn notify_status_remote(&self, notification: &Message, target: &str) -> DispatchResult<()> {
        let reply = self.round_trip(Action::ServiceNotification, notification, target).await?;
        Self::check_code(&reply, target)
    }

    /// Queries the score of the device at `target`.
    ///
    /// NB: A score of exactly `0.0` can not be told apart from a failure, and it is reported as
    ///      [DispatchError::RemoteOperationFailed]
    #[instrument(skip(self))]
    pub async fn get_score_remote(&self, device_id: &str, target: &str) -> DispatchResult<f64> {
        let request = json_message(json!({ "devID": device_id }));
        let reply = self.round_trip(Action::ScoreQuery, &request, target).await?;
        Self::check_code(&reply, target)?;

        match reply.get("ScoreValue").and_then(Value::as_f64) {
            Some(score) if score != 0.0 => Ok(score),
            _ => Err(DispatchError::RemoteOperationFailed(format!("no score from {}: {:?}", target, reply))),
        }
    }

    /// Sends a service application's request to its orchestration
    #[instrument(skip(self, request), fields(service_name = %request.service_name))]
    pub async fn request_service(&self, request: &ServiceRequest, target: &str) -> DispatchResult<ServiceResponse> {
        let request = match serde_json::to_value(request) {
            Ok(Value::Object(m)) => m,
            _ => return Err(DispatchError::InvalidParameter(format!("can not serialize {:?}", request))),
        };
        let reply = self.round_trip(Action::RequestService, &request, target).await?;
        Self::check_code(&reply, target)?;

        serde_json::from_value(Value::Object(reply))
            .map_err(|e| DispatchError::RemoteOperationFailed(format!("unexpected reply from {}: {}", target, e)))
    }

    async fn round_trip(&self, action: Action, msg: &Message, target: &str) -> DispatchResult<Message> {
        if !self.cipher.has_key() {
            return Err(DispatchError::KeyNotConfigured);
        }

        let data = self.cipher.encrypt(msg)
            .map_err(|e| DispatchError::Encryption(Box::new(e)))?;

        let buf = Envelope::new(action, data).encode()?;

        let endpoint = self.endpoint(target);
        debug!("sending {:?} to {}", action, endpoint);
        let reply = send_request(&endpoint, &buf, &self.config.transport).await?;

        let reply = self.cipher.decrypt(&reply)
            .map_err(|e| DispatchError::Decryption(Box::new(e)))?;
        debug!("reply from {}: {:?}", endpoint, reply);
        Ok(reply)
    }

    /// Targets may be full socket addresses, bare IP addresses or host names; the configured port
    ///  is added if there is none.
    fn endpoint(&self, target: &str) -> String {
        if target.parse::<SocketAddr>().is_ok() {
            return target.to_string();
        }
        if let Ok(ip) = target.parse::<IpAddr>() {
            return SocketAddr::new(ip, self.config.port).to_string();
        }
        if target.contains(':') {
            return target.to_string();
        }
        format!("{}:{}", target, self.config.port)
    }

    fn check_code(reply: &Message, target: &str) -> DispatchResult<()> {
        match reply.get("Code").and_then(Value::as_i64) {
            None => Ok(()),
            Some(CODE_OK) => Ok(()),
            Some(CODE_NOT_FOUND) => {
                debug!("{} has no orchestration API or no key", target);
                Err(DispatchError::NotConfigured)
            }
            Some(code) => Err(DispatchError::RemoteOperationFailed(format!("{} replied with code {}", target, code))),
        }
    }
}

fn json_message(value: Value) -> Message {
    match value {
        Value::Object(m) => m,
        _ => Message::new(),
    }
}
