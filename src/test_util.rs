use std::net::IpAddr;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::cipher::{CipherBoundary, Message};
use crate::error::{DispatchError, DispatchResult};
use crate::orchestration::{OrchestrationApi, ServiceRequest, ServiceResponse};

/// a fixed 32 byte key for tests
pub fn test_key() -> [u8; 32] {
    let mut result = [0u8; 32];
    for (i, b) in result.iter_mut().enumerate() {
        *b = i as u8 * 7 + 3;
    }
    result
}

/// A cipher that claims to have a key but fails every operation
pub struct FailingCipher;

impl CipherBoundary for FailingCipher {
    fn has_key(&self) -> bool {
        true
    }

    fn encrypt(&self, _message: &Message) -> DispatchResult<Vec<u8>> {
        Err(DispatchError::Crypto("encryption is broken".to_string()))
    }

    fn decrypt(&self, _ciphertext: &[u8]) -> DispatchResult<Message> {
        Err(DispatchError::Crypto("decryption is broken".to_string()))
    }
}

/// An orchestration that records every call it receives, and answers score queries and service
///  requests with configurable values
#[derive(Default)]
pub struct RecordingOrchestration {
    score: RwLock<Option<f64>>,
    response: RwLock<ServiceResponse>,
    executions: RwLock<Vec<Message>>,
    notifications: RwLock<Vec<(u64, String)>>,
    score_queries: RwLock<Vec<String>>,
    service_requests: RwLock<Vec<ServiceRequest>>,
}

impl RecordingOrchestration {
    pub fn new() -> RecordingOrchestration {
        Default::default()
    }

    /// `None` makes score queries fail
    pub async fn set_score(&self, score: Option<f64>) {
        *self.score.write().await = score;
    }

    pub async fn set_response(&self, response: ServiceResponse) {
        *self.response.write().await = response;
    }

    pub async fn executions(&self) -> Vec<Message> {
        self.executions.read().await.clone()
    }

    pub async fn notifications(&self) -> Vec<(u64, String)> {
        self.notifications.read().await.clone()
    }

    pub async fn score_queries(&self) -> Vec<String> {
        self.score_queries.read().await.clone()
    }

    pub async fn service_requests(&self) -> Vec<ServiceRequest> {
        self.service_requests.read().await.clone()
    }

    /// the `NotificationTargetURL` of the single recorded execution
    pub async fn notification_target(&self) -> Option<IpAddr> {
        let executions = self.executions.read().await;
        match executions.as_slice() {
            [app_info] => app_info.get("NotificationTargetURL")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
            _ => None,
        }
    }
}

#[async_trait]
impl OrchestrationApi for RecordingOrchestration {
    async fn execute_app_on_local(&self, app_info: Message) {
        self.executions.write().await.push(app_info);
    }

    async fn handle_notification_on_local(&self, service_id: u64, status: String) -> anyhow::Result<()> {
        self.notifications.write().await.push((service_id, status));
        Ok(())
    }

    async fn get_score(&self, device_id: String) -> anyhow::Result<f64> {
        self.score_queries.write().await.push(device_id.clone());
        match *self.score.read().await {
            Some(score) => Ok(score),
            None => Err(anyhow!("no score for {}", device_id)),
        }
    }

    async fn request_service(&self, request: ServiceRequest) -> ServiceResponse {
        let mut response = self.response.read().await.clone();
        if response.service_name.is_empty() {
            response.service_name = request.service_name.clone();
        }
        self.service_requests.write().await.push(request);
        response
    }
}
