use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cipher::Message;

pub const CODE_OK: i64 = 0;
pub const CODE_INVALID_PARAMETER: i64 = 400;
pub const CODE_NOT_FOUND: i64 = 404;
pub const CODE_INTERNAL_ERROR: i64 = 500;

pub const STATUS_STARTED: &str = "Started";
pub const STATUS_FAILED: &str = "Failed";

pub const INVALID_PARAMETER: &str = "INVALID_PARAMETER";

/// The orchestration logic of the local device. This is what the router dispatches to - deciding
///  what to execute, tracking service status and computing scores is out of this crate's scope.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrchestrationApi: Send + Sync + 'static {
    /// starts the execution of a service requested by a remote orchestration. The message
    ///  contains a `NotificationTargetURL` with the requesting device's IP address for status
    ///  notifications.
    async fn execute_app_on_local(&self, app_info: Message);

    async fn handle_notification_on_local(&self, service_id: u64, status: String) -> anyhow::Result<()>;

    async fn get_score(&self, device_id: String) -> anyhow::Result<f64>;

    async fn request_service(&self, request: ServiceRequest) -> ServiceResponse;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestServiceInfo {
    #[serde(rename = "ExecutionType")]
    pub execution_type: String,
    #[serde(rename = "ExecCmd")]
    pub exec_cmd: Vec<String>,
}

/// A request to execute a service, as it is sent by service applications (and embedded in
///  service execution requests between orchestrations)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "ServiceInfo")]
    pub service_info: Vec<RequestServiceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    #[serde(rename = "ExecutionType", default)]
    pub execution_type: String,
    #[serde(rename = "Target", default)]
    pub target: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
    #[serde(rename = "RemoteTargetInfo", default)]
    pub remote_target_info: TargetInfo,
}

impl ServiceResponse {
    /// The reply to a malformed service request. `RemoteTargetInfo` is sent as an empty object
    ///  (`{"ExecutionType":"","Target":null}`) rather than `null`, so that clients can always
    ///  deserialize it.
    pub fn invalid_parameter(service_name: String) -> ServiceResponse {
        ServiceResponse {
            message: INVALID_PARAMETER.to_string(),
            service_name,
            remote_target_info: TargetInfo::default(),
        }
    }
}

/// The shape violation found when parsing a [ServiceRequest], carrying whatever was extracted
///  before the violation
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidServiceRequest {
    pub service_name: String,
    pub reason: String,
}

impl ServiceRequest {
    /// Parses the request from a decrypted message, field by field. The first shape violation
    ///  ends parsing, and the service name is reported if it was extracted by then.
    pub fn parse(msg: &Message) -> Result<ServiceRequest, InvalidServiceRequest> {
        let invalid = |service_name: &str, reason: &str| InvalidServiceRequest {
            service_name: service_name.to_string(),
            reason: reason.to_string(),
        };

        let service_name = msg.get("ServiceName")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("", "ServiceName must be a string"))?;

        let raw_infos = msg.get("ServiceInfo")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid(service_name, "ServiceInfo must be a list"))?;

        let mut service_info = Vec::with_capacity(raw_infos.len());
        for raw_info in raw_infos {
            let raw_info = raw_info.as_object()
                .ok_or_else(|| invalid(service_name, "ServiceInfo entries must be objects"))?;

            let execution_type = raw_info.get("ExecutionType")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(service_name, "ExecutionType must be a string"))?;

            let exec_cmd = raw_info.get("ExecCmd")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(service_name, "ExecCmd must be a list"))?
                .iter()
                .map(|cmd| cmd.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| invalid(service_name, "ExecCmd entries must be strings"))?;

            service_info.push(RequestServiceInfo {
                execution_type: execution_type.to_string(),
                exec_cmd,
            });
        }

        Ok(ServiceRequest {
            service_name: service_name.to_string(),
            service_info,
        })
    }
}
