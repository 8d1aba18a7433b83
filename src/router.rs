use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cipher::{CipherBoundary, Message};
use crate::envelope::{Action, Envelope};
use crate::orchestration::*;
use crate::transport::{DatagramHandler, Replier};

pub const PING_ACK: &[u8] = b"ping received";
pub const DISCOVERY_ACK: &[u8] = b"discovery msg received";

/// The server side's dispatcher: it routes a received envelope to the handler for its action,
///  and produces (at most) one reply datagram.
///
/// The orchestration API is bound after construction, and until it is, application-level
///  requests are answered with a `{"Code": 404}` marker. Liveness actions are answered regardless.
pub struct ActionRouter {
    api: RwLock<Option<Arc<dyn OrchestrationApi>>>,
    cipher: Arc<dyn CipherBoundary>,
}

impl Debug for ActionRouter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActionRouter{{has_key:{}}}", self.cipher.has_key())
    }
}

impl ActionRouter {
    pub fn new(cipher: Arc<dyn CipherBoundary>) -> ActionRouter {
        ActionRouter {
            api: Default::default(),
            cipher,
        }
    }

    pub async fn set_orchestration_api(&self, api: Arc<dyn OrchestrationApi>) {
        *self.api.write().await = Some(api);
        info!("orchestration API bound");
    }

    pub async fn is_api_set(&self) -> bool {
        self.api.read().await.is_some()
    }

    /// Produces the reply to a raw datagram, or `None` if the datagram is to be dropped without
    ///  reply - this is the case for undecodable envelopes and unknown actions.
    pub async fn route(&self, buf: &[u8], sender: SocketAddr) -> Option<Vec<u8>> {
        let envelope = match Envelope::decode(buf) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("received a datagram without a valid envelope - discarding: {}", e);
                return None;
            }
        };

        let Some(action) = Action::from_wire_id(&envelope.action) else {
            debug!("received unknown action {:?} - ignoring", envelope.action);
            return None;
        };
        debug!("received {:?} from {:?}", action, sender);

        match action {
            Action::Ping => Some(PING_ACK.to_vec()),
            Action::DiscoveryFromRelay => Some(DISCOVERY_ACK.to_vec()),
            _ => Some(self.on_application_request(action, &envelope.data, sender).await),
        }
    }

    async fn on_application_request(&self, action: Action, data: &[u8], sender: SocketAddr) -> Vec<u8> {
        let Some(api) = self.api.read().await.clone() else {
            warn!("{:?}: orchestration API is not set", action);
            return self.not_configured_reply();
        };
        if !self.cipher.has_key() {
            warn!("{:?}: encryption key is not set", action);
            return self.not_configured_reply();
        }

        let msg = match self.cipher.decrypt(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("{:?}: can not decrypt request: {}", action, e);
                return self.not_configured_reply();
            }
        };

        let response = match action {
            Action::ServiceExecution => Self::on_service_execution(api.as_ref(), msg, sender).await,
            Action::ServiceNotification => Self::on_service_notification(api.as_ref(), &msg).await,
            Action::ScoreQuery => Self::on_score_query(api.as_ref(), &msg).await,
            Action::RequestService => Self::on_request_service(api.as_ref(), &msg).await,
            Action::Ping | Action::DiscoveryFromRelay => unreachable!("liveness actions are answered before decryption"),
        };

        match self.cipher.encrypt(&response) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                warn!("{:?}: can not encrypt response: {}", action, e);
                self.not_configured_reply()
            }
        }
    }

    /// `{"Code": 404}`, encrypted if possible, plain JSON otherwise
    fn not_configured_reply(&self) -> Vec<u8> {
        let msg = message(json!({ "Code": CODE_NOT_FOUND }));
        if self.cipher.has_key() {
            if let Ok(ciphertext) = self.cipher.encrypt(&msg) {
                return ciphertext;
            }
        }
        serde_json::to_vec(&msg).unwrap_or_default()
    }

    async fn on_service_execution(api: &dyn OrchestrationApi, mut app_info: Message, sender: SocketAddr) -> Message {
        if let Err(e) = ServiceRequest::parse(&app_info) {
            debug!("invalid service execution request: {}", e.reason);
            return message(json!({
                "Status": STATUS_FAILED,
                "Code": CODE_INVALID_PARAMETER,
                "Message": INVALID_PARAMETER,
                "ServiceName": e.service_name,
            }));
        }

        app_info.insert("NotificationTargetURL".to_string(), Value::String(sender.ip().to_string()));
        api.execute_app_on_local(app_info).await;

        message(json!({
            "Status": STATUS_STARTED,
            "Code": CODE_OK,
        }))
    }

    async fn on_service_notification(api: &dyn OrchestrationApi, msg: &Message) -> Message {
        let service_id = msg.get("ServiceID").and_then(as_service_id);
        let status = msg.get("Status").and_then(Value::as_str);

        let (Some(service_id), Some(status)) = (service_id, status) else {
            debug!("invalid service notification: {:?}", msg);
            return message(json!({ "Code": CODE_INVALID_PARAMETER, "Message": INVALID_PARAMETER }));
        };

        match api.handle_notification_on_local(service_id, status.to_string()).await {
            Ok(()) => message(json!({ "Code": CODE_OK })),
            Err(e) => {
                warn!("handling notification for service {} failed: {}", service_id, e);
                message(json!({ "Code": CODE_INTERNAL_ERROR }))
            }
        }
    }

    async fn on_score_query(api: &dyn OrchestrationApi, msg: &Message) -> Message {
        let Some(device_id) = msg.get("devID").and_then(Value::as_str) else {
            debug!("invalid score query: {:?}", msg);
            return message(json!({ "Code": CODE_INVALID_PARAMETER, "Message": INVALID_PARAMETER }));
        };

        match api.get_score(device_id.to_string()).await {
            Ok(score) => message(json!({ "ScoreValue": score, "Code": CODE_OK })),
            Err(e) => {
                warn!("getting score for {} failed: {}", device_id, e);
                message(json!({ "Code": CODE_INTERNAL_ERROR }))
            }
        }
    }

    async fn on_request_service(api: &dyn OrchestrationApi, msg: &Message) -> Message {
        let response = match ServiceRequest::parse(msg) {
            Ok(request) => api.request_service(request).await,
            Err(e) => {
                debug!("invalid service request: {}", e.reason);
                ServiceResponse::invalid_parameter(e.service_name)
            }
        };

        match serde_json::to_value(&response) {
            Ok(Value::Object(m)) => m,
            _ => message(json!({ "Message": INVALID_PARAMETER, "ServiceName": response.service_name })),
        }
    }
}

#[async_trait]
impl DatagramHandler for ActionRouter {
    async fn handle_datagram(&self, buf: Bytes, replier: Replier) {
        if let Some(reply) = self.route(&buf, replier.peer_addr()).await {
            replier.reply(&reply).await;
        }
    }
}

/// Service ids are integers, but senders may encode them as floating point numbers
fn as_service_id(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value.as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    })
}

fn message(value: Value) -> Message {
    match value {
        Value::Object(m) => m,
        _ => Message::new(),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use mockall::predicate::eq;
    use rstest::rstest;

    use super::*;
    use crate::cipher::CipherContext;

    const KEY: [u8; 32] = [9u8; 32];

    fn sender() -> SocketAddr {
        "10.1.2.3:40000".parse().unwrap()
    }

    fn keyed_cipher() -> Arc<CipherContext> {
        Arc::new(CipherContext::with_key(&KEY).unwrap())
    }

    fn request(action: Action, cipher: &CipherContext, value: Value) -> Vec<u8> {
        let data = cipher.encrypt(&message(value)).unwrap();
        Envelope::new(action, data).encode().unwrap()
    }

    async fn router_with(api: MockOrchestrationApi) -> (ActionRouter, Arc<CipherContext>) {
        let cipher = keyed_cipher();
        let router = ActionRouter::new(cipher.clone());
        router.set_orchestration_api(Arc::new(api)).await;
        (router, cipher)
    }

    fn execution_request() -> Value {
        json!({"ServiceName": "foo", "ServiceInfo": [{"ExecutionType": "native", "ExecCmd": ["run"]}]})
    }

    #[tokio::test]
    async fn test_service_execution() {
        let mut api = MockOrchestrationApi::new();
        api.expect_execute_app_on_local()
            .withf(|app_info| {
                app_info.get("ServiceName") == Some(&json!("foo"))
                    && app_info.get("NotificationTargetURL") == Some(&json!("10.1.2.3"))
            })
            .times(1)
            .return_const(());
        let (router, cipher) = router_with(api).await;

        let reply = router.route(&request(Action::ServiceExecution, &cipher, execution_request()), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), json!({"Status": "Started", "Code": 0}));
    }

    #[tokio::test]
    async fn test_service_execution_invalid_parameter() {
        let mut api = MockOrchestrationApi::new();
        api.expect_execute_app_on_local().never();
        let (router, cipher) = router_with(api).await;

        let reply = router.route(&request(Action::ServiceExecution, &cipher, json!({"ServiceName": "foo", "ServiceInfo": 3})), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), json!({
            "Status": "Failed",
            "Code": 400,
            "Message": "INVALID_PARAMETER",
            "ServiceName": "foo",
        }));
    }

    #[tokio::test]
    async fn test_api_not_set() {
        let cipher = keyed_cipher();
        let router = ActionRouter::new(cipher.clone());

        let reply = router.route(&request(Action::ServiceExecution, &cipher, execution_request()), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), json!({"Code": 404}));
    }

    #[rstest]
    #[case::execution(Action::ServiceExecution)]
    #[case::notification(Action::ServiceNotification)]
    #[case::score(Action::ScoreQuery)]
    #[case::request_service(Action::RequestService)]
    #[tokio::test]
    async fn test_key_not_set(#[case] action: Action) {
        let mut api = MockOrchestrationApi::new();
        api.expect_execute_app_on_local().never();
        api.expect_handle_notification_on_local().never();
        api.expect_get_score().never();
        api.expect_request_service().never();

        let router = ActionRouter::new(Arc::new(CipherContext::new()));
        router.set_orchestration_api(Arc::new(api)).await;

        let buf = Envelope::new(action, b"not really encrypted".to_vec()).encode().unwrap();
        let reply = router.route(&buf, sender()).await.unwrap();

        assert_eq!(reply, br#"{"Code":404}"#);
    }

    #[tokio::test]
    async fn test_undecryptable_request() {
        let mut api = MockOrchestrationApi::new();
        api.expect_get_score().never();
        let (router, cipher) = router_with(api).await;

        let other_cipher = CipherContext::with_key(&[1u8; 32]).unwrap();
        let reply = router.route(&request(Action::ScoreQuery, &other_cipher, json!({"devID": "x"})), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), json!({"Code": 404}));
    }

    #[rstest]
    #[case::score_value(Ok(0.75), json!({"ScoreValue": 0.75, "Code": 0}))]
    #[case::zero_score(Ok(0.0), json!({"ScoreValue": 0.0, "Code": 0}))]
    #[case::failure(Err(()), json!({"Code": 500}))]
    #[tokio::test]
    async fn test_score_query(#[case] score: Result<f64, ()>, #[case] expected: Value) {
        let mut api = MockOrchestrationApi::new();
        api.expect_get_score()
            .with(eq("dev-1".to_string()))
            .times(1)
            .returning(move |_| score.map_err(|_| anyhow!("no score")));
        let (router, cipher) = router_with(api).await;

        let reply = router.route(&request(Action::ScoreQuery, &cipher, json!({"devID": "dev-1"})), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), expected);
    }

    #[tokio::test]
    async fn test_score_query_without_device_id() {
        let mut api = MockOrchestrationApi::new();
        api.expect_get_score().never();
        let (router, cipher) = router_with(api).await;

        let reply = router.route(&request(Action::ScoreQuery, &cipher, json!({"devId": "dev-1"})), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), json!({"Code": 400, "Message": "INVALID_PARAMETER"}));
    }

    #[rstest]
    #[case::ok(json!({"ServiceID": 17, "Status": "Finished"}), Some(Ok(())), json!({"Code": 0}))]
    #[case::float_id(json!({"ServiceID": 17.0, "Status": "Finished"}), Some(Ok(())), json!({"Code": 0}))]
    #[case::failure(json!({"ServiceID": 17, "Status": "Finished"}), Some(Err(())), json!({"Code": 500}))]
    #[case::missing_status(json!({"ServiceID": 17}), None, json!({"Code": 400, "Message": "INVALID_PARAMETER"}))]
    #[case::fractional_id(json!({"ServiceID": 1.5, "Status": "Finished"}), None, json!({"Code": 400, "Message": "INVALID_PARAMETER"}))]
    #[tokio::test]
    async fn test_service_notification(#[case] request_value: Value, #[case] result: Option<Result<(), ()>>, #[case] expected: Value) {
        let mut api = MockOrchestrationApi::new();
        match result {
            Some(result) => {
                api.expect_handle_notification_on_local()
                    .with(eq(17u64), eq("Finished".to_string()))
                    .times(1)
                    .returning(move |_, _| result.map_err(|_| anyhow!("unknown service")));
            }
            None => {
                api.expect_handle_notification_on_local().never();
            }
        }
        let (router, cipher) = router_with(api).await;

        let reply = router.route(&request(Action::ServiceNotification, &cipher, request_value), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), expected);
    }

    #[tokio::test]
    async fn test_request_service() {
        let mut api = MockOrchestrationApi::new();
        api.expect_request_service()
            .withf(|request| request.service_name == "foo" && request.service_info[0].exec_cmd == vec!["run".to_string()])
            .times(1)
            .returning(|request| ServiceResponse {
                message: "ERROR_NONE".to_string(),
                service_name: request.service_name,
                remote_target_info: TargetInfo {
                    execution_type: "native".to_string(),
                    target: json!("10.0.0.9"),
                },
            });
        let (router, cipher) = router_with(api).await;

        let reply = router.route(&request(Action::RequestService, &cipher, execution_request()), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), json!({
            "Message": "ERROR_NONE",
            "ServiceName": "foo",
            "RemoteTargetInfo": {"ExecutionType": "native", "Target": "10.0.0.9"},
        }));
    }

    #[rstest]
    #[case::no_name(json!({"ServiceInfo": []}), "")]
    #[case::bad_exec_cmd(json!({"ServiceName": "foo", "ServiceInfo": [{"ExecutionType": "native", "ExecCmd": "run"}]}), "foo")]
    #[tokio::test]
    async fn test_request_service_invalid_parameter(#[case] request_value: Value, #[case] expected_name: &str) {
        let mut api = MockOrchestrationApi::new();
        api.expect_request_service().never();
        let (router, cipher) = router_with(api).await;

        let reply = router.route(&request(Action::RequestService, &cipher, request_value), sender()).await.unwrap();

        assert_eq!(Value::Object(cipher.decrypt(&reply).unwrap()), json!({
            "Message": "INVALID_PARAMETER",
            "ServiceName": expected_name,
            "RemoteTargetInfo": {"ExecutionType": "", "Target": null},
        }));
    }

    #[rstest]
    #[case::ping(Action::Ping, PING_ACK)]
    #[case::discovery(Action::DiscoveryFromRelay, DISCOVERY_ACK)]
    #[tokio::test]
    async fn test_liveness_needs_no_configuration(#[case] action: Action, #[case] expected: &[u8]) {
        let router = ActionRouter::new(Arc::new(CipherContext::new()));

        let buf = Envelope::new(action, Vec::new()).encode().unwrap();
        assert_eq!(router.route(&buf, sender()).await.unwrap(), expected);
    }

    #[rstest]
    #[case::unknown_action(br#"{"Action":"APIV1Reboot","Data":""}"#)]
    #[case::wrong_case(br#"{"Action":"apiv1ping","Data":""}"#)]
    #[case::not_an_envelope(b"hello")]
    #[tokio::test]
    async fn test_dropped_without_reply(#[case] buf: &[u8]) {
        let (router, _) = router_with(MockOrchestrationApi::new()).await;
        assert!(router.route(buf, sender()).await.is_none());
    }

    #[rstest]
    #[case::integer(json!(5), Some(5))]
    #[case::integral_float(json!(5.0), Some(5))]
    #[case::fraction(json!(5.5), None)]
    #[case::negative(json!(-1), None)]
    #[case::string(json!("5"), None)]
    fn test_as_service_id(#[case] value: Value, #[case] expected: Option<u64>) {
        assert_eq!(as_service_id(&value), expected);
    }
}
