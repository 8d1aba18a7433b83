use std::fmt::{Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};

/// The actions that the router dispatches on. The wire identifiers are exact and case sensitive.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Action {
    /// liveness probe from a remote orchestration
    Ping,
    /// discovery message forwarded by a relay
    DiscoveryFromRelay,
    /// service execution request from a remote orchestration
    ServiceExecution,
    /// service status notification from a remote orchestration
    ServiceNotification,
    /// scoring request from a remote orchestration
    ScoreQuery,
    /// service request from a local service application
    RequestService,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Ping,
        Action::DiscoveryFromRelay,
        Action::ServiceExecution,
        Action::ServiceNotification,
        Action::ScoreQuery,
        Action::RequestService,
    ];

    pub fn wire_id(&self) -> &'static str {
        match self {
            Action::Ping => "APIV1Ping",
            Action::DiscoveryFromRelay => "APIV1DiscoveryFromRelay",
            Action::ServiceExecution => "APIV1ServicemgrServicesPost",
            Action::ServiceNotification => "APIV1ServicemgrServicesNotificationServiceIDPost",
            Action::ScoreQuery => "APIV1ScoringmgrScoreLibnameGet",
            Action::RequestService => "APIV1RequestServicePost",
        }
    }

    pub fn from_wire_id(id: &str) -> Option<Action> {
        Self::ALL.into_iter()
            .find(|a| a.wire_id() == id)
    }
}

/// The wire envelope, one per datagram. `data` is opaque at this level - it is ciphertext for
///  application-level actions, and empty for liveness probes.
///
/// On the wire, this is a JSON object with the `data` field base64 encoded:
///
/// ```ascii
/// {"Action":"APIV1Ping","Data":""}
/// ```
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Data", with = "data_base64", default)]
    pub data: Vec<u8>,
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope{{action:{:?}, data:{} bytes}}", self.action, self.data.len())
    }
}

impl Envelope {
    pub fn new(action: Action, data: Vec<u8>) -> Envelope {
        Envelope {
            action: action.wire_id().to_string(),
            data,
        }
    }

    pub fn encode(&self) -> DispatchResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DispatchError::MalformedEnvelope(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> DispatchResult<Envelope> {
        serde_json::from_slice(buf)
            .map_err(|e| DispatchError::MalformedEnvelope(e.to_string()))
    }
}

/// `null` and a missing field are both read as empty data
mod data_base64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(s) => BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::ping(Action::Ping, "APIV1Ping")]
    #[case::discovery(Action::DiscoveryFromRelay, "APIV1DiscoveryFromRelay")]
    #[case::execution(Action::ServiceExecution, "APIV1ServicemgrServicesPost")]
    #[case::notification(Action::ServiceNotification, "APIV1ServicemgrServicesNotificationServiceIDPost")]
    #[case::score(Action::ScoreQuery, "APIV1ScoringmgrScoreLibnameGet")]
    #[case::request_service(Action::RequestService, "APIV1RequestServicePost")]
    fn test_wire_ids(#[case] action: Action, #[case] wire_id: &str) {
        assert_eq!(action.wire_id(), wire_id);
        assert_eq!(Action::from_wire_id(wire_id), Some(action));
    }

    #[rstest]
    #[case::lower_case("apiv1ping")]
    #[case::empty("")]
    #[case::unknown("APIV1Shutdown")]
    fn test_unknown_wire_id(#[case] wire_id: &str) {
        assert_eq!(Action::from_wire_id(wire_id), None);
    }

    #[test]
    fn test_encode() {
        let envelope = Envelope::new(Action::ScoreQuery, b"abc".to_vec());
        let encoded = envelope.encode().unwrap();
        assert_eq!(encoded, br#"{"Action":"APIV1ScoringmgrScoreLibnameGet","Data":"YWJj"}"#);
    }

    #[test]
    fn test_encode_empty_data() {
        let encoded = Envelope::new(Action::Ping, Vec::new()).encode().unwrap();
        assert_eq!(encoded, br#"{"Action":"APIV1Ping","Data":""}"#);
    }

    #[rstest]
    #[case::regular(br#"{"Action":"APIV1Ping","Data":"YWJj"}"#, "APIV1Ping", b"abc")]
    #[case::null_data(br#"{"Action":"APIV1Ping","Data":null}"#, "APIV1Ping", b"")]
    #[case::missing_data(br#"{"Action":"APIV1Ping"}"#, "APIV1Ping", b"")]
    #[case::unknown_action_is_not_validated(br#"{"Action":"whatever","Data":""}"#, "whatever", b"")]
    #[case::additional_fields(br#"{"Action":"x","Data":"","Other":1}"#, "x", b"")]
    fn test_decode(#[case] buf: &[u8], #[case] action: &str, #[case] data: &[u8]) {
        let envelope = Envelope::decode(buf).unwrap();
        assert_eq!(envelope.action, action);
        assert_eq!(envelope.data, data);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::not_json(b"ping received")]
    #[case::missing_action(br#"{"Data":""}"#)]
    #[case::action_not_a_string(br#"{"Action":5,"Data":""}"#)]
    #[case::data_not_base64(br#"{"Action":"APIV1Ping","Data":"%%%"}"#)]
    #[case::array(b"[1,2]")]
    #[case::truncated(br#"{"Action":"APIV1Pi"#)]
    fn test_decode_malformed(#[case] buf: &[u8]) {
        assert!(matches!(Envelope::decode(buf), Err(DispatchError::MalformedEnvelope(_))));
    }
}
