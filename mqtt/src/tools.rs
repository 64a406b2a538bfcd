//! Tool dispatch.
//!
//! Routes named tool invocations with JSON parameters to the
//! [`Orchestrator`] and renders results as JSON. Also serves the read-only
//! discovery resources describing the configured topic rules.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::acl::{RuleExamples, RuleInfo, WILDCARD_LEGEND};
use crate::config::MqttConfig;
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::types::{Message, QoS};

/// Names of all tools, in the order they are advertised.
pub const TOOL_NAMES: [&str; 4] = ["mqtt_publish", "mqtt_subscribe", "mqtt_read", "mqtt_query"];

/// Names of all discovery resources.
pub const RESOURCE_NAMES: [&str; 2] = ["topics/allowed", "topics/examples"];

/// URI scheme resources may be addressed with.
pub const RESOURCE_SCHEME: &str = "mcpmqtt://";

/// A callable tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Publish,
    Subscribe,
    Read,
    Query,
}

impl Tool {
    pub fn name(self) -> &'static str {
        match self {
            Tool::Publish => TOOL_NAMES[0],
            Tool::Subscribe => TOOL_NAMES[1],
            Tool::Read => TOOL_NAMES[2],
            Tool::Query => TOOL_NAMES[3],
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tool {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mqtt_publish" => Ok(Tool::Publish),
            "mqtt_subscribe" => Ok(Tool::Subscribe),
            "mqtt_read" => Ok(Tool::Read),
            "mqtt_query" => Ok(Tool::Query),
            _ => Err(Error::InvalidArgument(format!("unknown tool '{s}'"))),
        }
    }
}

fn default_subscribe_timeout() -> f64 {
    30.0
}

fn default_read_timeout() -> f64 {
    5.0
}

fn default_max_messages() -> usize {
    1
}

/// Parameters of `mqtt_publish`.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishParams {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

/// Parameters of `mqtt_subscribe`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeParams {
    pub topic: String,
    #[serde(default = "default_subscribe_timeout")]
    pub timeout: f64,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

/// Parameters of `mqtt_read`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadParams {
    #[serde(alias = "response_topic")]
    pub topic: String,
    #[serde(default = "default_read_timeout")]
    pub timeout: f64,
}

/// Parameters of `mqtt_query`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryParams {
    pub request_topic: String,
    pub response_topic: String,
    pub payload: String,
    #[serde(default = "default_read_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub qos: QoS,
}

/// Payload encoding in a rendered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

/// JSON rendering of a received [`Message`].
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub topic: String,
    pub payload: String,
    pub payload_encoding: PayloadEncoding,
    pub qos: QoS,
    pub retained: bool,
    pub received_at: String,
}

impl From<&Message> for MessageView {
    fn from(msg: &Message) -> Self {
        let (payload, payload_encoding) = match msg.payload_str() {
            Some(text) => (text.to_string(), PayloadEncoding::Utf8),
            None => (BASE64.encode(&msg.payload), PayloadEncoding::Base64),
        };
        Self {
            topic: msg.topic.clone(),
            payload,
            payload_encoding,
            qos: msg.qos,
            retained: msg.retain,
            received_at: msg.received_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PublishResult {
    topic: String,
    qos: QoS,
    acknowledged: bool,
    packet_id: u16,
    success: bool,
}

#[derive(Debug, Serialize)]
struct SubscribeResult {
    topic: String,
    messages_received: usize,
    messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
struct ReadResult {
    response_topic: String,
    response_payload: String,
    message: MessageView,
    success: bool,
}

#[derive(Debug, Serialize)]
struct QueryResult {
    request_topic: String,
    response_topic: String,
    request_payload: String,
    response_payload: String,
    message: MessageView,
    success: bool,
}

/// Broker details exposed by the `topics/allowed` resource.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerInfo {
    pub host: String,
    pub port: u16,
    pub requires_auth: bool,
}

impl From<&MqttConfig> for BrokerInfo {
    fn from(config: &MqttConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            requires_auth: config.requires_auth(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AllowedTopics {
    topics: Vec<RuleInfo>,
    mqtt_info: BrokerInfo,
}

#[derive(Debug, Serialize)]
struct TopicExamples {
    examples: Vec<RuleExamples>,
    wildcard_info: serde_json::Map<String, Value>,
}

/// The tool surface: dispatches tools and serves resources.
#[derive(Debug, Clone)]
pub struct Toolbox {
    orchestrator: Orchestrator,
    broker: BrokerInfo,
}

impl Toolbox {
    pub fn new(orchestrator: Orchestrator, broker: BrokerInfo) -> Self {
        Self {
            orchestrator,
            broker,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run tool `name` with JSON `params`.
    ///
    /// `cancel` aborts an in-flight subscribe, read or query.
    pub async fn call(&self, name: &str, params: &Value, cancel: &CancellationToken) -> Result<Value> {
        let tool: Tool = name.parse()?;
        match tool {
            Tool::Publish => {
                let p: PublishParams = parse_params(tool, params)?;
                let ack = self
                    .orchestrator
                    .publish(&p.topic, Bytes::from(p.payload), p.qos, p.retain)
                    .await?;
                to_value(PublishResult {
                    topic: ack.topic,
                    qos: ack.qos,
                    acknowledged: ack.acknowledged,
                    packet_id: ack.packet_id,
                    success: true,
                })
            }
            Tool::Subscribe => {
                let p: SubscribeParams = parse_params(tool, params)?;
                let messages = self
                    .orchestrator
                    .subscribe(&p.topic, seconds(p.timeout)?, p.max_messages, cancel)
                    .await?;
                to_value(SubscribeResult {
                    topic: p.topic,
                    messages_received: messages.len(),
                    messages: messages.iter().map(MessageView::from).collect(),
                })
            }
            Tool::Read => {
                let p: ReadParams = parse_params(tool, params)?;
                let msg = self
                    .orchestrator
                    .read(&p.topic, seconds(p.timeout)?, cancel)
                    .await?;
                let message = MessageView::from(&msg);
                to_value(ReadResult {
                    response_topic: p.topic,
                    response_payload: message.payload.clone(),
                    message,
                    success: true,
                })
            }
            Tool::Query => {
                let p: QueryParams = parse_params(tool, params)?;
                let msg = self
                    .orchestrator
                    .query(
                        &p.request_topic,
                        &p.response_topic,
                        Bytes::from(p.payload.clone()),
                        p.qos,
                        seconds(p.timeout)?,
                        cancel,
                    )
                    .await?;
                let message = MessageView::from(&msg);
                to_value(QueryResult {
                    request_topic: p.request_topic,
                    response_topic: p.response_topic,
                    request_payload: p.payload,
                    response_payload: message.payload.clone(),
                    message,
                    success: true,
                })
            }
        }
    }

    /// Read discovery resource `name`, with or without the `mcpmqtt://` prefix.
    pub fn read_resource(&self, name: &str) -> Result<Value> {
        let registry = self.orchestrator.registry();
        match name.strip_prefix(RESOURCE_SCHEME).unwrap_or(name) {
            "topics/allowed" => to_value(AllowedTopics {
                topics: registry.describe(),
                mqtt_info: self.broker.clone(),
            }),
            "topics/examples" => to_value(TopicExamples {
                examples: registry.examples(),
                wildcard_info: WILDCARD_LEGEND
                    .iter()
                    .map(|(wildcard, meaning)| (wildcard.to_string(), json!(meaning)))
                    .collect(),
            }),
            other => Err(Error::InvalidArgument(format!("unknown resource '{other}'"))),
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(tool: Tool, params: &Value) -> Result<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| Error::InvalidArgument(format!("invalid {tool} params: {e}")))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::InvalidArgument(format!("timeout must be a non-negative number of seconds, got {secs}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::acl::{Permission, PermissionRegistry, TopicRule};
    use crate::mock::MockConnection;

    fn toolbox() -> (Toolbox, Arc<MockConnection>) {
        let registry = PermissionRegistry::new(vec![
            TopicRule::new("sensors/+/temperature", [Permission::Read, Permission::Write])
                .with_description("Temperature sensor data from any location"),
            TopicRule::new("actuators/#", [Permission::Write]),
            TopicRule::new("commands/+/request", [Permission::Write]),
            TopicRule::new("commands/+/response", [Permission::Read]),
        ])
        .unwrap();

        let (mock, inbound) = MockConnection::connected();
        let orchestrator = Orchestrator::new(Arc::new(registry), mock.clone());
        orchestrator.spawn_dispatcher(inbound);

        let broker = BrokerInfo::from(&MqttConfig::default());
        (Toolbox::new(orchestrator, broker), mock)
    }

    #[test]
    fn test_tool_names_round_trip() {
        for name in TOOL_NAMES {
            let tool: Tool = name.parse().unwrap();
            assert_eq!(tool.name(), name);
        }
        assert!("mqtt_delete".parse::<Tool>().is_err());
    }

    #[test]
    fn test_param_defaults() {
        let p: SubscribeParams = serde_json::from_value(json!({"topic": "a/b"})).unwrap();
        assert_eq!(p.timeout, 30.0);
        assert_eq!(p.max_messages, 1);

        let p: ReadParams = serde_json::from_value(json!({"response_topic": "a/b"})).unwrap();
        assert_eq!(p.topic, "a/b");
        assert_eq!(p.timeout, 5.0);

        let p: QueryParams = serde_json::from_value(
            json!({"request_topic": "a", "response_topic": "b", "payload": "x"}),
        )
        .unwrap();
        assert_eq!(p.timeout, 5.0);
        assert_eq!(p.qos, QoS::AtMostOnce);

        let p: PublishParams = serde_json::from_value(json!({"topic": "a", "payload": "x", "qos": 2})).unwrap();
        assert_eq!(p.qos, QoS::ExactlyOnce);
        assert!(!p.retain);
    }

    #[test]
    fn test_message_view_encoding() {
        let text = MessageView::from(&Message::new("a/b", "22.5"));
        assert_eq!(text.payload, "22.5");
        assert_eq!(text.payload_encoding, PayloadEncoding::Utf8);

        let binary = MessageView::from(&Message::new("a/b", vec![0xff, 0x00, 0x10]));
        assert_eq!(binary.payload, "/wAQ");
        assert_eq!(binary.payload_encoding, PayloadEncoding::Base64);

        let value = serde_json::to_value(&binary).unwrap();
        assert_eq!(value["payload_encoding"], "base64");
        assert_eq!(value["qos"], 0);
        assert_eq!(value["retained"], false);
    }

    #[test]
    fn test_seconds() {
        assert_eq!(seconds(1.5).unwrap(), Duration::from_millis(1500));
        assert_eq!(seconds(0.0).unwrap(), Duration::ZERO);
        assert!(seconds(-1.0).is_err());
        assert!(seconds(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn test_call_publish() {
        let (toolbox, mock) = toolbox();
        let result = toolbox
            .call(
                "mqtt_publish",
                &json!({"topic": "actuators/lights/room1", "payload": "on", "qos": 1}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result["topic"], "actuators/lights/room1");
        assert_eq!(result["acknowledged"], true);
        assert_eq!(result["success"], true);
        assert_eq!(mock.events(), ["publish actuators/lights/room1"]);
    }

    #[tokio::test]
    async fn test_call_errors() {
        let (toolbox, _mock) = toolbox();
        let cancel = CancellationToken::new();

        let err = toolbox.call("mqtt_nope", &json!({}), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let err = toolbox.call("mqtt_publish", &json!({"topic": "x"}), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let err = toolbox
            .call("mqtt_publish", &json!({"topic": "other", "payload": "x"}), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");

        let err = toolbox
            .call("mqtt_publish", &json!({"topic": "actuators/a", "payload": "x", "qos": 3}), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let err = toolbox
            .call("mqtt_read", &json!({"topic": "sensors/+/temperature", "timeout": -1}), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_subscribe_empty() {
        let (toolbox, _mock) = toolbox();
        let result = toolbox
            .call(
                "mqtt_subscribe",
                &json!({"topic": "sensors/+/temperature", "timeout": 1, "max_messages": 3}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result["messages_received"], 0);
        assert_eq!(result["messages"], json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_read_timeout_is_error() {
        let (toolbox, _mock) = toolbox();
        let err = toolbox
            .call("mqtt_read", &json!({"topic": "sensors/+/temperature", "timeout": 2}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn test_call_query() {
        let (toolbox, mock) = toolbox();
        mock.respond("commands/+/request", "commands/room1/response", "ok");

        let result = toolbox
            .call(
                "mqtt_query",
                &json!({
                    "request_topic": "commands/room1/request",
                    "response_topic": "commands/room1/response",
                    "payload": "get_status",
                }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result["request_payload"], "get_status");
        assert_eq!(result["response_payload"], "ok");
        assert_eq!(result["message"]["topic"], "commands/room1/response");
        assert_eq!(result["success"], true);
    }

    #[tokio::test]
    async fn test_resources() {
        let (toolbox, _mock) = toolbox();

        let allowed = toolbox.read_resource("topics/allowed").unwrap();
        assert_eq!(allowed["topics"].as_array().unwrap().len(), 4);
        assert_eq!(allowed["topics"][0]["permissions"], json!(["read", "write"]));
        assert_eq!(allowed["topics"][1]["description"], "No description provided");
        assert_eq!(allowed["mqtt_info"]["host"], "localhost");
        assert_eq!(allowed["mqtt_info"]["port"], 1883);
        assert_eq!(allowed["mqtt_info"]["requires_auth"], false);

        let examples = toolbox.read_resource("mcpmqtt://topics/examples").unwrap();
        assert_eq!(
            examples["examples"][0]["examples"][0]["topic"],
            "sensors/example/temperature"
        );
        assert_eq!(
            examples["examples"][1]["examples"][0]["topic"],
            "actuators/subtopic/data"
        );
        assert!(examples["wildcard_info"]["+"].is_string());
        assert!(examples["wildcard_info"]["#"].is_string());

        assert!(toolbox.read_resource("topics/secret").is_err());
    }
}
