// ============================================================================
// Wire Format - protobuf messages and gRPC method paths
// ============================================================================
//
// Methods are named at runtime from event types and command names, so the
// services are routed by hand instead of generated from a .proto file.
//
//   /event_relay.EventHub/{event_type}.sub   SubscribeRequest -> stream EventFrame
//   /event_relay.EventHub/{event_type}.pub   EventFrame -> Ack (broker mode)
//   /event_relay.Commands/{command}          CommandFrame -> CommandFrame
//
// ============================================================================

pub const HUB_SERVICE: &str = "event_relay.EventHub";
pub const COMMAND_SERVICE: &str = "event_relay.Commands";

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeRequest {
    #[prost(string, tag = "1")]
    pub subscriber_id: String,
}

/// One serialized event
#[derive(Clone, PartialEq, prost::Message)]
pub struct EventFrame {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ack {}

/// JSON-encoded command or command result
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandFrame {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HubMethod<'a> {
    Subscribe(&'a str),
    Publish(&'a str),
}

pub fn subscribe_path(event_type: &str) -> String {
    format!("/{HUB_SERVICE}/{event_type}.sub")
}

pub fn publish_path(event_type: &str) -> String {
    format!("/{HUB_SERVICE}/{event_type}.pub")
}

pub fn command_path(command: &str) -> String {
    format!("/{COMMAND_SERVICE}/{command}")
}

pub fn parse_hub_path(path: &str) -> Option<HubMethod<'_>> {
    let method = path.strip_prefix('/')?.strip_prefix(HUB_SERVICE)?.strip_prefix('/')?;

    let parsed = if let Some(event_type) = method.strip_suffix(".sub") {
        HubMethod::Subscribe(event_type)
    } else if let Some(event_type) = method.strip_suffix(".pub") {
        HubMethod::Publish(event_type)
    } else {
        return None;
    };

    match parsed {
        HubMethod::Subscribe("") | HubMethod::Publish("") => None,
        other => Some(other),
    }
}

pub fn parse_command_path(path: &str) -> Option<&str> {
    path.strip_prefix('/')?
        .strip_prefix(COMMAND_SERVICE)?
        .strip_prefix('/')
        .filter(|name| !name.is_empty())
}
