//! The `_proxy/successor/*` envelope protocol and the proxy handshake.
//!
//! With at least one proxy in the pipeline, forward-direction traffic is
//! not delivered to proxies raw: each request or notification travels
//! inside an envelope naming the wrapped method, so that a proxy only
//! ever reasons about its immediate successor. Proxies opt into this
//! contract during `initialize`: the conductor offers it by setting
//! `params._meta.proxy = true`, and the proxy accepts by echoing
//! `result._meta.proxy = true`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::{ErrorObject, Id, Request};

pub const SUCCESSOR_REQUEST: &str = "_proxy/successor/request";
pub const SUCCESSOR_NOTIFICATION: &str = "_proxy/successor/notification";

/// Payload carried by a successor envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessorEnvelope {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

pub fn is_envelope(method: &str) -> bool {
    method == SUCCESSOR_REQUEST || method == SUCCESSOR_NOTIFICATION
}

fn envelope_params(method: String, params: Option<Value>) -> Value {
    let mut object = serde_json::Map::new();
    object.insert("method".to_string(), Value::String(method));
    if let Some(params) = params {
        object.insert("params".to_string(), params);
    }
    Value::Object(object)
}

/// Wraps a request for delivery to a proxy.
pub fn wrap_request(method: String, params: Option<Value>, id: impl Into<Id>) -> Request {
    Request::new(SUCCESSOR_REQUEST, Some(envelope_params(method, params)), id)
}

/// Wraps a notification for delivery to a proxy.
pub fn wrap_notification(method: String, params: Option<Value>) -> Request {
    Request::notification(
        SUCCESSOR_NOTIFICATION,
        Some(envelope_params(method, params)),
    )
}

/// Recovers the wrapped method and params from envelope params.
pub fn unwrap_envelope(params: Option<Value>) -> Result<SuccessorEnvelope, ErrorObject> {
    let params = params
        .ok_or_else(|| ErrorObject::invalid_params("successor envelope is missing params"))?;
    serde_json::from_value(params)
        .map_err(|err| ErrorObject::invalid_params(format!("malformed successor envelope: {err}")))
}

/// Returns initialize params with `_meta.proxy = true` inserted,
/// leaving every other branch untouched. Non-object params are returned
/// as-is; there is nowhere to attach the offer.
pub fn offer_proxy(params: Option<Value>) -> Option<Value> {
    let mut object = match params {
        Some(Value::Object(object)) => object,
        None => serde_json::Map::new(),
        Some(other) => return Some(other),
    };
    let meta = object
        .entry("_meta")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("proxy".to_string(), Value::Bool(true));
    }
    Some(Value::Object(object))
}

/// Whether an initialize result acknowledges the proxy contract.
pub fn acknowledged_proxy(result: &Value) -> bool {
    result
        .get("_meta")
        .and_then(|meta| meta.get("proxy"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
