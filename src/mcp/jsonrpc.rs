use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The literal `"2.0"` protocol tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		"2.0".serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s: String = Deserialize::deserialize(deserializer)?;
		if s == "2.0" {
			Ok(JsonRpcVersion2_0)
		} else {
			Err(serde::de::Error::custom("expect jsonrpc version \"2.0\""))
		}
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum RequestId {
	Number(u32),
	String(Arc<str>),
}

impl Display for RequestId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RequestId::Number(n) => Display::fmt(n, f),
			RequestId::String(s) => Display::fmt(s, f),
		}
	}
}

impl Serialize for RequestId {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			RequestId::Number(n) => n.serialize(serializer),
			RequestId::String(s) => s.serialize(serializer),
		}
	}
}

impl<'de> Deserialize<'de> for RequestId {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value: Value = Deserialize::deserialize(deserializer)?;
		match value {
			Value::Number(n) => Ok(RequestId::Number(
				n.as_u64()
					.ok_or(serde::de::Error::custom("expect an integer id"))? as u32,
			)),
			Value::String(s) => Ok(RequestId::String(s.into())),
			_ => Err(serde::de::Error::custom("expect number or string id")),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
	pub jsonrpc: JsonRpcVersion2_0,
	pub id: RequestId,
	pub method: String,
	#[serde(skip_serializing_if = "Value::is_null", default)]
	pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
	pub code: i64,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
	pub jsonrpc: JsonRpcVersion2_0,
	pub id: RequestId,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub error: Option<JsonRpcError>,
}

impl JsonRpcRequest {
	pub fn new(id: u32, method: &str, params: Value) -> JsonRpcRequest {
		JsonRpcRequest {
			jsonrpc: JsonRpcVersion2_0,
			id: RequestId::Number(id),
			method: method.to_string(),
			params,
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn request_wire_shape() {
		let req = JsonRpcRequest::new(7, "tools/list", Value::Null);
		let v = serde_json::to_value(&req).unwrap();
		assert_eq!(v, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));
	}

	#[test]
	fn response_parses_result_or_error() {
		let ok: JsonRpcResponse =
			serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
		assert!(ok.result.is_some());
		assert!(ok.error.is_none());

		let err: JsonRpcResponse = serde_json::from_str(
			r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-32601,"message":"no such method"}}"#,
		)
		.unwrap();
		assert_eq!(err.error.unwrap().code, -32601);
		assert_eq!(err.id, RequestId::String("abc".into()));
	}

	#[test]
	fn version_is_validated() {
		assert!(serde_json::from_str::<JsonRpcResponse>(
			r#"{"jsonrpc":"1.0","id":1,"result":null}"#
		)
		.is_err());
	}
}
