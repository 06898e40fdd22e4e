use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context as _, anyhow};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::client::{BodyPara, HttpClient};
use crate::config::McpServiceConfig;
use crate::http::Method;
use crate::mcp::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// One tool as reported by an upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none", default, alias = "input_schema")]
	pub input_schema: Option<Value>,
}

/// JSON-RPC-over-HTTP client for one managed MCP service.
pub struct McpClient {
	pub name: String,
	endpoint: String,
	http: HttpClient,
	next_id: AtomicU32,
}

impl McpClient {
	pub fn new(name: &str, endpoint: &str, http: HttpClient) -> McpClient {
		McpClient {
			name: name.to_string(),
			endpoint: endpoint.to_string(),
			http,
			next_id: AtomicU32::new(1),
		}
	}

	async fn rpc(&self, method: &str, params: Value) -> anyhow::Result<Value> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let request = JsonRpcRequest::new(id, method, params);
		let body = serde_json::to_value(&request)?;

		let call = self
			.http
			.request(Method::POST, &self.endpoint)
			.set_body_para(BodyPara::Value(body))
			.nothrow()
			.new_call()
			.map_err(|e| anyhow!("building mcp request: {e}"))?;
		let resp = call
			.execute()
			.await
			.with_context(|| format!("mcp service {} unreachable", self.name))?;
		let status = resp.status();
		let bytes = resp
			.into_body()
			.collect()
			.await
			.context("reading mcp response")?
			.to_bytes();
		if !status.is_success() {
			return Err(anyhow!("mcp service {} returned {status}", self.name));
		}
		let parsed: JsonRpcResponse =
			serde_json::from_slice(&bytes).context("malformed json-rpc response")?;
		if let Some(err) = parsed.error {
			return Err(anyhow!("mcp error {}: {}", err.code, err.message));
		}
		Ok(parsed.result.unwrap_or(Value::Null))
	}

	pub async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
		let result = self.rpc("tools/list", json!({})).await?;
		let tools = result
			.get("tools")
			.cloned()
			.unwrap_or(Value::Array(vec![]));
		Ok(serde_json::from_value(tools).context("malformed tools list")?)
	}

	pub async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<Value> {
		self
			.rpc("tools/call", json!({"name": name, "arguments": arguments}))
			.await
	}
}

/// All managed MCP services, one upstream per service name.
pub struct McpClientManager {
	clients: HashMap<String, Arc<McpClient>>,
}

impl McpClientManager {
	pub fn from_config(services: &[McpServiceConfig], http: HttpClient) -> McpClientManager {
		let mut clients = HashMap::new();
		for svc in services {
			debug!(service = %svc.name, url = %svc.url, "registering mcp service");
			clients.insert(
				svc.name.clone(),
				Arc::new(McpClient::new(&svc.name, &svc.url, http.clone())),
			);
		}
		McpClientManager { clients }
	}

	pub fn get(&self, service: &str) -> Option<Arc<McpClient>> {
		self.clients.get(service).cloned()
	}

	pub fn service_names(&self) -> Vec<&str> {
		self.clients.keys().map(|s| s.as_str()).collect()
	}

	/// Tool descriptors from every service, names qualified as
	/// `service::tool`. Unreachable services are skipped with a warning so one
	/// dead upstream does not hide the rest.
	pub async fn aggregate_tools(&self) -> Vec<ToolDescriptor> {
		let mut out = Vec::new();
		for (service, client) in &self.clients {
			match client.list_tools().await {
				Ok(tools) => {
					out.extend(tools.into_iter().map(|mut t| {
						t.name = format!("{service}::{}", t.name);
						t
					}));
				},
				Err(e) => warn!(service, "listing tools failed: {e}"),
			}
		}
		out.sort_by(|a, b| a.name.cmp(&b.name));
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tool_descriptor_parses_mcp_wire_form() {
		let t: ToolDescriptor = serde_json::from_str(
			r#"{"name":"read_file","description":"Read a file","inputSchema":{"type":"object"}}"#,
		)
		.unwrap();
		assert_eq!(t.name, "read_file");
		assert!(t.input_schema.is_some());
	}

	#[test]
	fn manager_lookup() {
		let http = HttpClient::builder().build();
		let services = vec![
			McpServiceConfig {
				name: "files".to_string(),
				url: "http://127.0.0.1:1/rpc".to_string(),
			},
		];
		let manager = McpClientManager::from_config(&services, http);
		assert!(manager.get("files").is_some());
		assert!(manager.get("nope").is_none());
		assert_eq!(manager.service_names(), vec!["files"]);
	}
}
