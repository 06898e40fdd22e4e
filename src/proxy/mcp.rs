use serde_json::{Value, json};
use tracing::debug;

use super::GatewayError;
use super::context::Context;
use super::write;
use crate::client::{ClientError, TimeoutStage};
use crate::http::{Response, StatusCode};
use crate::mcp::McpClientManager;

/// The MCP router: `action=listTools` aggregates descriptors across all
/// managed services; `action=callTool` dispatches
/// `toolName=service::actualName` with the remaining query params as
/// arguments. The asset timeout bounds either action.
pub async fn route(manager: &McpClientManager, ctx: &mut Context) -> Result<Response, GatewayError> {
	let asset = ctx.asset.clone();
	let action = ctx.param("action").map(|s| s.to_string());
	let tool_name = ctx.param("toolName").map(|s| s.to_string());
	let arguments: serde_json::Map<String, Value> = ctx
		.params
		.iter()
		.filter(|(k, _)| k.as_str() != "action" && k.as_str() != "toolName")
		.map(|(k, v)| (k.clone(), Value::String(v.clone())))
		.collect();
	let work = async {
		match action.as_deref() {
			Some("listTools") => {
				let tools = manager.aggregate_tools().await;
				debug!(count = tools.len(), "aggregated mcp tools");
				write::json_response(
					asset.stream,
					StatusCode::OK,
					&json!({"tools": tools}),
				)
			},
			Some("callTool") => {
				let tool = tool_name
					.as_deref()
					.ok_or_else(|| GatewayError::Validation("missing toolName".to_string()))?;
				let (service, name) = tool
					.split_once("::")
					.filter(|(s, n)| !s.is_empty() && !n.is_empty())
					.ok_or_else(|| {
						GatewayError::Validation(
							"toolName must be serviceName::actualName".to_string(),
						)
					})?;
				let client = manager.get(service).ok_or_else(|| {
					GatewayError::NotFound(format!("unknown mcp service: {service}"))
				})?;

				let result = client
					.call_tool(name, Value::Object(arguments))
					.await
					.map_err(GatewayError::Internal)?;
				write::json_response(asset.stream, StatusCode::OK, &result)
			},
			_ => Err(GatewayError::Validation(
				"action must be listTools or callTool".to_string(),
			)),
		}
	};
	tokio::time::timeout(asset.timeout_duration(), work)
		.await
		.map_err(|_| {
			GatewayError::Upstream(ClientError::TimedOut {
				stage: TimeoutStage::Call,
			})
		})?
}
