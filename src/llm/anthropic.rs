pub const NAME: &str = "anthropic";
pub const DEFAULT_HOST: &str = "api.anthropic.com";
pub const DEFAULT_PATH: &str = "/v1/messages";
pub const VERSION_HEADER: &str = "anthropic-version";
pub const VERSION: &str = "2023-06-01";

/// Metadata keys the asset can carry for this provider.
pub const API_KEY: &str = "anthropicApiKey";
pub const HOST_OVERRIDE: &str = "anthropicHost";

pub fn serves_model(model: &str) -> bool {
	model.starts_with("claude-")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn model_prefixes() {
		assert!(serves_model("claude-opus-4-1"));
		assert!(!serves_model("gpt-4o"));
	}
}
