pub const NAME: &str = "openai";
pub const DEFAULT_HOST: &str = "api.openai.com";
pub const DEFAULT_PATH: &str = "/v1/chat/completions";

/// Metadata keys the asset can carry for this provider.
pub const API_KEY: &str = "openaiApiKey";
pub const HOST_OVERRIDE: &str = "openaiHost";

/// Models this provider serves.
pub fn serves_model(model: &str) -> bool {
	model.starts_with("gpt-")
		|| model.starts_with("o1")
		|| model.starts_with("o3")
		|| model.starts_with("o4")
		|| model.starts_with("chatgpt-")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn model_prefixes() {
		assert!(serves_model("gpt-4o"));
		assert!(serves_model("o3-mini"));
		assert!(!serves_model("claude-sonnet-4"));
	}
}
