use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Which backend transport a route targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
	Rest,
	Mq,
	Ws,
	Mcp,
	Llm,
}

impl std::fmt::Display for AssetKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			AssetKind::Rest => "rest",
			AssetKind::Mq => "mq",
			AssetKind::Ws => "ws",
			AssetKind::Mcp => "mcp",
			AssetKind::Llm => "llm",
		};
		f.write_str(s)
	}
}

/// How responses are emitted: `1` buffers the whole body and sets
/// Content-Length, `2` streams chunks with per-chunk flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
	#[default]
	Buffered,
	Chunked,
}

impl Serialize for StreamMode {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u8(match self {
			StreamMode::Buffered => 1,
			StreamMode::Chunked => 2,
		})
	}
}

impl<'de> Deserialize<'de> for StreamMode {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<StreamMode, D::Error> {
		match u8::deserialize(deserializer)? {
			1 => Ok(StreamMode::Buffered),
			2 => Ok(StreamMode::Chunked),
			other => Err(serde::de::Error::custom(format!(
				"stream must be 1 (buffered) or 2 (chunked), got {other}"
			))),
		}
	}
}

const fn default_timeout_ms() -> u64 {
	10_000
}

/// Static descriptor of one route target. `method` doubles as the routing key
/// and, for MQ assets, the topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Asset {
	pub method: String,
	pub kind: AssetKind,
	#[serde(default)]
	pub host: String,
	#[serde(default)]
	pub port: u16,
	#[serde(default)]
	pub path: String,
	#[serde(default)]
	pub url: String,
	#[serde(default = "default_timeout_ms")]
	pub timeout: u64,
	#[serde(default)]
	pub stream: StreamMode,
	#[serde(default)]
	pub metadata: HashMap<String, String>,
}

impl Asset {
	pub fn timeout_duration(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}

	/// `host[:port]/path` with the scheme from metadata (`https: "true"` opts
	/// in), the base every REST target URI is resolved against.
	pub fn base_url(&self) -> String {
		let scheme = if self.metadata.get("https").map(|v| v == "true").unwrap_or(false) {
			"https"
		} else {
			"http"
		};
		let mut out = format!("{scheme}://{}", self.host);
		if self.port != 0 {
			out.push_str(&format!(":{}", self.port));
		}
		if !self.path.is_empty() && !self.path.starts_with('/') {
			out.push('/');
		}
		out.push_str(&self.path);
		out
	}

	/// The full target template: base plus the `url` template path.
	pub fn target_template(&self) -> String {
		let base = self.base_url();
		if self.url.is_empty() {
			return base;
		}
		if self.url.starts_with('/') || base.ends_with('/') {
			format!("{base}{}", self.url)
		} else {
			format!("{base}/{}", self.url)
		}
	}

	pub fn metadata_get(&self, key: &str) -> Option<&str> {
		self.metadata.get(key).map(|s| s.as_str())
	}
}
