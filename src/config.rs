use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::serdes::{self, yamlviajson};
use crate::types::asset::Asset;

fn default_bind() -> SocketAddr {
	"0.0.0.0:8080".parse().expect("static address parses")
}

fn default_preproc_timeout() -> Duration {
	Duration::from_secs(5)
}

fn default_keep_alive() -> Duration {
	Duration::from_secs(300)
}

fn default_max_requests() -> usize {
	64
}

fn default_max_requests_per_host() -> usize {
	5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	#[serde(default = "default_bind")]
	pub bind: SocketAddr,
	#[serde(default)]
	pub assets: Vec<Asset>,
	#[serde(default)]
	pub trusted_proxies: Vec<IpAddr>,
	#[serde(default = "default_preproc_timeout", with = "serdes::serde_dur")]
	pub preproc_timeout: Duration,
	#[serde(default)]
	pub client: ClientSection,
	#[serde(default)]
	pub cache: Option<CacheSection>,
	#[serde(default)]
	pub mcp_services: Vec<McpServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientSection {
	#[serde(default = "default_max_requests")]
	pub max_requests: usize,
	#[serde(default = "default_max_requests_per_host")]
	pub max_requests_per_host: usize,
	#[serde(default = "default_keep_alive", with = "serdes::serde_dur")]
	pub keep_alive: Duration,
	#[serde(default, with = "serdes::serde_dur_option")]
	pub call_timeout: Option<Duration>,
}

impl Default for ClientSection {
	fn default() -> Self {
		ClientSection {
			max_requests: default_max_requests(),
			max_requests_per_host: default_max_requests_per_host(),
			keep_alive: default_keep_alive(),
			call_timeout: None,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheSection {
	pub directory: PathBuf,
	/// Upper bound for the on-disk cache, in bytes.
	pub max_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct McpServiceConfig {
	pub name: String,
	pub url: String,
}

/// Fully-resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
	pub bind: SocketAddr,
	/// Assets indexed by their routing key (`Asset.method`).
	pub assets: HashMap<String, Arc<Asset>>,
	pub trusted_proxies: Vec<IpAddr>,
	pub preproc_timeout: Duration,
	pub client: ClientSection,
	pub cache: Option<CacheSection>,
	pub mcp_services: Vec<McpServiceConfig>,
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = yamlviajson::from_str(contents).context("invalid configuration")?;
	let mut assets = HashMap::new();
	for asset in raw.assets {
		let key = asset.method.clone();
		if key.is_empty() {
			anyhow::bail!("asset with empty method");
		}
		if assets.insert(key.clone(), Arc::new(asset)).is_some() {
			anyhow::bail!("duplicate asset method: {key}");
		}
	}
	Ok(Config {
		bind: raw.bind,
		assets,
		trusted_proxies: raw.trusted_proxies,
		preproc_timeout: raw.preproc_timeout,
		client: raw.client,
		cache: raw.cache,
		mcp_services: raw.mcp_services,
	})
}

pub fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
	let contents =
		std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
	parse_config(&contents)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::asset::{AssetKind, StreamMode};

	#[test]
	fn parses_full_config() {
		let yaml = r#"
bind: 127.0.0.1:9000
trustedProxies: ["10.0.0.1"]
preprocTimeout: 2s
client:
  maxRequests: 32
  maxRequestsPerHost: 4
  keepAlive: 60s
cache:
  directory: /tmp/vortex-cache
  maxSize: 10485760
assets:
  - method: hello
    kind: rest
    host: upstream
    port: 80
    path: /hello
    stream: 1
    timeout: 5000
  - method: orders.created
    kind: mq
    stream: 1
mcpServices:
  - name: files
    url: http://localhost:9200/rpc
"#;
		let config = parse_config(yaml).unwrap();
		assert_eq!(config.bind, "127.0.0.1:9000".parse().unwrap());
		assert_eq!(config.client.max_requests, 32);
		assert_eq!(config.preproc_timeout, Duration::from_secs(2));
		let hello = config.assets.get("hello").unwrap();
		assert_eq!(hello.kind, AssetKind::Rest);
		assert_eq!(hello.stream, StreamMode::Buffered);
		assert_eq!(hello.timeout, 5000);
		assert!(config.assets.contains_key("orders.created"));
		assert_eq!(config.mcp_services.len(), 1);
	}

	#[test]
	fn duplicate_asset_method_rejected() {
		let yaml = r#"
assets:
  - method: a
    kind: rest
    host: h
  - method: a
    kind: mq
"#;
		assert!(parse_config(yaml).is_err());
	}

	#[test]
	fn defaults_apply() {
		let config = parse_config("{}").unwrap();
		assert_eq!(config.bind, default_bind());
		assert_eq!(config.client.max_requests, 64);
		assert!(config.cache.is_none());
	}
}
