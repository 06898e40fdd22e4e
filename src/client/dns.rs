use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
	ips: Arc<[IpAddr]>,
	valid_until: Instant,
}

/// Async resolver with a TTL-driven cache. IP literals bypass resolution.
#[derive(Debug, Clone)]
pub struct CachedResolver {
	dns: Arc<TokioResolver>,
	entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl CachedResolver {
	pub fn new(config: ResolverConfig, opts: ResolverOpts) -> Self {
		let mut rb =
			hickory_resolver::Resolver::builder_with_config(config, TokioConnectionProvider::default());
		*rb.options_mut() = opts;
		CachedResolver {
			dns: Arc::new(rb.build()),
			entries: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	pub fn system() -> Self {
		match hickory_resolver::system_conf::read_system_conf() {
			Ok((cfg, opts)) => Self::new(cfg, opts),
			Err(e) => {
				debug!("failed to read system resolver config, using defaults: {e}");
				Self::new(ResolverConfig::default(), ResolverOpts::default())
			},
		}
	}

	/// Resolve a hostname to all its addresses, oldest-cached first.
	pub async fn resolve(&self, host: &str) -> anyhow::Result<Arc<[IpAddr]>> {
		// Bracketed or bare IP literals never hit the resolver.
		let bare = host.trim_start_matches('[').trim_end_matches(']');
		if let Ok(ip) = bare.parse::<IpAddr>() {
			return Ok(Arc::from(vec![ip].into_boxed_slice()));
		}

		if let Some(entry) = self.entries.lock().get(host)
			&& entry.valid_until > Instant::now()
		{
			return Ok(entry.ips.clone());
		}

		let lookup = self.dns.lookup_ip(host).await?;
		let valid_until = lookup.valid_until();
		let ips: Arc<[IpAddr]> = lookup.iter().collect::<Vec<_>>().into();
		if ips.is_empty() {
			return Err(anyhow!("no addresses for {host}"));
		}
		self.entries.lock().insert(
			host.to_string(),
			CacheEntry {
				ips: ips.clone(),
				valid_until,
			},
		);
		Ok(ips)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn ip_literals_bypass_resolution() {
		let r = CachedResolver::system();
		let ips = r.resolve("127.0.0.1").await.unwrap();
		assert_eq!(&*ips, &["127.0.0.1".parse::<IpAddr>().unwrap()][..]);
		let ips = r.resolve("[::1]").await.unwrap();
		assert_eq!(&*ips, &["::1".parse::<IpAddr>().unwrap()][..]);
	}
}
