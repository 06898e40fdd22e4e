use std::env;
use std::str::FromStr;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry, filter};

/// Install the global subscriber. `RUST_LOG` selects targets/levels; the DNS
/// resolver is clamped to warn by default because it logs per-lookup.
/// `LOG_FORMAT=json` switches to line-delimited JSON output.
pub fn setup_logging() {
	tracing_subscriber::registry().with(fmt_layer()).init();
}

fn fmt_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
	let use_json = env::var("LOG_FORMAT").unwrap_or_default() == "json";
	let format: Box<dyn Layer<Registry> + Send + Sync + 'static> = if use_json {
		Box::new(
			tracing_subscriber::fmt::layer()
				.json()
				.with_target(true)
				.flatten_event(true),
		)
	} else {
		Box::new(tracing_subscriber::fmt::layer().with_target(true))
	};
	Box::new(format.with_filter(default_filter()))
}

fn default_filter() -> filter::Targets {
	let var: String = env::var("RUST_LOG")
		.map(|v| "hickory_resolver=warn,".to_string() + v.as_str())
		.unwrap_or("hickory_resolver=warn,info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}
