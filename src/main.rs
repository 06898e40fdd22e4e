use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use vortex::proxy::Gateway;
use vortex::signal;
use vortex::telemetry;

#[derive(Parser)]
#[command(name = "vortex", about = "Multi-protocol reactive API gateway")]
struct Args {
	/// Configuration file (YAML).
	#[arg(short = 'f', long = "file")]
	file: PathBuf,
	/// Parse and validate the configuration, then exit.
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::log::setup_logging();
	let args = Args::parse();
	let config = vortex::config::load_config(&args.file).context("loading configuration")?;
	if args.validate_only {
		info!("configuration ok: {} assets", config.assets.len());
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("building runtime")?
		.block_on(async move {
			let gateway = Gateway::new(config);
			let shutdown = signal::Shutdown::new();
			gateway.serve(shutdown.wait()).await
		})
}
