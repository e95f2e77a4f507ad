#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use mdgate::server::bootstrap::{launch, BootstrapArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mdgate", version, about = "URL-to-Markdown conversion gateway")]
struct Cli {
    /// Path to the gateway config file (optional; defaults apply)
    #[arg(long, default_value = "mdgate.toml")]
    config: PathBuf,

    /// Listen address for the conversion surface
    #[arg(long, default_value = "0.0.0.0:8787")]
    listen: String,

    /// Admin listen address (health/metrics/stats)
    #[arg(long, default_value = "0.0.0.0:9090")]
    admin_listen: String,

    /// Log output: "json" (default) or "plain"
    #[arg(long, default_value = "json")]
    log_format: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    launch(BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
        json_logs: cli.log_format != "plain",
    })
}
