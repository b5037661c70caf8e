use clap::Parser;

use brew_updater::cli::{self, Cli};
use brew_updater::config::{log_path, resolve_config_path};
use brew_updater::logging::{self, Verbosity};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref())?;

    let _guard = logging::init(
        Verbosity::from_flags(cli.quiet, cli.verbose),
        Some(&log_path(&config_path)),
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(cli::run(cli, config_path))
}
