mod cli;
mod config;
mod settings;
mod sync;

use clap::Parser;
use color_eyre::Result;
use keyward_storage::certificate_store::FileCertificateStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{CertCommand, Command, ConfigCommand};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    let home = config::data_home(std::env::var_os(config::HOME_ENV))?;
    let mut paths = config.resolve_paths(&home);
    if let Some(settings) = cli.settings {
        paths.settings_path = settings;
    }

    match cli.command {
        Command::Version => print_version(),
        Command::Protect {
            cert,
            force,
            entries,
        } => settings::protect(
            &settings::store_from_paths(&paths),
            &config,
            cert,
            force,
            entries,
        )?,
        Command::Get { keys } => settings::get(&settings::store_from_paths(&paths), &keys)?,
        Command::List => settings::list(&settings::store_from_paths(&paths))?,
        Command::Cert(CertCommand::New { subject }) => settings::new_certificate(
            &FileCertificateStore::new(paths.certificate_dir.clone()),
            &subject,
        )?,
        Command::Sync { force } => {
            let sync_cfg = config.sync.clone().unwrap_or_default();
            sync::run(&sync_cfg, &settings::store_from_paths(&paths), force).await?
        }
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info. Logs go to stderr so
    // `keyward get` output stays clean.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("keyward {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
