mod config_commands;
mod doctor_commands;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use campusline_broker::AddressNormalizer;

#[derive(Parser)]
#[command(name = "campusline", about = "Campusline, multi-tenant messaging session broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    // Gateway arguments (used when no subcommand is provided, or with `gateway` subcommand)
    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Custom config directory (overrides default ~/.config/campusline/).
    #[arg(long, global = true, env = "CAMPUSLINE_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
    /// Custom data directory (holds per-tenant credential stores).
    #[arg(long, global = true, env = "CAMPUSLINE_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (default when no subcommand is provided).
    Gateway,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Check config, directories and the sidecar runtime.
    Doctor,
    /// Print the canonical recipient address for a phone number.
    Normalize {
        /// Phone number in any common format.
        phone: String,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    // Apply directory overrides before any config lookup.
    if let Some(ref dir) = cli.config_dir {
        campusline_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        campusline_config::set_data_dir(dir.clone());
    }

    match cli.command {
        // Default: start gateway when no subcommand is provided
        None | Some(Commands::Gateway) => {
            info!(version = env!("CARGO_PKG_VERSION"), "campusline starting");
            let config = campusline_config::discover_and_load();

            // CLI args override config values
            let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());
            let port = cli.port.unwrap_or(config.server.port);

            campusline_gateway::start_gateway(&config, &bind, port).await
        },
        Some(Commands::Config { action }) => config_commands::handle_config(action),
        Some(Commands::Doctor) => doctor_commands::handle_doctor(),
        Some(Commands::Normalize { phone }) => {
            let config = campusline_config::discover_and_load();
            let normalizer = AddressNormalizer::from_config(&config.broker);
            println!("{}", normalizer.normalize(&phone)?);
            Ok(())
        },
    }
}
