use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, WrapErr, eyre},
};
use switchyard::{
    adapters::{HttpClientAdapter, NotificationClient, tls},
    bootstrap::build_gateway,
    config::{
        HttpClientConfig, ServerConfigValidator,
        loader::{load_config, load_config_unchecked},
    },
    core::balancer::{ClusterCommand, CommandKind, DEFAULT_BALANCER, DEFAULT_CLUSTER},
    tracing_setup::{self, LogFormat},
    utils::{GracefulShutdown, ShutdownReason},
};
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    /// Default log filter when RUST_LOG is unset
    #[clap(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Send an up/down/takeout command to a running gateway
    Notify {
        /// up, down or takeout
        command: CommandKind,
        #[clap(long)]
        host: String,
        #[clap(long, default_value_t = 80)]
        port: u16,
        /// Absolute URL of the cluster manager endpoint
        #[clap(long, default_value = "http://127.0.0.1:8080/clustermanager")]
        cluster_manager: String,
        #[clap(long, default_value = DEFAULT_BALANCER)]
        balancer: String,
        #[clap(long, default_value = DEFAULT_CLUSTER)]
        cluster: String,
        /// Hex AES key; the command is sent encrypted when set
        #[clap(long)]
        key: Option<String>,
        /// Shared secret for an HMAC signature
        #[clap(long)]
        hmac_secret: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    tracing_setup::init_tracing(args.log_format, &args.log_level)?;
    tls::install_crypto_provider();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        Some(Commands::Notify {
            command,
            host,
            port,
            cluster_manager,
            balancer,
            cluster,
            key,
            hmac_secret,
        }) => {
            let mut client = NotificationClient::new(
                cluster_manager,
                HttpClientAdapter::with_own_pool(HttpClientConfig::default()),
            );
            if let Some(key) = key {
                client = client.with_key_hex(&key)?;
            }
            if let Some(secret) = hmac_secret {
                client = client.with_hmac_secret(secret)?;
            }
            let command = ClusterCommand::new(command, host, port)
                .with_balancer(balancer)
                .with_cluster(cluster);
            client.send(&command).await
        }
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;
    switchyard::metrics::init_metrics()?;
    let gateway = build_gateway(&config)?;

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    graceful_shutdown.register_pool(gateway.pool.clone());

    let signal_handler = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let reaper = gateway.pool.spawn_reaper();
    let session_cleaner = gateway
        .balancers
        .spawn_session_cleaner(Duration::from_secs(60), graceful_shutdown.cancellation_token());

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| eyre!("Invalid listen address {}: {}", config.listen_addr, e))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(%addr, rules = config.rules.len(), "Switchyard listening");

    let app = gateway.handler.clone().router().layer(TraceLayer::new_for_http());
    let signal = graceful_shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signal.wait_for_shutdown_signal().await;
    });

    let mut server = tokio::spawn(server.into_future());
    tokio::select! {
        result = &mut server => {
            result.wrap_err("Server task failed")?.wrap_err("Server error")?;
        }
        _ = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Draining in-flight requests");
            if graceful_shutdown.drain(&mut server).await == ShutdownReason::Force {
                server.abort();
            }
        }
    }

    graceful_shutdown.close_pools();
    session_cleaner.abort();
    reaper.abort();
    tracing::info!("Switchyard stopped");
    Ok(())
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    let errors = ServerConfigValidator::collect_errors(&config);
    if errors.is_empty() {
        println!("Configuration validation: OK");
        println!();
        println!("Configuration Summary:");
        println!("   Listen Address: {}", config.listen_addr);
        println!("   Rules: {}", config.rules.len());
        println!("   Balancers: {}", config.balancers.len());
        println!(
            "   Cluster Manager: {}",
            config
                .cluster_manager
                .as_ref()
                .map(|cm| cm.path_prefix.as_str())
                .unwrap_or("disabled")
        );
        Ok(())
    } else {
        eprintln!("Configuration validation failed:");
        for error in &errors {
            eprintln!("   - {error}");
        }
        std::process::exit(1);
    }
}
