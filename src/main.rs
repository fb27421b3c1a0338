//! nico-gateway - CLI entry point

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use nico_gateway::{Config, Gateway, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nico")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Adaptive routing gateway with a live-ranked proxy pool")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', short_alias = 'f', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Working directory for the config and store files
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Mixed HTTP/SOCKS5 port (overrides config)
    #[arg(long = "mixed-port")]
    mixed_port: Option<u16>,

    /// External controller address (overrides config)
    #[arg(long = "ext-ctl")]
    external_controller: Option<String>,

    /// External controller secret (overrides config)
    #[arg(long = "secret")]
    secret: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // rustls needs a process-wide provider for the https probes
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("nico-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(ref dir) = args.directory {
        if dir.is_dir() {
            std::env::set_current_dir(dir)?;
        }
    }

    let mut config = Config::load(&args.config)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("nico_gateway={}", config.log_level).parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("nico v{}", VERSION);
    info!("Loaded configuration from: {}", args.config.display());

    if let Some(port) = args.mixed_port {
        config.mixed_port = port;
    }
    if let Some(ext_ctl) = args.external_controller {
        config.external_controller = Some(ext_ctl);
    }
    if let Some(secret) = args.secret {
        config.secret = Some(secret);
    }
    config.validate()?;

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to initialize gateway: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
