use chain_store::{ChainStore, StoreConfig};
use config::Config;
use eyre::{Result, WrapErr, bail};
use std::fs;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use sync_service::{ChainRegistry, RpcClientFactory, SyncController, SyncSettings};
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use vault_secrets::VaultClient;

#[derive(StructOpt)]
#[structopt(name = "syncd")]
struct Options {
    #[structopt(short, long)]
    pub cfg: PathBuf,
    #[structopt(short, long)]
    pub debug_log: Option<PathBuf>,
    #[structopt(long)]
    pub debug_level: Option<String>,
}

const DEFAULT_DEBUG_LEVEL: &str = "info,sync_service=debug,chain_store=debug";

#[tokio::main]
async fn main() -> Result<()> {
    let opt: Options = Options::from_args();

    let (console_non_blocking, _console_guard) = tracing_appender::non_blocking(std::io::stdout());
    let debug_log = opt
        .debug_log
        .map(|path| {
            OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(path)
                .wrap_err("open debug log for writing")
        })
        .transpose()?
        .map(tracing_appender::non_blocking);
    tracing_subscriber::registry()
        .with(debug_log.as_ref().map(|(handle, _)| {
            let debug_level = opt.debug_level.as_deref().unwrap_or(DEFAULT_DEBUG_LEVEL);
            let filter = EnvFilter::builder()
                .parse(debug_level)
                .unwrap_or_else(|error| {
                    println!("failed to build debug log filter: {error:?}, using default: {DEFAULT_DEBUG_LEVEL}");
                    EnvFilter::builder()
                        .parse(DEFAULT_DEBUG_LEVEL)
                        .unwrap_or_else(|_| EnvFilter::builder().from_env_lossy())
                });
            tracing_logfmt::builder()
                .with_span_name(false)
                .with_span_path(true)
                .with_level(false)
                .with_target(false)
                .with_timestamp(true)
                .layer()
                .with_writer(handle.clone())
                .with_filter(filter)
        }))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(true)
                .with_writer(console_non_blocking)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::INFO.into())
                        .from_env_lossy(),
                ),
        )
        .init();

    let cfg: Config = {
        let data = fs::read_to_string(&opt.cfg).wrap_err("read a config file")?;
        if opt
            .cfg
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        {
            serde_json::from_str(&data).wrap_err("parse config")?
        } else if opt
            .cfg
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml"))
        {
            serde_yaml::from_str(&data).wrap_err("parse config")?
        } else {
            bail!("unsupported config file format");
        }
    };

    let db_dir = cfg.db_dir.clone().unwrap_or_else(|| PathBuf::from("db"));
    let store =
        Arc::new(ChainStore::open(StoreConfig { root_dir: db_dir }).wrap_err("open chain store")?);

    let vault = Arc::new(VaultClient::new(
        cfg.vault.addr.clone(),
        cfg.vault.token.clone(),
        cfg.vault.transit_key.clone(),
    ));
    let registry = ChainRegistry::new(Arc::clone(&store), vault);
    let clients = Arc::new(RpcClientFactory::new(Arc::clone(&store)));
    let settings = SyncSettings {
        safety_margin: cfg.sync.safety_margin,
        cooldown: cfg.sync.cooldown.into_inner(),
        pass_interval: cfg.sync.pass_interval.into_inner(),
    };
    let controller = SyncController::new(registry, clients, store, settings);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown signal received");
                    cancel.cancel();
                }
                Err(err) => error!(?err, "failed to listen for shutdown signal"),
            }
        });
    }

    controller.run(cancel).await.wrap_err("sync controller")?;
    Ok(())
}
