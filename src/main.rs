use anyhow::Result;
use log::{error, info};
use std::path::Path;
use std::sync::Arc;

use power_monitor::cli::{build_cli, handle_subcommands, overrides_from};
use power_monitor::config::Config;
use power_monitor::devices::MeterClient;
use power_monitor::modbus::ModbusClient;
use power_monitor::services::PollScheduler;
use power_monitor::storage::{LatestCache, SqliteManager};
use power_monitor::utils::error::InitError;

const DEFAULT_CONFIG_PATH: &str = "power_monitor.toml";

fn load_config(explicit: Option<&String>) -> Result<Config, InitError> {
    let config = match explicit {
        Some(path) => Config::from_file(path).map_err(InitError::Config)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::from_file(DEFAULT_CONFIG_PATH).map_err(InitError::Config)?
        }
        None => {
            info!("📝 No config file found, using built-in defaults");
            Config::default()
        }
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let level = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = load_config(matches.get_one::<String>("config"))?;
    config.apply_overrides(overrides_from(&matches));
    config.validate().map_err(InitError::Config)?;

    if handle_subcommands(&matches, &config).await? {
        return Ok(());
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    info!("⚡ Power Monitor v{}", power_monitor::VERSION);

    let meters = config.power_meters().map_err(InitError::Config)?;
    for meter in &meters {
        info!("📟 {} at slave {} using profile {}", meter.device_id, meter.address, meter.profile.name);
    }

    let transport = ModbusClient::new(&config.serial_port, config.baud_rate, &config.parity, config.timeout_ms)
        .map_err(InitError::Transport)?;
    let store = SqliteManager::new(config.database.clone())
        .await
        .map_err(InitError::Store)?;
    let cache = Arc::new(LatestCache::new());

    let scheduler = PollScheduler::new(
        meters,
        MeterClient::new(Arc::new(transport)),
        store.clone(),
        Arc::clone(&cache),
        config.poll.clone(),
    );
    let handle = scheduler.handle();

    #[cfg(feature = "api")]
    let mut api = if config.api.enabled {
        use power_monitor::services::{ApiService, ApiServiceState};
        let state = ApiServiceState::new(store.clone(), Arc::clone(&cache), config.device_ids());
        let mut api = ApiService::new(state);
        api.start(&config.api.bind_address, config.api.port).await?;
        Some(api)
    } else {
        info!("🌐 HTTP API disabled");
        None
    };

    let mut poller = tokio::spawn(scheduler.run());

    tokio::select! {
        result = &mut poller => {
            if let Err(e) = result {
                error!("❌ Poll scheduler task failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
            handle.stop().await;
            if let Err(e) = poller.await {
                error!("❌ Poll scheduler task failed: {}", e);
            }
        }
    }

    #[cfg(feature = "api")]
    if let Some(api) = api.as_mut() {
        api.stop().await;
    }

    store.close().await;
    info!("👋 Power Monitor stopped");
    Ok(())
}
