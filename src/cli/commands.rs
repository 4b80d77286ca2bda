use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::config::settings::{Config, ConfigOverrides};
use crate::devices::power_meter::MeterClient;
use crate::modbus::client::ModbusClient;
use crate::output::{formatter_for, DataFormatter, HexFormatter};
use crate::storage::models::Reading;
use crate::storage::sqlite_manager::SqliteManager;
use crate::utils::error::InitError;

/// Settle time between meters after an energy reset.
const ENERGY_RESET_PAUSE: Duration = Duration::from_secs(2);

pub fn build_cli() -> Command {
    let device = || Arg::new("device").required(true).help("Device id, e.g. unit01");
    let start = || Arg::new("start").long("start").required(true).help("Start date YYYY-MM-DD");
    let end = || Arg::new("end").long("end").required(true).help("End date YYYY-MM-DD (inclusive)");

    Command::new("power_monitor")
        .version(crate::VERSION)
        .about("Polls Modbus power meters and serves their time series")
        .arg(Arg::new("config").short('c').long("config").global(true).help("Path to TOML config"))
        .arg(Arg::new("port").short('p').long("port").global(true).help("Serial port"))
        .arg(
            Arg::new("baud")
                .short('b')
                .long("baud")
                .global(true)
                .value_parser(value_parser!(u32))
                .help("Baud rate"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .global(true)
                .value_parser(value_parser!(u64))
                .help("Poll period in milliseconds"),
        )
        .arg(Arg::new("database").long("database").global(true).help("SQLite database path"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .global(true)
                .value_parser(["console", "json", "csv"])
                .default_value("console")
                .help("Output format for query commands"),
        )
        .subcommand(Command::new("run").about("Start polling and the API (default)"))
        .subcommand(Command::new("latest").about("Most recent stored reading").arg(device()))
        .subcommand(
            Command::new("history")
                .about("Time-bucketed readings for a date range")
                .arg(device())
                .arg(start())
                .arg(end()),
        )
        .subcommand(
            Command::new("compare")
                .about("Every Nth raw reading for a date range")
                .arg(device())
                .arg(start())
                .arg(end())
                .arg(Arg::new("skip").long("skip").value_parser(value_parser!(u32))),
        )
        .subcommand(
            Command::new("recent").about("Raw readings from the last hours").arg(device()).arg(
                Arg::new("hours")
                    .long("hours")
                    .value_parser(value_parser!(i64))
                    .default_value("24"),
            ),
        )
        .subcommand(
            Command::new("summarize")
                .about("Compute and record daily summaries")
                .arg(Arg::new("date").long("date").help("Day YYYY-MM-DD, default today")),
        )
        .subcommand(
            Command::new("purge")
                .about("Delete readings past retention")
                .arg(Arg::new("days").long("days").value_parser(value_parser!(i64))),
        )
        .subcommand(
            Command::new("correct-polarity")
                .about("Rewrite negative current/power of a device to absolute values")
                .arg(device()),
        )
        .subcommand(Command::new("stats").about("Database statistics"))
        .subcommand(Command::new("raw").about("Read and dump raw registers once").arg(device()))
        .subcommand(
            Command::new("reset-energy")
                .about("Clear the accumulated kWh counter of one meter, or of every enabled meter")
                .arg(Arg::new("device").help("Device id; all enabled meters when omitted")),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write the default configuration")
                .arg(Arg::new("path").required(true)),
        )
}

pub fn overrides_from(matches: &ArgMatches) -> ConfigOverrides {
    ConfigOverrides {
        serial_port: matches.get_one::<String>("port").cloned(),
        baud_rate: matches.get_one::<u32>("baud").copied(),
        interval_ms: matches.get_one::<u64>("interval-ms").copied(),
        database_path: matches.get_one::<String>("database").cloned(),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", raw))
}

fn date_arg(matches: &ArgMatches, name: &str) -> Result<NaiveDate> {
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing --{}", name))?;
    parse_date(raw)
}

fn device_arg<'a>(matches: &'a ArgMatches, config: &Config) -> Result<&'a str> {
    let device = matches
        .get_one::<String>("device")
        .ok_or_else(|| anyhow!("missing device id"))?;
    if config.meter_by_id(device).is_none() {
        bail!("unknown device '{}' (configured: {})", device, config.device_ids().join(", "));
    }
    Ok(device.as_str())
}

fn report_resets(results: Vec<(String, Result<(), crate::utils::error::ModbusError>)>) -> Result<()> {
    let mut failed = 0;
    for (device_id, result) in &results {
        match result {
            Ok(()) => println!("✅ {}: energy counter cleared", device_id),
            Err(e) => {
                failed += 1;
                println!("❌ {}: reset rejected ({})", device_id, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} meters did not accept the reset", failed, results.len());
    }
    Ok(())
}

async fn open_store(config: &Config) -> Result<SqliteManager> {
    Ok(SqliteManager::new(config.database.clone())
        .await
        .map_err(InitError::Store)?)
}

/// Runs a query or maintenance subcommand. Returns `false` when the
/// polling service should start instead.
pub async fn handle_subcommands(matches: &ArgMatches, config: &Config) -> Result<bool> {
    let format = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("console");
    let formatter: Box<dyn DataFormatter> =
        formatter_for(format).ok_or_else(|| anyhow!("unknown format '{}'", format))?;

    let (name, sub) = match matches.subcommand() {
        None | Some(("run", _)) => return Ok(false),
        Some(pair) => pair,
    };

    match name {
        "raw" => {
            let device = device_arg(sub, config)?;
            let meter = config
                .power_meters()?
                .into_iter()
                .find(|m| m.device_id == device)
                .ok_or_else(|| anyhow!("device '{}' is disabled", device))?;
            let transport = ModbusClient::new(&config.serial_port, config.baud_rate, &config.parity, config.timeout_ms)
                .map_err(InitError::Transport)?;
            let client = MeterClient::new(Arc::new(transport));
            let fields = client.read_raw(&meter).await?;
            print!("{}", HexFormatter.format_raw_fields(&meter.device_id, meter.address, &fields));
            return Ok(true);
        }
        "reset-energy" => {
            let meters = match sub.get_one::<String>("device") {
                Some(_) => {
                    let device = device_arg(sub, config)?;
                    config
                        .power_meters()?
                        .into_iter()
                        .filter(|m| m.device_id == device)
                        .collect::<Vec<_>>()
                }
                None => config.power_meters()?,
            };
            if meters.is_empty() {
                bail!("no enabled meter to reset");
            }
            let transport = ModbusClient::new(&config.serial_port, config.baud_rate, &config.parity, config.timeout_ms)
                .map_err(InitError::Transport)?;
            let client = MeterClient::new(Arc::new(transport));
            report_resets(client.reset_energy_all(&meters, ENERGY_RESET_PAUSE).await)?;
            return Ok(true);
        }
        "init-config" => {
            let path = sub
                .get_one::<String>("path")
                .ok_or_else(|| anyhow!("missing path"))?;
            Config::default().save_to_file(path)?;
            println!("✅ Default configuration written to {}", path);
            return Ok(true);
        }
        _ => {}
    }

    let store = open_store(config).await?;
    let result = run_store_command(name, sub, config, &store, formatter.as_ref()).await;
    store.close().await;
    result?;
    Ok(true)
}

async fn run_store_command(
    name: &str,
    sub: &ArgMatches,
    config: &Config,
    store: &SqliteManager,
    formatter: &dyn DataFormatter,
) -> Result<()> {
    print!("{}", formatter.format_header());
    match name {
        "latest" => {
            let device = device_arg(sub, config)?;
            match store.query_latest(device).await? {
                Some(reading) => print!("{}", formatter.format_reading(&reading)),
                None => print!("{}", formatter.format_readings(&[])),
            }
        }
        "history" => {
            let device = device_arg(sub, config)?;
            let buckets = store
                .query_range(device, date_arg(sub, "start")?, date_arg(sub, "end")?)
                .await?;
            print!("{}", formatter.format_buckets(device, &buckets));
        }
        "compare" => {
            let device = device_arg(sub, config)?;
            let (start, end) = (date_arg(sub, "start")?, date_arg(sub, "end")?);
            let skip = sub
                .get_one::<u32>("skip")
                .copied()
                .unwrap_or_else(|| crate::storage::aggregation::skip_for_span(start, end));
            let rows: Vec<Reading> = store
                .query_downsampled(device, start, end, skip)
                .await?
                .into_iter()
                .map(Reading::from)
                .collect();
            print!("{}", formatter.format_readings(&rows));
        }
        "recent" => {
            let device = device_arg(sub, config)?;
            let hours = sub.get_one::<i64>("hours").copied().unwrap_or(24);
            let rows: Vec<Reading> = store
                .query_recent(device, hours)
                .await?
                .into_iter()
                .map(Reading::from)
                .collect();
            print!("{}", formatter.format_readings(&rows));
        }
        "summarize" => {
            let date = match sub.get_one::<String>("date") {
                Some(raw) => parse_date(raw)?,
                None => Local::now().date_naive(),
            };
            let mut summaries = Vec::new();
            for device in config.device_ids() {
                let summary = store.daily_summary(&device, date).await?;
                store.record_daily_summary(&summary).await?;
                summaries.push(summary);
            }
            info!("📅 Recorded {} daily summaries for {}", summaries.len(), date);
            print!("{}", formatter.format_summaries(&summaries));
        }
        "purge" => {
            let days = sub
                .get_one::<i64>("days")
                .copied()
                .unwrap_or(config.poll.retention_days);
            let deleted = store.purge_older_than(days).await?;
            println!("🧹 Deleted {} readings older than {} days", deleted, days);
        }
        "correct-polarity" => {
            let device = device_arg(sub, config)?;
            let fixed = store.correct_reversed_polarity(device).await?;
            println!("🔧 Corrected {} rows for {}", fixed, device);
        }
        "stats" => {
            let stats = store.stats().await?;
            print!("{}", formatter.format_stats(&stats));
        }
        other => bail!("unknown command '{}'", other),
    }
    Ok(())
}
