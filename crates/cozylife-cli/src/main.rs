use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use cozylife_core::{
    CoordinatorConfig, CoordinatorStatus, Endpoint, PollState, PollingCoordinator, QueryMode,
    SwitchDriver, TcpDeviceClient, DEFAULT_PORT,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod viewer;

#[derive(Debug, Parser)]
#[command(name = "cozylifed")]
#[command(about = "CozyLife smart plug control and power monitor")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = 3000)]
    connect_timeout_ms: u64,

    #[arg(long, default_value_t = 2000)]
    read_timeout_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    retry_delay_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    interval_ms: u64,

    #[arg(long, default_value_t = 5000)]
    refresh_timeout_ms: u64,

    #[arg(long, default_value_t = 5)]
    failure_threshold: u32,

    /// Send the legacy `[0]` query instead of the explicit attribute list.
    #[arg(long)]
    query_all: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    Test,
    Info,
    On {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Off {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Query {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    #[command(alias = "watch")]
    Run {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    View {
        #[arg(long, default_value_t = 600.0)]
        window_sec: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let endpoint = Endpoint::new(cli.host.clone())
        .with_port(cli.port)
        .with_connect_timeout(Duration::from_millis(cli.connect_timeout_ms))
        .with_read_timeout(Duration::from_millis(cli.read_timeout_ms))
        .with_retry_delay(Duration::from_millis(cli.retry_delay_ms))
        .with_query_mode(if cli.query_all {
            QueryMode::All
        } else {
            QueryMode::Attributes
        });
    endpoint.validate()?;

    let config = CoordinatorConfig {
        poll_interval: Duration::from_millis(cli.interval_ms),
        refresh_timeout: Duration::from_millis(cli.refresh_timeout_ms),
        failure_threshold: cli.failure_threshold,
    };
    config.validate()?;

    let name = endpoint.to_string();
    let client = Arc::new(TcpDeviceClient::new(endpoint));

    match cli.command {
        Command::Test => {
            let ok = client.test_connection().await;
            println!("{}", serde_json::json!({"device": name, "reachable": ok}));
            if !ok {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Info => {
            let Some(info) = client.device_info().await else {
                warn!(device = %name, "no INFO reply");
                return Ok(ExitCode::FAILURE);
            };
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::On { format } => {
            let coordinator = PollingCoordinator::new(client, config, name);
            return switch(&coordinator, true, format).await;
        }
        Command::Off { format } => {
            let coordinator = PollingCoordinator::new(client, config, name);
            return switch(&coordinator, false, format).await;
        }
        Command::Query { format } => {
            let coordinator = PollingCoordinator::new(client, config, name);
            let result = coordinator.refresh().await;
            print_status(&coordinator.status(), format)?;
            if result.is_err() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Run { format } => {
            let coordinator = PollingCoordinator::new(client, config, name);
            stream_loop(&coordinator, format).await?;
        }
        Command::View { window_sec } => {
            let coordinator = PollingCoordinator::new(client, config, name);
            viewer::run_viewer(&coordinator, window_sec).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn switch<D: SwitchDriver>(
    coordinator: &PollingCoordinator<D>,
    on: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    let ok = coordinator.set_power(on).await;
    print_status(&coordinator.status(), format)?;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn stream_loop<D: SwitchDriver>(
    coordinator: &PollingCoordinator<D>,
    format: OutputFormat,
) -> Result<()> {
    let mut updates = coordinator.subscribe();
    let poller = coordinator.run();
    tokio::pin!(poller);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            () = &mut poller => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = updates.borrow_and_update().clone();
                if status.state == PollState::Polling {
                    continue;
                }
                print_status(&status, format)?;
                info!(available = %status.available, failures = %status.consecutive_failures, state = ?status.state, "tick");
            }
        }
    }

    Ok(())
}

fn print_status(status: &CoordinatorStatus, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(status)?);
        }
        OutputFormat::Ndjson => {
            println!("{}", serde_json::to_string(status)?);
        }
        OutputFormat::Human => {
            println!("=== CozyLife Plug ===");
            println!("Device:     {}", status.device);
            println!(
                "State:      available={} failures={}/{} poll={:?} poll_ms={}",
                status.available,
                status.consecutive_failures,
                status.failure_threshold,
                status.state,
                status.quality.last_poll_ms,
            );
            if let Some(err) = &status.last_error {
                println!("Last error: {err}");
            }

            match &status.snapshot {
                Some(snapshot) => {
                    println!("Sampled:    {}", snapshot.ts.to_rfc3339());
                    println!("Switch:     {}", if snapshot.on { "on" } else { "off" });
                    println!("  {:<12} {:>8.1} W", "Power", snapshot.power);
                    println!("  {:<12} {:>8.3} A", "Current", snapshot.current);
                    println!("  {:<12} {:>8.1} V", "Voltage", snapshot.voltage);
                }
                None => println!("Snapshot:   none yet"),
            }

            println!(
                "Polls:      ok={} err={} skipped={}",
                status.quality.polls_ok, status.quality.polls_err, status.quality.polls_skipped
            );
        }
    }

    Ok(())
}
