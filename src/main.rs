//! Kiosk cash - coin/bill acceptance and change dispensing
//!
//! Drives the cash subsystem against simulated hardware so a full checkout
//! can be exercised without a kiosk attached.
//!
//! Module structure:
//! - `domain/` - Money and event types (Denomination, ChangeResult, Settlement)
//! - `hal/` - GPIO registry and the simulated backend
//! - `services/` - Pulse decoding, channels, payment session, dispenser
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiosk_cash::domain::{ChannelKind, Settlement};
use kiosk_cash::hal::{sim, Level, Pin, PulseInjector, SimHopperConfig};
use kiosk_cash::infra::{Config, Metrics, SensorLevel};
use kiosk_cash::services::{ChangeDispenser, DispenserConfig, PaymentSession};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Kiosk cash subsystem
#[derive(Parser, Debug)]
#[command(name = "kiosk-cash", version, about)]
struct Args {
    /// Path to TOML configuration file [default: $CONFIG_FILE or config/dev.toml]
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one customer checkout with scripted insertions
    Checkout {
        /// Amount the customer has to pay
        #[arg(long)]
        amount: Decimal,
        /// Pulse burst to inject, e.g. `bill:2` or `coin:4`; repeatable
        #[arg(long = "insert")]
        inserts: Vec<Insertion>,
        /// Give up on the customer after this long
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Pay out an amount from the hoppers
    Dispense {
        #[arg(long)]
        amount: Decimal,
        /// Coins loaded in each simulated hopper (unlimited if omitted)
        #[arg(long)]
        stock: Option<u32>,
    },
}

/// One scripted money insertion
#[derive(Debug, Clone, Copy)]
struct Insertion {
    channel: ChannelKind,
    pulses: u32,
}

impl FromStr for Insertion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, pulses) =
            s.split_once(':').ok_or_else(|| format!("expected <coin|bill>:<pulses>, got '{s}'"))?;
        let channel = match kind {
            "coin" => ChannelKind::Coin,
            "bill" => ChannelKind::Bill,
            other => return Err(format!("unknown channel '{other}'")),
        };
        let pulses = pulses.parse().map_err(|e| format!("bad pulse count '{pulses}': {e}"))?;
        Ok(Self { channel, pulses })
    }
}

/// Gap between pulses inside one insertion
const PULSE_SPACING: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "kiosk-cash starting");
    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        coin_pin = %config.coin_pin(),
        coin_policy = %config.coin_policy().as_str(),
        bill_pin = %config.bill_pin(),
        hoppers = %config.hopper_units().len(),
        "config_loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let (registry, injector) = sim::simulated();

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Ctrl+C ends a checkout early; the session still settles
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    match args.command {
        Command::Checkout { amount, inserts, timeout_secs } => {
            let session = PaymentSession::from_config(&config, &registry, metrics.clone())
                .context("Failed to bring up payment session")?;
            attach_hoppers(&injector, &config, None);

            let outcome =
                run_checkout(&session, &injector, &config, amount, &inserts, timeout_secs, shutdown_rx)
                    .await;
            session.cleanup().await;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
        Command::Dispense { amount, stock } => {
            let dispenser = ChangeDispenser::new(
                DispenserConfig::from_config(&config),
                registry.clone(),
                metrics.clone(),
            )
            .context("Failed to initialize change dispenser")?;
            attach_hoppers(&injector, &config, stock);

            let result = dispenser
                .dispense(amount, |p| info!(progress = %p, "dispense_progress"))
                .await;
            dispenser.cleanup();
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    metrics.report().log();
    info!("kiosk-cash shutdown complete");
    Ok(())
}

async fn run_checkout(
    session: &PaymentSession,
    injector: &PulseInjector,
    config: &Config,
    amount: Decimal,
    inserts: &[Insertion],
    timeout_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Settlement> {
    session.start(amount);

    // Feed the script one insertion at a time, leaving each burst its quiet
    // period before the next starts
    let mut script = Vec::with_capacity(inserts.len());
    for insertion in inserts {
        let channel = session
            .channel(insertion.channel)
            .with_context(|| format!("{} channel is disabled", insertion.channel))?;
        let quiet = match insertion.channel {
            ChannelKind::Coin => config.coin_quiet_period_ms(),
            ChannelKind::Bill => config.bill_quiet_period_ms(),
        };
        script.push((channel.pin(), insertion.pulses, Duration::from_millis(quiet + 200)));
    }
    let feeder = {
        let injector = injector.clone();
        tokio::spawn(async move {
            for (pin, pulses, settle) in script {
                if let Err(e) = injector.inject_burst(pin, pulses, PULSE_SPACING).await {
                    warn!(pin = %pin, error = %e, "insertion_failed");
                }
                tokio::time::sleep(settle).await;
            }
        })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.session_poll_interval_ms().max(1)));
    let mut last_amount = Decimal::ZERO;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                warn!("checkout_interrupted");
                break;
            }
        }

        let current = session.poll();
        if current != last_amount {
            info!(received = %current, required = %amount, "amount_updated");
            last_amount = current;
        }
        if session.is_complete() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(received = %current, required = %amount, "checkout_timeout");
            break;
        }
    }
    feeder.abort();

    Ok(session.stop_and_settle().await)
}

/// Run a simulated hopper behind every configured motor/sensor pair
fn attach_hoppers(injector: &PulseInjector, config: &Config, stock: Option<u32>) {
    let coin_present = match config.hopper_coin_present() {
        SensorLevel::High => Level::High,
        SensorLevel::Low => Level::Low,
    };
    for unit in config.hopper_units() {
        injector.attach_hopper(
            Pin(unit.motor_pin),
            Pin(unit.sensor_pin),
            SimHopperConfig { stock, coin_present, ..Default::default() },
        );
    }
}
