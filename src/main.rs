use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use gainerbot::config::Settings;
use gainerbot::engine::{Command, Engine};
use gainerbot::execution::{LiveExecutor, OrderExecutor, SimulatedExecutor};
use gainerbot::gateway::{BinanceFuturesGateway, MarketGateway};
use gainerbot::stream::MarketStream;

/// Directional futures bot trading the daily top movers
#[derive(Parser, Debug)]
#[command(name = "gainerbot", version)]
struct Args {
    /// Place real orders (overrides BOT_LIVE_TRADING)
    #[arg(long, conflicts_with = "sim")]
    live: bool,
    /// Force simulated fills (overrides BOT_LIVE_TRADING)
    #[arg(long)]
    sim: bool,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gainerbot=info".into()),
        )
        .init();
}

/// Forward operator hotkeys to the control loop: `p` toggles the scan,
/// `x` force-closes the open position, `!` halts for the day.
async fn hotkey_loop(tx: mpsc::Sender<Command>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1];
    loop {
        match stdin.read(&mut buf).await {
            Ok(1) => {
                let cmd = match buf[0] {
                    b'p' => Some(Command::TogglePause),
                    b'x' => Some(Command::ForceClose),
                    b'!' => Some(Command::HaltToday),
                    _ => None,
                };
                if let Some(cmd) = cmd {
                    if tx.send(cmd).await.is_err() {
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Hotkey input closed: {e}");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut settings = Settings::load().context("loading settings")?;
    if args.live {
        settings.live_trading = true;
    }
    if args.sim {
        settings.live_trading = false;
    }
    settings.validate().context("validating settings")?;

    tracing::info!(
        mode = if settings.live_trading { "LIVE" } else { "SIM" },
        testnet = settings.testnet,
        "Starting gainerbot"
    );

    let gateway: Arc<dyn MarketGateway> = Arc::new(BinanceFuturesGateway::new(
        settings.testnet,
        settings.api_key.clone(),
        settings.api_secret.clone(),
    ));

    // Startup preconditions: the rule table must load, and live mode must
    // be able to read the account balance
    let rules = gateway
        .exchange_rules()
        .await
        .context("fetching exchange rules at startup")?;
    tracing::info!(symbols = rules.len(), "Exchange rules loaded");

    let initial_equity = if settings.live_trading {
        let balance = gateway
            .balance_usdt()
            .await
            .context("fetching initial balance")?;
        tracing::info!(balance, "Initial balance fetched");
        balance
    } else {
        tracing::info!(equity = settings.start_equity, "Simulation equity");
        settings.start_equity
    };

    let stream = Arc::new(MarketStream::new(settings.testnet));
    let executor: Arc<dyn OrderExecutor> = if settings.live_trading {
        Arc::new(LiveExecutor::with_timing(
            gateway.clone(),
            std::time::Duration::from_secs(settings.order_timeout_s),
            std::time::Duration::from_secs(2),
        ))
    } else {
        Arc::new(SimulatedExecutor::new(stream.clone(), gateway.clone()))
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    tokio::spawn(hotkey_loop(cmd_tx));

    let mut engine = Engine::new(
        settings,
        gateway,
        stream.clone(),
        executor,
        cmd_rx,
        initial_equity,
    );

    tokio::select! {
        result = engine.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, shutting down");
        }
    }

    stream.stop().await;
    tracing::info!("Bot stopped");
    Ok(())
}
