use color_eyre::Result;
use slotlink::config::LinkSettings;
use slotlink::console::{ConsoleCommand, HELP};
use slotlink::link::SerialLinkController;
use slotlink::transport::serial::SerialPortProvider;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = LinkSettings::ensure_default_config(&LinkSettings::default_path()).await?;
    info!(
        "Using link settings: port={:?}, baud={}",
        settings.port_path, settings.baud_rate
    );

    let provider = Arc::new(SerialPortProvider::from_settings(&settings));
    let controller = Arc::new(SerialLinkController::new(provider, Some(settings)));

    let _status_logger = spawn_status_logger(&controller);
    let _roll_logger = spawn_roll_logger(&controller);

    if let Err(e) = controller.connect().await {
        warn!("Initial connect failed: {}", e);
    }

    println!("{}", HELP);
    run_console(&controller).await?;

    controller.disconnect().await;
    info!("Shutting down");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn run_console(controller: &SerialLinkController) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match command {
            ConsoleCommand::Connect => {
                if let Err(e) = controller.connect().await {
                    error!("Connect failed: {}", e);
                }
            }
            ConsoleCommand::Disconnect => controller.disconnect().await,
            ConsoleCommand::Win(prize) => controller.send_result(true, prize.as_deref()).await,
            ConsoleCommand::Lose => controller.send_result(false, None).await,
            ConsoleCommand::Status => println!(
                "state: {}, cooldown: {}ms",
                controller.state(),
                controller.active_cooldown().as_millis()
            ),
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => return Ok(()),
        }
    }
}

fn spawn_status_logger(controller: &SerialLinkController) -> JoinHandle<()> {
    let mut status = controller.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(status) => info!("[{}] link {}", status.timestamp.format("%H:%M:%S"), status),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} status updates", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_roll_logger(controller: &SerialLinkController) -> JoinHandle<()> {
    let mut rolls = controller.subscribe_rolls();
    tokio::spawn(async move {
        loop {
            match rolls.recv().await {
                Ok(roll) => info!(
                    "[{}] roll #{} requested, answer with 'win [prize]' or 'lose'",
                    roll.received_at.format("%H:%M:%S"),
                    roll.sequence
                ),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} roll requests", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
