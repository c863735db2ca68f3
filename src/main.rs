use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use telemetry_agent::config::AgentConfig;
use telemetry_agent::transport::{CooperativeTransport, DeliveryMode, ThreadedTransport, Transport};
use telemetry_agent::{DeviceCredentials, FailurePolicy, ParamType, ParamValue, Session};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const QUEUE_CAPACITY: usize = 100;

fn main() -> Result<()> {
    install_error_hooks()?;
    let config = load_config()?;
    setup_logging(config.agent.debug)?;

    let credentials = DeviceCredentials::from(&config.device);
    let settings = config.session_settings(FailurePolicy::Exit);
    let stop = shutdown_flag()?;

    info!("Starting telemetry agent in {:?} mode", config.agent.mode);
    match config.agent.mode {
        DeliveryMode::Threaded => {
            let transport = ThreadedTransport::new(QUEUE_CAPACITY, config.reconnect_delay());
            run(Session::with_settings(transport, credentials, settings), &config, &stop)
        }
        DeliveryMode::Cooperative => {
            let transport = CooperativeTransport::new(QUEUE_CAPACITY, Duration::from_millis(10));
            run(Session::with_settings(transport, credentials, settings), &config, &stop)
        }
    }
}

fn run<T: Transport>(
    mut session: Session<T, DeviceCredentials>,
    config: &AgentConfig,
    stop: &AtomicBool,
) -> Result<()> {
    let started = Instant::now();
    let rate = Arc::new(AtomicU64::new(config.agent.message_rate_secs));

    let rate_setter = rate.clone();
    let initial_rate = u32::try_from(config.agent.message_rate_secs).unwrap_or(u32::MAX);
    session.add_parameter_with_callback(
        "message_rate",
        initial_rate,
        ParamType::UInt,
        move |name, value| match value.coerce(ParamType::UInt) {
            Ok(ParamValue::UInt(secs)) if secs > 0 => {
                info!("{} set to {}s", name, secs);
                rate_setter.store(u64::from(secs), Ordering::Relaxed);
            }
            _ => warn!("Ignoring unusable {} value {}", name, value),
        },
    )?;

    session.add_command("uptime", move |_: &Value| {
        json!({"uptime": started.elapsed().as_secs()})
    });
    session.add_command("echo", |arg: &Value| arg.clone());

    session.connect()?;

    let mut last_send = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        let interval = Duration::from_secs(rate.load(Ordering::Relaxed));
        if last_send.elapsed() >= interval {
            session.add_to_payload("uptime", started.elapsed().as_secs());
            if let Err(e) = session.send_data() {
                warn!("Failed to send data: {}", e);
            }
            last_send = Instant::now();
        }

        if let Err(e) = session.poll() {
            debug!("Poll failed: {}", e);
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let status = session.status();
    info!(
        "Shutting down after {} sent / {} received messages",
        status.messages_sent, status.messages_received
    );
    session.disconnect()?;
    Ok(())
}

fn install_error_hooks() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn subscriber(level: Level) -> FmtSubscriber {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish()
}

// the configured level is unknown until the file is read
fn load_config() -> Result<AgentConfig> {
    let _guard = tracing::subscriber::set_default(subscriber(Level::INFO));
    AgentConfig::load()
}

fn setup_logging(debug: bool) -> Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing::subscriber::set_global_default(subscriber(level))
        .map_err(|e| eyre!("Failed to install logger: {}", e))
}

// Ctrl-C flips the flag from a dedicated signal thread
fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let setter = flag.clone();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| eyre!("Failed to build signal runtime: {}", e))?;

    std::thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, stopping");
                    setter.store(true, Ordering::SeqCst);
                }
            })
        })
        .map_err(|e| eyre!("Failed to spawn signal thread: {}", e))?;

    Ok(flag)
}
