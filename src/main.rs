//! Card Detector Agent CLI
//!
//! Operator console for the envelope/card detector, plus a simulated device.

use anyhow::Context;
use card_detector_agent::{
    config::{Config, ConfigStore, JsonConfigStore},
    device::{
        DeviceConfig, DeviceController, DeviceTiming, ManualSource, Sample, ScriptedSource,
        Simulator, Smoother,
    },
    host::{
        create_shared_counters, create_shared_counters_with_persistence, read_persisted_total,
        CommandSink, FileLogSink, HostReconciler, MemoryLogSink, Notification, OperatorAction,
    },
    session::{
        pipe, MemoryConnector, PortTarget, SerialConnector, SerialTransport, SessionEvent,
        SessionManager, SessionTiming,
    },
    DeviceEvent, VERSION,
};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "card-detector")]
#[command(version = VERSION)]
#[command(about = "Envelope/card pass validation over a serial sensor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the device and run the operator console
    Start {
        /// Serial port (overrides the configured one)
        #[arg(long)]
        port: Option<String>,

        /// Baud rate (overrides the configured one)
        #[arg(long)]
        baud: Option<u32>,
    },

    /// Run a simulated device on a serial port
    Simulate {
        /// Serial port the simulated device listens on
        #[arg(long)]
        port: String,

        /// Baud rate
        #[arg(long, default_value = "115200")]
        baud: u32,

        /// Smoothing factor in (0, 1]; 1.0 disables smoothing
        #[arg(long, default_value = "1.0", value_parser = parse_alpha)]
        alpha: f32,
    },

    /// Run the console against a simulated device in this process
    Demo,

    /// Show counters and the error log location
    Status,

    /// Show configuration
    Config,

    /// Validate and persist one configuration value
    Set {
        /// Configuration key (e.g. envelope_card_threshold)
        key: String,
        /// New value
        value: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port, baud } => cmd_start(port, baud),
        Commands::Simulate { port, baud, alpha } => cmd_simulate(&port, baud, alpha),
        Commands::Demo => cmd_demo(),
        Commands::Status => cmd_status(),
        Commands::Config => cmd_config(),
        Commands::Set { key, value } => cmd_set(&key, &value),
    }
}

fn parse_alpha(s: &str) -> Result<f32, String> {
    let alpha: f32 = s.parse().map_err(|e| format!("{e}"))?;
    if Smoother::checked(alpha).is_none() {
        return Err(format!("{s} is not a finite value in (0, 1]"));
    }
    Ok(alpha)
}

fn cmd_start(port: Option<String>, baud: Option<u32>) -> anyhow::Result<()> {
    let store = JsonConfigStore::default_location();
    let mut config = store.load().context("Failed to load configuration")?;
    if let Some(port) = port {
        config.serial_port = port;
    }
    if let Some(baud) = baud {
        config.baud_rate = baud;
    }
    config.validate().context("Invalid configuration")?;
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    println!("Card Detector Agent v{VERSION}");
    println!();
    match config.port_target() {
        Some(target) => println!("  Port: {target}"),
        None => println!("  Port: not configured (use `port <name>`)"),
    }
    println!("  Error log: {}", config.error_log_path().display());
    println!();
    print_help();

    let counters = create_shared_counters_with_persistence(config.counters_path());
    let log_sink = FileLogSink::new(config.error_log_path());

    let (manager, handle, events) = SessionManager::new(
        SerialConnector::default(),
        config.port_target(),
        config.device(),
        SessionTiming::default(),
    );
    let worker = manager.spawn().context("Failed to start session thread")?;

    let (mut host, notifications) = HostReconciler::new(
        handle.clone(),
        Box::new(store),
        config,
        counters,
        Box::new(log_sink),
    );

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    run_console(&mut host, &events, &notifications, &running);

    handle.shutdown();
    if worker.join().is_err() {
        eprintln!("Session thread panicked");
    }
    println!();
    println!("{}", host.counters_summary());
    Ok(())
}

fn cmd_simulate(port: &str, baud: u32, alpha: f32) -> anyhow::Result<()> {
    let target = PortTarget::new(port, baud);
    let transport = SerialTransport::open(&target, Duration::from_millis(5))
        .with_context(|| format!("Failed to open {target}"))?;

    let source = ManualSource::default();
    let controller = DeviceController::new(
        DeviceConfig::default(),
        Smoother::new(alpha),
        DeviceTiming::default(),
    );
    let mut simulator = Simulator::new(controller, source.clone(), Box::new(transport));

    println!("Simulated device on {target}");
    println!("Commands: adc <0-1023>, env on|off, quit");

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let lines = spawn_stdin_reader();
    let stdin_running = running.clone();
    thread::spawn(move || {
        for line in lines.iter() {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("adc"), Some(v)) => match v.parse::<u16>() {
                    Ok(raw) => source.set_raw(raw),
                    Err(_) => eprintln!("Not a number: {v}"),
                },
                (Some("env"), Some(v)) => source.set_envelope(matches!(v, "on" | "1")),
                (Some("quit" | "exit" | "q"), _) => break,
                (None, _) => {}
                _ => eprintln!("Unknown command: {line}"),
            }
        }
        stdin_running.store(false, Ordering::SeqCst);
    });

    simulator.run(&running).context("Serial link failed")?;
    Ok(())
}

fn cmd_demo() -> anyhow::Result<()> {
    let dir = std::env::temp_dir().join(format!("card-detector-demo-{}", uuid::Uuid::new_v4()));
    let config = Config {
        serial_port: "memory://demo".to_string(),
        data_path: dir.clone(),
        ..Config::default()
    };

    let (host_end, device_end) = pipe(Duration::from_millis(5));
    let connector = MemoryConnector::new();
    connector.attach(host_end);

    let controller = DeviceController::new(
        config.device(),
        Smoother::disabled(),
        DeviceTiming::default(),
    );
    let mut simulator = Simulator::new(
        controller,
        ScriptedSource::new(demo_script()),
        Box::new(device_end),
    );

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let device_running = running.clone();
    let device = thread::spawn(move || {
        if let Err(e) = simulator.run(&device_running) {
            tracing::warn!(error = %e, "Simulated device stopped");
        }
    });

    let timing = SessionTiming {
        boot_settle: Duration::from_millis(200),
        command_gap: Duration::from_millis(10),
        ..SessionTiming::default()
    };
    let (manager, handle, events) =
        SessionManager::new(connector, config.port_target(), config.device(), timing);
    let worker = manager.spawn().context("Failed to start session thread")?;

    let (mut host, notifications) = HostReconciler::new(
        handle.clone(),
        Box::new(JsonConfigStore::at(dir.join("config.json"))),
        config,
        create_shared_counters(),
        Box::new(MemoryLogSink::new()),
    );

    println!("Card Detector Agent v{VERSION} (demo)");
    println!("A pass, then an empty envelope. Type `resume` to clear the fault.");
    println!();
    print_help();

    run_console(&mut host, &events, &notifications, &running);

    running.store(false, Ordering::SeqCst);
    handle.shutdown();
    worker.join().ok();
    device.join().ok();
    std::fs::remove_dir_all(&dir).ok();

    println!();
    println!("{}", host.counters_summary());
    Ok(())
}

/// Idle, a good envelope, idle, an empty envelope, idle.
fn demo_script() -> Vec<Sample> {
    let idle = |n| std::iter::repeat(Sample::new(100, false)).take(n);
    let envelope = |raw, n| std::iter::repeat(Sample::new(raw, true)).take(n);

    idle(60)
        .chain(envelope(180, 4))
        .chain(envelope(260, 6))
        .chain(idle(40))
        .chain(envelope(120, 10))
        .chain(idle(1))
        .collect()
}

fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Card Detector Agent Status");
    println!("==========================");
    println!();
    println!("Configuration:");
    println!(
        "  Port: {}",
        config
            .port_target()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "not configured".to_string())
    );
    println!("  Floor value: {}", config.floor_value);
    println!("  Card threshold: {}", config.envelope_card_threshold);
    println!("  Card upper threshold: {}", config.card_upper_threshold);
    println!("  Reverse sensor: {}", config.reverse_sensor);
    println!("  System override: {}", config.system_override);
    println!("  Log verbosity: {}", config.log_verbosity);
    println!();

    match read_persisted_total(&config.counters_path()) {
        Ok(Some(total)) => println!("Total envelopes processed: {total}"),
        Ok(None) => println!("Total envelopes processed: 0"),
        Err(e) => eprintln!("Warning: Could not read counters: {e}"),
    }
    println!();

    let log_path = config.error_log_path();
    println!("Error log: {}", log_path.display());
    if let Ok(content) = std::fs::read_to_string(&log_path) {
        let lines: Vec<&str> = content.lines().collect();
        let recent = lines.iter().rev().take(10);
        for line in recent {
            println!("  {line}");
        }
    }
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
    Ok(())
}

fn cmd_set(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    config
        .set_value(key, value)
        .with_context(|| format!("Cannot set {key}"))?;
    config.save().context("Failed to save configuration")?;
    println!("{key} = {value}");
    Ok(())
}

/// Pump session events and operator input until told to stop.
fn run_console<S: CommandSink>(
    host: &mut HostReconciler<S>,
    events: &Receiver<SessionEvent>,
    notifications: &Receiver<Notification>,
    running: &AtomicBool,
) {
    let input = spawn_stdin_reader();

    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => {
                host.handle(event);
                // Keep up with a chatty device before looking at input
                for event in events.try_iter() {
                    host.handle(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                eprintln!("Session stopped unexpectedly");
                break;
            }
        }

        for notification in notifications.try_iter() {
            print_notification(&notification);
        }

        for line in input.try_iter() {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<OperatorAction>() {
                Ok(OperatorAction::Quit) => return,
                Ok(OperatorAction::Status) => print_status(host),
                Ok(OperatorAction::History) => print_history(host),
                Ok(action) => match action.apply(host) {
                    Ok(()) => println!("OK"),
                    Err(e) => eprintln!("Rejected: {e}"),
                },
                Err(e) => {
                    eprintln!("{e}");
                    print_help();
                }
            }
        }
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::ConnectionChanged { connected, detail } => {
            if *connected {
                println!("Connected: {detail}");
            } else {
                println!("Disconnected: {detail}");
            }
        }
        // Too frequent to print; shown by `status`
        Notification::TelemetryUpdated(_) => {}
        Notification::EventOccurred { event, label } => match event {
            Some(DeviceEvent::Error { .. }) => println!(">> {label} (type `resume` to clear)"),
            _ => println!(">> {label}"),
        },
        Notification::CountersChanged(snapshot) => println!(
            "   session: {}  total: {}",
            snapshot.session_count, snapshot.total_count
        ),
        Notification::HistoryChanged => {}
    }
}

fn print_status<S: CommandSink>(host: &HostReconciler<S>) {
    println!(
        "Connection: {}",
        host.connected_port().unwrap_or("disconnected")
    );
    println!("Last event: {}", host.last_event());
    if let Some(live) = host.live() {
        if live.out_of_range {
            println!("Reading: {} (FLOOR ERROR)", live.raw);
        } else {
            println!("Reading: {} ({:.2} mm)", live.raw, live.millimetres);
        }
        println!(
            "Envelope: {}  Stop: {}",
            if live.envelope { "present" } else { "absent" },
            if live.stop { "ACTIVE" } else { "clear" }
        );
    }
    let counters = host.counters();
    println!(
        "Counters: session {}  total {}",
        counters.session_count, counters.total_count
    );
}

fn print_history<S: CommandSink>(host: &HostReconciler<S>) {
    if host.history().is_empty() {
        println!("No errors logged");
        return;
    }
    for entry in host.history().entries() {
        println!("  {entry}");
    }
}

fn print_help() {
    println!("Actions: resume | floor N | thr N | upper N | reverse on|off | override on|off");
    println!("         factor F | verbosity error|info | port NAME | status | history | quit");
    println!();
}

/// Forward stdin lines to a channel so the console loop never blocks on input.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");
}

