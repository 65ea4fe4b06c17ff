//! Entry point for the devwatch CLI
use anyhow::Context;
use clap::Parser;
use device_watcher::common::{install_logger, APP_NAME};
use device_watcher::{
    BindPolicy, DeviceClass, DeviceEvent, DeviceEventReceiver, DeviceWatcher, WatcherConfig,
};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
    /// Also write the log to a file in the local data directory
    #[arg(long)]
    log_to_disk: bool,
    /// Override the config file path
    #[arg(long)]
    config: Option<PathBuf>,
    /// Treat `bind` uevents as the canonical attach signal instead of `add`
    #[arg(long)]
    bind_is_add: bool,
    /// Device interface class GUID to watch (Windows only)
    #[arg(long)]
    class: Option<DeviceClass>,
    /// Print events as JSON lines on stdout instead of logging them
    #[arg(long)]
    json: bool,
}

/// Logs each event as it arrives
struct LogReceiver;

impl DeviceEventReceiver for LogReceiver {
    fn on_device_event(&self, event: &DeviceEvent) {
        log::info!("{} {}", event.action, event.device);
    }
}

/// Prints each event as a JSON line, for piping into other tools
struct JsonReceiver;

impl DeviceEventReceiver for JsonReceiver {
    fn on_device_event(&self, event: &DeviceEvent) {
        println!("{}", serde_json::to_string(event).unwrap());
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    log::info!(
        "Starting {}, version: {}",
        APP_NAME,
        env!("CARGO_PKG_VERSION")
    );
    let mut config = match &args.config {
        Some(path) => WatcherConfig::load(path)
            .context("Unable to load config file")?
            .context("Config file does not exist")?,
        None => WatcherConfig::default(),
    };
    if args.bind_is_add {
        config.bind_policy = BindPolicy::BindIsCanonical;
    }
    if let Some(class) = args.class {
        config.device_class = class;
    }

    let watcher = DeviceWatcher::new(config);
    if args.json {
        watcher.subscribe(Arc::new(JsonReceiver));
    } else {
        watcher.subscribe(Arc::new(LogReceiver));
    }
    watcher
        .start()
        .context("Unable to start the device watcher")?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || tx.send(()).unwrap()).expect("Error setting Ctrl-C handler");
    rx.recv().expect("Could not receive from channel.");
    watcher.stop();
    Ok(())
}

fn main() {
    let args: Args = Args::parse();
    if let Err(e) = install_logger(args.debug, args.log_to_disk) {
        eprintln!("Unable to install logger: {:#}", e);
        std::process::exit(1);
    }
    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
