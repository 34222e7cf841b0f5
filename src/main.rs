use anyhow::{bail, Context};
use clap::Parser;
use ebus_rs::catalog::{csv, MessageMap};
use ebus_rs::ebus::address::is_master;
use ebus_rs::ebus::device::{create_device, RawControl};
use ebus_rs::ebus::handler::{BusConfig, BusHandler, BusWorker};
use ebus_rs::net::{http, server, CommandContext};
use ebus_rs::init_logger;
use log::{error, info};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Daemon for communication with eBUS heating systems.
#[derive(Parser)]
#[command(name = "ebusd")]
#[command(version, about)]
struct Args {
    /// Serial device or tcp:host:port of the bus adapter
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    device: String,

    /// Send an ESC symbol right after opening the device
    #[arg(long)]
    initsend: bool,

    /// Own master address (hex)
    #[arg(short, long, default_value = "ff")]
    address: String,

    /// Answer requests addressed to our own master/slave address
    #[arg(long)]
    answer: bool,

    /// Maximum time for bus acquisition in microseconds
    #[arg(long, default_value_t = ebus_rs::constants::BUS_ACQUIRE_TIMEOUT)]
    acquiretimeout: u64,

    /// Number of retries for acquiring the bus
    #[arg(long, default_value_t = ebus_rs::constants::BUS_LOST_RETRIES)]
    acquireretries: u32,

    /// Number of retries for failed sends
    #[arg(long, default_value_t = ebus_rs::constants::FAILED_SEND_RETRIES)]
    sendretries: u32,

    /// Maximum time an addressed slave may take to answer, in microseconds
    #[arg(long, default_value_t = ebus_rs::constants::SLAVE_RECV_TIMEOUT)]
    receivetimeout: u64,

    /// Extra transfer latency in microseconds
    #[arg(long, default_value_t = 0)]
    latency: u64,

    /// Number of SYN symbols to wait after lost arbitration (0 = auto)
    #[arg(long, default_value_t = 0)]
    lockcount: u32,

    /// Generate AUTO-SYN symbols on an idle bus
    #[arg(long)]
    generatesyn: bool,

    /// Poll interval in seconds (0 disables polling)
    #[arg(long, default_value_t = ebus_rs::constants::POLL_INTERVAL)]
    pollinterval: u64,

    /// Directory with the message catalog CSV files
    #[arg(short, long)]
    configpath: Option<PathBuf>,

    /// Automatically load per-slave configuration for scanned participants
    #[arg(long)]
    scanconfig: bool,

    /// Allow raw hex sending via the HEX command
    #[arg(long)]
    enablehex: bool,

    /// Port for the text client protocol
    #[arg(short, long, default_value_t = 8888)]
    port: u16,

    /// Port for the HTTP interface (0 disables it)
    #[arg(long, default_value_t = 0)]
    httpport: u16,

    /// Listen on the loopback interface only
    #[arg(long)]
    localhost: bool,

    /// Log every raw byte sent and received
    #[arg(long)]
    lograwdata: bool,

    /// Dump received bytes to the dump file
    #[arg(long)]
    dump: bool,

    /// Path of the raw dump file
    #[arg(long, default_value = "/tmp/ebus_dump.bin")]
    dumpfile: String,

    /// Maximum size of the raw dump file in kB before rotation
    #[arg(long, default_value_t = 100)]
    dumpsize: u64,
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Args::parse();

    let own_master = u8::from_str_radix(&args.address, 16)
        .context("invalid own address")?;
    if !is_master(own_master) {
        bail!("own address {own_master:02x} is not a master address");
    }

    let mut map = MessageMap::new(false);
    if let Some(config_path) = &args.configpath {
        let count = csv::load_config_dir(&mut map, config_path)
            .with_context(|| format!("unable to read configuration from {}", config_path.display()))?;
        info!("main: read {count} messages from {}", config_path.display());
    }
    let messages = Arc::new(RwLock::new(map));

    let raw = RawControl::new();
    raw.set_log_raw(args.lograwdata);
    raw.set_dump_raw(args.dump);
    let mut device = create_device(
        &args.device,
        args.initsend,
        raw.clone(),
        Some(args.dumpfile.clone()),
        args.dumpsize,
    );
    device.open().with_context(|| format!("unable to open {}", args.device))?;
    info!("main: opened {}", args.device);

    let cfg = BusConfig {
        own_master,
        answer: args.answer,
        bus_lost_retries: args.acquireretries,
        failed_send_retries: args.sendretries,
        transfer_latency: args.latency,
        bus_acquire_timeout: args.acquiretimeout,
        slave_recv_timeout: args.receivetimeout,
        lock_count: args.lockcount,
        generate_syn: args.generatesyn,
        poll_interval: args.pollinterval,
    };
    let handler = BusHandler::new(cfg, messages);
    let worker_handler = handler.clone();
    let worker = std::thread::Builder::new()
        .name("bushandler".to_string())
        .spawn(move || {
            let mut worker = BusWorker::new(worker_handler, device);
            worker.run();
        })
        .context("unable to start bus handler thread")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let ctx = CommandContext {
        handler: handler.clone(),
        raw,
        enable_hex: args.enablehex,
        config_path: args.configpath.clone(),
        shutdown: shutdown.clone(),
    };
    server::start(ctx.clone(), args.port, args.localhost)
        .with_context(|| format!("unable to listen on port {}", args.port))?;
    if args.httpport != 0 {
        http::start(ctx.clone(), args.httpport, args.localhost)
            .with_context(|| format!("unable to listen on http port {}", args.httpport))?;
    }

    run_main_loop(&args, &handler, &shutdown);

    handler.stop();
    let _ = worker.join();
    info!("main: shutdown");
    Ok(())
}

/// Periodic housekeeping: with `--scanconfig` walk the participant table,
/// scan newly seen slaves, and load their configuration files.
fn run_main_loop(args: &Args, handler: &Arc<BusHandler>, shutdown: &Arc<AtomicBool>) {
    let mut last_scan_address: u8 = 0;
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(1));
        if !args.scanconfig || !handler.has_signal() {
            continue;
        }
        let Some((address, scanned)) = handler.next_scan_address(last_scan_address) else {
            last_scan_address = 0;
            continue;
        };
        last_scan_address = address;
        if !scanned {
            if let Err(e) = handler.scan_and_wait(address) {
                error!("main: scan config {address:02x}: {e}");
                continue;
            }
            info!("main: scan config {address:02x} message received");
        }
        // per-slave files live below the configuration directory so the
        // initial load does not pick them up twice
        let file = args
            .configpath
            .as_ref()
            .map(|path| path.join("scanconfig").join(format!("{address:02x}.csv")))
            .filter(|path| path.exists());
        match file {
            None => handler.set_scan_config_loaded(address, None),
            Some(path) => {
                let loaded = {
                    let mut map = handler.messages().write().unwrap();
                    let templates = csv::Templates::new();
                    csv::load_file(&mut map, &templates, &path)
                };
                match loaded {
                    Ok(count) => {
                        info!(
                            "main: loaded {} ({count} messages) for {address:02x}",
                            path.display()
                        );
                        handler.set_scan_config_loaded(
                            address,
                            path.file_name().and_then(|n| n.to_str()),
                        );
                    }
                    Err(e) => {
                        error!("main: unable to load {}: {e}", path.display());
                        handler.set_scan_config_loaded(address, None);
                    }
                }
            }
        }
    }
}
