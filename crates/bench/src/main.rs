//! usb-bench
//!
//! Throughput benchmark for devices running the USB benchmark firmware.
//! Selects the firmware test, streams data on the test endpoints and prints
//! running rates until a key is pressed or a worker gives up.

use anyhow::{Context, Result};
use bench::config::{BenchConfig, TransferMode};
use bench::device::{BenchDevice, list_devices};
use bench::display::{self, Command, Console, KEY_HELP};
use bench::firmware::{self, TestType};
use bench::runner::{self, RunningTest};
use bench::stats::TransferStats;
use clap::Parser;
use common::setup_logging;
use rusb::Context as UsbContext;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use xfer::libusb::LibusbEvents;
use xfer::{Session, SessionOptions};

#[derive(Parser, Debug)]
#[command(name = "usb-bench")]
#[command(
    author,
    version,
    about = "USB benchmark - Measure read/write throughput of a benchmark device"
)]
#[command(long_about = "
Measures bulk, interrupt and isochronous throughput against a device running
the USB benchmark firmware. The firmware is switched into the requested test
with a vendor request before the transfers start.

EXAMPLES:
    # Loop test on the default 0666:0001 device
    usb-bench

    # Read test with 4 transfers in flight
    usb-bench --test-type read --buffer-count 4

    # Pick the device from a list and verify the looped data
    usb-bench --list --verify

    # Run for 30 seconds without a terminal
    usb-bench --duration 30

CONFIGURATION:
    Settings are read from the following locations, in order:
    1. Path specified with --config
    2. ~/.config/usb-bench/bench.toml
    3. ./bench.toml
    4. Built-in defaults
    Command line options override the file.

KEYS (while the test is running):
    Q  quit    T  test details    I  transfer counters    R  reset averages
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save the effective configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// List devices and pick one interactively
    #[arg(long)]
    list: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Vendor id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Product id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Interface number
    #[arg(short, long)]
    interface: Option<u8>,

    /// Alternate setting
    #[arg(long)]
    alt: Option<u8>,

    /// Endpoint number (hex); 0 picks the first endpoint of each direction
    #[arg(short, long, value_parser = parse_hex_u8)]
    endpoint: Option<u8>,

    /// Test to run
    #[arg(short, long, value_enum)]
    test_type: Option<TestType>,

    /// Transfer mode (sync, async)
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<TransferMode>,

    /// Bytes per transfer
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Transfers kept in flight per endpoint (more than 1 implies async)
    #[arg(long)]
    buffer_count: Option<usize>,

    /// Isochronous packet size (defaults to the endpoint's wMaxPacketSize)
    #[arg(long)]
    iso_packet_size: Option<usize>,

    /// Display refresh interval in milliseconds
    #[arg(long, value_name = "MS")]
    refresh: Option<u64>,

    /// Transfer timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Failed transfers tolerated before a worker stops
    #[arg(long)]
    retry: Option<u32>,

    /// Verify received data against the firmware's pattern
    #[arg(long)]
    verify: bool,

    /// Log every mismatching byte
    #[arg(long)]
    verify_details: bool,

    /// Do not send the test select request
    #[arg(long)]
    no_test_select: bool,

    /// Stop the test after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut BenchConfig) {
        let device = &mut config.device;
        let test = &mut config.test;

        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(vid) = self.vid {
            device.vid = vid;
        }
        if let Some(pid) = self.pid {
            device.pid = pid;
        }
        if let Some(interface) = self.interface {
            device.interface = interface;
        }
        if let Some(alt) = self.alt {
            device.alt_setting = alt;
        }
        if let Some(endpoint) = self.endpoint {
            device.endpoint = endpoint;
        }
        device.no_test_select |= self.no_test_select;

        if let Some(test_type) = self.test_type {
            test.test_type = test_type;
        }
        if let Some(mode) = self.mode {
            test.mode = mode;
        }
        if let Some(size) = self.buffer_size {
            test.buffer_size = size;
        }
        if let Some(count) = self.buffer_count {
            test.buffer_count = count;
        }
        if let Some(size) = self.iso_packet_size {
            test.iso_packet_size = size;
        }
        if let Some(refresh) = self.refresh {
            test.refresh_ms = refresh;
        }
        if let Some(timeout) = self.timeout {
            test.timeout_ms = timeout;
        }
        if let Some(retry) = self.retry {
            test.retry = retry;
        }
        test.verify |= self.verify || self.verify_details;
        test.verify_details |= self.verify_details;
    }
}

fn parse_hex_u16(s: &str) -> std::result::Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_hex_u8(s: &str) -> std::result::Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_mode(s: &str) -> std::result::Result<TransferMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "sync" => Ok(TransferMode::Sync),
        "async" => Ok(TransferMode::Async),
        _ => Err(format!("invalid transfer mode '{}', expected sync or async", s)),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(ref path) = args.config {
        BenchConfig::load(Some(BenchConfig::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        BenchConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if args.save_config {
        let path = BenchConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    setup_logging(&config.log_level).context("Failed to setup logging")?;

    info!("usb-bench v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.log_level);

    let events = Arc::new(LibusbEvents::new().context("Failed to initialize libusb")?);
    let context = events.context().clone();
    let session = Session::new(events, SessionOptions::default());

    let duration = args.duration.map(Duration::from_secs);
    let result = run_bench(&mut config, &session, &context, args.list, duration);

    info!("Shutting down transfer engine...");
    session.shutdown();
    result
}

fn run_bench(
    config: &mut BenchConfig,
    session: &Session,
    context: &UsbContext,
    list: bool,
    duration: Option<Duration>,
) -> Result<()> {
    let device = if list {
        match select_device(context, config)? {
            Some(device) => device,
            None => return Ok(()),
        }
    } else {
        BenchDevice::open(
            context,
            config.device.vid,
            config.device.pid,
            config.device.interface,
            config.device.alt_setting,
        )?
    };
    config.device.vid = device.vid;
    config.device.pid = device.pid;
    config.device.interface = device.interface;
    config.device.alt_setting = device.alt_setting;

    device.configure().context("Failed configuring device")?;
    let result = run_test(config, session, &device, duration);
    device.release();
    result
}

/// List mode: print every device and read the user's pick from stdin
fn select_device(context: &UsbContext, config: &BenchConfig) -> Result<Option<BenchDevice>> {
    let mut listings = list_devices(context)?;

    for (index, listing) in listings.iter().enumerate() {
        println!("{}. {}", index + 1, listing);
    }
    print!("Select device (1-{}): ", listings.len());
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let selection = match line.trim().parse::<usize>() {
        Ok(n) if (1..=listings.len()).contains(&n) => n - 1,
        _ => {
            println!("Invalid device selection");
            return Ok(None);
        }
    };

    let listing = listings.swap_remove(selection);
    let device = BenchDevice::open_listed(
        &listing,
        config.device.interface,
        config.device.alt_setting,
    )?;
    info!("Selected {}", listing);
    Ok(Some(device))
}

fn run_test(
    config: &BenchConfig,
    session: &Session,
    device: &BenchDevice,
    duration: Option<Duration>,
) -> Result<()> {
    let io = device.io();

    if !config.device.no_test_select {
        firmware::set_test_type(session, io.as_ref(), device.interface, config.test.test_type)
            .context("Failed selecting the firmware test")?;
    }
    if config.test.test_type == TestType::None {
        println!("Firmware test set to none, nothing to transfer");
        return Ok(());
    }

    let plan = runner::plan_test(config, session, io, &device.endpoints)?;
    let mode = plan.mode;

    print!("{}", display::format_test_info(config, mode));
    for endpoint in [&plan.read, &plan.write].into_iter().flatten() {
        print!(
            "{}",
            display::format_transfer_info(&endpoint.info, &TransferStats::new())
        );
    }
    println!();
    println!("{}", KEY_HELP);

    let console = Console::new();
    if console.is_interactive() {
        println!("Press any key to start, 'Q' to quit");
        if let Some(key) = console.wait_key()
            && Command::from_char(key) == Command::Quit
        {
            return Ok(());
        }
    } else if duration.is_none() {
        warn!("No terminal attached, the test runs until a worker stops");
    }

    let mut test = RunningTest::start(plan, config).context("Failed to start worker threads")?;
    let user_aborted = monitor(&test, &console, config, mode, duration);
    test.stop(user_aborted);

    println!();
    print!("{}", display::format_test_info(config, mode));
    print!("{}", test.transfer_info());
    Ok(())
}

/// Print status until the user quits, the duration expires or a worker stops
///
/// Returns whether the user asked to quit.
fn monitor(
    test: &RunningTest,
    console: &Console,
    config: &BenchConfig,
    mode: TransferMode,
    duration: Option<Duration>,
) -> bool {
    let deadline = duration.map(|d| Instant::now() + d);

    loop {
        if test.any_stopped() {
            error!("A worker stopped, ending the test");
            return false;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Test duration reached");
            return false;
        }

        match console.poll_key(config.test.refresh()).map(Command::from_char) {
            Some(Command::Quit) => return true,
            Some(Command::TestInfo) => print!("{}", display::format_test_info(config, mode)),
            Some(Command::TransferInfo) => print!("{}", test.transfer_info()),
            Some(Command::ResetAverages) => {
                test.reset_averages();
                println!("Averages reset");
            }
            Some(Command::Other) | None => {}
        }

        if let Some(status) = test.status_line() {
            println!("{}", status);
        }
    }
}
