use std::process::exit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;

use shimmer_rs::logging::init_rust_logging;
use shimmer_rs::{
    BluetoothConnector, ChannelType, DeviceStatus, DockFirmwareInfo, DockOptions, FirmwareType,
    FirmwareVersion, HardwareVersion, SerialConfig, ShimmerBluetooth, ShimmerDock,
    ShimmerOptions,
};

#[derive(Parser, Debug)]
#[command(name = "shimmer-demo", about = "Connect to a Shimmer3 and stream samples")]
struct Args {
    /// Serial port speaking the Bluetooth protocol (e.g. /dev/rfcomm0)
    #[arg(long, conflicts_with = "mac")]
    serial: Option<String>,
    /// Bluetooth MAC address (e.g. 00:06:66:XX:XX:XX)
    #[arg(long)]
    mac: Option<String>,
    /// Pairing PIN code
    #[arg(long, default_value = "1234")]
    pin: String,
    /// Seconds to stream before stopping
    #[arg(long, default_value_t = 5)]
    stream_secs: u64,
    /// Keep the status ACK preamble enabled
    #[arg(long)]
    keep_status_ack: bool,
    /// Print device info and samples as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Query a docked Shimmer over the dock UART
    Dock {
        /// Dock serial port (e.g. /dev/ttyUSB0)
        path: String,
    },
}

#[derive(Serialize)]
struct DockReport {
    mac: String,
    firmware: DockFirmwareInfo,
    rtc: f64,
}

#[derive(Serialize)]
struct DeviceReport {
    name: String,
    hardware: HardwareVersion,
    firmware_type: FirmwareType,
    firmware_version: FirmwareVersion,
    sampling_rate: f64,
    battery_percent: f64,
    status: DeviceStatus,
    channels: Vec<ChannelType>,
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match &args.command {
        Some(Cmd::Dock { path }) => run_dock(path, args.json),
        None => run_bluetooth(&args),
    }
}

fn run_dock(path: &str, json: bool) -> Result<()> {
    let mut dock = ShimmerDock::open(&SerialConfig::new(path), DockOptions::default())
        .with_context(|| format!("opening dock at {path}"))?;

    let mac = dock.get_mac_address().context("reading MAC address")?;
    let report = DockReport {
        mac: mac
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":"),
        firmware: dock.get_firmware_version().context("reading firmware version")?,
        rtc: dock.get_rtc().context("reading RTC")?,
    };

    if json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }
    println!("MAC: {}", report.mac);
    println!(
        "Hardware: {} | Firmware: {:?} {}",
        report.firmware.hw_version, report.firmware.fw_type, report.firmware.version
    );
    println!("RTC: {:.3} s", report.rtc);
    Ok(())
}

fn run_bluetooth(args: &Args) -> Result<()> {
    let options = ShimmerOptions {
        disable_status_ack: !args.keep_status_ack,
    };
    let shimmer = match (&args.serial, &args.mac) {
        (Some(path), _) => {
            let port = SerialConfig::new(path.as_str())
                .open()
                .with_context(|| format!("opening {path}"))?;
            ShimmerBluetooth::new(port, options)?
        }
        (None, Some(mac)) => {
            info!("connecting to {mac}");
            let stream = BluetoothConnector::default()
                .connect(mac, &args.pin)
                .with_context(|| format!("connecting to {mac}"))?;
            ShimmerBluetooth::new(stream, options)?
        }
        (None, None) => bail!("either --serial or --mac is required"),
    };

    shimmer.initialize().context("initializing device")?;
    let (firmware_type, firmware_version) = shimmer.get_firmware_version()?;
    let report = DeviceReport {
        name: shimmer.get_device_name()?,
        hardware: shimmer.hardware_version()?,
        firmware_type,
        firmware_version,
        sampling_rate: shimmer.get_sampling_rate()?,
        battery_percent: shimmer.get_battery_state(true)?,
        status: shimmer.get_status()?,
        channels: shimmer.get_data_types()?,
    };
    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!(
            "Connected: {} ({:?}, {:?} {})",
            report.name, report.hardware, report.firmware_type, report.firmware_version
        );
        println!(
            "Sampling rate: {:.1} Hz | Battery: {:.0} %",
            report.sampling_rate, report.battery_percent
        );
    }

    let json = args.json;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    shimmer.add_stream_callback(move |packet| {
        if counter.fetch_add(1, Ordering::Relaxed) % 100 != 0 {
            return;
        }
        if !json {
            println!("{:?}", packet.values());
            return;
        }
        match serde_json::to_string(packet.values()) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("could not serialize packet: {e}"),
        }
    });
    shimmer.add_status_callback(move |status| {
        if !json {
            println!("Status: {:?}", status);
            return;
        }
        match serde_json::to_string(status) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("could not serialize status: {e}"),
        }
    });

    info!("streaming for {} s", args.stream_secs);
    shimmer.start_streaming()?;
    thread::sleep(Duration::from_secs(args.stream_secs));
    shimmer.stop_streaming()?;
    info!("received {} packets", received.load(Ordering::Relaxed));

    shimmer.shutdown();
    Ok(())
}
