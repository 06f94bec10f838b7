//! Command line tool that discovers attached controllers and prints a
//! summary of each, as a tree or as JSON.

use anyhow::Result;
use clap::Parser;
use log::warn;
use serde::Serialize;

use okolab::{Channel, Device, DeviceOptions, PortCandidate, Status};

#[derive(Parser)]
#[command(name = "okolab", about = "Discover and inspect H401-T temperature controllers")]
struct Args {
    /// Probe every serial port, not just those with the vendor's USB ids
    #[arg(long)]
    all: bool,

    /// Emit the report as JSON instead of a tree
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct DeviceReport {
    address: String,
    product: String,
    serial_number: String,
    uptime: String,
    status: Status,
    board_temperature: f64,
    channels: Vec<ChannelReport>,
}

#[derive(Serialize)]
struct ChannelReport {
    channel: u8,
    device_type: Option<i32>,
    status: Option<Status>,
    temperature: Option<f64>,
    setpoint: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let candidates = okolab::list_ports(args.all);
    if candidates.is_empty() {
        eprintln!("No controllers found");
        return Ok(());
    }

    let mut reports = Vec::new();
    for candidate in candidates {
        match inspect(&candidate).await {
            Ok(report) => reports.push(report),
            Err(e) => warn!("Skipping {}: {}", candidate.address, e),
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_tree(report);
        }
    }
    Ok(())
}

async fn inspect(candidate: &PortCandidate) -> Result<DeviceReport> {
    let device = candidate.connect(DeviceOptions::default()).await?;
    let report = gather(&device, &candidate.address).await;
    let _ = device.close().await;
    Ok(report?)
}

async fn gather(device: &Device, address: &str) -> Result<DeviceReport> {
    let mut channels = Vec::new();
    for channel in [Channel::One, Channel::Two] {
        channels.push(gather_channel(device, channel).await?);
    }

    Ok(DeviceReport {
        address: address.to_string(),
        product: device.product_name().await?,
        serial_number: device.serial_number().await?,
        uptime: format_uptime(device.uptime().await?),
        status: device.status().await?,
        board_temperature: device.board_temperature().await?,
        channels,
    })
}

async fn gather_channel(device: &Device, channel: Channel) -> Result<ChannelReport> {
    let device_type = device.channel_type(channel).await?;
    if device_type.is_none() {
        return Ok(ChannelReport {
            channel: channel.index(),
            device_type: None,
            status: None,
            temperature: None,
            setpoint: None,
        });
    }

    Ok(ChannelReport {
        channel: channel.index(),
        device_type,
        status: Some(device.channel_status(channel).await?),
        temperature: device.temperature(channel).await?,
        setpoint: device.setpoint(channel).await?,
    })
}

fn format_uptime(uptime: chrono::Duration) -> String {
    let secs = uptime.num_seconds();
    format!(
        "{}d {:02}:{:02}:{:02}",
        secs / 86_400,
        secs / 3_600 % 24,
        secs / 60 % 60,
        secs % 60
    )
}

fn print_tree(report: &DeviceReport) {
    println!("{} ({})", report.product, report.address);

    let mut lines = vec![
        format!("serial: {}", report.serial_number),
        format!("status: {:?}", report.status),
        format!("uptime: {}", report.uptime),
        format!("board temperature: {:.1} C", report.board_temperature),
    ];
    for ch in &report.channels {
        lines.push(format_channel(ch));
    }

    let last = lines.len() - 1;
    for (i, line) in lines.iter().enumerate() {
        let branch = if i == last { "└── " } else { "├── " };
        println!("{}{}", branch, line);
    }
}

fn format_channel(ch: &ChannelReport) -> String {
    match ch.device_type {
        None => format!("channel {}: disabled", ch.channel),
        Some(device_type) => {
            let temperature = ch
                .temperature
                .map_or_else(|| "off".to_string(), |t| format!("{:.1} C", t));
            let setpoint = ch
                .setpoint
                .map_or_else(|| "off".to_string(), |s| format!("{:.1} C", s));
            format!(
                "channel {}: type {}, {:?}, {} (setpoint {})",
                ch.channel,
                device_type,
                ch.status.unwrap_or(Status::Disabled),
                temperature,
                setpoint
            )
        }
    }
}
