// Timed capture with signal statistics
//
// Captures a few channels for a fixed time, exports the samples as CSV and
// prints frequency and duty cycle of every digital channel.

use clap::Parser;
use logic_automation::{
    AutomationConfig, CaptureConfiguration, DeviceConfiguration, LogicController, SocketAutomationService,
};

#[derive(Parser)]
#[command(name = "capture_and_analyze")]
#[command(version = "1.0")]
#[command(about = "Capture digital channels and report frequency and duty cycle")]
struct Args {
    /// Digital channels to record
    #[arg(short, long, value_delimiter = ',', default_values_t = [0, 1])]
    channels: Vec<u32>,

    /// Sample rate in samples per second
    #[arg(short = 'r', long, default_value_t = 10_000_000)]
    sample_rate: u64,

    /// Capture duration in seconds
    #[arg(short, long, default_value_t = 0.5)]
    duration: f64,

    /// Configuration file (defaults to the built-in settings)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let config = AutomationConfig::load_from(args.config.as_deref())?;
    println!("Connecting to automation service at {}", config.address());
    let service = SocketAutomationService::connect(&config)?;
    let controller = LogicController::new(service, config);

    let devices = controller.get_available_devices()?;
    if devices.is_empty() {
        println!("No devices reported. Connect an analyzer or enable a simulation device.");
        return Ok(());
    }
    for device in &devices {
        let kind = if device.is_simulation { " (simulation)" } else { "" };
        println!("  {} {}{}", device.device_type, device.masked_id(), kind);
    }

    controller.create_device_config(DeviceConfiguration::new(
        "demo",
        args.channels.iter().copied(),
        args.sample_rate,
    ))?;
    controller.create_capture_config(CaptureConfiguration::new("demo", args.duration))?;

    println!("\nCapturing {:?} for {} s at {} S/s", args.channels, args.duration, args.sample_rate);
    for &channel in &args.channels {
        match controller.capture_and_analyze_digital("demo", "demo", channel) {
            Ok(result) => println!(
                "  channel {}: {:.1} Hz, duty {:.1}%, {} rising / {} falling edges",
                channel,
                result.frequency_hz,
                result.duty_cycle * 100.0,
                result.rising_edges,
                result.falling_edges
            ),
            Err(e) => println!("  channel {channel}: {e}"),
        }
    }

    Ok(())
}
