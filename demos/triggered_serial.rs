// Edge-triggered capture with a serial decoder
//
// Arms a falling-edge trigger on the RX line, records for a short window
// after it fires, attaches an async serial analyzer and exports its table.

use clap::Parser;
use logic_automation::{
    AutomationConfig, DeviceConfiguration, ExportFormat, LogicController, SettingValue,
    SocketAutomationService, TriggerSpec,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "triggered_serial")]
#[command(version = "1.0")]
#[command(about = "Trigger on a UART start bit and decode the frame")]
struct Args {
    /// Digital channel wired to the RX line
    #[arg(short, long, default_value_t = 0)]
    channel: u32,

    /// Baud rate of the serial link
    #[arg(short, long, default_value_t = 115_200)]
    baud: i64,

    /// Seconds to record after the trigger
    #[arg(short, long, default_value_t = 0.05)]
    after: f64,

    /// Output directory for the decoded table and raw samples
    #[arg(short, long, default_value = "serial-capture")]
    output: PathBuf,

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

    let config = AutomationConfig::load_from(None)?;
    let service = SocketAutomationService::connect(&config)?;
    let controller = LogicController::new(service, config);
    controller.create_device_config(DeviceConfiguration::new("uart", [args.channel], 10_000_000))?;

    let trigger = TriggerSpec::start_capturing_when()
        .channel(args.channel)
        .falling_edge()
        .then_record_for(args.after);

    println!("Waiting for a start bit on channel {}...", args.channel);
    let mut session = controller.start_with_trigger("uart", trigger)?;
    println!("Triggered, capture {:?} complete", session.capture_id());

    let settings = BTreeMap::from([
        ("Input Channel".to_string(), SettingValue::from(args.channel)),
        ("Bit Rate (Bits/s)".to_string(), SettingValue::from(args.baud)),
    ]);
    let attachment = controller.attach_analyzer(&mut session, "uart", "rx", settings)?;
    println!("Attached {} analyzer '{}'", attachment.decoder_type, attachment.label);

    std::fs::create_dir_all(&args.output)?;
    let table = args.output.join("rx.csv");
    controller.export_analyzer(&session, "rx", &table)?;
    println!("Decoded frames written to {}", table.display());

    controller.export(&mut session, &args.output.join("raw"), ExportFormat::Csv)?;
    println!("Raw samples written to {}", args.output.join("raw").display());

    Ok(())
}
