// JSON tool session
//
// Reads one tool call per line from stdin as `<tool> <json-args>` and prints
// the JSON response, the way an agent integration would drive the library.
//
//   echo 'get_available_devices' | cargo run --example tool_session

use clap::Parser;
use logic_automation::tools::TOOL_NAMES;
use logic_automation::{AutomationConfig, LogicController, LogicTools, SocketAutomationService};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};

#[derive(Parser)]
#[command(name = "tool_session")]
#[command(version = "1.0")]
#[command(about = "Drive the logic analyzer through JSON tool calls on stdin")]
struct Args {
    /// Configuration file (defaults to the built-in settings)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// List the available tools and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    if args.list {
        for name in TOOL_NAMES {
            println!("{name}");
        }
        return Ok(());
    }

    let config = AutomationConfig::load_from(args.config.as_deref())?;
    // Lazy connection: the first tool call that needs the service connects.
    let tools = LogicTools::new(LogicController::new(SocketAutomationService::new(&config), config));

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (tool, raw_args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let args = if raw_args.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(raw_args) {
                Ok(args) => args,
                Err(e) => {
                    let error = json!({ "error": { "kind": "configuration", "message": e.to_string() } });
                    writeln!(stdout, "{error}")?;
                    continue;
                }
            }
        };
        let response = tools.respond(tool, args);
        writeln!(stdout, "{response}")?;
    }

    Ok(())
}
