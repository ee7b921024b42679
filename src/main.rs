//! The BLE order scanner console.
//!
//! Reads one command per line from stdin and prints controller events as they arrive. Type
//! `help` for the command list.

use std::sync::Arc;

use anyhow::Result;
use async_channel::Receiver;
use ble_order_scanner::{
    central::BluerCentral,
    controller::{Controller, DeviceEntry, Event},
    env,
};
use log::{info, warn};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal::unix::{signal, SignalKind},
};

type Scanner = Arc<Controller<BluerCentral>>;

const HELP: &str = "\
Commands:
  scan                    start scanning
  stop                    stop scanning after the current window
  filter [text]           show only devices whose name contains text (empty shows all)
  devices                 list sighted devices
  connect <address|index> connect to a device by address or by its `devices` index
  send <text>             send text to the connected device
  disconnect              release the connected device
  status                  show the session state
  help                    show this list
  quit                    disconnect and exit";

/// One console line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Scan,
    Stop,
    Filter(String),
    Devices,
    Connect(String),
    Send(String),
    Disconnect,
    Status,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

impl Command {
    fn parse(line: &str) -> Command {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        match word.to_lowercase().as_str() {
            "" => Command::Empty,
            "scan" => Command::Scan,
            "stop" => Command::Stop,
            "filter" => Command::Filter(rest.to_string()),
            "devices" | "ls" => Command::Devices,
            "connect" if rest.is_empty() => {
                Command::Invalid("usage: connect <address|index>".to_string())
            }
            "connect" => Command::Connect(rest.to_string()),
            "send" if rest.is_empty() => Command::Invalid("Please enter data to send.".to_string()),
            "send" => Command::Send(rest.to_string()),
            "disconnect" => Command::Disconnect,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => Command::Invalid(format!("unknown command \"{other}\"; type `help`")),
        }
    }
}

/// Resolves a `connect` argument: an index into the sorted device list, or an address.
fn resolve_target(target: &str, devices: &[DeviceEntry]) -> String {
    match target.parse::<usize>() {
        Ok(index) if index < devices.len() => devices[index].address().to_string(),
        _ => target.to_string(),
    }
}

fn describe(entry: &DeviceEntry) -> String {
    format!(
        "{} ({}) | Phone: {} | Card: {} | RSSI: {}",
        entry.display_name(),
        entry.address(),
        entry.identity.phone.as_deref().unwrap_or("-"),
        entry.identity.card.as_deref().unwrap_or("-"),
        entry.rssi()
    )
}

async fn print_events(events: Receiver<Event>) {
    while let Ok(event) = events.recv().await {
        match event {
            Event::ScanStarted => println!("Scanning..."),
            Event::ScanStopped => println!("Scan stopped"),
            Event::ScanFailed(message) => println!("Scan error: {message}"),
            Event::ScanCycle { .. } => (),
            Event::DeviceSeen(entry) => println!("Found: {}", describe(&entry)),
            Event::Session { state, detail, .. } => println!("[{state}] {detail}"),
            Event::Trail(line) => println!("{line}"),
            Event::ChannelsSelected { read, write } => {
                println!("Read: {read}");
                println!("Write: {write}");
            }
            Event::OrderInformation(info) => println!("Order information: {info}"),
        }
    }
}

/// Runs one command. Returns false when the console should exit.
async fn handle_command(scanner: &Scanner, command: Command) -> bool {
    match command {
        Command::Empty => (),
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
        Command::Invalid(message) => println!("{message}"),
        Command::Scan => {
            if !scanner.start_scan().await {
                println!("Already scanning");
            }
        }
        Command::Stop => {
            if !scanner.stop_scan().await {
                println!("Not scanning");
            }
        }
        Command::Filter(filter) => {
            scanner.set_name_filter(filter.clone()).await;
            scanner.clear_devices();
            if filter.is_empty() {
                println!("Name filter cleared");
            } else {
                println!("Name filter set to \"{filter}\"");
            }
        }
        Command::Devices => {
            let devices = scanner.devices();
            if devices.is_empty() {
                println!("No devices sighted");
            }
            for (index, entry) in devices.iter().enumerate() {
                println!("{index:>3}: {}", describe(entry));
            }
        }
        Command::Connect(target) => {
            let address = resolve_target(&target, &scanner.devices());
            // Connecting can take a while; keep the console responsive.
            let scanner = scanner.clone();
            tokio::spawn(async move {
                scanner.connect(&address).await;
            });
        }
        Command::Send(text) => {
            let scanner = scanner.clone();
            tokio::spawn(async move {
                match scanner.send(text.as_bytes()).await {
                    Ok(report) => println!("{report}"),
                    Err(e) => println!("Send failed: {e}"),
                }
            });
        }
        Command::Disconnect => {
            if !scanner.disconnect().await {
                println!("Not connected");
            }
        }
        Command::Status => {
            let status = scanner.status();
            match &status.address {
                Some(address) => println!("{address}: {} ({})", status.state, status.detail),
                None => println!("{}", status.state),
            }
            if let Some(selection) = &status.selection {
                println!("Read: {}", selection.read_label());
                println!("Write: {}", selection.write_label());
            }
            if let Some(info) = &status.order_info {
                println!("Order information: {info}");
            }
            println!(
                "Scanning: {} | Filter: \"{}\" | Devices: {}",
                scanner.is_scanning().await,
                scanner.name_filter().await,
                scanner.devices().len()
            );
            let config = scanner.config();
            println!(
                "Scan window: {:?} | Pause: {:?} | Write UUID: {} | Read UUID: {}",
                config.scan_window,
                config.scan_pause,
                config.selector.fixed_write_uuid,
                config.selector.fixed_read_uuid
            );
        }
    }
    true
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Started the BLE order scanner");

    let config = env::get_config()?;
    let central = BluerCentral::new().await?;
    let (controller, events) = Controller::new(central, config.controller_config());
    let scanner: Scanner = Arc::new(controller);
    let printer = tokio::spawn(print_events(events));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{HELP}");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(&scanner, Command::parse(&line)).await {
                            break;
                        }
                    },
                    Ok(None) => {
                        info!("Console input closed; stopping the BLE order scanner");
                        break;
                    },
                    Err(e) => {
                        warn!("Error reading console input: {e}; stopping the BLE order scanner");
                        break;
                    }
                }
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal; stopping the BLE order scanner");
                break;
            },
            _ = sigint.recv() => {
                info!("Received SIGINT signal; stopping the BLE order scanner");
                break;
            }
        }
    }

    scanner.shutdown().await;
    printer.abort();
    info!("Stopped the BLE order scanner");
    Ok(())
}
