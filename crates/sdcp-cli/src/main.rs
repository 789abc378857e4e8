//! sdcp - control SDCP (ElegooLink) printers from the terminal
//!
//! Discovers printers, sends control commands and uploads G-code.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdcp_printer::{ClientConfig, PrinterStatus, SdcpClient, TransferOutcome};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sdcp")]
#[command(about = "Control SDCP printers over WebSocket", long_about = None)]
struct Cli {
    /// Printer IP address
    #[arg(long, env = "PRINTER_IP", global = true)]
    ip: Option<IpAddr>,

    /// TOML file with client settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// WebSocket port to try (repeatable; default 3031, 3030)
    #[arg(long = "port", global = true)]
    ports: Vec<u16>,

    /// WebSocket path to try (repeatable; default /websocket, /ws, /)
    #[arg(long = "path", global = true)]
    paths: Vec<String>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast a discovery probe and list printers that answer
    Discover {
        /// Seconds to wait for replies
        #[arg(short, long, default_value_t = 2.0)]
        timeout: f64,
    },
    /// Show device attributes
    Attributes,
    /// Request and show the current status
    Status,
    /// List files stored on the printer
    Files {
        /// Directory on the printer
        #[arg(default_value = "/local")]
        dir: String,
    },
    /// Upload a G-code file
    Upload {
        /// Local G-code file
        file: PathBuf,
        /// Destination directory for HTTP push uploads
        #[arg(long, default_value = "/local")]
        dest: String,
        /// Start printing once the upload finishes
        #[arg(long)]
        print: bool,
    },
    /// Start printing a file already on the printer
    Print {
        /// File name on the printer
        filename: String,
    },
    /// Pause the current print
    Pause,
    /// Resume a paused print
    Resume,
    /// Stop the current print
    Stop,
    /// Switch the light on or off
    Light {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Discover { timeout } = cli.command {
        return discover(timeout).await;
    }

    let ip = cli
        .ip
        .context("printer IP required: pass --ip or set PRINTER_IP")?;
    let config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let client = SdcpClient::with_config(ip, config);
    client.connect_with(&cli.ports, &cli.paths).await?;
    if let Some(endpoint) = client.endpoint() {
        println!("Connected to {endpoint}");
    }

    let result = run(&client, cli.command).await;
    client.close().await;
    result
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(client: &SdcpClient, command: Commands) -> Result<()> {
    match command {
        Commands::Discover { timeout } => discover(timeout).await?,
        Commands::Attributes => {
            let response = client.get_attributes().await?;
            print_json(&response)?;
            if let Some(identity) = client.mainboard() {
                println!("Mainboard: {}", identity.id);
            }
        }
        Commands::Status => show_status(client).await?,
        Commands::Files { dir } => {
            let response = client.list_files(&dir).await?;
            print_json(&response)?;
        }
        Commands::Upload { file, dest, print } => upload(client, &file, &dest, print).await?,
        Commands::Print { filename } => {
            client.start_print(&filename).await?;
            println!("Started printing {filename}");
        }
        Commands::Pause => {
            client.pause_print().await?;
            println!("Paused");
        }
        Commands::Resume => {
            client.resume_print().await?;
            println!("Resumed");
        }
        Commands::Stop => {
            client.stop_print().await?;
            println!("Stopped");
        }
        Commands::Light { state } => {
            let on = state == "on";
            client.set_light(on).await?;
            println!("Light {state}");
        }
    }

    Ok(())
}

async fn discover(timeout: f64) -> Result<()> {
    let timeout = Duration::try_from_secs_f64(timeout).context("invalid timeout")?;
    let devices = SdcpClient::discover(timeout).await?;

    if devices.is_empty() {
        println!("No printers answered");
        return Ok(());
    }

    for device in &devices {
        match device.info() {
            Some(info) => {
                let name = info
                    .name
                    .or(info.machine_name)
                    .unwrap_or_else(|| "unnamed".to_string());
                println!(
                    "{}: {} (mainboard {}, firmware {})",
                    device.ip,
                    name,
                    info.mainboard_id.as_deref().unwrap_or("?"),
                    info.firmware_version.as_deref().unwrap_or("?")
                );
            }
            None => println!("{}: {}", device.ip, device.raw),
        }
    }
    println!("{} printer(s) found", devices.len());
    Ok(())
}

async fn show_status(client: &SdcpClient) -> Result<()> {
    client.get_status().await?;
    let message = client.wait_for_status(Duration::from_secs(5)).await?;
    let status = PrinterStatus::from_payload(&message);

    println!("State: {:?}", status.machine_states);
    if let Some(print) = &status.print {
        println!(
            "  Print: {} layer {}/{}",
            print.filename.as_deref().unwrap_or("-"),
            print.current_layer,
            print.total_layer
        );
    }
    if let Some(transfer) = &status.transfer {
        println!(
            "  Transfer: {:?} {}/{} bytes",
            transfer.state, transfer.download_offset, transfer.total_size
        );
    }
    for (label, temp) in [
        ("Nozzle", status.nozzle_temp),
        ("Bed", status.bed_temp),
        ("Chamber", status.box_temp),
    ] {
        if let Some(temp) = temp {
            println!("  {label}: {temp:.1} C");
        }
    }
    Ok(())
}

async fn upload(client: &SdcpClient, file: &Path, dest: &str, print: bool) -> Result<()> {
    // The pull transfer is addressed by mainboard id.
    if let Err(e) = client.get_attributes().await {
        tracing::warn!("could not read attributes: {e}");
    }

    let report = client.upload(file, dest).await?;
    match &report.outcome {
        TransferOutcome::Pulled { .. } => {
            println!("Printer pulled {} ({})", file.display(), report.endpoint)
        }
        TransferOutcome::Pushed { status, .. } => {
            println!("Uploaded {} to {} ({status})", file.display(), report.endpoint)
        }
    }

    if print {
        let filename = file
            .file_name()
            .and_then(|name| name.to_str())
            .context("file name is not valid UTF-8")?;
        client.start_print(filename).await?;
        println!("Started printing {filename}");
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_repeatable_candidates() {
        let cli = Cli::try_parse_from([
            "sdcp", "--ip", "10.0.0.5", "--port", "3030", "--port", "3031", "--path", "/ws", "status",
        ])
        .unwrap();
        assert_eq!(cli.ports, vec![3030, 3031]);
        assert_eq!(cli.paths, vec!["/ws".to_string()]);
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_light_rejects_unknown_state() {
        assert!(Cli::try_parse_from(["sdcp", "light", "dim"]).is_err());
    }
}
