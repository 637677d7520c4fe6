use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::VecDeque;
use std::path::PathBuf;
use tinylink::{init_logging, list_ports, load_config, InstructionHandle, TinyGController};

/// Lines allowed in flight while streaming a file
const STREAM_WINDOW: usize = 64;

/// Log progress every this many executed lines
const PROGRESS_EVERY: usize = 100;

/// tinylink command-line sender
#[derive(Parser, Debug)]
#[command(name = "tinylink", version, about = "Sender for TinyG motion controllers.")]
struct Cli {
    /// Path to a JSON or TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port (overrides the config file)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long)]
    baud: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream a G-code file, waiting for every line to execute
    Stream {
        /// G-code file to send
        file: PathBuf,
    },
    /// List serial ports that look like CNC controllers
    Ports,
    /// Connect and print one status snapshot
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    tracing::debug!("tinylink {} built {}", tinylink::VERSION, tinylink::BUILD_DATE);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(baud) = cli.baud {
        config.connection.baud_rate = baud;
    }
    config.validate()?;

    match cli.command {
        Commands::Ports => {
            for port in list_ports()? {
                println!(
                    "{}\t{}\t{}",
                    port.port_name,
                    port.description,
                    port.manufacturer.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Status => {
            let controller = TinyGController::new(&config);
            controller.connect().await?;
            let status = controller.get_status().await?;
            let report = serde_json::json!({
                "state": status.state.fields(),
                "comms": status.comms,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            controller.close().await?;
        }
        Commands::Stream { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let controller = TinyGController::new(&config);
            controller.connect().await?;
            stream(&controller, &text).await?;
            controller.close().await?;
        }
    }

    Ok(())
}

/// Send every non-empty line of `text`, keeping at most `STREAM_WINDOW`
/// lines outstanding
async fn stream(controller: &TinyGController, text: &str) -> anyhow::Result<()> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let total = lines.len();
    tracing::info!("Streaming {} lines", total);

    let mut in_flight: VecDeque<(usize, InstructionHandle)> = VecDeque::new();
    let mut done = 0;
    for (number, line) in lines.into_iter().enumerate() {
        if in_flight.len() >= STREAM_WINDOW {
            if let Some((n, handle)) = in_flight.pop_front() {
                finish(n, handle).await?;
                done += 1;
                log_progress(done, total);
            }
        }
        let handle = controller.send_line(line).await?;
        in_flight.push_back((number + 1, handle));
    }
    while let Some((n, handle)) = in_flight.pop_front() {
        finish(n, handle).await?;
        done += 1;
        log_progress(done, total);
    }

    controller.wait_until_synced().await?;
    tracing::info!("Finished streaming {} lines", total);
    Ok(())
}

async fn finish(number: usize, mut handle: InstructionHandle) -> anyhow::Result<()> {
    handle
        .executed()
        .await
        .with_context(|| format!("line {}", number))
}

fn log_progress(done: usize, total: usize) {
    if done % PROGRESS_EVERY == 0 || done == total {
        tracing::info!("{}/{} lines executed", done, total);
    }
}
