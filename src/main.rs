use arduino_serial::config::{ConfigLoader, LogFormat, LoggingConfig};
use arduino_serial::port::{self, DeviceEvent, OpenMode, SerialDevice};
use arduino_serial::upload::{self, Firmware, ResetPolicy, UploadRequest, UploadTimings, Uploader};
use arduino_serial::AppError;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Serial port tool for Arduino boards: list ports, reset, upload firmware, monitor output.",
    long_about = "Opens serial ports exclusively, resets boards through DTR and streams firmware images (raw or Intel HEX) to their bootloader. The selected port and baud rate persist in arduino-serial.toml."
)]
struct Args {
    /// Use this configuration file instead of the resolved one.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Log level (overrides the configured level; RUST_LOG overrides both).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports, likely boards first.
    Ports,

    /// Reset the board and stream a firmware image to it.
    Upload {
        /// Firmware image (.hex is decoded, anything else is sent raw).
        firmware: PathBuf,
        #[command(flatten)]
        target: Target,
        /// Skip the DTR reset before streaming.
        #[arg(long)]
        no_reset: bool,
        /// Wait for this many reply bytes after the transfer.
        #[arg(long)]
        expect_reply: Option<usize>,
    },

    /// Pulse DTR to reset the board.
    Reset {
        #[command(flatten)]
        target: Target,
        /// How long DTR stays asserted (at least 50).
        #[arg(long)]
        pulse_ms: Option<u64>,
    },

    /// Print whatever the board sends until Ctrl-C.
    Monitor {
        #[command(flatten)]
        target: Target,
    },

    /// Show or change persisted settings.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Serial port (defaults to the configured one).
    #[arg(short, long)]
    port: Option<String>,
    /// Baud rate (defaults to the configured one).
    #[arg(short, long)]
    baud: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Print the path of the configuration file in use.
    Path,
    /// Remember the port the board is attached to.
    SetPort { port: String },
    /// Remember the upload baud rate.
    SetBaud { baud: u32 },
}

// --- Main Application Entry Point ---
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::load_from(path),
        None => ConfigLoader::load(),
    };
    let loader = match loader {
        Ok(loader) => loader,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            std::process::exit(2);
        }
    };

    init_tracing(&loader.config().logging, args.log_level.as_deref());

    if let Err(err) = run(args, loader).await {
        tracing::debug!(error = ?err, "command failed");
        eprintln!("{err}");
        std::process::exit(err.exit_code());
    }
}

fn init_tracing(logging: &LoggingConfig, level_override: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_override.unwrap_or(&logging.level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

async fn run(args: Args, mut loader: ConfigLoader) -> Result<(), AppError> {
    let json = args.json;
    match args.command {
        Command::Ports => {
            let ports = port::list_ports()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ports)?);
            } else if ports.is_empty() {
                println!("No serial ports found.");
            } else {
                for p in &ports {
                    let mark = if p.is_likely_board() { "*" } else { " " };
                    let label = p.product.as_deref().unwrap_or("");
                    println!("{mark} {:<24} {:<10} {label}", p.name, p.kind);
                }
            }
        }

        Command::Upload {
            firmware,
            target,
            no_reset,
            expect_reply,
        } => {
            let image = Firmware::load(&firmware)?;
            let (port, baud) = resolve_target(&loader, &target)?;

            let mut request = UploadRequest::new(port, baud, image.into_bytes());
            request.reset = if no_reset || !loader.config().upload.reset_before_upload {
                ResetPolicy::None
            } else {
                ResetPolicy::PulseDtr
            };
            request.expect_reply = expect_reply.or(loader.config().upload.expect_reply_bytes);

            let uploader = Uploader::new(UploadTimings::from(&loader.config().upload));
            let report = tokio::task::spawn_blocking(move || uploader.upload(&request))
                .await
                .map_err(|e| AppError::IoError(std::io::Error::other(e)))??;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Uploaded {} bytes to {} at {} baud in {} ms.",
                    report.bytes_written,
                    report.port,
                    report.baud_rate,
                    report.elapsed.as_millis()
                );
                if let Some(reply) = &report.reply {
                    println!("Bootloader replied: {reply:02X?}");
                }
            }
        }

        Command::Reset { target, pulse_ms } => {
            let (port, baud) = resolve_target(&loader, &target)?;
            let pulse = pulse_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| loader.config().upload.reset_pulse());

            let name = tokio::task::spawn_blocking(move || -> Result<String, AppError> {
                let mut device = SerialDevice::new(port, baud);
                device.open(OpenMode::ReadWrite)?;
                upload::pulse_dtr(&mut device, pulse)?;
                let name = device.port_name().to_string();
                device.close();
                Ok(name)
            })
            .await
            .map_err(|e| AppError::IoError(std::io::Error::other(e)))??;

            if json {
                println!("{}", serde_json::json!({ "port": name, "reset": true }));
            } else {
                println!("Reset {name}.");
            }
        }

        Command::Monitor { target } => {
            let (port, baud) = resolve_target(&loader, &target)?;
            run_monitor(port, baud).await?;
        }

        Command::Config(cmd) => match cmd {
            ConfigCommand::Show => {
                let config = loader.config();
                if json {
                    println!("{}", serde_json::to_string_pretty(config)?);
                } else {
                    let text = toml::to_string_pretty(config)
                        .map_err(arduino_serial::ConfigError::from)?;
                    print!("{text}");
                }
            }
            ConfigCommand::Path => match &loader.config_path {
                Some(path) => println!("{}", path.display()),
                None => println!(
                    "(defaults; would be saved to {})",
                    arduino_serial::config::get_default_config_path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<no config directory>".to_string())
                ),
            },
            ConfigCommand::SetPort { port } => {
                loader.set_device_port(port)?;
                let path = loader.save_or_create()?;
                println!("Saved to {}.", path.display());
            }
            ConfigCommand::SetBaud { baud } => {
                loader.set_baud_rate(baud)?;
                let path = loader.save_or_create()?;
                println!("Saved to {}.", path.display());
            }
        },
    }

    Ok(())
}

/// Port and baud from the command line, falling back to the configuration.
fn resolve_target(loader: &ConfigLoader, target: &Target) -> Result<(String, u32), AppError> {
    let serial = &loader.config().serial;
    let port = match &target.port {
        Some(port) => serial.resolve_port(port),
        None => serial
            .resolved_device_port()
            .ok_or(AppError::NoPortConfigured)?,
    };
    Ok((port, target.baud.unwrap_or(serial.baud_rate)))
}

async fn run_monitor(port: String, baud: u32) -> Result<(), AppError> {
    let mut device = SerialDevice::new(port, baud);
    device.open(OpenMode::ReadOnly)?;
    let mut events = device.subscribe();
    device.set_read_notifications(true)?;
    eprintln!("Monitoring {} at {baud} baud, Ctrl-C to stop.", device.port_name());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DeviceEvent::ReadyRead) => loop {
                    let n = device.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    stdout.write_all(&buf[..n])?;
                    stdout.flush()?;
                },
                Some(DeviceEvent::AboutToClose) | None => break,
            },
            _ = &mut ctrl_c => break,
        }
    }

    device.close();
    Ok(())
}
