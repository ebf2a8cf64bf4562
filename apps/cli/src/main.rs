use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use uwblink_core::{
    Device, DeviceCore, Frame, FrameHandler, ImageLibrary, LinkConfig, MessageType, Notifier,
    OwnerId, Priority, SimPeripheral, SpiTransport, TracingListener, Transport,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "HSSPI link tool (simulated peripheral)", long_about = None)]
struct Args {
    /// Link configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Firmware image offered to the update step
    #[arg(long)]
    firmware: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register the device and print its information
    Probe,
    /// Send one frame through the registration API and print the answer
    Send {
        /// Message type (application, log, trace, ...)
        #[arg(long = "type", default_value = "log")]
        ty: MessageType,
        /// Payload as hex bytes
        payload: String,
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
    /// Open the bypass channel, send one frame and print every reply
    Bypass {
        #[arg(long = "type", default_value = "application")]
        ty: MessageType,
        payload: String,
        /// Stop listening after this long without a frame
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
    },
    /// Print the effective configuration
    Config,
}

/// A registered device over the simulated peripheral.
struct Link {
    device: Arc<Device>,
    notifier: Notifier,
}

fn connect(config: LinkConfig, firmware: Option<PathBuf>) -> Result<Link> {
    let sim = SimPeripheral::new();
    let library = Arc::new(ImageLibrary::new());
    if let Some(path) = firmware {
        let data = std::fs::read(&path)
            .with_context(|| format!("Failed to read firmware {}", path.display()))?;
        let name = config
            .fw_name
            .clone()
            .unwrap_or_else(|| "qorvo/qm35.bin".to_string());
        info!(name = %name, len = data.len(), "Firmware image offered");
        library.add(&name, None, data);
    }

    let core = Arc::new(DeviceCore::new());
    let transport = SpiTransport::new(
        Arc::new(sim.clone()),
        Arc::new(sim.clone()),
        config.clone(),
        Arc::clone(&core),
        library,
    )?;
    sim.attach_irq(transport.irq_handler());

    let device = Device::new(0, transport, core, config);
    let notifier = Notifier::new();
    notifier.register(Arc::new(TracingListener))?;
    device.register(&notifier)?;
    Ok(Link { device, notifier })
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => LinkConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => LinkConfig::default(),
    };

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::Probe => {
            let link = connect(config, args.firmware)?;
            print_info(&link.device);
            link.device.unregister(&link.notifier)?;
        }
        Command::Send {
            ty,
            payload,
            timeout_ms,
        } => {
            let data = parse_hex(&payload)?;
            let link = connect(config, args.firmware)?;
            let device = &link.device;

            let (tx, rx) = mpsc::channel::<Frame>();
            let tx = std::sync::Mutex::new(tx);
            let handler: Arc<dyn FrameHandler> = Arc::new(move |frame: Frame| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(frame);
                }
            });
            device.register_handler(ty, Priority::Normal, Arc::clone(&handler))?;
            device.transport().start()?;

            device.send(ty, &data)?;
            match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
                Ok(frame) => println!("{} {}", frame.ty, to_hex(&frame.data)),
                Err(_) => println!("no answer"),
            }

            device.transport().stop()?;
            device.unregister_handler(ty, Priority::Normal, &handler)?;
            device.unregister(&link.notifier)?;
        }
        Command::Bypass {
            ty,
            payload,
            timeout_ms,
        } => {
            let data = parse_hex(&payload)?;
            let link = connect(config, args.firmware)?;
            let bypass = link.device.bypass();
            let owner = OwnerId::current();

            let (tx, rx) = mpsc::channel::<()>();
            let tx = std::sync::Mutex::new(tx);
            bypass.open(
                owner,
                Some(ty),
                Arc::new(move || {
                    if let Ok(tx) = tx.lock() {
                        let _ = tx.send(());
                    }
                }),
            )?;
            bypass.send(owner, &data)?;

            let mut buf = vec![0u8; link.device.config().max_packet_size];
            while rx.recv_timeout(Duration::from_millis(timeout_ms)).is_ok() {
                let received = bypass.recv(owner, &mut buf)?;
                println!(
                    "{} {}",
                    MessageType::try_from(received.ty)?,
                    to_hex(&buf[..received.len])
                );
            }

            bypass.close(owner)?;
            link.device.unregister(&link.notifier)?;
        }
    }
    Ok(())
}

fn print_info(device: &Device) {
    println!("state:        {}", device.state());
    let Some(info) = device.info() else {
        println!("device info:  unavailable");
        return;
    };
    println!("UCI version:  {:#06x}", info.uci_version);
    match info.firmware() {
        Some((version, device_id)) => {
            println!("firmware:     {version}");
            println!("device id:    {device_id:#06x}");
        }
        None => println!("firmware:     unknown"),
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("Payload is not hex: {text:?}");
    }
    if digits.is_empty() || digits.len() % 2 != 0 {
        bail!("Payload needs a whole number of bytes");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| Ok(u8::from_str_radix(&digits[i..i + 2], 16)?))
        .collect()
}

fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting uwblink over a simulated peripheral...");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("20 02 00 00").unwrap(), vec![0x20, 0x02, 0, 0]);
        assert_eq!(parse_hex("de:ad").unwrap(), vec![0xDE, 0xAD]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("").is_err());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x01, 0xAB]), "01 ab");
    }
}
