//! print-agent - operator tool for the receipt printers
//!
//! Lists and remembers printers, prints tickets and test pages, and drives
//! the paper commands. Settings come from the environment (`.env` is
//! loaded first); command-line flags override them.

mod logger;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ticket_printer::channel::{DataBits, FlowControl, Parity, StopBits};
use ticket_printer::{
    ChannelProvider, DeviceIdentity, KnownPrinterStore, MemoryChannelProvider,
    MemoryKnownPrinterStore, PrintOrchestrator, PrintTarget, PrinterConfig, PrinterRegistry,
    RedbKnownPrinterStore, SerialChannelProvider, SerialConfig, TicketOrder,
};

/// Status block of a healthy simulated printer
const SIMULATED_STATUS: [u8; 6] = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80];

#[derive(Debug, Parser)]
#[command(name = "print-agent", version, about = "Receipt printer operator tool")]
struct Cli {
    /// Known-printer database file
    #[arg(long, env = "PRINTER_STORE_PATH", global = true)]
    store: Option<String>,

    /// Paper width in characters
    #[arg(long, env = "PRINTER_PAGE_WIDTH", global = true)]
    page_width: Option<usize>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Talk to a simulated printer instead of the serial ports
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List serial devices visible to this host
    Ports,
    /// List remembered printers, most recent first
    Known,
    /// Open a printer and remember it
    Connect {
        /// usb:VID:PID[:SERIAL] or port:PATH
        device: DeviceIdentity,
        /// Display name, defaults to the device identity
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        line: LineArgs,
    },
    /// Forget a remembered printer
    Forget { device: DeviceIdentity },
    /// Print the test page
    Test {
        #[arg(long)]
        device: Option<DeviceIdentity>,
    },
    /// Advance the paper and cut
    Cut {
        #[arg(long)]
        device: Option<DeviceIdentity>,
    },
    /// Query the printer status
    Status {
        #[arg(long)]
        device: Option<DeviceIdentity>,
    },
    /// Reopen every remembered printer
    Reconnect,
    /// Print an order ticket from a JSON file
    Print {
        order: PathBuf,
        #[arg(long)]
        device: Option<DeviceIdentity>,
    },
}

#[derive(Debug, Args)]
struct LineArgs {
    #[arg(long, default_value_t = 9600)]
    baud: u32,
    #[arg(long, value_enum, default_value_t = ParityArg::None)]
    parity: ParityArg,
    /// Seven data bits instead of eight
    #[arg(long)]
    seven_bits: bool,
    /// Two stop bits instead of one
    #[arg(long)]
    two_stop_bits: bool,
    /// RTS/CTS flow control
    #[arg(long)]
    hardware_flow: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ParityArg {
    None,
    Even,
    Odd,
}

impl LineArgs {
    fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            baud_rate: self.baud,
            data_bits: if self.seven_bits {
                DataBits::Seven
            } else {
                DataBits::Eight
            },
            stop_bits: if self.two_stop_bits {
                StopBits::Two
            } else {
                StopBits::One
            },
            parity: match self.parity {
                ParityArg::None => Parity::None,
                ParityArg::Even => Parity::Even,
                ParityArg::Odd => Parity::Odd,
            },
            flow_control: if self.hardware_flow {
                FlowControl::Hardware
            } else {
                FlowControl::None
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = PrinterConfig::from_env();
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    if let Some(width) = cli.page_width.filter(|w| *w > 0) {
        config.page_width = width;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    logger::init_logger(&config.log_level, config.log_dir.as_deref());

    let simulated = cli.simulate.then(|| {
        let provider = MemoryChannelProvider::new();
        let device = DeviceIdentity::port("SIMULATED");
        provider.add_device(device.clone());
        provider.auto_respond(&device, Some(SIMULATED_STATUS));
        (provider, device)
    });

    let (provider, store): (Arc<dyn ChannelProvider>, Arc<dyn KnownPrinterStore>) =
        match &simulated {
            Some((provider, _)) => (
                Arc::new(provider.clone()),
                Arc::new(MemoryKnownPrinterStore::new()),
            ),
            None => (
                Arc::new(SerialChannelProvider::new()),
                Arc::new(
                    RedbKnownPrinterStore::open(&config.store_path)
                        .with_context(|| format!("opening {}", config.store_path))?,
                ),
            ),
        };

    let registry = Arc::new(PrinterRegistry::new(provider, store));
    if let Some((_, device)) = &simulated {
        registry
            .connect(device, "Simulated", SerialConfig::default())
            .await?;
    }

    let orchestrator = PrintOrchestrator::new(registry.clone(), config.orchestrator_config());
    tracing::debug!(store = %config.store_path, simulate = cli.simulate, "print-agent starting");

    let result = run(cli.command, &orchestrator).await;
    registry.disconnect_all().await;

    if let Some((provider, device)) = &simulated {
        println!(
            "simulated printer received {} bytes in {} writes",
            provider.written(device).len(),
            provider.writes(device).len()
        );
    }

    result
}

async fn run(command: Command, orchestrator: &PrintOrchestrator) -> anyhow::Result<()> {
    let registry = orchestrator.registry();

    match command {
        Command::Ports => {
            let devices = registry.list_known_devices().await?;
            if devices.is_empty() {
                println!("no serial devices found");
            }
            for device in devices {
                println!("{}", device);
            }
        }
        Command::Known => {
            for printer in registry.known_printers()? {
                println!(
                    "{}\t{}\t{} baud\tlast connected {}",
                    printer.identity,
                    printer.display_name,
                    printer.config.baud_rate,
                    printer.last_connected_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Command::Connect { device, name, line } => {
            let name = name.unwrap_or_else(|| device.to_string());
            let printer = registry
                .connect(&device, &name, line.serial_config())
                .await?;
            println!("{}", serde_json::to_string_pretty(&printer)?);
        }
        Command::Forget { device } => {
            if registry.forget(&device).await? {
                println!("forgot {}", device);
            } else {
                println!("{} was not a known printer", device);
            }
        }
        Command::Test { device } => {
            let target = resolve_target(orchestrator, device).await?;
            orchestrator.print_test(target).await?;
            println!("test page sent");
        }
        Command::Cut { device } => {
            let target = resolve_target(orchestrator, device).await?;
            let report = orchestrator.cut_and_advance(target).await?;
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status { device } => {
            let target = resolve_target(orchestrator, device).await?;
            let status = orchestrator.query_status(target).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            for fault in status.faults() {
                println!("fault: {}", fault);
            }
        }
        Command::Reconnect => {
            let report = registry.reconnect_known().await;
            for printer in &report.connected {
                println!("connected {} ({})", printer.identity, printer.display_name);
            }
            for (identity, error) in &report.failed {
                println!("failed {}: {}", identity, error);
            }
        }
        Command::Print { order, device } => {
            let raw = std::fs::read_to_string(&order)
                .with_context(|| format!("reading {}", order.display()))?;
            let order: TicketOrder = serde_json::from_str(&raw).context("parsing order")?;

            let target = resolve_target(orchestrator, device).await?;
            orchestrator.print_ticket(&order, target).await?;
            println!("ticket {} printed", order.order_id);
        }
    }

    Ok(())
}

/// Open an explicitly named printer with its remembered settings
async fn resolve_target(
    orchestrator: &PrintOrchestrator,
    device: Option<DeviceIdentity>,
) -> anyhow::Result<PrintTarget> {
    let Some(device) = device else {
        return Ok(PrintTarget::Default);
    };

    let registry = orchestrator.registry();
    if !registry.is_connected(&device) {
        let Some(known) = registry
            .known_printers()?
            .into_iter()
            .find(|p| p.identity == device)
        else {
            bail!("{} is not a known printer, run `connect` first", device);
        };
        registry
            .connect(&device, &known.display_name, known.config)
            .await?;
    }

    Ok(PrintTarget::Connected(device))
}
