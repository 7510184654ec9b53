//! # ticket-printer
//!
//! Receipt printer communication for the order desk.
//!
//! ## Scope
//!
//! - ESC/POS ticket rendering from a structured order
//! - Fiscal-printer command framing (paper advance, cut, status)
//! - Serial connection lifetime per physical device
//! - Print job orchestration over those connections
//!
//! Order pricing, menus and the UI live elsewhere; this crate only turns a
//! finished order into printed paper.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ticket_printer::{
//!     DeviceIdentity, OrchestratorConfig, PrintOrchestrator, PrintTarget, PrinterRegistry,
//!     RedbKnownPrinterStore, SerialChannelProvider, SerialConfig,
//! };
//!
//! let registry = Arc::new(PrinterRegistry::new(
//!     Arc::new(SerialChannelProvider::new()),
//!     Arc::new(RedbKnownPrinterStore::open("printers.redb")?),
//! ));
//!
//! let kitchen = DeviceIdentity::usb(0x0416, 0x5011);
//! registry.connect(&kitchen, "Kitchen", SerialConfig::new(19200)).await?;
//!
//! let orchestrator = PrintOrchestrator::new(registry, OrchestratorConfig::default());
//! orchestrator.print_ticket(&order, PrintTarget::Connected(kitchen.clone())).await?;
//! orchestrator.cut_and_advance(PrintTarget::Connected(kitchen)).await?;
//! ```

pub mod channel;
pub mod config;
pub mod encoding;
pub mod error;
pub mod escpos;
pub mod fiscal;
pub mod orchestrator;
pub mod registry;
pub mod storage;
pub mod ticket;
pub mod types;

// Re-exports
pub use channel::memory::MemoryChannelProvider;
pub use channel::serial::SerialChannelProvider;
pub use channel::{Channel, ChannelProvider, DeviceIdentity, SerialConfig};
pub use config::PrinterConfig;
pub use encoding::{Codepage, wrap_words};
pub use error::{
    ChannelError, ConnectError, DeviceFault, PrintError, PrintResult, ProtocolError, ReadError,
    StoreError, WriteError,
};
pub use escpos::{Align, CutMode, EscPosBuilder};
pub use fiscal::{DeviceStatus, FiscalCodec, ParsedResponse, decode_status, parse_response};
pub use orchestrator::{CommandReport, OrchestratorConfig, PrintOrchestrator, PrintTarget};
pub use registry::{ChannelId, ConnectedPrinter, PrinterRegistry, ReconnectReport};
pub use storage::{
    KnownPrinter, KnownPrinterStore, MemoryKnownPrinterStore, RedbKnownPrinterStore,
};
pub use ticket::{DEFAULT_PAGE_WIDTH, TicketEncoder, encode_ticket};
pub use types::{StoreIdentity, TicketCustomer, TicketLabels, TicketLineItem, TicketOrder};
