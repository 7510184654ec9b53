use std::str::FromStr;
use std::time::Duration;

use crate::encoding::Codepage;
use crate::orchestrator::{MIN_ADVANCE_LINES, OrchestratorConfig};
use crate::ticket::DEFAULT_PAGE_WIDTH;
use crate::types::StoreIdentity;

/// Printer subsystem configuration
///
/// # Environment variables
///
/// | Variable | Default | Meaning |
/// |----------|---------|---------|
/// | PRINTER_STORE_PATH | printers.redb | Known-printer database file |
/// | PRINTER_PAGE_WIDTH | 48 | Paper width in characters |
/// | PRINTER_RESPONSE_TIMEOUT_MS | 1000 | Bound for each device response |
/// | PRINTER_COMMAND_DELAY_MS | 200 | Pause between advance and cut |
/// | PRINTER_ADVANCE_LINES | 3 | Lines fed before the cut (at least 2) |
/// | PRINTER_PAPER_STATION | 1 | Paper station for the advance command |
/// | PRINTER_CODEPAGE | utf8 | utf8, cp866 or cp1251 |
/// | PRINTER_STORE_NAME | (empty) | Restaurant name on tickets |
/// | PRINTER_STORE_ADDRESS | (unset) | Restaurant address on tickets |
/// | LOG_LEVEL | info | Log level |
/// | LOG_DIR | (unset) | Directory for daily log files |
///
/// # Example
///
/// ```ignore
/// PRINTER_PAGE_WIDTH=32 PRINTER_CODEPAGE=cp866 print-agent test
/// ```
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub store_path: String,
    pub page_width: usize,
    pub response_timeout_ms: u64,
    pub command_delay_ms: u64,
    pub advance_lines: u8,
    pub paper_station: u8,
    pub codepage: Codepage,
    pub store_name: String,
    pub store_address: Option<String>,
    pub log_level: String,
    pub log_dir: Option<String>,
}

impl PrinterConfig {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    ///
    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            store_path: lookup("PRINTER_STORE_PATH").unwrap_or_else(|| "printers.redb".into()),
            page_width: parse(lookup("PRINTER_PAGE_WIDTH"))
                .filter(|w: &usize| *w > 0)
                .unwrap_or(DEFAULT_PAGE_WIDTH),
            response_timeout_ms: parse(lookup("PRINTER_RESPONSE_TIMEOUT_MS")).unwrap_or(1000),
            command_delay_ms: parse(lookup("PRINTER_COMMAND_DELAY_MS")).unwrap_or(200),
            advance_lines: parse(lookup("PRINTER_ADVANCE_LINES")).unwrap_or(3),
            paper_station: parse(lookup("PRINTER_PAPER_STATION")).unwrap_or(1),
            codepage: parse(lookup("PRINTER_CODEPAGE")).unwrap_or_default(),
            store_name: lookup("PRINTER_STORE_NAME").unwrap_or_default(),
            store_address: lookup("PRINTER_STORE_ADDRESS").filter(|a| !a.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_dir: lookup("LOG_DIR").filter(|d| !d.is_empty()),
        }
    }

    /// Settings for [`crate::PrintOrchestrator`]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            page_width: self.page_width,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            command_delay: Duration::from_millis(self.command_delay_ms),
            advance_lines: self.advance_lines.max(MIN_ADVANCE_LINES),
            paper_station: self.paper_station,
            store: StoreIdentity {
                name: self.store_name.clone(),
                address: self.store_address.clone(),
                extra_lines: Vec::new(),
            },
            codepage: self.codepage,
            ..Default::default()
        }
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
