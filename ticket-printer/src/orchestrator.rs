//! Print orchestration
//!
//! Turns a print request into channel traffic: renders tickets, drives the
//! fiscal paper commands and interprets the device responses. Every job
//! holds the target device's job lock for its whole duration.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::channel::DeviceIdentity;
use crate::encoding::Codepage;
use crate::error::{DeviceFault, PrintError, PrintResult, ReadError, WriteError};
use crate::escpos::CutMode;
use crate::fiscal::{self, DeviceStatus, FiscalCodec, STATION_RECEIPT};
use crate::registry::PrinterRegistry;
use crate::ticket::{DEFAULT_PAGE_WIDTH, TicketEncoder};
use crate::types::{StoreIdentity, TicketLabels, TicketOrder};

/// Fewer lines than this leave the last printed line under the cutter
pub const MIN_ADVANCE_LINES: u8 = 2;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Paper width in characters
    pub page_width: usize,
    /// Upper bound for each device response
    pub response_timeout: Duration,
    /// Pause between the advance and the cut command
    pub command_delay: Duration,
    pub advance_lines: u8,
    pub paper_station: u8,
    pub store: StoreIdentity,
    pub labels: TicketLabels,
    pub codepage: Codepage,
    pub cut: CutMode,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_width: DEFAULT_PAGE_WIDTH,
            response_timeout: Duration::from_secs(1),
            command_delay: Duration::from_millis(200),
            advance_lines: 3,
            paper_station: STATION_RECEIPT,
            store: StoreIdentity::default(),
            labels: TicketLabels::default(),
            codepage: Codepage::Utf8,
            cut: CutMode::Full,
        }
    }
}

/// Which printer a job goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintTarget {
    /// The most recently connected known printer, opened for this job only
    Default,
    /// A printer the registry already holds open
    Connected(DeviceIdentity),
}

/// Outcome of a fiscal command sequence
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandReport {
    /// Advisory problems, e.g. responses that never arrived
    pub warnings: Vec<String>,
    /// Status blocks decoded from the responses, in arrival order
    pub statuses: Vec<DeviceStatus>,
}

/// A job's hold on its device
struct Session {
    identity: DeviceIdentity,
    opened_here: bool,
    _job: OwnedMutexGuard<()>,
}

/// Print job coordinator
pub struct PrintOrchestrator {
    registry: Arc<PrinterRegistry>,
    config: OrchestratorConfig,
    encoder: TicketEncoder,
    codec: FiscalCodec,
}

impl PrintOrchestrator {
    pub fn new(registry: Arc<PrinterRegistry>, config: OrchestratorConfig) -> Self {
        let encoder = TicketEncoder::new(config.page_width)
            .with_store(config.store.clone())
            .with_labels(config.labels.clone())
            .with_codepage(config.codepage)
            .with_cut(config.cut);

        Self {
            registry,
            config,
            encoder,
            codec: FiscalCodec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<PrinterRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Render and print an order ticket
    #[instrument(skip(self, order), fields(order_id = %order.order_id))]
    pub async fn print_ticket(&self, order: &TicketOrder, target: PrintTarget) -> PrintResult<()> {
        let bytes = self.encoder.encode(order);

        let session = self.begin(target).await?;
        let result = self.registry.write(&session.identity, &bytes).await;
        if result.is_ok() {
            info!(identity = %session.identity, bytes = bytes.len(), "Ticket printed");
        }
        self.end(session).await;

        Ok(result?)
    }

    /// Print the connectivity test page
    #[instrument(skip(self))]
    pub async fn print_test(&self, target: PrintTarget) -> PrintResult<()> {
        let bytes = self.encoder.test_page();

        let session = self.begin(target).await?;
        let result = self.registry.write(&session.identity, &bytes).await;
        if result.is_ok() {
            info!(identity = %session.identity, "Test page printed");
        }
        self.end(session).await;

        Ok(result?)
    }

    /// Advance the paper, cut it, and check the device's answers
    ///
    /// Missing responses are reported as warnings. Malformed responses and
    /// reported faults are errors.
    #[instrument(skip(self))]
    pub async fn cut_and_advance(&self, target: PrintTarget) -> PrintResult<CommandReport> {
        let lines = self.config.advance_lines.max(MIN_ADVANCE_LINES);
        let advance = self.codec.advance_paper(lines, self.config.paper_station)?;
        let cut = self.codec.cut()?;

        let session = self.begin(target).await?;
        let result = self.run_cut(&session.identity, &advance, &cut).await;
        self.end(session).await;

        let report = result?;
        let faults = collect_faults(&report.statuses);
        if !faults.is_empty() {
            warn!(faults = ?faults, "Printer reported faults");
            return Err(PrintError::DeviceFault(faults));
        }
        Ok(report)
    }

    /// Ask the device for its status block
    #[instrument(skip(self))]
    pub async fn query_status(&self, target: PrintTarget) -> PrintResult<DeviceStatus> {
        let frame = self.codec.status()?;

        let session = self.begin(target).await?;
        let result = self.run_query(&session.identity, &frame).await;
        self.end(session).await;

        result
    }

    async fn run_cut(
        &self,
        identity: &DeviceIdentity,
        advance: &[u8],
        cut: &[u8],
    ) -> PrintResult<CommandReport> {
        self.registry.write(identity, advance).await?;
        tokio::time::sleep(self.config.command_delay).await;
        self.registry.write(identity, cut).await?;

        self.collect_responses(identity, 2).await
    }

    async fn run_query(&self, identity: &DeviceIdentity, frame: &[u8]) -> PrintResult<DeviceStatus> {
        self.registry.write(identity, frame).await?;

        let report = self.collect_responses(identity, 1).await?;
        report
            .statuses
            .into_iter()
            .next()
            .ok_or(PrintError::NoResponse(self.config.response_timeout))
    }

    /// Read up to `expected` response frames, each bounded by the response timeout
    async fn collect_responses(
        &self,
        identity: &DeviceIdentity,
        expected: usize,
    ) -> PrintResult<CommandReport> {
        let timeout = self.config.response_timeout;
        let mut report = CommandReport::default();
        let mut buffer = Vec::new();
        let mut frames = Vec::new();

        'responses: for n in 1..=expected {
            let deadline = Instant::now() + timeout;

            while frames.len() < n {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(identity = %identity, response = n, "Response timed out");
                    report
                        .warnings
                        .push(format!("No response {} of {} within {:?}", n, expected, timeout));
                    break 'responses;
                }

                match self.registry.read(identity, remaining).await {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        let (found, consumed) = fiscal::split_frames(&buffer)?;
                        buffer.drain(..consumed);
                        frames.extend(found);
                    }
                    Err(ReadError::Timeout) => {
                        warn!(identity = %identity, response = n, "Response timed out");
                        report
                            .warnings
                            .push(format!("No response {} of {} within {:?}", n, expected, timeout));
                        break 'responses;
                    }
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "Response read failed");
                        report.warnings.push(e.to_string());
                        break 'responses;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            report
                .warnings
                .push(format!("Discarded {} bytes of incomplete response", buffer.len()));
        }

        for frame in frames {
            let parsed = fiscal::parse_response(&frame).into_result()?;
            if let Some(status) = parsed.status {
                report.statuses.push(fiscal::decode_status(&status)?);
            }
        }

        Ok(report)
    }

    /// Resolve the target and take its job lock
    async fn begin(&self, target: PrintTarget) -> PrintResult<Session> {
        match target {
            PrintTarget::Connected(identity) => {
                let job = self.registry.lock_device(&identity).await;
                if !self.registry.is_connected(&identity) {
                    return Err(WriteError::NotOpen(identity).into());
                }
                Ok(Session {
                    identity,
                    opened_here: false,
                    _job: job,
                })
            }
            PrintTarget::Default => {
                let printer = self
                    .registry
                    .default_printer()?
                    .ok_or(PrintError::NoDefaultPrinter)?;
                let identity = printer.identity;
                let job = self.registry.lock_device(&identity).await;

                let opened_here = !self.registry.is_connected(&identity);
                if opened_here {
                    self.registry
                        .connect(&identity, &printer.display_name, printer.config)
                        .await?;
                }
                Ok(Session {
                    identity,
                    opened_here,
                    _job: job,
                })
            }
        }
    }

    /// Release whatever `begin` opened
    async fn end(&self, session: Session) {
        if session.opened_here {
            self.registry.disconnect(&session.identity).await;
        }
    }
}

/// Faults across all statuses, first occurrence order, no duplicates
fn collect_faults(statuses: &[DeviceStatus]) -> Vec<DeviceFault> {
    let mut faults = Vec::new();
    for fault in statuses.iter().flat_map(DeviceStatus::faults) {
        if !faults.contains(&fault) {
            faults.push(fault);
        }
    }
    faults
}
