//! Abstract reader hardware layer.
//!
//! Real matching hardware lives behind [`FpHwDevice`]; the daemon only ever
//! talks to trait objects. Driver callback APIs are reshaped into async
//! calls that feed match/progress events through channels, consumed by the
//! device state machine.

pub mod virt;

#[cfg(test)]
pub mod mock;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::print::Print;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Press,
    Swipe,
}

impl ScanType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanType::Press => "press",
            ScanType::Swipe => "swipe",
        }
    }
}

/// Reader temperature estimate; anything above `Cold` counts as busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Temperature {
    Cold,
    Warm,
    Hot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerStatus {
    pub present: bool,
    pub needed: bool,
}

/// Capability flags advertised by a reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    /// 1-of-N matching against a supplied gallery.
    pub identify: bool,
    /// Templates live on the reader itself.
    pub storage: bool,
    /// The reader can enumerate its stored templates.
    pub storage_list: bool,
    /// The reader can wipe its storage wholesale.
    pub storage_clear: bool,
}

/// Hints carried by the driver's retry family of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    General,
    TooShort,
    CenterFinger,
    RemoveFinger,
}

#[derive(Debug)]
pub enum DriverError {
    /// Transient capture failure; the operation may be restarted.
    Retry(RetryHint),
    Cancelled,
    /// Protocol breakdown talking to the reader; treated as disconnection.
    Proto(String),
    /// On-reader storage is full.
    DataFull,
    /// The reader claims a supplied print is not in its storage.
    DataNotFound,
    NotOpen,
    NotSupported,
    Failed(String),
}

impl DriverError {
    pub fn is_retry(&self) -> bool {
        matches!(self, DriverError::Retry(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Retry(hint) => write!(f, "transient capture failure ({hint:?})"),
            DriverError::Cancelled => write!(f, "operation cancelled"),
            DriverError::Proto(msg) => write!(f, "protocol error: {msg}"),
            DriverError::DataFull => write!(f, "device storage full"),
            DriverError::DataNotFound => write!(f, "print not found on device"),
            DriverError::NotOpen => write!(f, "device not open"),
            DriverError::NotSupported => write!(f, "operation not supported"),
            DriverError::Failed(msg) => write!(f, "device failure: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {}

/// Events produced by a running verify/identify capture.
#[derive(Debug, Clone)]
pub enum MatchEvent {
    /// The matcher produced a decision for the current capture.
    Report { matched: bool },
    /// The capture needs to be repeated by the user.
    Retry(RetryHint),
}

/// Progress of a running enrollment.
#[derive(Debug, Clone)]
pub struct EnrollStage {
    pub completed: u32,
    pub retry: Option<RetryHint>,
}

/// Result of an identify run: a gallery match, a device-resident print
/// that matched outside the gallery, or neither.
#[derive(Debug, Default)]
pub struct IdentifyOutcome {
    pub matched: Option<Print>,
    pub found: Option<Print>,
}

/// Out-of-band property changes a reader may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwChange {
    FingerStatus,
    Temperature,
    EnrollStages,
    ScanType,
}

/// One fingerprint reader.
///
/// Long operations honor their [`CancellationToken`] by failing with
/// [`DriverError::Cancelled`]; cancelling an already-finished operation is
/// a no-op.
#[async_trait]
pub trait FpHwDevice: Send + Sync {
    fn driver(&self) -> &str;
    fn device_id(&self) -> &str;
    fn name(&self) -> &str;
    fn scan_type(&self) -> ScanType;
    fn nr_enroll_stages(&self) -> u32;
    fn features(&self) -> Features;
    fn temperature(&self) -> Temperature;
    fn finger_status(&self) -> FingerStatus;
    fn is_open(&self) -> bool;

    /// Subscribe to property-change notifications.
    fn changes(&self) -> broadcast::Receiver<HwChange>;

    async fn open(&self) -> Result<(), DriverError>;
    async fn close(&self) -> Result<(), DriverError>;
    async fn suspend(&self) -> Result<(), DriverError>;
    async fn resume(&self) -> Result<(), DriverError>;

    /// 1-of-1 match against `target`. Yields retry and match reports on
    /// `feedback`, then resolves with the final decision.
    async fn verify(
        &self,
        target: &Print,
        cancel: CancellationToken,
        feedback: mpsc::UnboundedSender<MatchEvent>,
    ) -> Result<bool, DriverError>;

    /// 1-of-N match across `gallery`. `feedback` is optional: the
    /// duplicate-detection pass during enroll runs without reporting.
    async fn identify(
        &self,
        gallery: &[Print],
        cancel: CancellationToken,
        feedback: Option<mpsc::UnboundedSender<MatchEvent>>,
    ) -> Result<IdentifyOutcome, DriverError>;

    /// Multi-stage capture filling in `template`; resolves with the
    /// finished print.
    async fn enroll(
        &self,
        template: Print,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<EnrollStage>,
    ) -> Result<Print, DriverError>;

    async fn list_prints(&self) -> Result<Vec<Print>, DriverError>;
    async fn delete_print(&self, print: &Print) -> Result<(), DriverError>;
    async fn clear_storage(&self) -> Result<(), DriverError>;
}

/// Reader arrival/departure, keyed by device id.
pub enum HotplugEvent {
    Added(Arc<dyn FpHwDevice>),
    Removed(String),
}

/// Source of readers: initial enumeration plus hotplug.
#[async_trait]
pub trait FpHwContext: Send + Sync {
    /// All readers present right now. Completes only once enumeration is
    /// finished, so callers may export the result before serving requests.
    async fn enumerate(&self) -> Vec<Arc<dyn FpHwDevice>>;

    /// Next hotplug event; `None` once the context shuts down.
    async fn next_event(&self) -> Option<HotplugEvent>;
}
