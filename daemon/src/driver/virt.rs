//! Socket-driven virtual reader.
//!
//! Development and CI stand-in for real hardware: when
//! `XFPRINTD_VIRTUAL_DEVICE=<socket-path>` is set, one reader is exposed
//! whose captures are injected over a Unix socket, one command per line:
//!
//! ```text
//! SCAN <id>        capture a finger whose template data is <id>
//! RETRY <hint>     transient capture failure (general|too-short|center|remove)
//! ERROR <kind>     terminal failure (proto|data-full|data-not-found|failed)
//! FINGER <0|1>     finger-present status
//! LIST             write the ids stored on the reader back to the client
//! CLEAR            wipe the reader's stored templates
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::driver::{
    DriverError, EnrollStage, Features, FingerStatus, FpHwContext, FpHwDevice, HotplugEvent,
    HwChange, IdentifyOutcome, MatchEvent, RetryHint, ScanType, Temperature,
};
use crate::print::Print;

pub const SOCKET_ENV: &str = "XFPRINTD_VIRTUAL_DEVICE";

const DRIVER_NAME: &str = "virtual";
const DEVICE_ID: &str = "virt0";
const ENROLL_STAGES: u32 = 3;

/// Capture-affecting commands, consumed by the in-flight operation.
#[derive(Debug, Clone)]
enum Capture {
    Scan(String),
    Retry(RetryHint),
    Error(ErrorKind),
}

#[derive(Debug, Clone, Copy)]
enum ErrorKind {
    Proto,
    DataFull,
    DataNotFound,
    Failed,
}

struct Shared {
    open: bool,
    finger: FingerStatus,
    stored: Vec<Print>,
}

pub struct VirtualDevice {
    shared: Mutex<Shared>,
    captures: tokio::sync::Mutex<mpsc::UnboundedReceiver<Capture>>,
    changes: broadcast::Sender<HwChange>,
}

impl VirtualDevice {
    fn new(socket: &Path) -> std::io::Result<Arc<VirtualDevice>> {
        let _ = std::fs::remove_file(socket);
        let listener = UnixListener::bind(socket)?;

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (change_tx, _) = broadcast::channel(16);

        let device = Arc::new(VirtualDevice {
            shared: Mutex::new(Shared {
                open: false,
                finger: FingerStatus::default(),
                stored: Vec::new(),
            }),
            captures: tokio::sync::Mutex::new(capture_rx),
            changes: change_tx,
        });

        tokio::spawn(serve(listener, Arc::clone(&device), capture_tx));
        info!("virtual reader listening on {}", socket.display());

        Ok(device)
    }

    fn set_finger(&self, present: bool) {
        self.shared.lock().unwrap().finger = FingerStatus {
            present,
            needed: false,
        };
        let _ = self.changes.send(HwChange::FingerStatus);
    }

    fn stored_ids(&self) -> Vec<String> {
        self.shared
            .lock()
            .unwrap()
            .stored
            .iter()
            .map(|p| String::from_utf8_lossy(&p.data).into_owned())
            .collect()
    }

    /// Wait for the next capture command, honoring cancellation.
    async fn next_capture(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Capture, DriverError> {
        let mut rx = self.captures.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(DriverError::Cancelled),
            cmd = rx.recv() => cmd.ok_or(DriverError::Failed("virtual socket closed".to_string())),
        }
    }
}

fn terminal_error(kind: ErrorKind) -> DriverError {
    match kind {
        ErrorKind::Proto => DriverError::Proto("injected protocol error".to_string()),
        ErrorKind::DataFull => DriverError::DataFull,
        ErrorKind::DataNotFound => DriverError::DataNotFound,
        ErrorKind::Failed => DriverError::Failed("injected failure".to_string()),
    }
}

async fn serve(
    listener: UnixListener,
    device: Arc<VirtualDevice>,
    captures: mpsc::UnboundedSender<Capture>,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("virtual reader accept failed: {err}");
                return;
            }
        };

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!("virtual reader command: {trimmed}");

            let mut parts = trimmed.splitn(2, ' ');
            let verb = parts.next().unwrap_or_default();
            let arg = parts.next().unwrap_or_default();

            match (verb, arg) {
                ("SCAN", id) if !id.is_empty() => {
                    let _ = captures.send(Capture::Scan(id.to_string()));
                }
                ("RETRY", hint) => {
                    let hint = match hint {
                        "too-short" => RetryHint::TooShort,
                        "center" => RetryHint::CenterFinger,
                        "remove" => RetryHint::RemoveFinger,
                        _ => RetryHint::General,
                    };
                    let _ = captures.send(Capture::Retry(hint));
                }
                ("ERROR", kind) => {
                    let kind = match kind {
                        "proto" => ErrorKind::Proto,
                        "data-full" => ErrorKind::DataFull,
                        "data-not-found" => ErrorKind::DataNotFound,
                        _ => ErrorKind::Failed,
                    };
                    let _ = captures.send(Capture::Error(kind));
                }
                ("FINGER", flag) => device.set_finger(flag == "1"),
                ("LIST", _) => {
                    let reply = device.stored_ids().join(" ") + "\n";
                    if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
                ("CLEAR", _) => device.shared.lock().unwrap().stored.clear(),
                _ => warn!("virtual reader: unknown command '{trimmed}'"),
            }
        }
    }
}

#[async_trait]
impl FpHwDevice for VirtualDevice {
    fn driver(&self) -> &str {
        DRIVER_NAME
    }

    fn device_id(&self) -> &str {
        DEVICE_ID
    }

    fn name(&self) -> &str {
        "Virtual fingerprint reader"
    }

    fn scan_type(&self) -> ScanType {
        ScanType::Press
    }

    fn nr_enroll_stages(&self) -> u32 {
        ENROLL_STAGES
    }

    fn features(&self) -> Features {
        Features {
            identify: true,
            storage: true,
            storage_list: true,
            storage_clear: true,
        }
    }

    fn temperature(&self) -> Temperature {
        Temperature::Cold
    }

    fn finger_status(&self) -> FingerStatus {
        self.shared.lock().unwrap().finger
    }

    fn is_open(&self) -> bool {
        self.shared.lock().unwrap().open
    }

    fn changes(&self) -> broadcast::Receiver<HwChange> {
        self.changes.subscribe()
    }

    async fn open(&self) -> Result<(), DriverError> {
        self.shared.lock().unwrap().open = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.shared.lock().unwrap().open = false;
        Ok(())
    }

    async fn suspend(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn verify(
        &self,
        target: &Print,
        cancel: CancellationToken,
        feedback: mpsc::UnboundedSender<MatchEvent>,
    ) -> Result<bool, DriverError> {
        match self.next_capture(&cancel).await? {
            Capture::Scan(id) => {
                let matched = target.data == id.as_bytes();
                let _ = feedback.send(MatchEvent::Report { matched });
                Ok(matched)
            }
            Capture::Retry(hint) => {
                let _ = feedback.send(MatchEvent::Retry(hint));
                Err(DriverError::Retry(hint))
            }
            Capture::Error(kind) => Err(terminal_error(kind)),
        }
    }

    async fn identify(
        &self,
        gallery: &[Print],
        cancel: CancellationToken,
        feedback: Option<mpsc::UnboundedSender<MatchEvent>>,
    ) -> Result<IdentifyOutcome, DriverError> {
        match self.next_capture(&cancel).await? {
            Capture::Scan(id) => {
                let matched = gallery.iter().find(|p| p.data == id.as_bytes()).cloned();
                let found = match matched {
                    // Not in the gallery: the reader may still know the finger.
                    None => self
                        .shared
                        .lock()
                        .unwrap()
                        .stored
                        .iter()
                        .find(|p| p.data == id.as_bytes())
                        .cloned(),
                    Some(_) => None,
                };
                if let Some(feedback) = feedback {
                    let _ = feedback.send(MatchEvent::Report {
                        matched: matched.is_some(),
                    });
                }
                Ok(IdentifyOutcome { matched, found })
            }
            Capture::Retry(hint) => {
                if let Some(feedback) = feedback {
                    let _ = feedback.send(MatchEvent::Retry(hint));
                }
                Err(DriverError::Retry(hint))
            }
            Capture::Error(kind) => Err(terminal_error(kind)),
        }
    }

    async fn enroll(
        &self,
        mut template: Print,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<EnrollStage>,
    ) -> Result<Print, DriverError> {
        let mut completed = 0;
        let mut scan_id = None;

        while completed < ENROLL_STAGES {
            match self.next_capture(&cancel).await? {
                Capture::Scan(id) => {
                    completed += 1;
                    scan_id.get_or_insert(id);
                    let _ = progress.send(EnrollStage {
                        completed,
                        retry: None,
                    });
                }
                Capture::Retry(hint) => {
                    let _ = progress.send(EnrollStage {
                        completed,
                        retry: Some(hint),
                    });
                }
                Capture::Error(kind) => return Err(terminal_error(kind)),
            }
        }

        template.data = scan_id.unwrap_or_default().into_bytes();
        template.device_stored = true;
        self.shared.lock().unwrap().stored.push(template.clone());
        Ok(template)
    }

    async fn list_prints(&self) -> Result<Vec<Print>, DriverError> {
        Ok(self.shared.lock().unwrap().stored.clone())
    }

    async fn delete_print(&self, print: &Print) -> Result<(), DriverError> {
        let mut shared = self.shared.lock().unwrap();
        let before = shared.stored.len();
        shared.stored.retain(|p| p.data != print.data);
        if shared.stored.len() == before {
            return Err(DriverError::DataNotFound);
        }
        Ok(())
    }

    async fn clear_storage(&self) -> Result<(), DriverError> {
        self.shared.lock().unwrap().stored.clear();
        Ok(())
    }
}

/// Context exposing the virtual reader; no hotplug.
pub struct VirtualContext {
    devices: Vec<Arc<dyn FpHwDevice>>,
    quiescent: Notify,
}

impl VirtualContext {
    /// Build from `XFPRINTD_VIRTUAL_DEVICE`; `None` when unset. An unset
    /// environment simply means a daemon with no readers.
    pub fn from_env() -> std::io::Result<VirtualContext> {
        let mut devices: Vec<Arc<dyn FpHwDevice>> = Vec::new();
        if let Ok(path) = std::env::var(SOCKET_ENV) {
            if !path.is_empty() {
                let device = VirtualDevice::new(&PathBuf::from(path))?;
                devices.push(device);
            }
        }
        Ok(VirtualContext {
            devices,
            quiescent: Notify::new(),
        })
    }
}

#[async_trait]
impl FpHwContext for VirtualContext {
    async fn enumerate(&self) -> Vec<Arc<dyn FpHwDevice>> {
        self.devices.clone()
    }

    async fn next_event(&self) -> Option<HotplugEvent> {
        // Virtual readers never come or go.
        self.quiescent.notified().await;
        None
    }
}
