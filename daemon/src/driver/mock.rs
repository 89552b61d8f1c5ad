//! Scriptable in-process reader used by the device and manager tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::driver::{
    DriverError, EnrollStage, Features, FingerStatus, FpHwContext, FpHwDevice, HotplugEvent,
    HwChange, IdentifyOutcome, MatchEvent, RetryHint, ScanType, Temperature,
};
use crate::print::Print;

/// Injected capture outcomes, consumed one per capture attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Scan(Vec<u8>),
    Retry(RetryHint),
    Proto,
    DataFull,
    DataNotFound,
    Fail,
}

#[derive(Default)]
struct Counters {
    opens: u32,
    closes: u32,
    suspends: u32,
    resumes: u32,
    clears: u32,
}

struct Shared {
    open: bool,
    stored: Vec<Print>,
    deleted: Vec<Print>,
    counters: Counters,
    fail_open: bool,
    fail_device_delete: bool,
    temperature: Temperature,
}

pub struct MockDevice {
    device_id: String,
    features: Features,
    stages: u32,
    shared: Mutex<Shared>,
    steps: tokio::sync::Mutex<mpsc::UnboundedReceiver<Step>>,
    step_tx: mpsc::UnboundedSender<Step>,
    changes: broadcast::Sender<HwChange>,
    suspend_gate: Arc<Notify>,
    suspend_blocks: Mutex<bool>,
    hold_gate: Notify,
    hold_after_report: Mutex<bool>,
}

impl MockDevice {
    pub fn new(device_id: &str) -> Arc<MockDevice> {
        MockDevice::with_features(
            device_id,
            Features {
                identify: true,
                storage: true,
                storage_list: true,
                storage_clear: true,
            },
        )
    }

    pub fn with_features(device_id: &str, features: Features) -> Arc<MockDevice> {
        let (step_tx, step_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(16);
        Arc::new(MockDevice {
            device_id: device_id.to_string(),
            features,
            stages: 3,
            shared: Mutex::new(Shared {
                open: false,
                stored: Vec::new(),
                deleted: Vec::new(),
                counters: Counters::default(),
                fail_open: false,
                fail_device_delete: false,
                temperature: Temperature::Cold,
            }),
            steps: tokio::sync::Mutex::new(step_rx),
            step_tx,
            changes,
            suspend_gate: Arc::new(Notify::new()),
            suspend_blocks: Mutex::new(false),
            hold_gate: Notify::new(),
            hold_after_report: Mutex::new(false),
        })
    }

    pub fn push(&self, step: Step) {
        let _ = self.step_tx.send(step);
    }

    pub fn scan(&self, data: &[u8]) {
        self.push(Step::Scan(data.to_vec()));
    }

    pub fn store_print(&self, print: Print) {
        self.shared.lock().unwrap().stored.push(print);
    }

    pub fn stored(&self) -> Vec<Print> {
        self.shared.lock().unwrap().stored.clone()
    }

    pub fn deleted(&self) -> Vec<Print> {
        self.shared.lock().unwrap().deleted.clone()
    }

    pub fn opens(&self) -> u32 {
        self.shared.lock().unwrap().counters.opens
    }

    pub fn closes(&self) -> u32 {
        self.shared.lock().unwrap().counters.closes
    }

    pub fn suspends(&self) -> u32 {
        self.shared.lock().unwrap().counters.suspends
    }

    pub fn resumes(&self) -> u32 {
        self.shared.lock().unwrap().counters.resumes
    }

    pub fn clears(&self) -> u32 {
        self.shared.lock().unwrap().counters.clears
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.shared.lock().unwrap().fail_open = fail;
    }

    pub fn set_fail_device_delete(&self, fail: bool) {
        self.shared.lock().unwrap().fail_device_delete = fail;
    }

    pub fn set_temperature(&self, temperature: Temperature) {
        self.shared.lock().unwrap().temperature = temperature;
        let _ = self.changes.send(HwChange::Temperature);
    }

    /// Make `suspend` hang until [`MockDevice::release_suspend`].
    pub fn set_suspend_blocks(&self, blocks: bool) {
        *self.suspend_blocks.lock().unwrap() = blocks;
    }

    pub fn release_suspend(&self) {
        self.suspend_gate.notify_one();
    }

    /// Make `verify` report its match but hold off completing until
    /// [`MockDevice::release_hold`]; models hardware that has not settled.
    pub fn set_hold_after_report(&self, hold: bool) {
        *self.hold_after_report.lock().unwrap() = hold;
    }

    pub fn release_hold(&self) {
        self.hold_gate.notify_one();
    }

    async fn next_step(&self, cancel: &CancellationToken) -> Result<Step, DriverError> {
        let mut rx = self.steps.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(DriverError::Cancelled),
            step = rx.recv() => step.ok_or(DriverError::Failed("mock script exhausted".to_string())),
        }
    }
}

fn step_error(step: Step) -> DriverError {
    match step {
        Step::Proto => DriverError::Proto("injected protocol error".to_string()),
        Step::DataFull => DriverError::DataFull,
        Step::DataNotFound => DriverError::DataNotFound,
        Step::Fail => DriverError::Failed("injected failure".to_string()),
        Step::Scan(_) | Step::Retry(_) => unreachable!("not an error step"),
    }
}

#[async_trait]
impl FpHwDevice for MockDevice {
    fn driver(&self) -> &str {
        "mock"
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn name(&self) -> &str {
        "Mock fingerprint reader"
    }

    fn scan_type(&self) -> ScanType {
        ScanType::Press
    }

    fn nr_enroll_stages(&self) -> u32 {
        self.stages
    }

    fn features(&self) -> Features {
        self.features
    }

    fn temperature(&self) -> Temperature {
        self.shared.lock().unwrap().temperature
    }

    fn finger_status(&self) -> FingerStatus {
        FingerStatus::default()
    }

    fn is_open(&self) -> bool {
        self.shared.lock().unwrap().open
    }

    fn changes(&self) -> broadcast::Receiver<HwChange> {
        self.changes.subscribe()
    }

    async fn open(&self) -> Result<(), DriverError> {
        let mut shared = self.shared.lock().unwrap();
        shared.counters.opens += 1;
        if shared.fail_open {
            return Err(DriverError::Failed("injected open failure".to_string()));
        }
        shared.open = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut shared = self.shared.lock().unwrap();
        shared.counters.closes += 1;
        shared.open = false;
        Ok(())
    }

    async fn suspend(&self) -> Result<(), DriverError> {
        let blocks = *self.suspend_blocks.lock().unwrap();
        if blocks {
            self.suspend_gate.notified().await;
        }
        self.shared.lock().unwrap().counters.suspends += 1;
        Ok(())
    }

    async fn resume(&self) -> Result<(), DriverError> {
        self.shared.lock().unwrap().counters.resumes += 1;
        Ok(())
    }

    async fn verify(
        &self,
        target: &Print,
        cancel: CancellationToken,
        feedback: mpsc::UnboundedSender<MatchEvent>,
    ) -> Result<bool, DriverError> {
        match self.next_step(&cancel).await? {
            Step::Scan(data) => {
                let matched = target.data == data;
                let _ = feedback.send(MatchEvent::Report { matched });
                if *self.hold_after_report.lock().unwrap() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DriverError::Cancelled),
                        _ = self.hold_gate.notified() => {}
                    }
                }
                Ok(matched)
            }
            Step::Retry(hint) => {
                let _ = feedback.send(MatchEvent::Retry(hint));
                Err(DriverError::Retry(hint))
            }
            other => Err(step_error(other)),
        }
    }

    async fn identify(
        &self,
        gallery: &[Print],
        cancel: CancellationToken,
        feedback: Option<mpsc::UnboundedSender<MatchEvent>>,
    ) -> Result<IdentifyOutcome, DriverError> {
        match self.next_step(&cancel).await? {
            Step::Scan(data) => {
                let matched = gallery.iter().find(|p| p.data == data).cloned();
                let found = match matched {
                    None => self
                        .shared
                        .lock()
                        .unwrap()
                        .stored
                        .iter()
                        .find(|p| p.data == data)
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
            Step::Retry(hint) => {
                if let Some(feedback) = feedback {
                    let _ = feedback.send(MatchEvent::Retry(hint));
                }
                Err(DriverError::Retry(hint))
            }
            other => Err(step_error(other)),
        }
    }

    async fn enroll(
        &self,
        mut template: Print,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<EnrollStage>,
    ) -> Result<Print, DriverError> {
        let mut completed = 0;
        let mut scan_data = None;

        while completed < self.stages {
            match self.next_step(&cancel).await? {
                Step::Scan(data) => {
                    completed += 1;
                    scan_data.get_or_insert(data);
                    let _ = progress.send(EnrollStage {
                        completed,
                        retry: None,
                    });
                }
                Step::Retry(hint) => {
                    let _ = progress.send(EnrollStage {
                        completed,
                        retry: Some(hint),
                    });
                }
                other => return Err(step_error(other)),
            }
        }

        template.data = scan_data.unwrap_or_default();
        template.device_stored = true;
        self.shared.lock().unwrap().stored.push(template.clone());
        Ok(template)
    }

    async fn list_prints(&self) -> Result<Vec<Print>, DriverError> {
        Ok(self.shared.lock().unwrap().stored.clone())
    }

    async fn delete_print(&self, print: &Print) -> Result<(), DriverError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.fail_device_delete {
            return Err(DriverError::Failed("injected delete failure".to_string()));
        }
        shared.stored.retain(|p| p.data != print.data);
        shared.deleted.push(print.clone());
        Ok(())
    }

    async fn clear_storage(&self) -> Result<(), DriverError> {
        let mut shared = self.shared.lock().unwrap();
        shared.counters.clears += 1;
        shared.stored.clear();
        Ok(())
    }
}

/// Hotplug-capable context over mock devices.
pub struct MockContext {
    devices: Mutex<Vec<Arc<dyn FpHwDevice>>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<HotplugEvent>>,
    event_tx: mpsc::UnboundedSender<HotplugEvent>,
}

impl MockContext {
    pub fn new(devices: Vec<Arc<dyn FpHwDevice>>) -> Arc<MockContext> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(MockContext {
            devices: Mutex::new(devices),
            events: tokio::sync::Mutex::new(event_rx),
            event_tx,
        })
    }

    pub fn plug(&self, device: Arc<dyn FpHwDevice>) {
        self.devices.lock().unwrap().push(Arc::clone(&device));
        let _ = self.event_tx.send(HotplugEvent::Added(device));
    }

    pub fn unplug(&self, device_id: &str) {
        self.devices
            .lock()
            .unwrap()
            .retain(|d| d.device_id() != device_id);
        let _ = self
            .event_tx
            .send(HotplugEvent::Removed(device_id.to_string()));
    }
}

#[async_trait]
impl FpHwContext for MockContext {
    async fn enumerate(&self) -> Vec<Arc<dyn FpHwDevice>> {
        self.devices.lock().unwrap().clone()
    }

    async fn next_event(&self) -> Option<HotplugEvent> {
        self.events.lock().await.recv().await
    }
}
