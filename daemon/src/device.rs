//! Per-reader device object: claim arbitration and the operation state
//! machine driving enroll, verify/identify, delete and reconciliation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::driver::{DriverError, FpHwDevice, HwChange, MatchEvent, RetryHint};
use crate::error::Error;
use crate::finger::{Finger, REAL_FINGERS};
use crate::print::Print;
use crate::storage::PrintStore;

/// Seconds to wait for the device to complete before forcing a cancel
/// during `VerifyStop`.
pub const VERIFY_STOP_DEVICE_WAIT: Duration = Duration::from_secs(1);

static LAST_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Open,
    Close,
    Enroll,
    Verify,
    Identify,
    Delete,
}

/// What a method requires of the claim state before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRequest {
    Unclaimed,
    Claimed,
    AutoClaim,
    Anytime,
}

/// The association between a claiming client and the user it acts for.
///
/// Handlers that await while the device state can shift underneath them
/// hold their own `Arc` and re-read the device's session afterwards.
pub struct Session {
    pub sender: String,
    pub username: String,
    /// A claim/release invocation is still in flight.
    op_in_flight: AtomicBool,
    /// A final verify status has been reported for the current operation.
    verify_status_reported: AtomicBool,
}

impl Session {
    fn new(sender: &str, username: &str) -> Arc<Session> {
        Arc::new(Session {
            sender: sender.to_string(),
            username: username.to_string(),
            op_in_flight: AtomicBool::new(false),
            verify_status_reported: AtomicBool::new(false),
        })
    }

    fn reported(&self) -> bool {
        self.verify_status_reported.load(Ordering::SeqCst)
    }

    fn set_reported(&self, value: bool) {
        self.verify_status_reported.store(value, Ordering::SeqCst);
    }
}

/// Signals emitted on the device's bus path, in issuance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSignal {
    VerifyStatus { result: String, done: bool },
    VerifyFingerSelected { finger: String },
    EnrollStatus { result: String, done: bool },
}

/// Watches bus clients so the device can clean up after a crashed peer.
#[async_trait]
pub trait ClientWatcher: Send + Sync {
    /// Resolves once `sender` has left the bus.
    async fn wait_vanish(&self, sender: &str);
}

struct State {
    session: Option<Arc<Session>>,
    cancel: Option<CancellationToken>,
    /// A stop call is waiting for the pipeline to wind down.
    stop_pending: bool,
    verify_data: Option<Print>,
    identify_data: Option<Vec<Print>>,
    enroll_data: Option<Finger>,
    clients: HashMap<String, tokio::task::JoinHandle<()>>,
    local_storage_checked: bool,
}

pub struct Device {
    id: u32,
    hw: Arc<dyn FpHwDevice>,
    store: Arc<dyn PrintStore>,
    watcher: Arc<dyn ClientWatcher>,
    state: Mutex<State>,
    action: watch::Sender<Action>,
    signals: mpsc::UnboundedSender<DeviceSignal>,
    busy_changed: mpsc::UnboundedSender<()>,
}

/// Resets the device action when dropped; used on paths (claim, release,
/// delete) where the action must never outlive the handler.
struct ActionGuard<'a> {
    action: &'a watch::Sender<Action>,
}

impl<'a> ActionGuard<'a> {
    fn set(action: &'a watch::Sender<Action>, value: Action) -> ActionGuard<'a> {
        action.send_replace(value);
        ActionGuard { action }
    }
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.action.send_replace(Action::None);
    }
}

fn verify_result_name(matched: bool, error: Option<&DriverError>) -> &'static str {
    match error {
        None => {
            if matched {
                "verify-match"
            } else {
                "verify-no-match"
            }
        }
        Some(DriverError::Retry(RetryHint::TooShort)) => "verify-swipe-too-short",
        Some(DriverError::Retry(RetryHint::CenterFinger)) => "verify-finger-not-centered",
        Some(DriverError::Retry(RetryHint::RemoveFinger)) => "verify-remove-and-retry",
        Some(DriverError::Retry(RetryHint::General)) => "verify-retry-scan",
        Some(DriverError::Proto(_)) => "verify-disconnected",
        Some(DriverError::Cancelled) | Some(DriverError::DataNotFound) => "verify-no-match",
        Some(_) => "verify-unknown-error",
    }
}

fn enroll_result_name(completed: bool, enrolled: bool, error: Option<&DriverError>) -> &'static str {
    match error {
        None => {
            if !completed {
                "enroll-stage-passed"
            } else if enrolled {
                "enroll-completed"
            } else {
                "enroll-failed"
            }
        }
        Some(DriverError::Retry(RetryHint::TooShort)) => "enroll-swipe-too-short",
        Some(DriverError::Retry(RetryHint::CenterFinger)) => "enroll-finger-not-centered",
        Some(DriverError::Retry(RetryHint::RemoveFinger)) => "enroll-remove-and-retry",
        Some(DriverError::Retry(RetryHint::General)) => "enroll-retry-scan",
        Some(DriverError::Proto(_)) => "enroll-disconnected",
        Some(DriverError::DataFull) => "enroll-data-full",
        Some(DriverError::Cancelled) => "enroll-failed",
        Some(_) => "enroll-unknown-error",
    }
}

impl Device {
    pub fn new(
        hw: Arc<dyn FpHwDevice>,
        store: Arc<dyn PrintStore>,
        watcher: Arc<dyn ClientWatcher>,
        busy_changed: mpsc::UnboundedSender<()>,
    ) -> (Arc<Device>, mpsc::UnboundedReceiver<DeviceSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (action_tx, _) = watch::channel(Action::None);

        let device = Arc::new(Device {
            id: LAST_ID.fetch_add(1, Ordering::SeqCst),
            hw,
            store,
            watcher,
            state: Mutex::new(State {
                session: None,
                cancel: None,
                stop_pending: false,
                verify_data: None,
                identify_data: None,
                enroll_data: None,
                clients: HashMap::new(),
                local_storage_checked: false,
            }),
            action: action_tx,
            signals: signal_tx,
            busy_changed,
        });

        // Temperature swings flip the busy property without any client
        // involvement; keep the manager's idle timer honest.
        let weak = Arc::downgrade(&device);
        let mut changes = device.hw.changes();
        tokio::spawn(async move {
            while let Ok(change) = changes.recv().await {
                let Some(device) = weak.upgrade() else { break };
                if change == HwChange::Temperature {
                    device.notify_busy();
                }
            }
        });

        (device, signal_rx)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn hw(&self) -> &Arc<dyn FpHwDevice> {
        &self.hw
    }

    /// In use by clients, or still cooling down.
    pub fn busy(&self) -> bool {
        !self.state.lock().unwrap().clients.is_empty()
            || self.hw.temperature() > crate::driver::Temperature::Cold
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().unwrap().session.clone()
    }

    fn emit(&self, signal: DeviceSignal) {
        let _ = self.signals.send(signal);
    }

    fn notify_busy(&self) {
        let _ = self.busy_changed.send(());
    }

    fn action_now(&self) -> Action {
        *self.action.borrow()
    }

    async fn wait_action_none(&self) {
        let mut rx = self.action.subscribe();
        let _ = rx.wait_for(|action| *action == Action::None).await;
    }

    /// Claim-state gate shared by the authorization layer and the method
    /// handlers (which must check again after any await).
    pub fn check_claimed(&self, sender: &str, requested: ClaimRequest) -> Result<(), Error> {
        if requested == ClaimRequest::Anytime {
            return Ok(());
        }

        let state = self.state.lock().unwrap();
        let session = state.session.as_ref();

        let requested = match requested {
            ClaimRequest::AutoClaim => {
                if session.is_some() {
                    ClaimRequest::Claimed
                } else {
                    ClaimRequest::Unclaimed
                }
            }
            other => other,
        };

        if requested == ClaimRequest::Unclaimed {
            return match session {
                None => Ok(()),
                Some(_) => Err(Error::AlreadyInUse("Device was already claimed".to_string())),
            };
        }

        let Some(session) = session else {
            return Err(Error::ClaimDevice(
                "Device was not claimed before use".to_string(),
            ));
        };

        if session.sender != sender || session.op_in_flight.load(Ordering::SeqCst) {
            return Err(Error::AlreadyInUse(
                "Device already in use by another user".to_string(),
            ));
        }

        Ok(())
    }

    fn can_start_action(&self) -> Result<(), Error> {
        let message = match self.action_now() {
            Action::None => return Ok(()),
            Action::Enroll => "Enrollment already in progress",
            Action::Identify | Action::Verify => "Verification already in progress",
            Action::Open => "Claim already in progress",
            Action::Close => "Release already in progress",
            Action::Delete => "Delete already in progress",
        };
        Err(Error::AlreadyInUse(message.to_string()))
    }

    fn can_stop_action(&self, action: Action) -> Result<(), Error> {
        let current = self.action_now();
        let action_matches = match current {
            Action::Identify | Action::Verify => {
                action == Action::Verify || action == Action::Identify
            }
            other => other == action,
        };

        let stop_pending = self.state.lock().unwrap().stop_pending;
        if action_matches && !stop_pending {
            return Ok(());
        }

        if current != Action::None || action_matches {
            return Err(Error::AlreadyInUse(
                "Another operation is already in progress".to_string(),
            ));
        }

        match action {
            Action::Enroll => Err(Error::NoActionInProgress(
                "No enrollment in progress".to_string(),
            )),
            Action::Verify => Err(Error::NoActionInProgress(
                "No verification in progress".to_string(),
            )),
            _ => Err(Error::NoActionInProgress(
                "No action in progress".to_string(),
            )),
        }
    }

    /// Register a watch for `sender`, cleaning the device up if it crashes
    /// while holding a claim.
    pub fn add_client(self: &Arc<Device>, sender: &str) {
        let mut state = self.state.lock().unwrap();
        if state.clients.contains_key(sender) {
            return;
        }

        let device = Arc::clone(self);
        let name = sender.to_string();
        let handle = tokio::spawn(async move {
            device.watcher.wait_vanish(&name).await;
            device.client_vanished(&name).await;
        });
        state.clients.insert(sender.to_string(), handle);
        drop(state);

        self.notify_busy();
    }

    /// A watched client dropped off the bus.
    pub async fn client_vanished(&self, sender: &str) {
        let session = self.session();
        let is_claimant = session
            .as_ref()
            .map(|s| s.sender == sender)
            .unwrap_or(false);

        if is_claimant {
            {
                let state = self.state.lock().unwrap();
                if let Some(cancel) = &state.cancel {
                    cancel.cancel();
                } else {
                    // The underlying operation already finished; only the
                    // stop call is missing. Unset the action ourselves.
                    match self.action_now() {
                        Action::Verify | Action::Identify | Action::Enroll => {
                            self.action.send_replace(Action::None);
                        }
                        _ => {}
                    }
                }
            }

            self.wait_action_none().await;

            // The session may have disappeared while waiting if the device
            // was already closing.
            if self.session().is_some() {
                if let Err(err) = self.hw.close().await {
                    error!("Error closing device after disconnect: {err}");
                }
            }
            self.state.lock().unwrap().session = None;
        }

        let empty = {
            let mut state = self.state.lock().unwrap();
            if let Some(watch) = state.clients.remove(sender) {
                watch.abort();
            }
            state.clients.is_empty()
        };
        if empty {
            self.notify_busy();
        }
    }

    /// Drop every client watch; used when the reader is unplugged.
    pub fn drop_clients(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, watch) in state.clients.drain() {
            watch.abort();
        }
    }

    pub async fn claim(self: &Arc<Device>, sender: &str, username: &str) -> Result<(), Error> {
        self.check_claimed(sender, ClaimRequest::Unclaimed)?;

        self.add_client(sender);

        let session = Session::new(sender, username);
        session.op_in_flight.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().session = Some(Arc::clone(&session));

        info!("user '{}' claiming the device: {}", username, self.id);

        let guard = ActionGuard::set(&self.action, Action::Open);
        let result = self.hw.open().await;
        drop(guard);

        match result {
            Ok(()) => {
                session.op_in_flight.store(false, Ordering::SeqCst);
                debug!("claimed device {}", self.id);
                Ok(())
            }
            Err(err) => {
                self.state.lock().unwrap().session = None;
                Err(Error::Internal(format!("Open failed with error: {err}")))
            }
        }
    }

    pub async fn release(&self, sender: &str) -> Result<(), Error> {
        self.check_claimed(sender, ClaimRequest::Claimed)?;

        let cancel = self.state.lock().unwrap().cancel.clone();
        if let Some(cancel) = cancel {
            match self.action_now() {
                Action::Enroll => warn!("Enrollment was in progress, stopping it"),
                Action::Identify | Action::Verify => {
                    warn!("Verification was in progress, stopping it")
                }
                Action::Delete => warn!("Deletion was in progress, stopping it"),
                _ => {}
            }
            cancel.cancel();
            self.wait_action_none().await;
        }

        // We awaited; the session may have disappeared already.
        let Some(session) = self.session() else {
            return Ok(());
        };
        session.op_in_flight.store(true, Ordering::SeqCst);

        let guard = ActionGuard::set(&self.action, Action::Close);
        let result = self.hw.close().await;
        self.state.lock().unwrap().session = None;
        drop(guard);

        match result {
            Ok(()) => {
                debug!("released device {}", self.id);
                Ok(())
            }
            Err(err) => Err(Error::Internal(format!("Release failed with error: {err}"))),
        }
    }

    fn load_user_prints(&self, username: &str) -> Vec<Print> {
        let (driver, device_id) = (self.hw.driver(), self.hw.device_id());
        self.store
            .discover_prints(driver, device_id, username)
            .into_iter()
            .filter_map(|finger| {
                self.store.load(driver, device_id, finger, username).ok()
            })
            .collect()
    }

    fn load_all_prints(&self) -> Vec<Print> {
        self.store
            .discover_users()
            .into_iter()
            .flat_map(|user| self.load_user_prints(&user))
            .collect()
    }

    fn report_verify_status(&self, session: &Session, matched: bool, error: Option<&DriverError>) {
        let result = verify_result_name(matched, error);
        let done = error.map(|err| !err.is_retry()).unwrap_or(true);

        if done && session.reported() {
            // It is completely fine for cancellation to occur after a
            // result has been reported.
            if !matches!(error, Some(DriverError::Cancelled)) {
                warn!("Verify status already reported. Ignoring {result}");
            }
            return;
        }

        debug!("report_verify_status: result {result}");
        self.emit(DeviceSignal::VerifyStatus {
            result: result.to_string(),
            done,
        });

        if done {
            session.set_reported(true);
        }
    }

    /// Host-side store reconciliation against the reader's stored prints.
    async fn check_local_storage(&self, found_match: bool, error: Option<&DriverError>) {
        if !self.hw.features().storage_list {
            return;
        }

        let checked = self.state.lock().unwrap().local_storage_checked;
        let action = self.action_now();

        if matches!(error, Some(DriverError::DataNotFound)) {
            if checked {
                warn!(
                    "Device {} reported that a passed print did not exist during action {:?}, but we verified the local storage!",
                    self.hw.name(),
                    action
                );
            } else {
                debug!(
                    "Device {} reported that a passed print did not exist during action {:?}",
                    self.hw.name(),
                    action
                );
            }
        } else if error.is_some() || checked {
            return;
        } else if !found_match {
            debug!(
                "Device {} failed to match during action {:?}, verifying local storage",
                self.hw.name(),
                action
            );
        } else {
            return;
        }

        self.state.lock().unwrap().local_storage_checked = true;

        let device_prints = match self.hw.list_prints().await {
            Ok(prints) => prints,
            Err(err) => {
                warn!("Failed to query prints: {err}");
                return;
            }
        };

        for print in self.load_all_prints() {
            if device_prints.iter().any(|dev| dev.same_identity(&print)) {
                continue;
            }

            // Print not known by device, remove locally.
            match self.store.delete(
                &print.driver,
                &print.device_id,
                print.finger,
                &print.username,
            ) {
                Ok(()) => info!(
                    "Deleted stored finger {} for user {} as it is unknown to device.",
                    print.finger, print.username
                ),
                Err(err) => warn!(
                    "Error deleting finger {} for user {} that is unknown to device: {err}!",
                    print.finger, print.username
                ),
            }
        }
    }

    /// Wind down a stoppable operation: hand the action back if a stop is
    /// waiting or cancellation was observed; otherwise the action stays put
    /// until the client issues its stop call.
    fn stoppable_action_completed(&self) {
        let mut state = self.state.lock().unwrap();
        let cancelled = state
            .cancel
            .as_ref()
            .map(|cancel| cancel.is_cancelled())
            .unwrap_or(false);

        if state.stop_pending || cancelled {
            state.stop_pending = false;
            if let Some(session) = &state.session {
                session.set_reported(false);
            }
            self.action.send_replace(Action::None);
        }

        state.cancel = None;
    }

    async fn stop_action(&self) {
        let cancel = {
            let mut state = self.state.lock().unwrap();
            state.stop_pending = true;
            state.cancel.clone()
        };

        match cancel {
            // We return only once the pipeline has observed cancellation.
            Some(cancel) => {
                cancel.cancel();
                self.wait_action_none().await;
            }
            None => {
                let mut state = self.state.lock().unwrap();
                state.stop_pending = false;
                if let Some(session) = &state.session {
                    session.set_reported(false);
                }
                self.action.send_replace(Action::None);
            }
        }
    }

    pub async fn verify_start(self: &Arc<Device>, sender: &str, finger_name: &str) -> Result<(), Error> {
        self.check_claimed(sender, ClaimRequest::Claimed)?;
        let session = self.session().expect("claimed device has a session");
        self.can_start_action()?;

        let mut finger = Finger::from_name(finger_name);
        let mut gallery = None;

        if finger == Finger::Unknown {
            let prints = self.load_user_prints(&session.username);
            if prints.is_empty() {
                return Err(Error::NoEnrolledPrints(
                    "No fingerprints enrolled".to_string(),
                ));
            }
            if prints.len() == 1 {
                // A single enrolled finger also means we report the real
                // slot back to the client.
                finger = prints[0].finger;
            } else if self.hw.features().identify {
                for print in &prints {
                    debug!("adding finger {} to the gallery", print.finger);
                }
            }
            gallery = Some(prints);
        }

        enum Plan {
            Identify(Vec<Print>),
            Verify(Print),
        }

        let plan = if self.hw.features().identify && finger == Finger::Unknown {
            Plan::Identify(gallery.expect("identify path always resolved a gallery"))
        } else {
            let print = match gallery {
                Some(mut prints) => {
                    let print = prints.swap_remove(0);
                    finger = print.finger;
                    Some(print)
                }
                None => self
                    .store
                    .load(
                        self.hw.driver(),
                        self.hw.device_id(),
                        finger,
                        &session.username,
                    )
                    .ok(),
            };

            let Some(print) = print else {
                return Err(Error::NoEnrolledPrints(format!("No such print {finger}")));
            };
            Plan::Verify(print)
        };

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().unwrap();
            state.cancel = Some(cancel.clone());
            match &plan {
                Plan::Identify(gallery) => state.identify_data = Some(gallery.clone()),
                Plan::Verify(print) => state.verify_data = Some(print.clone()),
            }
        }
        session.set_reported(false);
        self.action.send_replace(match plan {
            Plan::Identify(_) => Action::Identify,
            Plan::Verify(_) => Action::Verify,
        });

        // Tell the front-end which finger we selected for auth; queued
        // ahead of the pipeline so it precedes any VerifyStatus, and it
        // goes out before the method reply.
        self.emit(DeviceSignal::VerifyFingerSelected {
            finger: finger.name().to_string(),
        });

        let device = Arc::clone(self);
        let task_session = Arc::clone(&session);
        match plan {
            Plan::Identify(gallery) => {
                debug!("start identification device {}", self.id);
                tokio::spawn(async move {
                    device.run_identify(task_session, gallery, cancel).await;
                });
            }
            Plan::Verify(print) => {
                debug!("start verification device {} finger {}", self.id, finger);
                tokio::spawn(async move {
                    device.run_verify(task_session, print, cancel).await;
                });
            }
        }

        Ok(())
    }

    async fn run_verify(&self, session: Arc<Session>, print: Print, cancel: CancellationToken) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let result = loop {
            let capture = self.hw.verify(&print, cancel.clone(), event_tx.clone());
            tokio::pin!(capture);

            let result = loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        if let Some(event) = event {
                            self.handle_match_event(&session, &cancel, event);
                        }
                    }
                    result = &mut capture => break result,
                }
            };

            // Automatically restart the operation for retry failures.
            match result {
                Err(err) if err.is_retry() => continue,
                other => break other,
            }
        };

        while let Ok(event) = event_rx.try_recv() {
            self.handle_match_event(&session, &cancel, event);
        }

        self.state.lock().unwrap().verify_data = None;

        let matched = *result.as_ref().unwrap_or(&false);
        let error = result.as_ref().err();
        debug!("verify result {}", verify_result_name(matched, error));

        if let Some(err) = error {
            self.report_verify_status(&session, false, Some(err));
            if !err.is_cancelled() {
                warn!("Device reported an error during verify: {err}");
            }
        }

        self.check_local_storage(matched, error).await;
        self.stoppable_action_completed();
    }

    async fn run_identify(
        &self,
        session: Arc<Session>,
        gallery: Vec<Print>,
        cancel: CancellationToken,
    ) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let result = loop {
            let capture = self
                .hw
                .identify(&gallery, cancel.clone(), Some(event_tx.clone()));
            tokio::pin!(capture);

            let result = loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        if let Some(event) = event {
                            self.handle_match_event(&session, &cancel, event);
                        }
                    }
                    result = &mut capture => break result,
                }
            };

            match result {
                Err(err) if err.is_retry() => continue,
                other => break other,
            }
        };

        while let Ok(event) = event_rx.try_recv() {
            self.handle_match_event(&session, &cancel, event);
        }

        self.state.lock().unwrap().identify_data = None;

        let matched = result
            .as_ref()
            .map(|outcome| outcome.matched.is_some())
            .unwrap_or(false);
        let error = result.as_ref().err();
        debug!("identify result {}", verify_result_name(matched, error));

        if let Some(err) = error {
            self.report_verify_status(&session, false, Some(err));
            if !err.is_cancelled() {
                warn!("Device reported an error during identify: {err}");
            }
        }

        self.check_local_storage(matched, error).await;
        self.stoppable_action_completed();
    }

    fn handle_match_event(
        &self,
        session: &Session,
        cancel: &CancellationToken,
        event: MatchEvent,
    ) {
        match event {
            MatchEvent::Report { matched } => {
                let matched = matched && !cancel.is_cancelled();
                self.report_verify_status(session, matched, None);
            }
            MatchEvent::Retry(hint) => {
                self.report_verify_status(session, false, Some(&DriverError::Retry(hint)));
            }
        }
    }

    fn verify_has_completed(&self) -> bool {
        let state = self.state.lock().unwrap();
        match &state.cancel {
            None => true,
            Some(cancel) if cancel.is_cancelled() => true,
            Some(_) => match self.action_now() {
                Action::Verify => state.verify_data.is_none(),
                Action::Identify => state.identify_data.is_none(),
                _ => true,
            },
        }
    }

    pub async fn verify_stop(&self, sender: &str) -> Result<(), Error> {
        self.check_claimed(sender, ClaimRequest::Claimed)?;
        self.can_stop_action(Action::Verify)?;

        let reported = self.session().map(|s| s.reported()).unwrap_or(false);
        if !self.verify_has_completed() && reported {
            // A final status went out but the hardware side has not
            // settled; give the device a bounded window to report the real
            // outcome instead of forcing a cancel.
            self.state.lock().unwrap().stop_pending = true;

            let settled =
                tokio::time::timeout(VERIFY_STOP_DEVICE_WAIT, self.wait_action_none()).await;
            if settled.is_ok() || self.action_now() == Action::None {
                return Ok(());
            }

            self.state.lock().unwrap().stop_pending = false;
        }

        self.stop_action().await;
        Ok(())
    }

    pub async fn enroll_start(self: &Arc<Device>, sender: &str, finger_name: &str) -> Result<(), Error> {
        self.check_claimed(sender, ClaimRequest::Claimed)?;

        let finger = Finger::from_name(finger_name);
        if !finger.is_real() {
            return Err(Error::InvalidFingername("Invalid finger name".to_string()));
        }

        let session = self.session().expect("claimed device has a session");
        let existing = self
            .store
            .load(
                self.hw.driver(),
                self.hw.device_id(),
                finger,
                &session.username,
            )
            .ok();

        self.can_start_action()?;

        if existing.is_some() {
            self.delete_enrolled(&session.username, finger).await?;
        }

        debug!("start enrollment device {} finger {}", self.id, finger);

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().unwrap();
            state.cancel = Some(cancel.clone());
            state.enroll_data = Some(finger);
        }
        self.action.send_replace(Action::Enroll);

        if !self.hw.features().storage_list && self.load_all_prints().is_empty() {
            // No way to ever spot stale device-side prints on this reader:
            // guarantee a clean slate before the very first enrollment.
            if let Err(err) = self.hw.clear_storage().await {
                warn!("Failed to clear storage before first enrollment: {err}");
            }
        }

        let device = Arc::clone(self);
        let task_session = Arc::clone(&session);
        if self.hw.features().identify {
            tokio::spawn(async move {
                device.run_enroll_identify(task_session, cancel).await;
            });
        } else {
            warn!(
                "Device {} does not support duplicate identification and so duplicate detection won't work",
                self.hw.name()
            );
            tokio::spawn(async move {
                device.run_enroll(task_session, cancel).await;
            });
        }

        Ok(())
    }

    /// Duplicate-detection identify pass run before the actual capture.
    async fn run_enroll_identify(&self, session: Arc<Session>, cancel: CancellationToken) {
        loop {
            let gallery = self.load_all_prints();
            let result = self.hw.identify(&gallery, cancel.clone(), None).await;

            let outcome = match result {
                // No driver knows this finger anywhere; free to continue.
                Err(DriverError::DataNotFound) => Default::default(),
                Err(err) if err.is_retry() => {
                    self.emit(DeviceSignal::EnrollStatus {
                        result: enroll_result_name(false, false, Some(&err)).to_string(),
                        done: false,
                    });
                    continue;
                }
                Err(err) => {
                    self.emit(DeviceSignal::EnrollStatus {
                        result: enroll_result_name(true, false, Some(&err)).to_string(),
                        done: true,
                    });
                    if !err.is_cancelled() {
                        warn!("Device reported an error during identify for enroll: {err}");
                    }
                    self.stoppable_action_completed();
                    return;
                }
                Ok(outcome) => outcome,
            };

            if outcome.matched.is_some() {
                self.emit(DeviceSignal::EnrollStatus {
                    result: "enroll-duplicate".to_string(),
                    done: true,
                });
                self.stoppable_action_completed();
                return;
            }

            if let Some(found) = outcome.found {
                if self.hw.features().storage {
                    if !found.device_stored {
                        error!("driver bug: returned device print not marked as stored on device");
                    }

                    // Someone else's leftover for the same finger; drop it
                    // from the reader and continue if that works.
                    if let Err(err) = self.hw.delete_print(&found).await {
                        warn!(
                            "Failed to garbage collect duplicate print, cannot continue with enroll: {err}"
                        );
                        self.emit(DeviceSignal::EnrollStatus {
                            result: "enroll-duplicate".to_string(),
                            done: true,
                        });
                        self.stoppable_action_completed();
                        return;
                    }
                }
            }

            self.emit(DeviceSignal::EnrollStatus {
                result: "enroll-stage-passed".to_string(),
                done: false,
            });
            break;
        }

        self.run_enroll(session, cancel).await;
    }

    fn create_enroll_template(&self, username: &str, finger: Finger) -> Print {
        Print::template(
            self.hw.driver(),
            self.hw.device_id(),
            username,
            finger,
            chrono::Local::now().date_naive(),
        )
    }

    async fn run_enroll(&self, session: Arc<Session>, cancel: CancellationToken) {
        let stages = self.hw.nr_enroll_stages();
        // The slot snapshot taken at EnrollStart; restarts reuse it.
        let Some(finger) = self.state.lock().unwrap().enroll_data else {
            return;
        };

        let result = loop {
            let template = self.create_enroll_template(&session.username, finger);
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let capture = self.hw.enroll(template, cancel.clone(), progress_tx);
            tokio::pin!(capture);

            let result = loop {
                tokio::select! {
                    stage = progress_rx.recv() => {
                        if let Some(stage) = stage {
                            // The driver's last stage is subsumed by completion.
                            if stage.completed < stages {
                                let error = stage.retry.map(DriverError::Retry);
                                self.emit(DeviceSignal::EnrollStatus {
                                    result: enroll_result_name(false, false, error.as_ref())
                                        .to_string(),
                                    done: false,
                                });
                            }
                        }
                    }
                    result = &mut capture => break result,
                }
            };

            match result {
                Err(DriverError::DataFull) if self.hw.features().storage_list => {
                    debug!("Device storage is full");
                    if self.garbage_collect_device_print().await {
                        // Reclaimed a slot; restart with a fresh template.
                        continue;
                    }
                    break Err(DriverError::DataFull);
                }
                other => break other,
            }
        };

        self.state.lock().unwrap().enroll_data = None;

        let (name, error) = match &result {
            Ok(print) => {
                let name = match self.store.save(print) {
                    Ok(()) => enroll_result_name(true, true, None),
                    Err(err) => {
                        warn!("Failed to save enrolled print: {err}");
                        "enroll-failed"
                    }
                };
                (name, None)
            }
            Err(err) => (enroll_result_name(true, false, Some(err)), Some(err)),
        };

        debug!("enroll result {name}");
        self.emit(DeviceSignal::EnrollStatus {
            result: name.to_string(),
            done: true,
        });

        if let Some(err) = error {
            if !err.is_cancelled() {
                warn!("Device reported an error during enroll: {err}");
            }
        }

        self.stoppable_action_completed();
    }

    /// On-device garbage collection: delete the oldest reader-stored print
    /// that no host print equals. Ties broken by a stable random key.
    async fn garbage_collect_device_print(&self) -> bool {
        let device_prints = match self.hw.list_prints().await {
            Ok(prints) => prints,
            Err(err) => {
                warn!("Failed to query prints: {err}");
                return false;
            }
        };

        debug!("Device has {} prints stored", device_prints.len());

        let host_prints = self.load_all_prints();
        let mut candidates: Vec<(Print, (NaiveDate, u32))> = {
            let mut rng = rand::rng();
            device_prints
                .into_iter()
                .filter(|print| !host_prints.iter().any(|host| host == print))
                .map(|print| {
                    let key = (print.enroll_date, rng.random_range(1..u32::MAX));
                    (print, key)
                })
                .collect()
        };

        debug!(
            "Device has {} prints stored that we do not need",
            candidates.len()
        );
        if candidates.is_empty() {
            return false;
        }

        candidates.sort_by_key(|(_, key)| *key);

        if let Err(err) = self.hw.delete_print(&candidates[0].0).await {
            warn!("Failed to garbage collect a print: {err}");
            return false;
        }
        true
    }

    pub async fn enroll_stop(&self, sender: &str) -> Result<(), Error> {
        self.check_claimed(sender, ClaimRequest::Claimed)?;
        self.can_stop_action(Action::Enroll)?;
        self.stop_action().await;
        Ok(())
    }

    pub fn list_enrolled_fingers(
        self: &Arc<Device>,
        sender: &str,
        username: &str,
    ) -> Result<Vec<String>, Error> {
        self.add_client(sender);

        let names: Vec<String> = self
            .load_user_prints(username)
            .into_iter()
            .filter(|print| print.finger.is_real())
            .map(|print| print.finger.name().to_string())
            .collect();

        if names.is_empty() {
            return Err(Error::NoEnrolledPrints(
                "Failed to discover prints".to_string(),
            ));
        }
        Ok(names)
    }

    fn user_has_print_enrolled(&self, username: &str, finger: Finger) -> bool {
        let fingers = self
            .store
            .discover_prints(self.hw.driver(), self.hw.device_id(), username);
        if finger == Finger::Unknown {
            !fingers.is_empty()
        } else {
            fingers.contains(&finger)
        }
    }

    /// Delete one slot (or all, for `Unknown`) from the reader and the
    /// store. Host-store failures outrank device-side ones.
    async fn delete_enrolled(&self, username: &str, finger: Finger) -> Result<(), Error> {
        if finger.is_real() {
            debug!("Deleting enrolled finger {finger} for user {username}");
        } else {
            debug!("Deleting enrolled fingers for user {username}");
        }

        if !self.user_has_print_enrolled(username, finger) {
            return Err(if finger.is_real() {
                Error::NoEnrolledPrints(format!(
                    "Fingerprint for finger {finger} is not enrolled"
                ))
            } else {
                Error::NoEnrolledPrints("No fingerprint enrolled".to_string())
            });
        }

        let (driver, device_id) = (self.hw.driver(), self.hw.device_id());
        let mut device_error = None;

        // First try deleting from the reader itself; not fatal on its own.
        if self.hw.features().storage {
            for slot in self.store.discover_prints(driver, device_id, username) {
                let Ok(print) = self.store.load(driver, device_id, slot, username) else {
                    continue;
                };
                if finger.is_real() && print.finger != finger {
                    continue;
                }
                if let Err(err) = self.hw.delete_print(&print).await {
                    warn!("Error deleting print from device: {err}");
                    warn!("This might indicate an issue in the driver or in the fingerprint device.");
                    device_error.get_or_insert(Error::PrintsNotDeletedFromDevice(format!(
                        "Failed to delete print from device storage: {err}"
                    )));
                }
            }
        }

        if finger.is_real() {
            if let Err(err) = self.store.delete(driver, device_id, finger, username) {
                if self.user_has_print_enrolled(username, finger) {
                    return Err(Error::PrintsNotDeleted(format!(
                        "Impossible to delete fingerprint reference got error: {err}"
                    )));
                }
            }
        } else {
            let mut store_error = None;
            for slot in REAL_FINGERS {
                if let Err(err) = self.store.delete(driver, device_id, slot, username) {
                    if store_error.is_none() && self.user_has_print_enrolled(username, slot) {
                        store_error = Some(Error::PrintsNotDeleted(format!(
                            "Impossible to delete fingerprint reference got error: {err}"
                        )));
                        // Do not bail yet; try to remove the remaining prints.
                    }
                }
            }
            if let Some(err) = store_error {
                return Err(err);
            }
        }

        if let Some(err) = device_error {
            return Err(err);
        }
        Ok(())
    }

    pub async fn delete_enrolled_finger(&self, sender: &str, finger_name: &str) -> Result<(), Error> {
        self.check_claimed(sender, ClaimRequest::Claimed)?;

        let finger = Finger::from_name(finger_name);
        if !finger.is_real() {
            return Err(Error::InvalidFingername("Invalid finger name".to_string()));
        }

        self.can_start_action()?;
        let session = self.session().expect("claimed device has a session");

        let _guard = ActionGuard::set(&self.action, Action::Delete);
        self.delete_enrolled(&session.username, finger).await
    }

    pub async fn delete_enrolled_fingers2(&self, sender: &str) -> Result<(), Error> {
        self.check_claimed(sender, ClaimRequest::Claimed)?;
        self.can_start_action()?;
        let session = self.session().expect("claimed device has a session");

        let _guard = ActionGuard::set(&self.action, Action::Delete);
        self.delete_enrolled(&session.username, Finger::Unknown).await
    }

    /// Legacy delete path: claimed if the device is claimed, else one-shot
    /// open/close around the call.
    pub async fn delete_enrolled_fingers(
        self: &Arc<Device>,
        sender: &str,
        username: &str,
    ) -> Result<(), Error> {
        self.can_start_action()?;
        let _guard = ActionGuard::set(&self.action, Action::Delete);

        let opened = match self.check_claimed(sender, ClaimRequest::AutoClaim) {
            Ok(()) => self.hw.is_open(),
            // Any failure but "not claimed" is a real precondition failure.
            Err(Error::ClaimDevice(_)) => false,
            Err(err) => return Err(err),
        };

        self.add_client(sender);

        if !opened && self.hw.features().storage {
            let _ = self.hw.open().await;
        }

        let result = self.delete_enrolled(username, Finger::Unknown).await;

        if !opened && self.hw.features().storage {
            let _ = self.hw.close().await;
        }

        result
    }

    /// Forward to the driver; sleep preparation for the manager.
    pub async fn suspend(&self) {
        if let Err(err) = self.hw.suspend().await {
            match err {
                DriverError::NotOpen | DriverError::NotSupported => {}
                other => warn!("Unexpected error while suspending device: {other}"),
            }
        }
    }

    pub async fn resume(&self) {
        if let Err(err) = self.hw.resume().await {
            match err {
                DriverError::NotOpen | DriverError::NotSupported => {}
                other => warn!("Unexpected error while resuming device: {other}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDevice, Step};
    use crate::storage::FileStore;
    use std::path::PathBuf;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const CLIENT: &str = ":1.7";
    const OTHER_CLIENT: &str = ":1.42";

    struct MockWatcher {
        vanishes: Mutex<HashMap<String, Arc<Notify>>>,
    }

    impl MockWatcher {
        fn new() -> Arc<MockWatcher> {
            Arc::new(MockWatcher {
                vanishes: Mutex::new(HashMap::new()),
            })
        }

        fn gate(&self, sender: &str) -> Arc<Notify> {
            Arc::clone(
                self.vanishes
                    .lock()
                    .unwrap()
                    .entry(sender.to_string())
                    .or_default(),
            )
        }

        fn vanish(&self, sender: &str) {
            self.gate(sender).notify_one();
        }
    }

    #[async_trait]
    impl ClientWatcher for MockWatcher {
        async fn wait_vanish(&self, sender: &str) {
            let gate = self.gate(sender);
            gate.notified().await;
        }
    }

    struct Fixture {
        device: Arc<Device>,
        signals: mpsc::UnboundedReceiver<DeviceSignal>,
        hw: Arc<MockDevice>,
        watcher: Arc<MockWatcher>,
        store: Arc<dyn PrintStore>,
        root: PathBuf,
        _busy: mpsc::UnboundedReceiver<()>,
    }

    impl Fixture {
        fn new(name: &str) -> Fixture {
            let root = std::env::temp_dir().join(format!(
                "xfprintd-device-{name}-{}",
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&root);

            let hw = MockDevice::new("mock0");
            let store: Arc<dyn PrintStore> = Arc::new(FileStore::with_root(root.clone()));
            let watcher = MockWatcher::new();
            let (busy_tx, busy_rx) = mpsc::unbounded_channel();

            let (device, signals) = Device::new(
                Arc::clone(&hw) as Arc<dyn FpHwDevice>,
                Arc::clone(&store),
                Arc::clone(&watcher) as Arc<dyn ClientWatcher>,
                busy_tx,
            );

            Fixture {
                device,
                signals,
                hw,
                watcher,
                store,
                root,
                _busy: busy_rx,
            }
        }

        fn save_print(&self, username: &str, finger: Finger, data: &[u8]) -> Print {
            let print = Print {
                driver: "mock".to_string(),
                device_id: "mock0".to_string(),
                username: username.to_string(),
                finger,
                enroll_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                device_stored: false,
                data: data.to_vec(),
            };
            self.store.save(&print).unwrap();
            print
        }

        async fn next_signal(&mut self) -> DeviceSignal {
            timeout(Duration::from_secs(2), self.signals.recv())
                .await
                .expect("timed out waiting for a device signal")
                .expect("signal channel closed")
        }

        fn no_signal(&mut self) {
            assert!(
                self.signals.try_recv().is_err(),
                "expected no further signals"
            );
        }

        async fn wait_idle(&self) {
            let mut rx = self.device.action.subscribe();
            timeout(
                Duration::from_secs(2),
                rx.wait_for(|action| *action == Action::None),
            )
            .await
            .expect("device never returned to idle")
            .unwrap();
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn assert_verify_status(signal: DeviceSignal, result: &str, done: bool) {
        assert_eq!(
            signal,
            DeviceSignal::VerifyStatus {
                result: result.to_string(),
                done
            }
        );
    }

    fn assert_enroll_status(signal: DeviceSignal, result: &str, done: bool) {
        assert_eq!(
            signal,
            DeviceSignal::EnrollStatus {
                result: result.to_string(),
                done
            }
        );
    }

    #[tokio::test]
    async fn verify_without_claim_is_rejected() {
        let mut fx = Fixture::new("unclaimed-verify");
        let err = fx
            .device
            .verify_start(CLIENT, "right-index-finger")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClaimDevice(_)));
        fx.no_signal();
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let fx = Fixture::new("claim-exclusive");
        fx.device.claim(CLIENT, "alice").await.unwrap();

        let err = fx.device.claim(OTHER_CLIENT, "bob").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse(_)));

        // Claiming again from the same sender is just as wrong.
        let err = fx.device.claim(CLIENT, "alice").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse(_)));
    }

    #[tokio::test]
    async fn failed_open_resets_the_session() {
        let fx = Fixture::new("open-fails");
        fx.hw.set_fail_open(true);

        let err = fx.device.claim(CLIENT, "alice").await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(fx.device.session().is_none());

        fx.hw.set_fail_open(false);
        fx.device.claim(CLIENT, "alice").await.unwrap();
        assert!(fx.device.session().is_some());
    }

    #[tokio::test]
    async fn verify_any_with_single_print_reports_its_finger() {
        let mut fx = Fixture::new("verify-single");
        let print = fx.save_print("alice", Finger::LeftThumb, b"blob-1");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.hw.scan(b"blob-1");
        fx.device.verify_start(CLIENT, "any").await.unwrap();

        assert_eq!(
            fx.next_signal().await,
            DeviceSignal::VerifyFingerSelected {
                finger: print.finger.name().to_string()
            }
        );
        assert_verify_status(fx.next_signal().await, "verify-match", true);

        fx.device.verify_stop(CLIENT).await.unwrap();
        assert_eq!(fx.device.action_now(), Action::None);
        fx.device.release(CLIENT).await.unwrap();
        assert!(fx.device.session().is_none());
    }

    #[tokio::test]
    async fn verify_any_with_no_prints_fails() {
        let mut fx = Fixture::new("verify-empty");
        fx.device.claim(CLIENT, "alice").await.unwrap();

        let err = fx.device.verify_start(CLIENT, "any").await.unwrap_err();
        assert!(matches!(err, Error::NoEnrolledPrints(_)));
        fx.no_signal();
    }

    #[tokio::test]
    async fn verify_retries_surface_as_non_terminal_statuses() {
        let mut fx = Fixture::new("verify-retry");
        fx.save_print("alice", Finger::RightIndex, b"blob-1");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.hw.push(Step::Retry(RetryHint::TooShort));
        fx.hw.scan(b"blob-1");
        fx.device
            .verify_start(CLIENT, "right-index-finger")
            .await
            .unwrap();

        assert!(matches!(
            fx.next_signal().await,
            DeviceSignal::VerifyFingerSelected { .. }
        ));
        assert_verify_status(fx.next_signal().await, "verify-swipe-too-short", false);
        assert_verify_status(fx.next_signal().await, "verify-match", true);
    }

    #[tokio::test]
    async fn stop_before_any_result_cancels_and_reports_no_match() {
        let mut fx = Fixture::new("verify-stop-cancels");
        fx.save_print("alice", Finger::RightIndex, b"blob-1");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.device
            .verify_start(CLIENT, "right-index-finger")
            .await
            .unwrap();
        assert!(matches!(
            fx.next_signal().await,
            DeviceSignal::VerifyFingerSelected { .. }
        ));

        fx.device.verify_stop(CLIENT).await.unwrap();
        assert_verify_status(fx.next_signal().await, "verify-no-match", true);
        assert_eq!(fx.device.action_now(), Action::None);
    }

    #[tokio::test]
    async fn stop_during_settle_window_does_not_cancel() {
        let mut fx = Fixture::new("settle-window");
        fx.save_print("alice", Finger::RightIndex, b"blob-1");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.hw.set_hold_after_report(true);
        fx.hw.scan(b"blob-1");
        fx.device.verify_start(CLIENT, "any").await.unwrap();

        assert!(matches!(
            fx.next_signal().await,
            DeviceSignal::VerifyFingerSelected { .. }
        ));
        assert_verify_status(fx.next_signal().await, "verify-match", true);

        // The final status is out but the hardware has not settled yet; a
        // stop issued now must wait for settlement, not force a cancel.
        let device = Arc::clone(&fx.device);
        let stop = tokio::spawn(async move { device.verify_stop(CLIENT).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stop.is_finished());

        fx.hw.release_hold();
        stop.await.unwrap().unwrap();

        let cancelled = fx
            .device
            .state
            .lock()
            .unwrap()
            .cancel
            .as_ref()
            .map(|c| c.is_cancelled())
            .unwrap_or(false);
        assert!(!cancelled, "settled stop must not force a cancellation");
        assert_eq!(fx.device.action_now(), Action::None);
        fx.no_signal();
    }

    #[tokio::test]
    async fn settle_window_expiry_forces_the_cancel() {
        let mut fx = Fixture::new("settle-expiry");
        fx.save_print("alice", Finger::RightIndex, b"blob-1");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.hw.set_hold_after_report(true);
        fx.hw.scan(b"blob-1");
        fx.device.verify_start(CLIENT, "any").await.unwrap();

        assert!(matches!(
            fx.next_signal().await,
            DeviceSignal::VerifyFingerSelected { .. }
        ));
        assert_verify_status(fx.next_signal().await, "verify-match", true);

        // Nobody releases the hold: the settle window runs out and the
        // operation is cancelled; the post-final cancellation is discarded.
        fx.device.verify_stop(CLIENT).await.unwrap();
        assert_eq!(fx.device.action_now(), Action::None);
        fx.no_signal();
    }

    #[tokio::test]
    async fn release_cancels_inflight_operation() {
        let mut fx = Fixture::new("release-cancels");
        fx.save_print("alice", Finger::RightIndex, b"blob-1");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.device
            .verify_start(CLIENT, "right-index-finger")
            .await
            .unwrap();

        fx.device.release(CLIENT).await.unwrap();
        assert!(fx.device.session().is_none());
        assert_eq!(fx.device.action_now(), Action::None);
        assert_eq!(fx.hw.closes(), 1);

        assert!(matches!(
            fx.next_signal().await,
            DeviceSignal::VerifyFingerSelected { .. }
        ));
        assert_verify_status(fx.next_signal().await, "verify-no-match", true);
    }

    #[tokio::test]
    async fn enroll_completes_and_persists() {
        let mut fx = Fixture::new("enroll-complete");
        fx.device.claim(CLIENT, "alice").await.unwrap();

        fx.hw.scan(b"fresh"); // duplicate-detection identify pass
        fx.hw.scan(b"fresh");
        fx.hw.scan(b"fresh");
        fx.hw.scan(b"fresh");
        fx.device.enroll_start(CLIENT, "left-thumb").await.unwrap();

        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-completed", true);

        let loaded = fx
            .store
            .load("mock", "mock0", Finger::LeftThumb, "alice")
            .unwrap();
        assert_eq!(loaded.data, b"fresh");
        assert_eq!(
            fx.device.list_enrolled_fingers(CLIENT, "alice").unwrap(),
            vec!["left-thumb"]
        );

        fx.device.enroll_stop(CLIENT).await.unwrap();
        assert_eq!(fx.device.action_now(), Action::None);
    }

    #[tokio::test]
    async fn enroll_rejects_the_any_finger() {
        let fx = Fixture::new("enroll-any");
        fx.device.claim(CLIENT, "alice").await.unwrap();
        let err = fx.device.enroll_start(CLIENT, "any").await.unwrap_err();
        assert!(matches!(err, Error::InvalidFingername(_)));
    }

    #[tokio::test]
    async fn enrolling_same_finger_again_deletes_the_old_print_first() {
        let mut fx = Fixture::new("enroll-replace");
        let old = fx.save_print("alice", Finger::LeftThumb, b"old-blob");
        fx.hw.store_print(old.clone());

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.hw.scan(b"new-blob");
        fx.hw.scan(b"new-blob");
        fx.hw.scan(b"new-blob");
        fx.hw.scan(b"new-blob");
        fx.device.enroll_start(CLIENT, "left-thumb").await.unwrap();

        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-completed", true);

        // The stale template went away both host- and device-side.
        assert!(fx.hw.deleted().iter().any(|p| p.data == b"old-blob"));
        let loaded = fx
            .store
            .load("mock", "mock0", Finger::LeftThumb, "alice")
            .unwrap();
        assert_eq!(loaded.data, b"new-blob");
    }

    #[tokio::test]
    async fn enrolling_an_already_enrolled_finger_is_a_duplicate() {
        let mut fx = Fixture::new("enroll-duplicate");
        fx.save_print("alice", Finger::LeftThumb, b"thumb-blob");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        // The identify pass sees the finger that is already enrolled for
        // the other slot.
        fx.hw.scan(b"thumb-blob");
        fx.device
            .enroll_start(CLIENT, "right-index-finger")
            .await
            .unwrap();

        assert_enroll_status(fx.next_signal().await, "enroll-duplicate", true);
        fx.wait_idle().await;
        assert!(fx
            .store
            .load("mock", "mock0", Finger::RightIndex, "alice")
            .is_err());
    }

    #[tokio::test]
    async fn foreign_device_print_is_dropped_before_enrolling() {
        let mut fx = Fixture::new("enroll-foreign");
        let mut foreign = fx.save_print("ghost", Finger::RightRing, b"foreign-blob");
        // Only on the reader, not in our store.
        fx.store
            .delete("mock", "mock0", Finger::RightRing, "ghost")
            .unwrap();
        foreign.device_stored = true;
        fx.hw.store_print(foreign);

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.hw.scan(b"foreign-blob"); // identify: found on device only
        fx.hw.scan(b"foreign-blob");
        fx.hw.scan(b"foreign-blob");
        fx.hw.scan(b"foreign-blob");
        fx.device.enroll_start(CLIENT, "left-thumb").await.unwrap();

        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-completed", true);

        assert!(fx.hw.deleted().iter().any(|p| p.data == b"foreign-blob"));
    }

    #[tokio::test]
    async fn full_device_storage_garbage_collects_the_oldest_print() {
        let mut fx = Fixture::new("enroll-gc");

        let mut oldest = fx.save_print("ghost", Finger::LeftRing, b"oldest");
        fx.store
            .delete("mock", "mock0", Finger::LeftRing, "ghost")
            .unwrap();
        oldest.enroll_date = chrono::NaiveDate::from_ymd_opt(2019, 2, 2).unwrap();
        oldest.device_stored = true;
        let mut newer = oldest.clone();
        newer.data = b"newer".to_vec();
        newer.enroll_date = chrono::NaiveDate::from_ymd_opt(2023, 7, 7).unwrap();
        fx.hw.store_print(oldest);
        fx.hw.store_print(newer);

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.hw.scan(b"fresh"); // identify pass
        fx.hw.push(Step::DataFull); // first capture attempt
        fx.hw.scan(b"fresh");
        fx.hw.scan(b"fresh");
        fx.hw.scan(b"fresh");
        fx.device.enroll_start(CLIENT, "left-thumb").await.unwrap();

        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-stage-passed", false);
        assert_enroll_status(fx.next_signal().await, "enroll-completed", true);

        let deleted = fx.hw.deleted();
        assert_eq!(deleted.len(), 1, "exactly one garbage-collected print");
        assert_eq!(deleted[0].data, b"oldest");
    }

    #[tokio::test]
    async fn vanished_claimant_mid_enroll_frees_the_device() {
        let mut fx = Fixture::new("vanish-enroll");
        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.device.enroll_start(CLIENT, "left-thumb").await.unwrap();

        fx.watcher.vanish(CLIENT);
        assert_enroll_status(fx.next_signal().await, "enroll-failed", true);

        fx.wait_idle().await;
        timeout(Duration::from_secs(2), async {
            while fx.device.session().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never cleared after vanish");
        assert!(fx.hw.closes() >= 1);

        fx.device.claim(OTHER_CLIENT, "bob").await.unwrap();
        assert_eq!(fx.device.session().unwrap().username, "bob");
    }

    #[tokio::test]
    async fn list_enrolled_fingers_without_prints_fails() {
        let fx = Fixture::new("list-empty");
        let err = fx
            .device
            .list_enrolled_fingers(CLIENT, "alice")
            .unwrap_err();
        assert!(matches!(err, Error::NoEnrolledPrints(_)));
    }

    #[tokio::test]
    async fn delete_returns_the_slot_to_its_pre_enroll_state() {
        let fx = Fixture::new("delete-one");
        let print = fx.save_print("alice", Finger::LeftThumb, b"blob");
        fx.hw.store_print(print);

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.device
            .delete_enrolled_finger(CLIENT, "left-thumb")
            .await
            .unwrap();

        assert!(fx
            .store
            .load("mock", "mock0", Finger::LeftThumb, "alice")
            .is_err());
        assert!(fx.hw.deleted().iter().any(|p| p.data == b"blob"));
        assert_eq!(fx.device.action_now(), Action::None);

        // Deleting again: nothing enrolled anymore.
        let err = fx
            .device
            .delete_enrolled_finger(CLIENT, "left-thumb")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEnrolledPrints(_)));
    }

    #[tokio::test]
    async fn legacy_delete_auto_claims_around_the_call() {
        let fx = Fixture::new("delete-legacy");
        fx.save_print("alice", Finger::LeftThumb, b"blob");

        fx.device
            .delete_enrolled_fingers(CLIENT, "alice")
            .await
            .unwrap();

        assert_eq!(fx.hw.opens(), 1);
        assert_eq!(fx.hw.closes(), 1);
        assert!(fx.device.session().is_none());
        assert!(fx
            .store
            .load("mock", "mock0", Finger::LeftThumb, "alice")
            .is_err());
    }

    #[tokio::test]
    async fn no_match_reconciles_host_storage_once() {
        let mut fx = Fixture::new("reconcile");
        fx.save_print("alice", Finger::RightIndex, b"host-only");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.hw.scan(b"wrong");
        fx.device
            .verify_start(CLIENT, "right-index-finger")
            .await
            .unwrap();

        assert!(matches!(
            fx.next_signal().await,
            DeviceSignal::VerifyFingerSelected { .. }
        ));
        assert_verify_status(fx.next_signal().await, "verify-no-match", true);
        fx.device.verify_stop(CLIENT).await.unwrap();

        // The reader does not know the print, so the host copy went away.
        assert!(fx
            .store
            .load("mock", "mock0", Finger::RightIndex, "alice")
            .is_err());

        // Latched: a second miss does not reconcile again.
        fx.save_print("alice", Finger::RightIndex, b"host-only");
        fx.hw.scan(b"wrong");
        fx.device
            .verify_start(CLIENT, "right-index-finger")
            .await
            .unwrap();
        assert!(matches!(
            fx.next_signal().await,
            DeviceSignal::VerifyFingerSelected { .. }
        ));
        assert_verify_status(fx.next_signal().await, "verify-no-match", true);
        fx.device.verify_stop(CLIENT).await.unwrap();

        assert!(fx
            .store
            .load("mock", "mock0", Finger::RightIndex, "alice")
            .is_ok());
    }

    #[tokio::test]
    async fn stop_without_operation_reports_no_action() {
        let fx = Fixture::new("stop-nothing");
        fx.device.claim(CLIENT, "alice").await.unwrap();

        let err = fx.device.verify_stop(CLIENT).await.unwrap_err();
        assert!(matches!(err, Error::NoActionInProgress(_)));
        let err = fx.device.enroll_stop(CLIENT).await.unwrap_err();
        assert!(matches!(err, Error::NoActionInProgress(_)));
    }

    #[tokio::test]
    async fn concurrent_start_is_already_in_use() {
        let fx = Fixture::new("concurrent-start");
        fx.save_print("alice", Finger::RightIndex, b"blob");

        fx.device.claim(CLIENT, "alice").await.unwrap();
        fx.device
            .verify_start(CLIENT, "right-index-finger")
            .await
            .unwrap();

        let err = fx
            .device
            .verify_start(CLIENT, "right-index-finger")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse(_)));
        let err = fx
            .device
            .enroll_start(CLIENT, "left-thumb")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse(_)));
    }

    #[tokio::test]
    async fn busy_follows_the_client_map() {
        let fx = Fixture::new("busy");
        assert!(!fx.device.busy());

        fx.device.claim(CLIENT, "alice").await.unwrap();
        assert!(fx.device.busy());

        fx.watcher.vanish(CLIENT);
        timeout(Duration::from_secs(2), async {
            while fx.device.busy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("device never went idle after vanish");
    }
}
