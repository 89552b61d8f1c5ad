//! Manager: owns the set of reader objects, the idle-exit timer and the
//! sleep/resume coordination with the seat service.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use zbus::Connection;

use crate::device::{ClientWatcher, Device, DeviceSignal};
use crate::driver::{FpHwContext, FpHwDevice, HotplugEvent};
use crate::error::Error;
use crate::storage::PrintStore;

pub const SERVICE_NAME: &str = "net.reactivated.Fprint";
pub const SERVICE_PATH: &str = "/net/reactivated/Fprint";
pub const MANAGER_PATH: &str = "/net/reactivated/Fprint/Manager";

/// Idle window after which an unused daemon exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Seat service seam: sleep notifications plus delay inhibitors. The
/// inhibitor is released by dropping the returned handle.
#[async_trait]
pub trait SeatService: Send + Sync {
    async fn take_sleep_inhibitor(&self) -> Option<Box<dyn Send>>;

    /// Next PrepareForSleep edge (`true` = going down); `None` once the
    /// stream ends.
    async fn next_sleep_event(&self) -> Option<bool>;
}

const LOGIND_BUS_NAME: &str = "org.freedesktop.login1";
const LOGIND_OBJ_PATH: &str = "/org/freedesktop/login1";
const LOGIND_IFACE_NAME: &str = "org.freedesktop.login1.Manager";

/// The real seat service, logind on the system bus.
pub struct LogindSeat {
    proxy: zbus::Proxy<'static>,
    events: tokio::sync::Mutex<zbus::proxy::SignalStream<'static>>,
}

impl LogindSeat {
    pub async fn new(conn: &Connection) -> zbus::Result<LogindSeat> {
        let proxy = zbus::Proxy::new(
            conn,
            LOGIND_BUS_NAME,
            LOGIND_OBJ_PATH,
            LOGIND_IFACE_NAME,
        )
        .await?;
        let events = proxy.receive_signal("PrepareForSleep").await?;
        Ok(LogindSeat {
            proxy,
            events: tokio::sync::Mutex::new(events),
        })
    }
}

#[async_trait]
impl SeatService for LogindSeat {
    async fn take_sleep_inhibitor(&self) -> Option<Box<dyn Send>> {
        let args = (
            "sleep",
            SERVICE_NAME,
            "Suspend fingerprint readers",
            "delay",
        );
        match self
            .proxy
            .call::<_, _, zbus::zvariant::OwnedFd>("Inhibit", &args)
            .await
        {
            Ok(fd) => Some(Box::new(fd)),
            Err(err) => {
                warn!("Failed to install a sleep delay inhibitor: {err}");
                None
            }
        }
    }

    async fn next_sleep_event(&self) -> Option<bool> {
        loop {
            let msg = self.events.lock().await.next().await?;
            match msg.body().deserialize::<(bool,)>() {
                Ok((start,)) => return Some(start),
                Err(err) => {
                    warn!("Received incorrect parameter for PrepareForSleep signal: {err}");
                }
            }
        }
    }
}

/// Publishes device objects somewhere clients can reach them; the bus
/// layer implements this, tests stub it out.
#[async_trait]
pub trait DeviceExporter: Send + Sync {
    async fn export(&self, device: Arc<Device>, signals: mpsc::UnboundedReceiver<DeviceSignal>);
    async fn unexport(&self, device_id: u32);
}

pub struct ManagerOptions {
    pub no_timeout: bool,
    pub idle_timeout: Duration,
    /// Invoked when the idle window elapses with nothing busy.
    pub on_idle_exit: Box<dyn Fn() + Send + Sync>,
}

impl Default for ManagerOptions {
    fn default() -> ManagerOptions {
        ManagerOptions {
            no_timeout: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            on_idle_exit: Box::new(|| std::process::exit(0)),
        }
    }
}

pub struct Manager {
    store: Arc<dyn PrintStore>,
    watcher: Arc<dyn ClientWatcher>,
    exporter: Arc<dyn DeviceExporter>,
    devices: Mutex<Vec<Arc<Device>>>,
    busy_tx: mpsc::UnboundedSender<()>,
}

impl Manager {
    /// Build the manager and enumerate all present readers before
    /// returning, so a client connecting right away sees every device.
    pub async fn new(
        ctx: Arc<dyn FpHwContext>,
        store: Arc<dyn PrintStore>,
        watcher: Arc<dyn ClientWatcher>,
        seat: Arc<dyn SeatService>,
        exporter: Arc<dyn DeviceExporter>,
        options: ManagerOptions,
    ) -> Arc<Manager> {
        let (busy_tx, busy_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Manager {
            store,
            watcher,
            exporter,
            devices: Mutex::new(Vec::new()),
            busy_tx,
        });

        for hw in ctx.enumerate().await {
            manager.add_device(hw).await;
        }

        tokio::spawn(hotplug_loop(Arc::downgrade(&manager), ctx));
        tokio::spawn(idle_loop(Arc::downgrade(&manager), busy_rx, options));
        tokio::spawn(sleep_loop(Arc::downgrade(&manager), seat));

        manager
    }

    async fn add_device(self: &Arc<Manager>, hw: Arc<dyn FpHwDevice>) {
        let (device, signals) = Device::new(
            hw,
            Arc::clone(&self.store),
            Arc::clone(&self.watcher),
            self.busy_tx.clone(),
        );

        info!("added device {} ({})", device.id(), device.hw().name());
        self.devices.lock().unwrap().push(Arc::clone(&device));
        self.exporter.export(device, signals).await;
    }

    async fn remove_device(&self, hw_device_id: &str) {
        let removed = {
            let mut devices = self.devices.lock().unwrap();
            let index = devices
                .iter()
                .position(|d| d.hw().device_id() == hw_device_id);
            index.map(|index| devices.remove(index))
        };

        if let Some(device) = removed {
            info!("removed device {} ({})", device.id(), device.hw().name());
            device.drop_clients();
            self.exporter.unexport(device.id()).await;
        }

        // The device that disappeared might have been busy.
        let _ = self.busy_tx.send(());
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().clone()
    }

    pub fn device_paths(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|device| format!("{SERVICE_PATH}/Device/{}", device.id()))
            .collect()
    }

    /// Path of the default device: the last one enumerated.
    pub fn default_device_path(&self) -> Result<String, Error> {
        self.device_paths()
            .pop()
            .ok_or_else(|| Error::NoSuchDevice("No devices available".to_string()))
    }

    fn busy_count(&self) -> usize {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .filter(|device| device.busy())
            .count()
    }
}

async fn hotplug_loop(manager: Weak<Manager>, ctx: Arc<dyn FpHwContext>) {
    while let Some(event) = ctx.next_event().await {
        let Some(manager) = manager.upgrade() else { return };
        match event {
            HotplugEvent::Added(hw) => manager.add_device(hw).await,
            HotplugEvent::Removed(device_id) => manager.remove_device(&device_id).await,
        }
    }
}

/// Exit the process after a full idle window with no busy device.
async fn idle_loop(
    manager: Weak<Manager>,
    mut busy_rx: mpsc::UnboundedReceiver<()>,
    options: ManagerOptions,
) {
    if options.no_timeout {
        while busy_rx.recv().await.is_some() {}
        return;
    }

    loop {
        let Some(current) = manager.upgrade() else { return };
        let busy = current.busy_count() > 0;
        drop(current);

        if busy {
            if busy_rx.recv().await.is_none() {
                return;
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(options.idle_timeout) => {
                info!("exiting after idle timeout");
                (options.on_idle_exit)();
                return;
            }
            changed = busy_rx.recv() => {
                if changed.is_none() {
                    return;
                }
            }
        }
    }
}

/// Sleep coordination: hold a delay inhibitor while awake, suspend every
/// reader on the way down and only then let go of the inhibitor, resume
/// and re-acquire on the way up.
async fn sleep_loop(manager: Weak<Manager>, seat: Arc<dyn SeatService>) {
    let mut inhibitor = seat.take_sleep_inhibitor().await;
    if inhibitor.is_some() {
        debug!("Got delay inhibitor for sleep.");
    }

    while let Some(start) = seat.next_sleep_event().await {
        let Some(current) = manager.upgrade() else { return };
        let devices = current.devices();
        drop(current);

        debug!(
            "Preparing devices for {}",
            if start { "sleep" } else { "resume" }
        );

        if start {
            join_all(devices.iter().map(|device| device.suspend())).await;
            if inhibitor.take().is_some() {
                debug!("Released delay inhibitor for sleep.");
            }
        } else {
            join_all(devices.iter().map(|device| device.resume())).await;
            inhibitor = seat.take_sleep_inhibitor().await;
            if inhibitor.is_some() {
                debug!("Got delay inhibitor for sleep.");
            }
        }
    }
}
