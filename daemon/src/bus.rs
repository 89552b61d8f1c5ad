//! D-Bus skeletons for the Manager and Device objects.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use zbus::message::Header;
use zbus::names::BusName;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedObjectPath;
use zbus::{interface, Connection};

use crate::auth::Gate;
use crate::device::{ClientWatcher, Device, DeviceSignal};
use crate::driver::HwChange;
use crate::error::Error;
use crate::manager::{DeviceExporter, Manager, SERVICE_PATH};

fn sender_of(hdr: &Header<'_>) -> Result<String, Error> {
    hdr.sender()
        .map(|name| name.to_string())
        .ok_or_else(|| Error::Internal("Message has no sender".to_string()))
}

fn device_path(id: u32) -> String {
    format!("{SERVICE_PATH}/Device/{id}")
}

/// The `net.reactivated.Fprint.Manager` skeleton.
pub struct ManagerIface {
    manager: Arc<Manager>,
}

impl ManagerIface {
    pub fn new(manager: Arc<Manager>) -> ManagerIface {
        ManagerIface { manager }
    }
}

#[interface(name = "net.reactivated.Fprint.Manager")]
impl ManagerIface {
    async fn get_devices(&self) -> Result<Vec<OwnedObjectPath>, Error> {
        self.manager
            .device_paths()
            .into_iter()
            .map(|path| {
                OwnedObjectPath::try_from(path)
                    .map_err(|err| Error::Internal(format!("Bad device path: {err}")))
            })
            .collect()
    }

    async fn get_default_device(&self) -> Result<OwnedObjectPath, Error> {
        let path = self.manager.default_device_path()?;
        OwnedObjectPath::try_from(path)
            .map_err(|err| Error::Internal(format!("Bad device path: {err}")))
    }
}

/// The `net.reactivated.Fprint.Device` skeleton at `…/Device/<id>`.
///
/// Every method runs the authorization gate first and lets the device
/// object enforce the state machine afterwards.
pub struct DeviceIface {
    device: Arc<Device>,
    gate: Arc<Gate>,
    conn: Connection,
}

#[interface(name = "net.reactivated.Fprint.Device")]
impl DeviceIface {
    async fn claim(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        username: String,
    ) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;
        let user = self
            .gate
            .authorize(&self.device, &sender, "Claim", Some(&username))
            .await?
            .expect("Claim always resolves a user");
        self.device.claim(&sender, &user).await
    }

    async fn release(&self, #[zbus(header)] hdr: Header<'_>) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;
        self.gate
            .authorize(&self.device, &sender, "Release", None)
            .await?;
        self.device.release(&sender).await
    }

    async fn enroll_start(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        finger_name: String,
    ) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;
        self.gate
            .authorize(&self.device, &sender, "EnrollStart", None)
            .await?;
        self.device.enroll_start(&sender, &finger_name).await
    }

    async fn enroll_stop(&self, #[zbus(header)] hdr: Header<'_>) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;
        self.gate
            .authorize(&self.device, &sender, "EnrollStop", None)
            .await?;
        self.device.enroll_stop(&sender).await
    }

    async fn verify_start(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        finger_name: String,
    ) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;
        self.gate
            .authorize(&self.device, &sender, "VerifyStart", None)
            .await?;
        self.device.verify_start(&sender, &finger_name).await
    }

    async fn verify_stop(&self, #[zbus(header)] hdr: Header<'_>) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;
        self.gate
            .authorize(&self.device, &sender, "VerifyStop", None)
            .await?;
        self.device.verify_stop(&sender).await
    }

    async fn list_enrolled_fingers(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        username: String,
    ) -> Result<Vec<String>, Error> {
        let sender = sender_of(&hdr)?;
        let user = self
            .gate
            .authorize(&self.device, &sender, "ListEnrolledFingers", Some(&username))
            .await?
            .expect("ListEnrolledFingers always resolves a user");
        self.device.list_enrolled_fingers(&sender, &user)
    }

    async fn delete_enrolled_finger(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        finger_name: String,
    ) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;
        self.gate
            .authorize(&self.device, &sender, "DeleteEnrolledFinger", None)
            .await?;
        self.device.delete_enrolled_finger(&sender, &finger_name).await
    }

    /// Deprecated path kept for old clients; auto-claims when unclaimed.
    async fn delete_enrolled_fingers(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        username: String,
    ) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;

        warn!("The API user should be updated to use DeleteEnrolledFingers2 method!");
        log_offending_client(self.conn.clone(), sender.clone());

        let user = self
            .gate
            .authorize(&self.device, &sender, "DeleteEnrolledFingers", Some(&username))
            .await?
            .expect("DeleteEnrolledFingers always resolves a user");
        self.device.delete_enrolled_fingers(&sender, &user).await
    }

    async fn delete_enrolled_fingers2(&self, #[zbus(header)] hdr: Header<'_>) -> Result<(), Error> {
        let sender = sender_of(&hdr)?;
        self.gate
            .authorize(&self.device, &sender, "DeleteEnrolledFingers2", None)
            .await?;
        self.device.delete_enrolled_fingers2(&sender).await
    }

    #[zbus(property)]
    async fn name(&self) -> String {
        self.device.hw().name().to_string()
    }

    #[zbus(property)]
    async fn scan_type(&self) -> String {
        self.device.hw().scan_type().as_str().to_string()
    }

    /// One extra step is advertised for the internal duplicate-detection
    /// identify pass.
    #[zbus(property)]
    async fn num_enroll_stages(&self) -> i32 {
        let mut stages = self.device.hw().nr_enroll_stages() as i32;
        if self.device.hw().features().identify {
            stages += 1;
        }
        stages
    }

    #[zbus(property)]
    async fn finger_present(&self) -> bool {
        self.device.hw().finger_status().present
    }

    #[zbus(property)]
    async fn finger_needed(&self) -> bool {
        self.device.hw().finger_status().needed
    }

    #[zbus(signal)]
    async fn verify_status(
        emitter: &SignalEmitter<'_>,
        result: &str,
        done: bool,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn verify_finger_selected(
        emitter: &SignalEmitter<'_>,
        finger_name: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn enroll_status(
        emitter: &SignalEmitter<'_>,
        result: &str,
        done: bool,
    ) -> zbus::Result<()>;
}

/// Best-effort log of which process is still using the legacy API.
fn log_offending_client(conn: Connection, sender: String) {
    tokio::spawn(async move {
        let Ok(proxy) = zbus::fdo::DBusProxy::new(&conn).await else {
            return;
        };
        let Ok(name) = BusName::try_from(sender) else {
            return;
        };
        let Ok(pid) = proxy.get_connection_unix_process_id(name).await else {
            return;
        };
        if let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) {
            warn!("Offending API user is {}", comm.trim());
        }
    });
}

/// Exports device objects on the bus and pumps their signal channel.
pub struct BusExporter {
    conn: Connection,
    gate: Arc<Gate>,
}

impl BusExporter {
    pub fn new(conn: Connection, gate: Arc<Gate>) -> BusExporter {
        BusExporter { conn, gate }
    }
}

#[async_trait]
impl DeviceExporter for BusExporter {
    async fn export(&self, device: Arc<Device>, signals: mpsc::UnboundedReceiver<DeviceSignal>) {
        let path = device_path(device.id());
        let iface = DeviceIface {
            device: Arc::clone(&device),
            gate: Arc::clone(&self.gate),
            conn: self.conn.clone(),
        };

        if let Err(err) = self.conn.object_server().at(path.as_str(), iface).await {
            warn!("Failed to export device object {path}: {err}");
            return;
        }
        debug!("exported device object {path}");

        tokio::spawn(pump_signals(self.conn.clone(), path.clone(), signals));
        tokio::spawn(pump_property_changes(self.conn.clone(), path, device));
    }

    async fn unexport(&self, device_id: u32) {
        let path = device_path(device_id);
        match self
            .conn
            .object_server()
            .remove::<DeviceIface, _>(path.as_str())
            .await
        {
            Ok(_) => debug!("unexported device object {path}"),
            Err(err) => warn!("Failed to unexport device object {path}: {err}"),
        }
    }
}

async fn pump_signals(
    conn: Connection,
    path: String,
    mut signals: mpsc::UnboundedReceiver<DeviceSignal>,
) {
    let emitter = match SignalEmitter::new(&conn, path.clone()) {
        Ok(emitter) => emitter,
        Err(err) => {
            warn!("Cannot emit signals for {path}: {err}");
            return;
        }
    };

    while let Some(signal) = signals.recv().await {
        let sent = match &signal {
            DeviceSignal::VerifyStatus { result, done } => {
                DeviceIface::verify_status(&emitter, result, *done).await
            }
            DeviceSignal::VerifyFingerSelected { finger } => {
                DeviceIface::verify_finger_selected(&emitter, finger).await
            }
            DeviceSignal::EnrollStatus { result, done } => {
                DeviceIface::enroll_status(&emitter, result, *done).await
            }
        };
        if let Err(err) = sent {
            warn!("Failed to emit device signal on {path}: {err}");
        }
    }
}

/// Forward reader property changes into `PropertiesChanged` emissions.
async fn pump_property_changes(conn: Connection, path: String, device: Arc<Device>) {
    let mut changes = device.hw().changes();
    drop(device);

    while let Ok(change) = changes.recv().await {
        let Ok(iface_ref) = conn
            .object_server()
            .interface::<_, DeviceIface>(path.as_str())
            .await
        else {
            return;
        };
        let emitter = iface_ref.signal_emitter();
        let iface = iface_ref.get().await;

        let sent = match change {
            HwChange::FingerStatus => {
                let present = iface.finger_present_changed(emitter).await;
                let needed = iface.finger_needed_changed(emitter).await;
                present.and(needed)
            }
            HwChange::ScanType => iface.scan_type_changed(emitter).await,
            HwChange::EnrollStages => iface.num_enroll_stages_changed(emitter).await,
            HwChange::Temperature => Ok(()),
        };
        if let Err(err) = sent {
            warn!("Failed to emit property change on {path}: {err}");
        }
    }
}

/// Client-vanished watching over the bus name registry.
pub struct BusWatcher {
    conn: Connection,
}

impl BusWatcher {
    pub fn new(conn: Connection) -> BusWatcher {
        BusWatcher { conn }
    }
}

#[async_trait]
impl ClientWatcher for BusWatcher {
    async fn wait_vanish(&self, sender: &str) {
        let Ok(proxy) = zbus::fdo::DBusProxy::new(&self.conn).await else {
            return;
        };
        let Ok(name) = BusName::try_from(sender.to_string()) else {
            return;
        };

        let mut stream = match proxy
            .receive_name_owner_changed_with_args(&[(0, sender)])
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Cannot watch client {sender}: {err}");
                return;
            }
        };

        // The client may have vanished before the subscription landed.
        match proxy.name_has_owner(name).await {
            Ok(false) => return,
            _ => {}
        }

        while let Some(signal) = stream.next().await {
            let Ok(args) = signal.args() else { continue };
            if args.new_owner().is_none() {
                return;
            }
        }
    }
}
