//! Async helpers for the xfprintd D-Bus interface.

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};
use zbus::zvariant::{OwnedObjectPath, Type};
use zbus::{Connection, Proxy};

/// D-Bus service name of the daemon.
pub const SERVICE: &str = "net.reactivated.Fprint";

/// Manager object path.
pub const MANAGER_PATH: &str = "/net/reactivated/Fprint/Manager";

/// Manager interface name.
pub const IFACE_MANAGER: &str = "net.reactivated.Fprint.Manager";

/// Device interface name.
pub const IFACE_DEVICE: &str = "net.reactivated.Fprint.Device";

/// Supported finger names.
pub const FINGERS: &[&str] = &[
    "left-thumb",
    "left-index-finger",
    "left-middle-finger",
    "left-ring-finger",
    "left-little-finger",
    "right-thumb",
    "right-index-finger",
    "right-middle-finger",
    "right-ring-finger",
    "right-little-finger",
];

/// A VerifyStatus/EnrollStatus signal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub result: String,
    pub done: bool,
}

/// Async client with system bus connection.
#[derive(Clone)]
pub struct Client {
    conn: Connection,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to system bus.
    pub async fn system() -> zbus::Result<Self> {
        let conn = Connection::system().await?;
        Ok(Self { conn })
    }

    /// Create Manager helper.
    pub fn manager(&self) -> Manager {
        Manager {
            conn: self.conn.clone(),
        }
    }

    /// Create Device helper for specific path.
    pub fn device(&self, object_path: OwnedObjectPath) -> Device {
        Device {
            conn: self.conn.clone(),
            object_path,
        }
    }
}

/// Manager interface helper.
#[derive(Clone)]
pub struct Manager {
    conn: Connection,
}

impl Manager {
    async fn proxy(&self) -> zbus::Result<Proxy<'_>> {
        Proxy::new(&self.conn, SERVICE, MANAGER_PATH, IFACE_MANAGER).await
    }

    /// Generic method call.
    async fn call<R>(
        &self,
        method: &str,
        args: &(impl Serialize + Type + fmt::Debug),
    ) -> zbus::Result<R>
    where
        R: DeserializeOwned + Type,
    {
        let proxy = self.proxy().await?;

        proxy.call(method, args).await
    }

    /// Get device object paths.
    pub async fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>> {
        let paths: Vec<OwnedObjectPath> = self.call("GetDevices", &()).await?;
        Ok(paths)
    }

    /// Get default device path.
    pub async fn get_default_device(&self) -> zbus::Result<OwnedObjectPath> {
        let path: OwnedObjectPath = self.call("GetDefaultDevice", &()).await?;
        Ok(path)
    }
}

/// Device interface helper.
#[derive(Clone)]
pub struct Device {
    conn: Connection,
    object_path: OwnedObjectPath,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("object_path", &self.object_path)
            .finish()
    }
}

impl Device {
    /// Interface proxy; also used by callers that subscribe to signals.
    pub async fn proxy(&self) -> zbus::Result<Proxy<'_>> {
        Proxy::new(&self.conn, SERVICE, self.object_path.as_str(), IFACE_DEVICE).await
    }

    /// Get device object path.
    pub fn object_path(&self) -> &str {
        self.object_path.as_str()
    }

    /// Generic method call.
    async fn call<R>(
        &self,
        method: &str,
        args: &(impl Serialize + Type + fmt::Debug),
    ) -> zbus::Result<R>
    where
        R: DeserializeOwned + Type,
    {
        let proxy = self.proxy().await?;

        proxy.call(method, args).await
    }

    /// Claim device for user ("" for current user).
    pub async fn claim(&self, username: &str) -> zbus::Result<()> {
        self.call("Claim", &(username,)).await
    }

    /// Release device.
    pub async fn release(&self) -> zbus::Result<()> {
        self.call("Release", &()).await
    }

    /// List enrolled fingers for user ("" for current user).
    pub async fn list_enrolled_fingers(&self, username: &str) -> zbus::Result<Vec<String>> {
        self.call("ListEnrolledFingers", &(username,)).await
    }

    /// Start enrollment for finger.
    pub async fn enroll_start(&self, finger: &str) -> zbus::Result<()> {
        self.call("EnrollStart", &(finger,)).await
    }

    /// Stop enrollment.
    pub async fn enroll_stop(&self) -> zbus::Result<()> {
        self.call("EnrollStop", &()).await
    }

    /// Start verification for finger.
    pub async fn verify_start(&self, finger: &str) -> zbus::Result<()> {
        self.call("VerifyStart", &(finger,)).await
    }

    /// Stop verification.
    pub async fn verify_stop(&self) -> zbus::Result<()> {
        self.call("VerifyStop", &()).await
    }

    /// Delete single enrolled finger (requires device claim).
    pub async fn delete_enrolled_finger(&self, finger: &str) -> zbus::Result<()> {
        self.call("DeleteEnrolledFinger", &(finger,)).await
    }

    /// Delete all enrolled fingers (requires device claim).
    pub async fn delete_enrolled_fingers(&self) -> zbus::Result<()> {
        self.call("DeleteEnrolledFingers2", &()).await
    }

    /// Get device name.
    pub async fn name(&self) -> zbus::Result<String> {
        let proxy = self.proxy().await?;
        proxy.get_property::<String>("Name").await
    }

    /// Get scan type ("press" or "swipe").
    pub async fn scan_type(&self) -> zbus::Result<String> {
        let proxy = self.proxy().await?;
        proxy.get_property::<String>("ScanType").await
    }

    /// Get enrollment stages count (requires claimed device).
    pub async fn num_enroll_stages(&self) -> zbus::Result<i32> {
        let proxy = self.proxy().await?;
        proxy.get_property::<i32>("NumEnrollStages").await
    }
}

/// Find first available device: the default one, else the first listed.
pub async fn first_device(client: &Client) -> zbus::Result<Option<Device>> {
    let mgr = client.manager();

    if let Ok(path) = mgr.get_default_device().await {
        return Ok(Some(client.device(path)));
    }

    match mgr.get_devices().await {
        Ok(paths) => Ok(paths.first().map(|path| client.device(path.clone()))),
        Err(e) => Err(e),
    }
}
