//! Authorization gate run before every device method handler.
//!
//! Three steps, in order: claim-state precheck, identity resolution for
//! methods carrying a username, then the polkit permission loop. Handlers
//! are still required to re-check the claim state themselves; the gate may
//! have raced with another invocation while a policy decision was pending.

use std::collections::HashMap;
use std::ffi::CStr;

use async_trait::async_trait;
use log::{debug, warn};
use zbus::names::BusName;
use zbus::zvariant::Value;
use zbus::Connection;

use crate::device::{ClaimRequest, Device};
use crate::error::Error;

/// Permissions in priority order: the earlier the entry, the sooner it is
/// offered to polkit; any permitted result permits the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Verify,
    Enroll,
    SetUsername,
}

impl Permission {
    /// Matching polkit action id.
    pub fn action_id(self) -> &'static str {
        match self {
            Permission::Verify => "net.reactivated.fprint.device.verify",
            Permission::Enroll => "net.reactivated.fprint.device.enroll",
            Permission::SetUsername => "net.reactivated.fprint.device.setusername",
        }
    }
}

/// Permissions each bus method needs.
pub fn required_permissions(method: &str) -> &'static [Permission] {
    match method {
        "Claim" => &[Permission::Verify, Permission::Enroll],
        "EnrollStart" | "DeleteEnrolledFinger" | "DeleteEnrolledFingers"
        | "DeleteEnrolledFingers2" => &[Permission::Enroll],
        "VerifyStart" | "ListEnrolledFingers" => &[Permission::Verify],
        // Stop/release operations skip authorization: the caller already
        // authenticated to start, and must never be re-prompted to stop.
        _ => &[],
    }
}

/// Claim state each bus method requires.
pub fn claim_request(method: &str) -> ClaimRequest {
    match method {
        "Claim" => ClaimRequest::Unclaimed,
        "DeleteEnrolledFingers" => ClaimRequest::AutoClaim,
        "ListEnrolledFingers" => ClaimRequest::Anytime,
        _ => ClaimRequest::Claimed,
    }
}

/// External policy engine plus caller identity lookups.
#[async_trait]
pub trait PolicyAuthority: Send + Sync {
    /// Whether `sender` holds `action_id`. May block while the engine
    /// interacts with the user.
    async fn check_authorization(&self, sender: &str, action_id: &str) -> Result<bool, String>;

    /// Unix uid owning the `sender` connection.
    async fn connection_uid(&self, sender: &str) -> Result<u32, String>;
}

#[zbus::proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority"
)]
trait Authority {
    #[allow(clippy::type_complexity)]
    fn check_authorization(
        &self,
        subject: &(&str, HashMap<&str, Value<'_>>),
        action_id: &str,
        details: HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::Result<(bool, bool, HashMap<String, String>)>;
}

const ALLOW_USER_INTERACTION: u32 = 1;

/// The real policy engine, consulted over the system bus.
pub struct Polkit {
    conn: Connection,
}

impl Polkit {
    pub fn new(conn: Connection) -> Polkit {
        Polkit { conn }
    }
}

#[async_trait]
impl PolicyAuthority for Polkit {
    async fn check_authorization(&self, sender: &str, action_id: &str) -> Result<bool, String> {
        let proxy = AuthorityProxy::new(&self.conn)
            .await
            .map_err(|err| err.to_string())?;

        let mut subject_details = HashMap::new();
        subject_details.insert("name", Value::from(sender));
        let subject = ("system-bus-name", subject_details);

        let (is_authorized, _is_challenge, _details) = proxy
            .check_authorization(
                &subject,
                action_id,
                HashMap::new(),
                ALLOW_USER_INTERACTION,
                "",
            )
            .await
            .map_err(|err| err.to_string())?;

        Ok(is_authorized)
    }

    async fn connection_uid(&self, sender: &str) -> Result<u32, String> {
        let proxy = zbus::fdo::DBusProxy::new(&self.conn)
            .await
            .map_err(|err| err.to_string())?;
        let name = BusName::try_from(sender.to_string()).map_err(|err| err.to_string())?;
        proxy
            .get_connection_unix_user(name)
            .await
            .map_err(|err| err.to_string())
    }
}

/// System user name for `uid`.
pub fn username_for_uid(uid: u32) -> Option<String> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0_u8; 4096];

    loop {
        let ret = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if ret == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if ret != 0 || result.is_null() {
            return None;
        }
        break;
    }

    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

pub struct Gate {
    authority: std::sync::Arc<dyn PolicyAuthority>,
}

impl Gate {
    pub fn new(authority: std::sync::Arc<dyn PolicyAuthority>) -> Gate {
        Gate { authority }
    }

    /// Resolve the user the call acts for: the caller's own account unless
    /// an explicitly different `username` is backed by the setusername
    /// permission.
    pub async fn resolve_user(&self, sender: &str, username: &str) -> Result<String, Error> {
        let uid = self
            .authority
            .connection_uid(sender)
            .await
            .map_err(|err| {
                Error::Internal(format!("Could not get connection unix user ID: {err}"))
            })?;

        let own_name = username_for_uid(uid).ok_or_else(|| {
            Error::Internal(format!("Failed to get information about user UID {uid}"))
        })?;

        // The current user is allowed to act on their own data; polkit
        // checks still follow.
        if username.is_empty() || username == own_name {
            return Ok(own_name);
        }

        self.check_permissions(sender, &[Permission::SetUsername])
            .await?;
        Ok(username.to_string())
    }

    /// Ask the engine for each permission in priority order; the first
    /// permitted one wins.
    pub async fn check_permissions(
        &self,
        sender: &str,
        permissions: &[Permission],
    ) -> Result<(), Error> {
        if permissions.is_empty() {
            return Ok(());
        }

        let mut denial = None;
        for permission in permissions {
            let action = permission.action_id();
            debug!("Getting authorization to perform polkit action {action}");

            match self.authority.check_authorization(sender, action).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    denial = Some(Error::PermissionDenied(format!("Not Authorized: {action}")));
                }
                Err(err) => {
                    denial = Some(Error::PermissionDenied(format!("Not Authorized: {err}")));
                }
            }
        }

        Err(denial.expect("permission list was not empty"))
    }

    /// The full pre-handler gate. Returns the resolved acting user for
    /// methods that carry a `username` argument.
    pub async fn authorize(
        &self,
        device: &Device,
        sender: &str,
        method: &str,
        username: Option<&str>,
    ) -> Result<Option<String>, Error> {
        debug!(
            "Requesting authorization from {} to call method '{}' for device '{}'",
            sender,
            method,
            device.hw().name()
        );

        let result = self.authorize_steps(device, sender, method, username).await;

        match &result {
            Ok(_) => debug!(
                "Authorization granted to {} to call method '{}' for device '{}'",
                sender,
                method,
                device.hw().name()
            ),
            Err(err) => warn!(
                "Authorization denied to {} to call method '{}' for device '{}': {}",
                sender,
                method,
                device.hw().name(),
                err
            ),
        }

        result
    }

    async fn authorize_steps(
        &self,
        device: &Device,
        sender: &str,
        method: &str,
        username: Option<&str>,
    ) -> Result<Option<String>, Error> {
        // Quick check to avoid interactive authentication when the call
        // could not proceed right now anyway.
        device.check_claimed(sender, claim_request(method))?;

        let resolved = match username {
            Some(username) => Some(self.resolve_user(sender, username).await?),
            None => None,
        };

        self.check_permissions(sender, required_permissions(method))
            .await?;

        Ok(resolved)
    }
}
