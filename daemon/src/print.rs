//! Fingerprint template value type.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::finger::Finger;

/// A stored or freshly captured fingerprint template.
///
/// The daemon never interprets `data`; it is whatever blob the driver
/// produced. Everything else is metadata describing where the template
/// belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Print {
    pub driver: String,
    pub device_id: String,
    pub username: String,
    pub finger: Finger,
    pub enroll_date: NaiveDate,
    /// Whether this template lives in the reader's own storage. Only
    /// meaningful on prints returned by the driver.
    #[serde(default)]
    pub device_stored: bool,
    #[serde(with = "serde_bytes_compat")]
    pub data: Vec<u8>,
}

impl Print {
    /// Fresh template for an enrollment about to start on `driver`/`device_id`.
    pub fn template(
        driver: &str,
        device_id: &str,
        username: &str,
        finger: Finger,
        enroll_date: NaiveDate,
    ) -> Print {
        Print {
            driver: driver.to_string(),
            device_id: device_id.to_string(),
            username: username.to_string(),
            finger,
            enroll_date,
            device_stored: false,
            data: Vec::new(),
        }
    }

    /// Whether the two prints refer to the same stored slot, ignoring the
    /// template data itself. Used when reconciling host storage against the
    /// reader's list.
    pub fn same_identity(&self, other: &Print) -> bool {
        self.driver == other.driver
            && self.device_id == other.device_id
            && self.username == other.username
            && self.finger == other.finger
    }

    /// Whether the print was produced by (and is loadable on) this reader.
    pub fn compatible_with(&self, driver: &str, device_id: &str) -> bool {
        self.driver == driver && self.device_id == device_id
    }

    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Print, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Keep the blob readable in the JSON files without pulling in a base64
/// crate: hex, two chars per byte.
mod serde_bytes_compat {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        let mut out = String::with_capacity(data.len() * 2);
        for b in data {
            out.push_str(&format!("{b:02x}"));
        }
        ser.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        if s.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length template data"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&s[i..i + 2], 16)
                    .map_err(|_| serde::de::Error::custom("invalid template data"))
            })
            .collect()
    }
}
