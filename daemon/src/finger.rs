//! Finger slot naming shared by the bus API and the template store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Anatomical finger slots plus the `Unknown` sentinel meaning "any".
///
/// The discriminants double as the single hex digit used for storage
/// filenames, so they must stay in sync with what is already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(u8)]
pub enum Finger {
    Unknown = 0,
    LeftThumb = 1,
    LeftIndex = 2,
    LeftMiddle = 3,
    LeftRing = 4,
    LeftLittle = 5,
    RightThumb = 6,
    RightIndex = 7,
    RightMiddle = 8,
    RightRing = 9,
    RightLittle = 10,
}

/// All real slots, in bus-name order. Excludes `Unknown`.
pub const REAL_FINGERS: [Finger; 10] = [
    Finger::LeftThumb,
    Finger::LeftIndex,
    Finger::LeftMiddle,
    Finger::LeftRing,
    Finger::LeftLittle,
    Finger::RightThumb,
    Finger::RightIndex,
    Finger::RightMiddle,
    Finger::RightRing,
    Finger::RightLittle,
];

const FINGER_NAMES: [&str; 10] = [
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

impl Finger {
    /// Bus name of the slot; `Unknown` serializes as `"any"`.
    pub fn name(self) -> &'static str {
        match self {
            Finger::Unknown => "any",
            real => FINGER_NAMES[real as usize - 1],
        }
    }

    /// Parse a bus finger name. Empty and `"any"` mean `Unknown`, and so
    /// does anything unrecognized: callers that require a real slot must
    /// reject `Unknown` themselves (`InvalidFingername` on the bus).
    pub fn from_name(name: &str) -> Finger {
        if name.is_empty() || name == "any" {
            return Finger::Unknown;
        }
        REAL_FINGERS
            .iter()
            .copied()
            .find(|f| f.name() == name)
            .unwrap_or(Finger::Unknown)
    }

    /// Single lowercase hex digit used as the storage filename.
    pub fn hex_code(self) -> char {
        char::from_digit(self as u32, 16).unwrap()
    }

    /// Inverse of [`Finger::hex_code`]; `None` for digits outside the
    /// valid slot range (including the `0` sentinel).
    pub fn from_hex_code(code: char) -> Option<Finger> {
        let val = code.to_digit(16)?;
        REAL_FINGERS.iter().copied().find(|f| *f as u32 == val)
    }

    pub fn is_real(self) -> bool {
        self != Finger::Unknown
    }
}

impl fmt::Display for Finger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Finger> for String {
    fn from(f: Finger) -> String {
        f.name().to_string()
    }
}

impl TryFrom<String> for Finger {
    type Error = String;

    fn try_from(s: String) -> Result<Finger, String> {
        let finger = Finger::from_name(&s);
        if !finger.is_real() && !(s.is_empty() || s == "any") {
            return Err(format!("unknown finger name '{s}'"));
        }
        Ok(finger)
    }
}
