//! Vat identities and vat-local references
//!
//! Vat-local refs (vrefs) have the form `<type><direction><id>`:
//!
//! | vref    | meaning                                   |
//! |---------|-------------------------------------------|
//! | `o+5`   | object exported by this vat               |
//! | `o+d5`  | durable object exported by this vat       |
//! | `o-5`   | object imported from elsewhere            |
//! | `p+5`   | promise allocated by this vat             |
//! | `p-5`   | promise allocated by the kernel           |
//! | `d-5`   | device node granted to this vat           |
//!
//! `o+0` is the vat's root object.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kernel-assigned vat identifier, rendered `v<N>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatId(pub u32);

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VatId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('v')
            .and_then(|n| n.parse().ok())
            .map(VatId)
            .ok_or_else(|| format!("invalid vat ID {s:?}"))
    }
}

impl TryFrom<String> for VatId {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VatId> for String {
    fn from(id: VatId) -> Self {
        id.to_string()
    }
}

/// What a reference designates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotType {
    /// An object (`o`).
    Object,
    /// A promise (`p`).
    Promise,
    /// A device node (`d`).
    Device,
}

impl SlotType {
    fn prefix(self) -> char {
        match self {
            SlotType::Object => 'o',
            SlotType::Promise => 'p',
            SlotType::Device => 'd',
        }
    }
}

/// A vat-local reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatSlot {
    /// Object, promise or device.
    pub slot_type: SlotType,
    /// `+` refs are allocated by the vat, `-` refs by the kernel.
    pub allocated_by_vat: bool,
    /// Durable exports survive upgrade.
    pub durable: bool,
    /// Per-vat numeric ID.
    pub id: u64,
}

impl VatSlot {
    /// The root object every vat exports.
    pub const ROOT: VatSlot = VatSlot::export(0);

    /// Ephemeral object export `o+N`.
    pub const fn export(id: u64) -> Self {
        Self {
            slot_type: SlotType::Object,
            allocated_by_vat: true,
            durable: false,
            id,
        }
    }

    /// Durable object export `o+dN`.
    pub const fn durable_export(id: u64) -> Self {
        Self {
            slot_type: SlotType::Object,
            allocated_by_vat: true,
            durable: true,
            id,
        }
    }

    /// Object import `o-N`.
    pub const fn import(id: u64) -> Self {
        Self {
            slot_type: SlotType::Object,
            allocated_by_vat: false,
            durable: false,
            id,
        }
    }

    /// Vat-allocated promise `p+N`.
    pub const fn promise_export(id: u64) -> Self {
        Self {
            slot_type: SlotType::Promise,
            allocated_by_vat: true,
            durable: false,
            id,
        }
    }

    /// Kernel-allocated promise `p-N`.
    pub const fn promise_import(id: u64) -> Self {
        Self {
            slot_type: SlotType::Promise,
            allocated_by_vat: false,
            durable: false,
            id,
        }
    }

    /// Device import `d-N`.
    pub const fn device(id: u64) -> Self {
        Self {
            slot_type: SlotType::Device,
            allocated_by_vat: false,
            durable: false,
            id,
        }
    }

    /// Check whether this is an object ref.
    pub fn is_object(&self) -> bool {
        self.slot_type == SlotType::Object
    }

    /// Check whether this is a promise ref.
    pub fn is_promise(&self) -> bool {
        self.slot_type == SlotType::Promise
    }

    /// Check whether this is an object exported by the vat.
    pub fn is_object_export(&self) -> bool {
        self.is_object() && self.allocated_by_vat
    }

    /// Check whether this is an object imported by the vat.
    pub fn is_object_import(&self) -> bool {
        self.is_object() && !self.allocated_by_vat
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.allocated_by_vat { '+' } else { '-' };
        let durable = if self.durable { "d" } else { "" };
        write!(f, "{}{}{}{}", self.slot_type.prefix(), dir, durable, self.id)
    }
}

impl FromStr for VatSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid vref {s:?}");
        let mut chars = s.chars();
        let slot_type = match chars.next() {
            Some('o') => SlotType::Object,
            Some('p') => SlotType::Promise,
            Some('d') => SlotType::Device,
            _ => return Err(bad()),
        };
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(bad()),
        };
        let rest = chars.as_str();
        let (durable, digits) = match rest.strip_prefix('d') {
            Some(d) if slot_type == SlotType::Object && allocated_by_vat => (true, d),
            Some(_) => return Err(bad()),
            None => (false, rest),
        };
        if slot_type == SlotType::Device && allocated_by_vat {
            return Err(bad());
        }
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let id = digits.parse().map_err(|_| bad())?;
        Ok(Self {
            slot_type,
            allocated_by_vat,
            durable,
            id,
        })
    }
}

impl TryFrom<String> for VatSlot {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VatSlot> for String {
    fn from(slot: VatSlot) -> Self {
        slot.to_string()
    }
}
