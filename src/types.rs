//! Core identifier types shared across the pipeline.
//!
//! These are thin newtypes over the on-wire integer encodings so that an
//! SCN can never be confused with a DBA or a log sequence number.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// System Change Number: the monotonically non-decreasing commit ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scn(u64);

impl Scn {
    pub const ZERO: Scn = Scn(0);

    pub const fn new(value: u64) -> Self {
        Scn(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log file sequence number.
pub type Seq = u32;

/// Object identifier from the catalog.
pub type Obj = u32;

/// Physical object identifier (partition-level).
pub type DataObj = u32;

/// Data block address (file + block packed into 32 bits).
pub type Dba = u32;

/// Transaction identifier: `(usn, slot, sequence)` packed into 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Xid {
    pub usn: u16,
    pub slot: u16,
    pub sequence: u32,
}

impl Xid {
    pub const fn new(usn: u16, slot: u16, sequence: u32) -> Self {
        Xid { usn, slot, sequence }
    }

    pub fn from_u64(value: u64) -> Self {
        Xid {
            usn: (value >> 48) as u16,
            slot: (value >> 32) as u16,
            sequence: value as u32,
        }
    }

    pub fn as_u64(&self) -> u64 {
        ((self.usn as u64) << 48) | ((self.slot as u64) << 32) | self.sequence as u64
    }

    /// Hex rendering used in output messages and file names,
    /// e.g. `0x0001.001.00000001`.
    pub fn to_hex(&self) -> String {
        format!("0x{:04x}.{:03x}.{:08x}", self.usn, self.slot, self.sequence)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Xid {
    type Err = String;

    /// Accepts the hex form `0xUSN.SLT.SEQUENCE` (as printed) or a plain
    /// decimal packed value, which is what the skip-xid config list uses.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix("0x") {
            let parts: Vec<&str> = hex.split('.').collect();
            if parts.len() != 3 {
                return Err(format!("invalid xid: {s}"));
            }
            let usn = u16::from_str_radix(parts[0], 16).map_err(|e| format!("invalid xid {s}: {e}"))?;
            let slot = u16::from_str_radix(parts[1], 16).map_err(|e| format!("invalid xid {s}: {e}"))?;
            let sequence =
                u32::from_str_radix(parts[2], 16).map_err(|e| format!("invalid xid {s}: {e}"))?;
            Ok(Xid::new(usn, slot, sequence))
        } else {
            let value: u64 = s.parse().map_err(|e| format!("invalid xid {s}: {e}"))?;
            Ok(Xid::from_u64(value))
        }
    }
}

/// Row instance identifier: `(dataObj, dba, slot)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId {
    pub data_obj: DataObj,
    pub dba: Dba,
    pub slot: u16,
}

impl RowId {
    pub fn new(data_obj: DataObj, dba: Dba, slot: u16) -> Self {
        RowId { data_obj, dba, slot }
    }

    /// 18-character base-64-alphabet text form used when `rid` output is on.
    pub fn to_text(&self) -> String {
        const ALPHABET: &[u8; 64] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
        let mut out = String::with_capacity(18);
        let mut push = |value: u64, digits: usize| {
            for i in (0..digits).rev() {
                let idx = ((value >> (i * 6)) & 0x3F) as usize;
                out.push(ALPHABET[idx] as char);
            }
        };
        push(self.data_obj as u64, 6);
        push((self.dba >> 16) as u64 & 0x3FF, 3);
        push(self.dba as u64 & 0xFFFF, 6);
        push(self.slot as u64, 3);
        out
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Opaque 10-byte large-object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LobId(pub [u8; 10]);

impl LobId {
    pub fn new(bytes: [u8; 10]) -> Self {
        LobId(bytes)
    }
}

impl fmt::Display for LobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
