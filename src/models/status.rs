//! Status byte decoding
//!
//! Each model declares a [`StatusTable`] mapping bit masks of its serial-poll
//! byte to [`StatusFlag`]s. Decoding is pure bit math and cannot fail.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition a status bit can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFlag {
    ServiceRequest,
    ErrorPresent,
    CommandComplete,
    EndOfSweep,
    MessagePresent,
    TriggerArmed,
    MeasurementComplete,
}

impl StatusFlag {
    /// Every flag, in bit-set order.
    pub const ALL: [StatusFlag; 7] = [
        StatusFlag::ServiceRequest,
        StatusFlag::ErrorPresent,
        StatusFlag::CommandComplete,
        StatusFlag::EndOfSweep,
        StatusFlag::MessagePresent,
        StatusFlag::TriggerArmed,
        StatusFlag::MeasurementComplete,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// One row of a model's status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBit {
    pub mask: u8,
    pub flag: StatusFlag,
}

/// A model's full bit assignment. Several rows may map to the same flag.
pub type StatusTable = &'static [StatusBit];

/// Set of decoded flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StatusFlags(u8);

impl StatusFlags {
    pub fn contains(self, flag: StatusFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    fn insert(&mut self, flag: StatusFlag) {
        self.0 |= flag.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = StatusFlag> {
        StatusFlag::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|flag| format!("{flag:?}")).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Decoded status byte plus any follow-up text the poll fetched.
///
/// Two statuses are equal when their raw bytes are equal.
#[derive(Debug, Clone)]
pub struct Status {
    raw: u8,
    flags: StatusFlags,
    error_text: Option<String>,
    message_text: Option<String>,
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Status {}

impl Status {
    /// Decode `raw` against `table`.
    pub fn decode(raw: u8, table: StatusTable) -> Self {
        let mut flags = StatusFlags::default();
        for row in table {
            if raw & row.mask != 0 {
                flags.insert(row.flag);
            }
        }
        Self {
            raw,
            flags,
            error_text: None,
            message_text: None,
        }
    }

    /// Placeholder before the first poll.
    pub fn unknown() -> Self {
        Self::decode(0, &[])
    }

    pub fn raw(&self) -> u8 {
        self.raw
    }

    pub fn flags(&self) -> StatusFlags {
        self.flags
    }

    pub fn is_set(&self, flag: StatusFlag) -> bool {
        self.flags.contains(flag)
    }

    pub fn error_text(&self) -> Option<&str> {
        self.error_text.as_deref()
    }

    pub fn message_text(&self) -> Option<&str> {
        self.message_text.as_deref()
    }

    /// Copy with the fetched error text attached.
    pub fn with_error_text(self, text: String) -> Self {
        Self {
            error_text: Some(text),
            ..self
        }
    }

    /// Copy with the fetched message text attached.
    pub fn with_message_text(self, text: String) -> Self {
        Self {
            message_text: Some(text),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: StatusTable = &[
        StatusBit { mask: 0x40, flag: StatusFlag::ServiceRequest },
        StatusBit { mask: 0x20, flag: StatusFlag::ErrorPresent },
        StatusBit { mask: 0x10, flag: StatusFlag::CommandComplete },
        StatusBit { mask: 0x04, flag: StatusFlag::EndOfSweep },
        StatusBit { mask: 0x02, flag: StatusFlag::MessagePresent },
        StatusBit { mask: 0x01, flag: StatusFlag::TriggerArmed },
    ];

    #[test]
    fn test_decode_error_and_sweep() {
        let status = Status::decode(0x24, TABLE);
        assert!(status.is_set(StatusFlag::ErrorPresent));
        assert!(status.is_set(StatusFlag::EndOfSweep));
        let others: Vec<StatusFlag> = status
            .flags()
            .iter()
            .filter(|f| !matches!(f, StatusFlag::ErrorPresent | StatusFlag::EndOfSweep))
            .collect();
        assert!(others.is_empty());
    }

    #[test]
    fn test_decode_zero_is_empty() {
        let status = Status::decode(0x00, TABLE);
        assert!(status.flags().is_empty());
        for flag in StatusFlag::ALL {
            assert!(!status.is_set(flag));
        }
    }

    #[test]
    fn test_unmapped_bits_are_ignored() {
        let status = Status::decode(0x88, TABLE);
        assert!(status.flags().is_empty());
        assert_eq!(status.raw(), 0x88);
    }

    #[test]
    fn test_equality_is_on_raw_byte() {
        let plain = Status::decode(0x20, TABLE);
        let with_text = Status::decode(0x20, TABLE).with_error_text("-113".into());
        assert_eq!(plain, with_text);
        assert_ne!(plain, Status::decode(0x60, TABLE));
    }

    #[test]
    fn test_two_masks_one_flag() {
        const DMM: StatusTable = &[
            StatusBit { mask: 0x04, flag: StatusFlag::ErrorPresent },
            StatusBit { mask: 0x08, flag: StatusFlag::ErrorPresent },
        ];
        assert!(Status::decode(0x08, DMM).is_set(StatusFlag::ErrorPresent));
        assert!(Status::decode(0x04, DMM).is_set(StatusFlag::ErrorPresent));
        assert_eq!(Status::decode(0x0C, DMM).flags().to_string(), "[ErrorPresent]");
    }
}
