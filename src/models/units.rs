//! Unit suffix table
//!
//! Numeric fields on the wire carry a unit suffix (`1000HZ`, `100NS`, `2V`).
//! Decoding looks the suffix up in [`UNIT_TABLE`], which lists every suffix a
//! model may report together with its quantity and SI conversion factor.
//!
//! Several suffixes end with another suffix (`MHZ` / `HZ`, `MS` / `S`,
//! `MV` / `V`). The table is ordered so that the longer one is always checked
//! first; `test_longer_suffixes_come_first` enforces this for every entry.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

/// Physical quantity a numeric field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Time,
    Frequency,
    Voltage,
    Percent,
    Count,
}

/// One row of the suffix table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitSuffix {
    pub suffix: &'static str,
    pub quantity: Quantity,
    /// Multiply the mantissa by this to get the SI value
    pub factor: f64,
}

const fn unit(suffix: &'static str, quantity: Quantity, factor: f64) -> UnitSuffix {
    UnitSuffix {
        suffix,
        quantity,
        factor,
    }
}

/// Every recognized suffix, longest-match first within each family.
pub const UNIT_TABLE: &[UnitSuffix] = &[
    unit("MHZ", Quantity::Frequency, 1e6),
    unit("KHZ", Quantity::Frequency, 1e3),
    unit("HZ", Quantity::Frequency, 1.0),
    unit("NS", Quantity::Time, 1e-9),
    unit("US", Quantity::Time, 1e-6),
    unit("MS", Quantity::Time, 1e-3),
    unit("S", Quantity::Time, 1.0),
    unit("MV", Quantity::Voltage, 1e-3),
    unit("V", Quantity::Voltage, 1.0),
    unit("%", Quantity::Percent, 1.0),
    unit("#", Quantity::Count, 1.0),
];

impl Quantity {
    /// Suffix used when writing an SI value back out unscaled.
    pub fn base_suffix(self) -> &'static str {
        match self {
            Quantity::Time => "S",
            Quantity::Frequency => "HZ",
            Quantity::Voltage => "V",
            Quantity::Percent => "%",
            Quantity::Count => "#",
        }
    }
}

/// Find the suffix row `text` ends with, for the given quantity.
pub fn lookup(text: &str, quantity: Quantity) -> Option<&'static UnitSuffix> {
    UNIT_TABLE
        .iter()
        .filter(|row| row.quantity == quantity)
        .find(|row| text.ends_with(row.suffix))
}

/// Decode `"<number><suffix>"` into an SI value.
///
/// `field` is only used to label errors.
pub fn parse_quantity(field: &str, text: &str, quantity: Quantity) -> Result<f64, DecodeError> {
    let row = lookup(text, quantity).ok_or_else(|| DecodeError::UnknownUnit {
        field: field.to_string(),
    })?;
    let mantissa = &text[..text.len() - row.suffix.len()];
    let not_numeric = || DecodeError::NotNumeric {
        field: field.to_string(),
        value: text.to_string(),
    };
    let mantissa: f64 = mantissa.trim().parse().map_err(|_| not_numeric())?;
    let value = mantissa * row.factor;
    if !value.is_finite() {
        return Err(not_numeric());
    }
    Ok(value)
}

/// Write an SI value in its base unit, e.g. `1000HZ`, `0.0000001S`.
///
/// `{}` on `f64` prints the shortest text that parses back to the same
/// value, so `parse_quantity(format_base(x)) == x` exactly.
pub fn format_base(value: f64, quantity: Quantity) -> String {
    format!("{value}{}", quantity.base_suffix())
}

/// Write `value` with the largest scale whose mantissa is at least 1.
///
/// `scales` is `(suffix, factor)` sorted by descending factor; the last entry
/// is used for values below every factor (including zero).
pub fn format_engineering(value: f64, scales: &[(&str, f64)]) -> String {
    let magnitude = value.abs();
    let (suffix, factor) = scales
        .iter()
        .find(|(_, factor)| magnitude >= *factor)
        .or_else(|| scales.last())
        .copied()
        .unwrap_or(("", 1.0));
    format!("{} {suffix}", trim_number(value / factor))
}

/// Fixed-point text with at most six decimals and no trailing zeros.
pub fn trim_number(value: f64) -> String {
    let text = format!("{value:.6}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longer_suffixes_come_first() {
        for (i, earlier) in UNIT_TABLE.iter().enumerate() {
            for later in &UNIT_TABLE[i + 1..] {
                if earlier.quantity == later.quantity {
                    assert!(
                        !later.suffix.ends_with(earlier.suffix) || later.suffix == earlier.suffix,
                        "{} is listed after {} and would never match",
                        later.suffix,
                        earlier.suffix
                    );
                }
            }
        }
    }

    #[test]
    fn test_every_row_converts_by_its_factor() {
        for row in UNIT_TABLE {
            let text = format!("3{}", row.suffix);
            let value = parse_quantity("X", &text, row.quantity).unwrap();
            assert_eq!(value, 3.0 * row.factor, "suffix {}", row.suffix);
        }
    }

    #[test]
    fn test_mhz_is_not_read_as_hz() {
        assert_eq!(
            parse_quantity("FRQ", "2MHZ", Quantity::Frequency).unwrap(),
            2e6
        );
        assert_eq!(
            parse_quantity("FRQ", "2KHZ", Quantity::Frequency).unwrap(),
            2e3
        );
        assert_eq!(parse_quantity("FRQ", "2HZ", Quantity::Frequency).unwrap(), 2.0);
        assert_eq!(parse_quantity("WID", "5MS", Quantity::Time).unwrap(), 5e-3);
        assert_eq!(parse_quantity("AMP", "500MV", Quantity::Voltage).unwrap(), 0.5);
    }

    #[test]
    fn test_unknown_unit_and_bad_number() {
        assert_eq!(
            parse_quantity("FRQ", "1000GHZ", Quantity::Frequency),
            Err(DecodeError::NotNumeric {
                field: "FRQ".into(),
                value: "1000GHZ".into()
            })
        );
        assert_eq!(
            parse_quantity("AMP", "2A", Quantity::Voltage),
            Err(DecodeError::UnknownUnit { field: "AMP".into() })
        );
        assert!(matches!(
            parse_quantity("FRQ", "HZ", Quantity::Frequency),
            Err(DecodeError::NotNumeric { .. })
        ));
    }

    #[test]
    fn test_scaled_overflow_is_not_numeric() {
        assert!(matches!(
            parse_quantity("FRQ", "1e308MHZ", Quantity::Frequency),
            Err(DecodeError::NotNumeric { .. })
        ));
        assert!(matches!(
            parse_quantity("FRQ", "infHZ", Quantity::Frequency),
            Err(DecodeError::NotNumeric { .. })
        ));
        assert_eq!(
            parse_quantity("FRQ", "1e302MHZ", Quantity::Frequency).unwrap(),
            1e302 * 1e6
        );
    }

    #[test]
    fn test_format_base_round_trips() {
        for value in [0.0, 1e-7, 2.5e-8, 1000.0, 12_345.678, -7.95] {
            let text = format_base(value, Quantity::Time);
            assert_eq!(parse_quantity("T", &text, Quantity::Time).unwrap(), value);
        }
    }

    #[test]
    fn test_format_engineering() {
        let freq = [("MHZ", 1e6), ("KHZ", 1e3), ("HZ", 1.0)];
        assert_eq!(format_engineering(1000.0, &freq), "1 KHZ");
        assert_eq!(format_engineering(2.5e6, &freq), "2.5 MHZ");
        assert_eq!(format_engineering(0.5, &freq), "0.5 HZ");
        assert_eq!(format_engineering(0.0, &freq), "0 HZ");
        assert_eq!(trim_number(-0.0000001), "0");
    }
}
