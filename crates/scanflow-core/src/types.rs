/*!
 * Core data types for scanflow.
 *
 * This module defines the frontend status codes, protocol identifiers and
 * the unit conversions shared by the scanner backend.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frontend status codes.
///
/// These are the only values a frontend caller ever observes from the
/// device API. `Good` doubles as the "no error" job status; the remaining
/// variants are usable as error values directly.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Operation completed successfully
    #[error("no error")]
    Good,
    /// Invalid argument or device state
    #[error("invalid argument")]
    Inval,
    /// Device is busy
    #[error("device busy")]
    DeviceBusy,
    /// Communication with the device failed
    #[error("I/O error")]
    IoError,
    /// Out of memory
    #[error("out of memory")]
    NoMem,
    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
    /// No more data available
    #[error("end of file")]
    Eof,
}

impl Status {
    /// Check whether the status is `Good`
    pub fn is_good(self) -> bool {
        self == Status::Good
    }
}

/// Identifier of a scan protocol understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtoId {
    /// eSCL (AirScan)
    Escl,
    /// WS-Scan (Microsoft WSD)
    Wsd,
}

impl fmt::Display for ProtoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoId::Escl => write!(f, "eSCL"),
            ProtoId::Wsd => write!(f, "WSD"),
        }
    }
}

/// Millimetres per inch, the bridge between frontend units and pixels
pub const MM_PER_INCH: f64 = 25.4;

/// Convert millimetres to pixels at the given resolution, rounding to
/// the nearest pixel
pub fn mm_to_px(mm: f64, dpi: u32) -> i32 {
    (mm * f64::from(dpi) / MM_PER_INCH).round() as i32
}

/// Convert pixels at the given resolution back to millimetres
pub fn px_to_mm(px: i32, dpi: u32) -> f64 {
    f64::from(px) * MM_PER_INCH / f64::from(dpi)
}

/// Multiply then divide without intermediate overflow, rounding to nearest
pub fn muldiv(value: i32, mul: u32, div: u32) -> i32 {
    debug_assert!(div != 0);
    let v = i64::from(value) * i64::from(mul);
    let d = i64::from(div);
    ((v + d / 2) / d) as i32
}

/// Clamp `value` into the inclusive `[min, max]` range
pub fn bound(value: i32, min: i32, max: i32) -> i32 {
    value.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mm_px_round_trip() {
        // A4 width at 300 dpi
        assert_eq!(mm_to_px(210.0, 300), 2480);
        let mm = px_to_mm(2480, 300);
        assert!((mm - 210.0).abs() < 0.1);
    }

    #[test]
    fn test_muldiv() {
        assert_eq!(muldiv(300, 150, 300), 150);
        assert_eq!(muldiv(7, 2, 3), 5); // 14/3 = 4.67, rounds to 5
        assert_eq!(muldiv(0, 600, 300), 0);
    }

    #[test]
    fn test_bound() {
        assert_eq!(bound(5, 1, 10), 5);
        assert_eq!(bound(-5, 1, 10), 1);
        assert_eq!(bound(50, 1, 10), 10);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Cancelled.to_string(), "operation cancelled");
        assert!(Status::Good.is_good());
        assert!(!Status::Eof.is_good());
    }
}
