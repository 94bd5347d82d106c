//! Device metadata: clock units, firmware and hardware identification, status
//! flags and battery conversion.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// ============================================================================
// Clock
// ============================================================================

/// Ticks per second of the device real-time clock.
pub const DEV_CLOCK_RATE: f64 = 32768.0;

/// Convert a device rate divider (clock ticks per sample) into Hz.
pub fn dr2sr(dev_rate: u16) -> f64 {
    DEV_CLOCK_RATE / dev_rate as f64
}

/// Convert a sampling rate in Hz into the nearest device rate divider.
pub fn sr2dr(sampling_rate: f64) -> Result<u16> {
    let dr = (DEV_CLOCK_RATE / sampling_rate).round();
    if !dr.is_finite() || dr < 1.0 || dr > u16::MAX as f64 {
        return Err(DriverError::ValueOutOfRange {
            value: dr as i64,
            size: 2,
        });
    }
    Ok(dr as u16)
}

pub fn sec2ticks(seconds: f64) -> u64 {
    (seconds * DEV_CLOCK_RATE).round() as u64
}

pub fn ticks2sec(ticks: u64) -> f64 {
    ticks as f64 / DEV_CLOCK_RATE
}

// ============================================================================
// Firmware
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareType {
    BtStream,
    SdLog,
    LogAndStream,
}

impl FirmwareType {
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            0x01 => Ok(FirmwareType::BtStream),
            0x02 => Ok(FirmwareType::SdLog),
            0x03 => Ok(FirmwareType::LogAndStream),
            other => Err(DriverError::Protocol(format!(
                "unknown firmware type: {other:#06x}"
            ))),
        }
    }
}

/// Firmware release, ordered by `(major, minor, rel)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u8,
    pub rel: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u16, minor: u8, rel: u8) -> Self {
        Self { major, minor, rel }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.rel)
    }
}

/// First LogAndStream release that can switch off the status ACK preamble.
const ACK_DISABLE_MIN_VERSION: FirmwareVersion = FirmwareVersion::new(0, 15, 4);

/// Optional protocol features of the connected firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareCapabilities {
    pub fw_type: FirmwareType,
    pub version: FirmwareVersion,
}

impl FirmwareCapabilities {
    pub fn new(fw_type: FirmwareType, version: FirmwareVersion) -> Self {
        Self { fw_type, version }
    }

    pub fn supports_ack_disable(&self) -> bool {
        self.fw_type == FirmwareType::LogAndStream && self.version >= ACK_DISABLE_MIN_VERSION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareVersion {
    Shimmer1,
    Shimmer2,
    Shimmer2R,
    Shimmer3,
    Shimmer3R,
    Unknown,
}

impl HardwareVersion {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => HardwareVersion::Shimmer1,
            1 => HardwareVersion::Shimmer2,
            2 => HardwareVersion::Shimmer2R,
            3 => HardwareVersion::Shimmer3,
            10 => HardwareVersion::Shimmer3R,
            _ => HardwareVersion::Unknown,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Status byte reported by the device, bit 0 first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStatus([bool; 8]);

impl DeviceStatus {
    pub fn from_byte(byte: u8) -> Self {
        let mut bits = [false; 8];
        for (i, bit) in bits.iter_mut().enumerate() {
            *bit = byte & (1 << i) != 0;
        }
        Self(bits)
    }

    /// `[docked, sensing, rtc_set, logging, streaming, sd_present, sd_error, red_led]`
    pub fn bits(&self) -> [bool; 8] {
        self.0
    }

    pub fn docked(&self) -> bool {
        self.0[0]
    }

    pub fn sensing(&self) -> bool {
        self.0[1]
    }

    pub fn rtc_set(&self) -> bool {
        self.0[2]
    }

    pub fn logging(&self) -> bool {
        self.0[3]
    }

    pub fn streaming(&self) -> bool {
        self.0[4]
    }

    pub fn sd_present(&self) -> bool {
        self.0[5]
    }

    pub fn sd_error(&self) -> bool {
        self.0[6]
    }

    pub fn red_led(&self) -> bool {
        self.0[7]
    }
}

// ============================================================================
// Battery
// ============================================================================

/// Battery divider between the cell and the ADC input.
const BATTERY_DIVIDER: f64 = 1.988;

/// Reference discharge curve: (volts, percent).
const BATTERY_CURVE: [(f64, f64); 26] = [
    (3.2, 0.0),
    (3.627, 5.9),
    (3.645, 9.8),
    (3.663, 13.8),
    (3.681, 17.7),
    (3.699, 21.6),
    (3.717, 25.6),
    (3.7314, 29.5),
    (3.735, 33.4),
    (3.7386, 37.4),
    (3.7566, 41.3),
    (3.771, 45.2),
    (3.789, 49.2),
    (3.8034, 53.1),
    (3.8106, 57.0),
    (3.8394, 61.0),
    (3.861, 64.9),
    (3.8826, 68.9),
    (3.9078, 72.8),
    (3.933, 76.7),
    (3.969, 80.7),
    (4.0086, 84.6),
    (4.041, 88.5),
    (4.0734, 92.5),
    (4.113, 96.4),
    (4.167, 100.0),
];

/// Scale a raw 12-bit ADC reading into volts.
pub fn calibrate_u12_adc_value(raw: f64, offset: f64, v_ref: f64, gain: f64) -> f64 {
    (raw - offset) * ((v_ref / gain) / 4095.0)
}

/// Battery voltage from the two little-endian ADC bytes of a battery response.
pub fn battery_voltage(lsb: u8, msb: u8) -> f64 {
    let raw = msb as f64 * 256.0 + lsb as f64;
    calibrate_u12_adc_value(raw, 0.0, 3.0, 1.0) * BATTERY_DIVIDER
}

/// Approximate charge in percent, interpolated on the reference curve.
pub fn battery_voltage_to_percent(voltage: f64) -> f64 {
    let (first_v, first_p) = BATTERY_CURVE[0];
    if voltage <= first_v {
        return first_p;
    }
    for pair in BATTERY_CURVE.windows(2) {
        let (v0, p0) = pair[0];
        let (v1, p1) = pair[1];
        if voltage <= v1 {
            return (p0 + (voltage - v0) * (p1 - p0) / (v1 - v0)).clamp(0.0, 100.0);
        }
    }
    100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rate_conversions() {
        assert_eq!(dr2sr(64), 512.0);
        assert_eq!(sr2dr(512.0).unwrap(), 64);
        assert_eq!(sr2dr(51.2).unwrap(), 640);
        assert!(sr2dr(0.0).is_err());
        assert!(sr2dr(100_000.0).is_err());
    }

    #[test]
    fn tick_conversions() {
        assert_eq!(sec2ticks(1.0), 32768);
        assert_eq!(sec2ticks(10.0), 0x050000);
        assert_abs_diff_eq!(ticks2sec(0x0993b11f), 4903.3837585, epsilon = 1e-6);
    }

    #[test]
    fn firmware_type_ids() {
        assert_eq!(FirmwareType::from_id(3).unwrap(), FirmwareType::LogAndStream);
        assert_eq!(FirmwareType::from_id(1).unwrap(), FirmwareType::BtStream);
        assert!(FirmwareType::from_id(0x42).is_err());
    }

    #[test]
    fn version_ordering() {
        let v = FirmwareVersion::new(1, 2, 3);
        assert!(v > FirmwareVersion::new(0, 20, 20));
        assert!(v > FirmwareVersion::new(1, 1, 9));
        assert!(v < FirmwareVersion::new(1, 2, 4));
        assert_eq!(v, FirmwareVersion::new(1, 2, 3));
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[rstest::rstest]
    #[test]
    #[case(FirmwareType::LogAndStream, FirmwareVersion::new(0, 15, 4), true)]
    #[case(FirmwareType::LogAndStream, FirmwareVersion::new(1, 0, 0), true)]
    #[case(FirmwareType::LogAndStream, FirmwareVersion::new(0, 15, 3), false)]
    #[case(FirmwareType::LogAndStream, FirmwareVersion::new(0, 11, 0), false)]
    #[case(FirmwareType::SdLog, FirmwareVersion::new(0, 16, 0), false)]
    fn ack_disable_capability(
        #[case] fw_type: FirmwareType,
        #[case] version: FirmwareVersion,
        #[case] expected: bool,
    ) {
        let caps = FirmwareCapabilities::new(fw_type, version);
        assert_eq!(caps.supports_ack_disable(), expected);
    }

    #[test]
    fn hardware_versions() {
        assert_eq!(HardwareVersion::from_id(3), HardwareVersion::Shimmer3);
        assert_eq!(HardwareVersion::from_id(10), HardwareVersion::Shimmer3R);
        assert_eq!(HardwareVersion::from_id(4), HardwareVersion::Unknown);
    }

    #[test]
    fn status_bits() {
        let status = DeviceStatus::from_byte(0x25);
        assert_eq!(
            status.bits(),
            [true, false, true, false, false, true, false, false]
        );
        assert!(status.docked() && status.rtc_set() && status.sd_present());
        assert!(!status.streaming());
    }

    #[test]
    fn battery_conversion() {
        assert_abs_diff_eq!(battery_voltage(0x2E, 0x0B), 4.168246153846154, epsilon = 1e-9);
        assert_eq!(battery_voltage_to_percent(battery_voltage(0x30, 0x0B)), 100.0);
        assert_eq!(battery_voltage_to_percent(3.0), 0.0);
        assert_abs_diff_eq!(battery_voltage_to_percent(3.645), 9.8, epsilon = 1e-9);
        assert_abs_diff_eq!(battery_voltage_to_percent(3.636), 7.85, epsilon = 1e-9);
    }

    #[test]
    fn device_metadata_serializes_to_json() {
        let version = FirmwareVersion::new(0, 15, 4);
        assert_eq!(
            serde_json::to_value(version).unwrap(),
            serde_json::json!({"major": 0, "minor": 15, "rel": 4})
        );
        assert_eq!(
            serde_json::from_str::<FirmwareVersion>(r#"{"major":0,"minor":15,"rel":4}"#).unwrap(),
            version
        );

        let caps = FirmwareCapabilities::new(FirmwareType::LogAndStream, version);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(
            json,
            r#"{"fw_type":"LogAndStream","version":{"major":0,"minor":15,"rel":4}}"#
        );
        assert_eq!(
            serde_json::from_str::<FirmwareCapabilities>(&json).unwrap(),
            caps
        );

        let status = DeviceStatus::from_byte(0x21);
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            "[true,false,false,false,false,true,false,false]"
        );
        assert_eq!(
            serde_json::to_string(&HardwareVersion::Shimmer3).unwrap(),
            r#""Shimmer3""#
        );
    }
}
