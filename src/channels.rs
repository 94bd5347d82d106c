//! Channel and sensor data model.
//!
//! Every value the device streams belongs to a [`ChannelType`] with a fixed
//! binary layout ([`DataType`]). Channels are switched on in groups
//! ([`SensorGroup`]) through a 3-byte little-endian bitfield, and the device
//! always emits the channels of enabled groups in one fixed canonical order.

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// ============================================================================
// Data Types
// ============================================================================

/// Fixed-width integer layout of a channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    /// Width on the wire in bytes (1 to 4).
    pub size: usize,
    pub signed: bool,
    pub little_endian: bool,
}

impl DataType {
    pub const fn new(size: usize, signed: bool, little_endian: bool) -> Self {
        Self {
            size,
            signed,
            little_endian,
        }
    }

    fn check_width(&self) -> Result<()> {
        if self.size == 0 || self.size > 4 {
            return Err(DriverError::Protocol(format!(
                "unsupported channel width: {} bytes",
                self.size
            )));
        }
        Ok(())
    }

    /// Decode one value of this type from exactly `size` bytes.
    ///
    /// Widths that are not a power of two are padded up to the next power of
    /// two first, by sign extension for signed types and zero extension
    /// otherwise.
    pub fn decode(&self, bytes: &[u8]) -> Result<i64> {
        self.check_width()?;
        if bytes.len() != self.size {
            return Err(DriverError::Protocol(format!(
                "expected {} bytes for channel value, got {}",
                self.size,
                bytes.len()
            )));
        }

        let width = self.size.next_power_of_two();
        let msb = if self.little_endian {
            bytes[self.size - 1]
        } else {
            bytes[0]
        };
        let fill = if self.signed && msb & 0x80 != 0 {
            0xFF
        } else {
            0x00
        };

        let mut padded = [fill; 4];
        if self.little_endian {
            padded[..self.size].copy_from_slice(bytes);
        } else {
            padded[width - self.size..width].copy_from_slice(bytes);
        }
        let padded = &padded[..width];

        let value = match (width, self.signed, self.little_endian) {
            (1, true, _) => i8::from_le_bytes([padded[0]]) as i64,
            (1, false, _) => padded[0] as i64,
            (2, true, true) => i16::from_le_bytes([padded[0], padded[1]]) as i64,
            (2, true, false) => i16::from_be_bytes([padded[0], padded[1]]) as i64,
            (2, false, true) => u16::from_le_bytes([padded[0], padded[1]]) as i64,
            (2, false, false) => u16::from_be_bytes([padded[0], padded[1]]) as i64,
            (4, signed, le) => {
                let raw = [padded[0], padded[1], padded[2], padded[3]];
                match (signed, le) {
                    (true, true) => i32::from_le_bytes(raw) as i64,
                    (true, false) => i32::from_be_bytes(raw) as i64,
                    (false, true) => u32::from_le_bytes(raw) as i64,
                    (false, false) => u32::from_be_bytes(raw) as i64,
                }
            }
            _ => {
                return Err(DriverError::Protocol(format!(
                    "unsupported channel width: {} bytes",
                    self.size
                )))
            }
        };
        Ok(value)
    }

    /// Encode `value` into `size` bytes, failing if it does not fit.
    pub fn encode(&self, value: i64) -> Result<Vec<u8>> {
        self.check_width()?;
        let bits = 8 * self.size as u32;
        let (min, max) = if self.signed {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        } else {
            (0, (1i64 << bits) - 1)
        };
        if value < min || value > max {
            return Err(DriverError::ValueOutOfRange {
                value,
                size: self.size,
            });
        }

        let mut out = value.to_le_bytes()[..self.size].to_vec();
        if !self.little_endian {
            out.reverse();
        }
        Ok(out)
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Signal source of a single streamed value.
///
/// ADC channels are named after the Shimmer3 expansion/internal ADC pin
/// they sample (e.g. [`ChannelType::IntAdc13`] is internal ADC A13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelType {
    AccelLnX,
    AccelLnY,
    AccelLnZ,
    VBatt,
    AccelWrX,
    AccelWrY,
    AccelWrZ,
    MagRegX,
    MagRegY,
    MagRegZ,
    GyroX,
    GyroY,
    GyroZ,
    ExtAdc7,
    ExtAdc6,
    ExtAdc15,
    IntAdc1,
    IntAdc12,
    IntAdc13,
    IntAdc14,
    AccelHgX,
    AccelHgY,
    AccelHgZ,
    MagWrX,
    MagWrY,
    MagWrZ,
    Temperature,
    Pressure,
    GsrRaw,
    Exg1Status,
    Exg1Ch1Bits24,
    Exg1Ch2Bits24,
    Exg2Status,
    Exg2Ch1Bits24,
    Exg2Ch2Bits24,
    Exg1Ch1Bits16,
    Exg1Ch2Bits16,
    Exg2Ch1Bits16,
    Exg2Ch2Bits16,
    StrainHigh,
    StrainLow,
    /// Sample timestamp prepended to every data packet. Never reported by the
    /// device as an active channel.
    Timestamp,
}

/// Per-channel metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel id used by the device (inquiry responses, log headers).
    pub id: u16,
    /// Whether the device ever lists this channel in an inquiry response.
    pub public: bool,
}

const fn public(id: u16) -> ChannelInfo {
    ChannelInfo { id, public: true }
}

impl ChannelType {
    pub const ALL: [ChannelType; 42] = [
        ChannelType::AccelLnX,
        ChannelType::AccelLnY,
        ChannelType::AccelLnZ,
        ChannelType::VBatt,
        ChannelType::AccelWrX,
        ChannelType::AccelWrY,
        ChannelType::AccelWrZ,
        ChannelType::MagRegX,
        ChannelType::MagRegY,
        ChannelType::MagRegZ,
        ChannelType::GyroX,
        ChannelType::GyroY,
        ChannelType::GyroZ,
        ChannelType::ExtAdc7,
        ChannelType::ExtAdc6,
        ChannelType::ExtAdc15,
        ChannelType::IntAdc1,
        ChannelType::IntAdc12,
        ChannelType::IntAdc13,
        ChannelType::IntAdc14,
        ChannelType::AccelHgX,
        ChannelType::AccelHgY,
        ChannelType::AccelHgZ,
        ChannelType::MagWrX,
        ChannelType::MagWrY,
        ChannelType::MagWrZ,
        ChannelType::Temperature,
        ChannelType::Pressure,
        ChannelType::GsrRaw,
        ChannelType::Exg1Status,
        ChannelType::Exg1Ch1Bits24,
        ChannelType::Exg1Ch2Bits24,
        ChannelType::Exg2Status,
        ChannelType::Exg2Ch1Bits24,
        ChannelType::Exg2Ch2Bits24,
        ChannelType::Exg1Ch1Bits16,
        ChannelType::Exg1Ch2Bits16,
        ChannelType::Exg2Ch1Bits16,
        ChannelType::Exg2Ch2Bits16,
        ChannelType::StrainHigh,
        ChannelType::StrainLow,
        ChannelType::Timestamp,
    ];

    pub const fn info(self) -> ChannelInfo {
        use ChannelType::*;
        match self {
            AccelLnX => public(0x00),
            AccelLnY => public(0x01),
            AccelLnZ => public(0x02),
            VBatt => public(0x03),
            AccelWrX => public(0x04),
            AccelWrY => public(0x05),
            AccelWrZ => public(0x06),
            MagRegX => public(0x07),
            MagRegY => public(0x08),
            MagRegZ => public(0x09),
            GyroX => public(0x0A),
            GyroY => public(0x0B),
            GyroZ => public(0x0C),
            ExtAdc7 => public(0x0D),
            ExtAdc6 => public(0x0E),
            ExtAdc15 => public(0x0F),
            IntAdc1 => public(0x10),
            IntAdc12 => public(0x11),
            IntAdc13 => public(0x12),
            IntAdc14 => public(0x13),
            AccelHgX => public(0x14),
            AccelHgY => public(0x15),
            AccelHgZ => public(0x16),
            MagWrX => public(0x17),
            MagWrY => public(0x18),
            MagWrZ => public(0x19),
            Temperature => public(0x1A),
            Pressure => public(0x1B),
            GsrRaw => public(0x1C),
            Exg1Status => public(0x1D),
            Exg1Ch1Bits24 => public(0x1E),
            Exg1Ch2Bits24 => public(0x1F),
            Exg2Status => public(0x20),
            Exg2Ch1Bits24 => public(0x21),
            Exg2Ch2Bits24 => public(0x22),
            Exg1Ch1Bits16 => public(0x23),
            Exg1Ch2Bits16 => public(0x24),
            Exg2Ch1Bits16 => public(0x25),
            Exg2Ch2Bits16 => public(0x26),
            StrainHigh => public(0x27),
            StrainLow => public(0x28),
            Timestamp => ChannelInfo {
                id: 0x100,
                public: false,
            },
        }
    }

    /// Look up a public channel by the id the device reports.
    pub fn from_id(id: u8) -> Result<ChannelType> {
        ChannelType::ALL
            .iter()
            .copied()
            .find(|ch| {
                let info = ch.info();
                info.public && info.id == id as u16
            })
            .ok_or_else(|| DriverError::Protocol(format!("unknown channel id: {id:#04x}")))
    }

    /// Wire layout of this channel, `None` for channels whose format is not
    /// known (wide-range accelerometer, wide-range magnetometer).
    pub const fn data_type(self) -> Option<DataType> {
        use ChannelType::*;
        const I16_LE: DataType = DataType::new(2, true, true);
        const I16_BE: DataType = DataType::new(2, true, false);
        const U16_LE: DataType = DataType::new(2, false, true);
        const U16_BE: DataType = DataType::new(2, false, false);
        const U8: DataType = DataType::new(1, false, true);
        const I24_BE: DataType = DataType::new(3, true, false);

        match self {
            AccelLnX | AccelLnY | AccelLnZ | VBatt => Some(I16_LE),
            AccelWrX | AccelWrY | AccelWrZ => Some(I16_LE),
            MagRegX | MagRegY | MagRegZ => Some(I16_LE),
            GyroX | GyroY | GyroZ => Some(I16_BE),
            ExtAdc7 | ExtAdc6 | ExtAdc15 => Some(U16_LE),
            IntAdc1 | IntAdc12 | IntAdc13 | IntAdc14 => Some(U16_LE),
            AccelHgX | AccelHgY | AccelHgZ | MagWrX | MagWrY | MagWrZ => None,
            Temperature => Some(U16_BE),
            Pressure => Some(DataType::new(3, false, false)),
            GsrRaw => Some(U16_LE),
            Exg1Status | Exg2Status => Some(U8),
            Exg1Ch1Bits24 | Exg1Ch2Bits24 | Exg2Ch1Bits24 | Exg2Ch2Bits24 => Some(I24_BE),
            Exg1Ch1Bits16 | Exg1Ch2Bits16 | Exg2Ch1Bits16 | Exg2Ch2Bits16 => Some(I16_BE),
            StrainHigh | StrainLow => Some(U16_LE),
            Timestamp => Some(DataType::new(3, false, true)),
        }
    }

    /// Like [`data_type`](Self::data_type) but fails for channels without a
    /// known layout.
    pub fn require_data_type(self) -> Result<DataType> {
        self.data_type().ok_or_else(|| {
            DriverError::Protocol(format!("channel {self:?} has no known data layout"))
        })
    }
}

// ============================================================================
// Sensor Groups
// ============================================================================

/// Width of the enabled-sensors bitfield on the wire.
pub const SENSOR_BITFIELD_LEN: usize = 3;
const SENSOR_BITFIELD_TYPE: DataType = DataType::new(SENSOR_BITFIELD_LEN, false, true);

/// Set of channels that is switched on and off as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorGroup {
    AccelLn,
    Battery,
    /// External ADC A7
    ChA7,
    /// External ADC A6
    ChA6,
    /// External ADC A15
    ChA15,
    /// Internal ADC A12
    ChA12,
    /// Internal ADC A13
    ChA13,
    /// Internal ADC A14
    ChA14,
    Strain,
    /// Internal ADC A1
    ChA1,
    Gsr,
    Gyro,
    AccelWr,
    MagReg,
    AccelHg,
    MagWr,
    Pressure,
    Exg1Bits24,
    Exg1Bits16,
    Exg2Bits24,
    Exg2Bits16,
    Temp,
}

impl SensorGroup {
    /// All groups in canonical stream order.
    pub const ALL: [SensorGroup; 22] = [
        SensorGroup::AccelLn,
        SensorGroup::Battery,
        SensorGroup::ChA7,
        SensorGroup::ChA6,
        SensorGroup::ChA15,
        SensorGroup::ChA12,
        SensorGroup::ChA13,
        SensorGroup::ChA14,
        SensorGroup::Strain,
        SensorGroup::ChA1,
        SensorGroup::Gsr,
        SensorGroup::Gyro,
        SensorGroup::AccelWr,
        SensorGroup::MagReg,
        SensorGroup::AccelHg,
        SensorGroup::MagWr,
        SensorGroup::Pressure,
        SensorGroup::Exg1Bits24,
        SensorGroup::Exg1Bits16,
        SensorGroup::Exg2Bits24,
        SensorGroup::Exg2Bits16,
        SensorGroup::Temp,
    ];

    /// Position in which the device appends this group's channels to a sample.
    pub fn order(self) -> usize {
        SensorGroup::ALL
            .iter()
            .position(|s| *s == self)
            .map_or(usize::MAX, |p| p + 1)
    }

    /// Bit that enables this group in the sensor bitfield.
    pub const fn bit(self) -> u32 {
        use SensorGroup::*;
        match self {
            AccelLn => 0x80,
            Gyro => 0x40,
            MagReg => 0x20,
            Exg1Bits24 => 0x10,
            Exg2Bits24 => 0x08,
            Gsr => 0x04,
            ChA7 => 0x02,
            ChA6 => 0x01,
            Strain => 0x80 << 8,
            Battery => 0x20 << 8,
            AccelWr => 0x10 << 8,
            ChA15 => 0x08 << 8,
            ChA1 => 0x04 << 8,
            ChA12 => 0x02 << 8,
            ChA13 => 0x01 << 8,
            ChA14 => 0x80 << 16,
            AccelHg => 0x40 << 16,
            MagWr => 0x20 << 16,
            Exg1Bits16 => 0x10 << 16,
            Exg2Bits16 => 0x08 << 16,
            Pressure => 0x04 << 16,
            Temp => 0x02 << 16,
        }
    }

    pub const fn channels(self) -> &'static [ChannelType] {
        use ChannelType as C;
        match self {
            SensorGroup::AccelLn => &[C::AccelLnX, C::AccelLnY, C::AccelLnZ],
            SensorGroup::Battery => &[C::VBatt],
            SensorGroup::ChA7 => &[C::ExtAdc7],
            SensorGroup::ChA6 => &[C::ExtAdc6],
            SensorGroup::ChA15 => &[C::ExtAdc15],
            SensorGroup::ChA12 => &[C::IntAdc12],
            SensorGroup::ChA13 => &[C::IntAdc13],
            SensorGroup::ChA14 => &[C::IntAdc14],
            SensorGroup::Strain => &[C::StrainHigh, C::StrainLow],
            SensorGroup::ChA1 => &[C::IntAdc1],
            SensorGroup::Gsr => &[C::GsrRaw],
            SensorGroup::Gyro => &[C::GyroX, C::GyroY, C::GyroZ],
            SensorGroup::AccelWr => &[C::AccelWrX, C::AccelWrY, C::AccelWrZ],
            SensorGroup::MagReg => &[C::MagRegX, C::MagRegY, C::MagRegZ],
            SensorGroup::AccelHg => &[C::AccelHgX, C::AccelHgY, C::AccelHgZ],
            SensorGroup::MagWr => &[C::MagWrX, C::MagWrY, C::MagWrZ],
            // Temperature is read out together with the pressure sensor.
            SensorGroup::Pressure => &[C::Temperature, C::Pressure],
            SensorGroup::Exg1Bits24 => &[C::Exg1Status, C::Exg1Ch1Bits24, C::Exg1Ch2Bits24],
            SensorGroup::Exg1Bits16 => &[C::Exg1Status, C::Exg1Ch1Bits16, C::Exg1Ch2Bits16],
            SensorGroup::Exg2Bits24 => &[C::Exg2Status, C::Exg2Ch1Bits24, C::Exg2Ch2Bits24],
            SensorGroup::Exg2Bits16 => &[C::Exg2Status, C::Exg2Ch1Bits16, C::Exg2Ch2Bits16],
            SensorGroup::Temp => &[],
        }
    }
}

/// Sort sensor groups into the order the device streams them in.
pub fn sort_sensors(sensors: &mut [SensorGroup]) {
    sensors.sort_by_key(|s| s.order());
}

/// Channels produced by `sensors`, in the order given.
pub fn enabled_channels(sensors: &[SensorGroup]) -> Vec<ChannelType> {
    sensors.iter().flat_map(|s| s.channels().iter().copied()).collect()
}

pub fn sensors_to_bitfield(sensors: &[SensorGroup]) -> u32 {
    sensors.iter().fold(0, |acc, s| acc | s.bit())
}

/// Enabled sensor groups in canonical order.
pub fn bitfield_to_sensors(bitfield: u32) -> Vec<SensorGroup> {
    SensorGroup::ALL
        .iter()
        .copied()
        .filter(|s| bitfield & s.bit() != 0)
        .collect()
}

/// Serialize sensor groups into the 3-byte little-endian wire bitfield.
pub fn serialize_sensors(sensors: &[SensorGroup]) -> Vec<u8> {
    let bitfield = sensors_to_bitfield(sensors);
    bitfield.to_le_bytes()[..SENSOR_BITFIELD_LEN].to_vec()
}

pub fn deserialize_sensors(bytes: &[u8]) -> Result<Vec<SensorGroup>> {
    let bitfield = SENSOR_BITFIELD_TYPE.decode(bytes)?;
    Ok(bitfield_to_sensors(bitfield as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[test]
    #[case(DataType::new(2, false, true), &[0x26, 0x07], 0x0726)]
    #[case(DataType::new(2, true, true), &[0xFF, 0xFF], -1)]
    #[case(DataType::new(2, true, false), &[0x80, 0x00], -32768)]
    #[case(DataType::new(3, false, true), &[0xDE, 0xD0, 0xB2], 0xB2D0DE)]
    #[case(DataType::new(3, true, false), &[0xFF, 0xFF, 0xFE], -2)]
    #[case(DataType::new(3, true, false), &[0x7F, 0xFF, 0xFF], 0x7F_FFFF)]
    #[case(DataType::new(3, false, false), &[0x80, 0x00, 0x01], 0x80_0001)]
    #[case(DataType::new(1, false, true), &[0xF0], 0xF0)]
    fn decode_values(#[case] dtype: DataType, #[case] bytes: &[u8], #[case] expected: i64) {
        assert_eq!(dtype.decode(bytes).unwrap(), expected);
    }

    #[test]
    fn encode_pads_and_truncates() {
        let i24 = DataType::new(3, true, false);
        assert_eq!(i24.encode(-2).unwrap(), vec![0xFF, 0xFF, 0xFE]);
        assert_eq!(i24.decode(&i24.encode(-123_456).unwrap()).unwrap(), -123_456);

        let u24 = DataType::new(3, false, true);
        assert_eq!(u24.encode(0xB2D0DE).unwrap(), vec![0xDE, 0xD0, 0xB2]);
    }

    #[test]
    fn encode_rejects_out_of_range() {
        let u16le = DataType::new(2, false, true);
        assert!(matches!(
            u16le.encode(0x1_0000),
            Err(DriverError::ValueOutOfRange { size: 2, .. })
        ));
        assert!(u16le.encode(-1).is_err());
        assert!(DataType::new(1, true, true).encode(128).is_err());
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(DataType::new(2, false, true).decode(&[0x00]).is_err());
    }

    #[rstest::rstest]
    #[test]
    #[case(DataType::new(0, false, true), &[])]
    #[case(DataType::new(0, true, false), &[])]
    #[case(DataType::new(5, false, true), &[0; 5])]
    #[case(DataType::new(8, true, false), &[0; 8])]
    fn unsupported_widths_are_errors(#[case] dtype: DataType, #[case] bytes: &[u8]) {
        assert!(matches!(dtype.decode(bytes), Err(DriverError::Protocol(_))));
        assert!(matches!(dtype.encode(0), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn channel_ids_round_trip() {
        for ch in ChannelType::ALL.iter().filter(|c| c.info().public) {
            assert_eq!(ChannelType::from_id(ch.info().id as u8).unwrap(), *ch);
        }
        assert_eq!(ChannelType::from_id(0x12).unwrap(), ChannelType::IntAdc13);
        assert!(ChannelType::from_id(0x29).is_err());
        assert!(!ChannelType::Timestamp.info().public);
    }

    #[test]
    fn unknown_layouts() {
        assert!(ChannelType::AccelHgX.data_type().is_none());
        assert!(ChannelType::MagWrZ.require_data_type().is_err());
        assert_eq!(
            ChannelType::GyroY.data_type(),
            Some(DataType::new(2, true, false))
        );
    }

    #[test]
    fn serialize_sensor_bitfield() {
        let sensors = [SensorGroup::Gyro, SensorGroup::ChA13, SensorGroup::Pressure];
        assert_eq!(sensors_to_bitfield(&sensors), 0x040140);
        assert_eq!(serialize_sensors(&sensors), vec![0x40, 0x01, 0x04]);
    }

    #[test]
    fn deserialize_sorts_canonically() {
        let sensors = deserialize_sensors(&[0x40, 0x01, 0x04]).unwrap();
        assert_eq!(
            sensors,
            vec![SensorGroup::ChA13, SensorGroup::Gyro, SensorGroup::Pressure]
        );
    }

    #[test]
    fn every_group_survives_the_bitfield() {
        let all = SensorGroup::ALL.to_vec();
        assert_eq!(deserialize_sensors(&serialize_sensors(&all)).unwrap(), all);

        let bits: Vec<u32> = all.iter().map(|s| s.bit()).collect();
        for (i, b) in bits.iter().enumerate() {
            assert_eq!(b.count_ones(), 1);
            assert!(!bits[i + 1..].contains(b));
        }
    }

    #[test]
    fn enabled_channels_follow_groups() {
        let mut sensors = vec![SensorGroup::Gsr, SensorGroup::Pressure, SensorGroup::AccelLn];
        sort_sensors(&mut sensors);
        assert_eq!(
            enabled_channels(&sensors),
            vec![
                ChannelType::AccelLnX,
                ChannelType::AccelLnY,
                ChannelType::AccelLnZ,
                ChannelType::GsrRaw,
                ChannelType::Temperature,
                ChannelType::Pressure,
            ]
        );
        assert!(SensorGroup::Temp.channels().is_empty());
    }

    #[test]
    fn sensor_sets_serialize_by_name() {
        let sensors = vec![SensorGroup::Gyro, SensorGroup::ChA13];
        let json = serde_json::to_string(&sensors).unwrap();
        assert_eq!(json, r#"["Gyro","ChA13"]"#);
        assert_eq!(
            serde_json::from_str::<Vec<SensorGroup>>(&json).unwrap(),
            sensors
        );
        assert!(serde_json::from_str::<SensorGroup>(r#""Thermometer""#).is_err());
    }
}
