//! ExG (ADS1292R) register block and inertial calibration block decoders.

use std::fmt;

use crate::errors::{DriverError, Result};
use crate::serial::hex;

/// Size of one ExG chip's register block.
pub const EXG_REGISTER_LEN: usize = 10;

/// Size of the all-calibration block (4 sensors x 21 bytes).
pub const ALL_CALIBRATION_LEN: usize = 84;

const CALIBRATION_SENSOR_LEN: usize = 21;
const CALIBRATION_SENSORS: usize = 4;

const CH_POWERDOWN_BIT: u8 = 0x80;
const RLD_POWERDOWN_BIT: u8 = 0x20;

/// Input multiplexer setting of an ExG channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExgMux {
    Normal,
    Shorted,
    RldMeasure,
    Mvdd,
    TempSensor,
    TestSignal,
    RldDrp,
    RldDrm,
    RldDrpm,
    Input3,
    Reserved,
}

impl ExgMux {
    fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits {
            0x00 => ExgMux::Normal,
            0x01 => ExgMux::Shorted,
            0x02 => ExgMux::RldMeasure,
            0x03 => ExgMux::Mvdd,
            0x04 => ExgMux::TempSensor,
            0x05 => ExgMux::TestSignal,
            0x06 => ExgMux::RldDrp,
            0x07 => ExgMux::RldDrm,
            0x08 => ExgMux::RldDrpm,
            0x09 => ExgMux::Input3,
            0x0A => ExgMux::Reserved,
            other => {
                return Err(DriverError::Protocol(format!(
                    "invalid ExG mux setting: {other:#04x}"
                )))
            }
        })
    }
}

/// Right-leg-drive lead selection bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RldLead {
    Rld1P,
    Rld1N,
    Rld2P,
    Rld2N,
}

impl RldLead {
    const ALL: [RldLead; 4] = [RldLead::Rld1P, RldLead::Rld1N, RldLead::Rld2P, RldLead::Rld2N];

    fn mask(self) -> u8 {
        match self {
            RldLead::Rld1P => 0x01,
            RldLead::Rld1N => 0x02,
            RldLead::Rld2P => 0x04,
            RldLead::Rld2N => 0x08,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RldRef {
    External,
    Internal,
}

/// Register contents of one ADS1292R chip.
#[derive(Clone, PartialEq, Eq)]
pub struct ExgRegister {
    raw: [u8; EXG_REGISTER_LEN],
}

impl ExgRegister {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = bytes.try_into().map_err(|_| {
            DriverError::Protocol(format!(
                "ExG register block must be {EXG_REGISTER_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { raw })
    }

    pub fn binary(&self) -> &[u8] {
        &self.raw
    }

    fn ch_byte(&self, ch: usize) -> Result<u8> {
        if ch > 1 {
            return Err(DriverError::Protocol(format!(
                "ExG channel must be 0 or 1, got {ch}"
            )));
        }
        Ok(self.raw[3 + ch])
    }

    pub fn ch_gain(&self, ch: usize) -> Result<u8> {
        match (self.ch_byte(ch)? & 0x70) >> 4 {
            0 => Ok(6),
            1 => Ok(1),
            2 => Ok(2),
            3 => Ok(3),
            4 => Ok(4),
            5 => Ok(8),
            6 => Ok(12),
            other => Err(DriverError::Protocol(format!(
                "invalid ExG gain setting: {other}"
            ))),
        }
    }

    pub fn ch_mux_bits(&self, ch: usize) -> Result<u8> {
        Ok(self.ch_byte(ch)? & 0x0F)
    }

    pub fn ch_mux(&self, ch: usize) -> Result<ExgMux> {
        ExgMux::from_bits(self.ch_mux_bits(ch)?)
    }

    pub fn ch_powerdown(&self, ch: usize) -> Result<bool> {
        Ok(self.ch_byte(ch)? & CH_POWERDOWN_BIT != 0)
    }

    /// Output data rate in samples per second, `None` for the reserved setting.
    pub fn data_rate(&self) -> Option<u16> {
        match self.raw[0] & 0x07 {
            0 => Some(125),
            1 => Some(250),
            2 => Some(500),
            3 => Some(1000),
            4 => Some(2000),
            5 => Some(4000),
            6 => Some(8000),
            _ => None,
        }
    }

    pub fn rld_powerdown(&self) -> bool {
        self.raw[5] & RLD_POWERDOWN_BIT == 0
    }

    pub fn rld_channels(&self) -> Vec<RldLead> {
        RldLead::ALL
            .iter()
            .copied()
            .filter(|lead| self.raw[5] & lead.mask() != 0)
            .collect()
    }

    pub fn rld_ref(&self) -> RldRef {
        if (self.raw[9] >> 1) & 0x01 == 1 {
            RldRef::Internal
        } else {
            RldRef::External
        }
    }
}

impl fmt::Debug for ExgRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExgRegister({})", hex(&self.raw))
    }
}

/// Factory calibration of the four inertial sensors.
#[derive(Clone, PartialEq, Eq)]
pub struct AllCalibration {
    raw: [u8; ALL_CALIBRATION_LEN],
}

impl AllCalibration {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = bytes.try_into().map_err(|_| {
            DriverError::Protocol(format!(
                "calibration block must be {ALL_CALIBRATION_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { raw })
    }

    pub fn binary(&self) -> &[u8] {
        &self.raw
    }

    fn sensor_block(&self, sensor: usize) -> Result<&[u8]> {
        if sensor >= CALIBRATION_SENSORS {
            return Err(DriverError::Protocol(format!(
                "calibration sensor must be 0 to {}, got {sensor}",
                CALIBRATION_SENSORS - 1
            )));
        }
        let start = sensor * CALIBRATION_SENSOR_LEN;
        Ok(&self.raw[start..start + CALIBRATION_SENSOR_LEN])
    }

    fn be_triplet(bytes: &[u8]) -> [i16; 3] {
        [
            i16::from_be_bytes([bytes[0], bytes[1]]),
            i16::from_be_bytes([bytes[2], bytes[3]]),
            i16::from_be_bytes([bytes[4], bytes[5]]),
        ]
    }

    pub fn offset_bias(&self, sensor: usize) -> Result<[i16; 3]> {
        Ok(Self::be_triplet(&self.sensor_block(sensor)?[0..6]))
    }

    pub fn sensitivity(&self, sensor: usize) -> Result<[i16; 3]> {
        Ok(Self::be_triplet(&self.sensor_block(sensor)?[6..12]))
    }

    pub fn alignment_matrix(&self, sensor: usize) -> Result<[i8; 9]> {
        let block = &self.sensor_block(sensor)?[12..21];
        let mut out = [0i8; 9];
        for (dst, src) in out.iter_mut().zip(block) {
            *dst = *src as i8;
        }
        Ok(out)
    }
}

impl fmt::Debug for AllCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllCalibration({})", hex(&self.raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REG_CHIP1: [u8; 10] = [0x00, 0x80, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01];
    const REG_CHIP2: [u8; 10] = [0x03, 0x80, 0x10, 0x40, 0x47, 0x2D, 0x00, 0x00, 0x02, 0x03];

    #[test]
    fn rejects_short_block() {
        assert!(ExgRegister::from_bytes(&[0u8; 4]).is_err());
        assert!(AllCalibration::from_bytes(&[0u8; 83]).is_err());
    }

    #[test]
    fn channel_settings() {
        let reg = ExgRegister::from_bytes(&REG_CHIP1).unwrap();
        assert_eq!(reg.ch_gain(0).unwrap(), 6);
        assert_eq!(reg.ch_mux(0).unwrap(), ExgMux::Normal);
        assert!(!reg.ch_powerdown(1).unwrap());
        assert!(reg.ch_gain(2).is_err());

        let reg = ExgRegister::from_bytes(&REG_CHIP2).unwrap();
        assert_eq!(reg.ch_gain(0).unwrap(), 4);
        assert_eq!(reg.ch_gain(1).unwrap(), 4);
        assert_eq!(reg.ch_mux(1).unwrap(), ExgMux::RldDrm);
        assert_eq!(reg.ch_mux_bits(1).unwrap(), 0x07);
    }

    #[test]
    fn data_rate_and_rld() {
        let reg = ExgRegister::from_bytes(&REG_CHIP1).unwrap();
        assert_eq!(reg.data_rate(), Some(125));
        assert!(reg.rld_powerdown());
        assert!(reg.rld_channels().is_empty());
        assert_eq!(reg.rld_ref(), RldRef::External);

        let reg = ExgRegister::from_bytes(&REG_CHIP2).unwrap();
        assert_eq!(reg.data_rate(), Some(1000));
        assert!(!reg.rld_powerdown());
        assert_eq!(
            reg.rld_channels(),
            vec![RldLead::Rld1P, RldLead::Rld2P, RldLead::Rld2N]
        );
        assert_eq!(reg.rld_ref(), RldRef::Internal);

        let mut raw = REG_CHIP1;
        raw[0] = 0x07;
        assert_eq!(ExgRegister::from_bytes(&raw).unwrap().data_rate(), None);
    }

    #[test]
    fn calibration_fields() {
        let mut raw = [0u8; ALL_CALIBRATION_LEN];
        // sensor 1: offset (1, -2, 3), sensitivity (256, 0, -1), alignment -1..
        let block = &mut raw[21..42];
        block[..6].copy_from_slice(&[0x00, 0x01, 0xFF, 0xFE, 0x00, 0x03]);
        block[6..12].copy_from_slice(&[0x01, 0x00, 0x00, 0x00, 0xFF, 0xFF]);
        block[12] = 0xFF;
        block[20] = 0x7F;

        let cal = AllCalibration::from_bytes(&raw).unwrap();
        assert_eq!(cal.offset_bias(1).unwrap(), [1, -2, 3]);
        assert_eq!(cal.sensitivity(1).unwrap(), [256, 0, -1]);
        assert_eq!(
            cal.alignment_matrix(1).unwrap(),
            [-1, 0, 0, 0, 0, 0, 0, 0, 127]
        );
        assert_eq!(cal.offset_bias(0).unwrap(), [0, 0, 0]);
        assert!(cal.sensitivity(4).is_err());
    }
}
