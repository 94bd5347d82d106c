//! Command codec for the Shimmer Bluetooth protocol.
//!
//! Every request the driver can send is a [`Command`]. A command knows its
//! request bytes ([`Command::encode`]), whether the device answers with a
//! payload after the ACK ([`Command::response_code`]) and how to decode that
//! payload off the wire ([`Command::decode`]).

use std::fmt;
use std::io::Read;

use log::debug;

use crate::channels::{serialize_sensors, ChannelType, DataType, SensorGroup};
use crate::device::{
    battery_voltage, battery_voltage_to_percent, dr2sr, sec2ticks, sr2dr, ticks2sec,
    DeviceStatus, FirmwareType, FirmwareVersion, HardwareVersion,
};
use crate::errors::{DriverError, Result};
use crate::exg::{AllCalibration, ExgRegister, ALL_CALIBRATION_LEN, EXG_REGISTER_LEN};
use crate::serial::WireReader;

// ============================================================================
// Constants
// ============================================================================

/// Leading byte of an acknowledgment.
pub const ACK_COMMAND_PROCESSED: u8 = 0xFF;
/// Leading byte of a streamed sample.
pub const DATA_PACKET: u8 = 0x00;
/// Leading byte shared by in-stream responses and unsolicited pushes.
pub const INSTREAM_CMD_RESPONSE: u8 = 0x8A;

pub const INQUIRY_COMMAND: u8 = 0x01;
pub const INQUIRY_RESPONSE: u8 = 0x02;
pub const GET_SAMPLING_RATE_COMMAND: u8 = 0x03;
pub const SAMPLING_RATE_RESPONSE: u8 = 0x04;
pub const SET_SAMPLING_RATE_COMMAND: u8 = 0x05;
pub const START_STREAMING_COMMAND: u8 = 0x07;
pub const SET_SENSORS_COMMAND: u8 = 0x08;
pub const STOP_STREAMING_COMMAND: u8 = 0x20;
pub const GET_ALL_CALIBRATION_COMMAND: u8 = 0x2C;
pub const ALL_CALIBRATION_RESPONSE: u8 = 0x2D;
pub const GET_FW_VERSION_COMMAND: u8 = 0x2E;
pub const FW_VERSION_RESPONSE: u8 = 0x2F;
pub const GET_SHIMMER_VERSION_COMMAND: u8 = 0x3F;
pub const SHIMMER_VERSION_RESPONSE: u8 = 0x25;
pub const SET_EXG_REGS_COMMAND: u8 = 0x61;
pub const EXG_REGS_RESPONSE: u8 = 0x62;
pub const GET_EXG_REGS_COMMAND: u8 = 0x63;
pub const GET_STATUS_COMMAND: u8 = 0x72;
pub const STATUS_RESPONSE: u8 = 0x71;
pub const SET_SHIMMERNAME_COMMAND: u8 = 0x79;
pub const SHIMMERNAME_RESPONSE: u8 = 0x7A;
pub const GET_SHIMMERNAME_COMMAND: u8 = 0x7B;
pub const SET_EXPID_COMMAND: u8 = 0x7C;
pub const EXPID_RESPONSE: u8 = 0x7D;
pub const GET_EXPID_COMMAND: u8 = 0x7E;
pub const SET_CONFIGTIME_COMMAND: u8 = 0x85;
pub const CONFIGTIME_RESPONSE: u8 = 0x86;
pub const GET_CONFIGTIME_COMMAND: u8 = 0x87;
pub const SET_RWC_COMMAND: u8 = 0x8F;
pub const RWC_RESPONSE: u8 = 0x90;
pub const GET_RWC_COMMAND: u8 = 0x91;
pub const START_LOGGING_COMMAND: u8 = 0x92;
pub const STOP_LOGGING_COMMAND: u8 = 0x93;
pub const BATTERY_RESPONSE: u8 = 0x94;
pub const GET_BATTERY_COMMAND: u8 = 0x95;
pub const DUMMY_COMMAND: u8 = 0x96;
pub const ENABLE_STATUS_ACK_COMMAND: u8 = 0xA3;

/// Largest payload of a length-prefixed field.
pub const MAX_VARLEN: usize = 255;

// ============================================================================
// Response codes
// ============================================================================

/// One or two byte signature that precedes a response payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode {
    bytes: [u8; 2],
    len: u8,
}

impl ResponseCode {
    pub const fn single(code: u8) -> Self {
        Self {
            bytes: [code, 0],
            len: 1,
        }
    }

    pub const fn pair(first: u8, second: u8) -> Self {
        Self {
            bytes: [first, second],
            len: 2,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseCode({:02x?})", self.as_bytes())
    }
}

/// Signature of a status response and of an unsolicited status push.
pub const FULL_STATUS_RESPONSE: ResponseCode =
    ResponseCode::pair(INSTREAM_CMD_RESPONSE, STATUS_RESPONSE);
pub const FULL_BATTERY_RESPONSE: ResponseCode =
    ResponseCode::pair(INSTREAM_CMD_RESPONSE, BATTERY_RESPONSE);

// ============================================================================
// Commands
// ============================================================================

/// Typed queries: commands with a fixed response layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Query {
    Inquiry,
    SamplingRate,
    Battery { in_percent: bool },
    ConfigTime,
    Rtc,
    Status,
    FirmwareVersion,
    HardwareVersion,
    ExgRegisters { chip: u8 },
    AllCalibration,
}

/// Typed settings: commands with arguments and no response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    /// Sampling rate in Hz.
    SamplingRate(f64),
    /// Config time as stored in the device configuration.
    ConfigTime(u64),
    /// Real-time clock as UNIX time in seconds.
    Rtc(f64),
    Sensors(Vec<SensorGroup>),
    ExgRegisters { chip: u8, offset: u8, data: Vec<u8> },
    StatusAck(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Single opcode, no arguments, no response.
    OneShot { code: u8 },
    /// Opcode answered with a length-prefixed string.
    GetString { code: u8, response: ResponseCode },
    /// Opcode followed by a length-prefixed string.
    SetString { code: u8, value: String },
    Get(Query),
    Set(Setting),
}

impl Command {
    pub fn start_streaming() -> Self {
        Command::OneShot {
            code: START_STREAMING_COMMAND,
        }
    }

    pub fn stop_streaming() -> Self {
        Command::OneShot {
            code: STOP_STREAMING_COMMAND,
        }
    }

    pub fn start_logging() -> Self {
        Command::OneShot {
            code: START_LOGGING_COMMAND,
        }
    }

    pub fn stop_logging() -> Self {
        Command::OneShot {
            code: STOP_LOGGING_COMMAND,
        }
    }

    pub fn dummy() -> Self {
        Command::OneShot {
            code: DUMMY_COMMAND,
        }
    }

    pub fn get_device_name() -> Self {
        Command::GetString {
            code: GET_SHIMMERNAME_COMMAND,
            response: ResponseCode::single(SHIMMERNAME_RESPONSE),
        }
    }

    pub fn set_device_name(name: impl Into<String>) -> Self {
        Command::SetString {
            code: SET_SHIMMERNAME_COMMAND,
            value: name.into(),
        }
    }

    pub fn get_experiment_id() -> Self {
        Command::GetString {
            code: GET_EXPID_COMMAND,
            response: ResponseCode::single(EXPID_RESPONSE),
        }
    }

    pub fn set_experiment_id(id: impl Into<String>) -> Self {
        Command::SetString {
            code: SET_EXPID_COMMAND,
            value: id.into(),
        }
    }

    /// Signature of the response payload, `None` if the device only ACKs.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Command::OneShot { .. } | Command::SetString { .. } | Command::Set(_) => None,
            Command::GetString { response, .. } => Some(*response),
            Command::Get(query) => Some(query.response_code()),
        }
    }

    pub fn has_response(&self) -> bool {
        self.response_code().is_some()
    }

    /// Whether this is the status query whose response looks exactly like an
    /// unsolicited status push.
    pub fn is_status_query(&self) -> bool {
        matches!(self, Command::Get(Query::Status))
    }

    /// Request bytes. Fails before anything is sent if an argument does not
    /// fit its wire field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Command::OneShot { code } | Command::GetString { code, .. } => out.push(*code),
            Command::SetString { code, value } => {
                out.push(*code);
                push_varlen(&mut out, value.as_bytes())?;
            }
            Command::Get(query) => query.encode_into(&mut out),
            Command::Set(setting) => setting.encode_into(&mut out)?,
        }
        Ok(out)
    }

    /// Read the response signature and decode the payload that follows.
    pub fn decode<R: Read>(&self, wire: &mut WireReader<R>) -> Result<Response> {
        match self {
            Command::GetString { response, .. } => {
                wire.read_response_code(response.as_bytes())?;
                Ok(Response::Text(read_string(wire)?))
            }
            Command::Get(query) => {
                wire.read_response_code(query.response_code().as_bytes())?;
                query.decode_payload(wire)
            }
            _ => Err(DriverError::Protocol(format!(
                "command {self:?} has no response"
            ))),
        }
    }
}

impl Query {
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Query::Inquiry => ResponseCode::single(INQUIRY_RESPONSE),
            Query::SamplingRate => ResponseCode::single(SAMPLING_RATE_RESPONSE),
            Query::Battery { .. } => FULL_BATTERY_RESPONSE,
            Query::ConfigTime => ResponseCode::single(CONFIGTIME_RESPONSE),
            Query::Rtc => ResponseCode::single(RWC_RESPONSE),
            Query::Status => FULL_STATUS_RESPONSE,
            Query::FirmwareVersion => ResponseCode::single(FW_VERSION_RESPONSE),
            Query::HardwareVersion => ResponseCode::single(SHIMMER_VERSION_RESPONSE),
            Query::ExgRegisters { .. } => ResponseCode::single(EXG_REGS_RESPONSE),
            Query::AllCalibration => ResponseCode::single(ALL_CALIBRATION_RESPONSE),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Query::Inquiry => out.push(INQUIRY_COMMAND),
            Query::SamplingRate => out.push(GET_SAMPLING_RATE_COMMAND),
            Query::Battery { .. } => out.push(GET_BATTERY_COMMAND),
            Query::ConfigTime => out.push(GET_CONFIGTIME_COMMAND),
            Query::Rtc => out.push(GET_RWC_COMMAND),
            Query::Status => out.push(GET_STATUS_COMMAND),
            Query::FirmwareVersion => out.push(GET_FW_VERSION_COMMAND),
            Query::HardwareVersion => out.push(GET_SHIMMER_VERSION_COMMAND),
            Query::ExgRegisters { chip } => {
                out.extend_from_slice(&[GET_EXG_REGS_COMMAND, *chip, 0x00, EXG_REGISTER_LEN as u8])
            }
            Query::AllCalibration => out.push(GET_ALL_CALIBRATION_COMMAND),
        }
    }

    fn decode_payload<R: Read>(&self, wire: &mut WireReader<R>) -> Result<Response> {
        let response = match self {
            Query::Inquiry => {
                let [sr_lo, sr_hi, c0, c1, c2, c3, n_ch, buf_size] = wire.read_array::<8>()?;
                let channels = wire
                    .read(n_ch as usize)?
                    .into_iter()
                    .map(ChannelType::from_id)
                    .collect::<Result<Vec<_>>>()?;
                Response::Inquiry(InquiryResponse {
                    sampling_rate: dr2sr(u16::from_le_bytes([sr_lo, sr_hi])),
                    config: u32::from_le_bytes([c0, c1, c2, c3]),
                    buffer_size: buf_size,
                    channels,
                })
            }
            Query::SamplingRate => {
                let dr = u16::from_le_bytes(wire.read_array::<2>()?);
                Response::SamplingRate(dr2sr(dr))
            }
            Query::Battery { in_percent } => {
                let [lsb, msb, _] = wire.read_array::<3>()?;
                let volts = battery_voltage(lsb, msb);
                Response::Battery(if *in_percent {
                    battery_voltage_to_percent(volts)
                } else {
                    volts
                })
            }
            Query::ConfigTime => {
                let text = read_string(wire)?;
                let time = text.trim().parse::<u64>().map_err(|_| {
                    DriverError::Protocol(format!("invalid config time: {text:?}"))
                })?;
                Response::ConfigTime(time)
            }
            Query::Rtc => {
                let ticks = u64::from_le_bytes(wire.read_array::<8>()?);
                Response::Rtc(ticks2sec(ticks))
            }
            Query::Status => Response::Status(DeviceStatus::from_byte(wire.read_byte()?)),
            Query::FirmwareVersion => {
                let [t0, t1, m0, m1, minor, rel] = wire.read_array::<6>()?;
                let fw_type = FirmwareType::from_id(u16::from_le_bytes([t0, t1]))?;
                let version = FirmwareVersion::new(u16::from_le_bytes([m0, m1]), minor, rel);
                Response::FirmwareVersion(fw_type, version)
            }
            Query::HardwareVersion => {
                Response::HardwareVersion(HardwareVersion::from_id(wire.read_byte()?))
            }
            Query::ExgRegisters { .. } => {
                let len = wire.read_byte()? as usize;
                if len != EXG_REGISTER_LEN {
                    return Err(DriverError::Protocol(format!(
                        "ExG register response must have length {EXG_REGISTER_LEN}, got {len}"
                    )));
                }
                Response::ExgRegister(ExgRegister::from_bytes(&wire.read(len)?)?)
            }
            Query::AllCalibration => Response::AllCalibration(AllCalibration::from_bytes(
                &wire.read(ALL_CALIBRATION_LEN)?,
            )?),
        };
        Ok(response)
    }
}

impl Setting {
    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Setting::SamplingRate(sr) => {
                out.push(SET_SAMPLING_RATE_COMMAND);
                out.extend_from_slice(&sr2dr(*sr)?.to_le_bytes());
            }
            Setting::ConfigTime(time) => {
                out.push(SET_CONFIGTIME_COMMAND);
                push_varlen(out, time.to_string().as_bytes())?;
            }
            Setting::Rtc(seconds) => {
                out.push(SET_RWC_COMMAND);
                out.extend_from_slice(&sec2ticks(*seconds).to_le_bytes());
            }
            Setting::Sensors(sensors) => {
                out.push(SET_SENSORS_COMMAND);
                out.extend_from_slice(&serialize_sensors(sensors));
            }
            Setting::ExgRegisters { chip, offset, data } => {
                if data.len() > MAX_VARLEN {
                    return Err(DriverError::ArgumentTooLong(data.len()));
                }
                out.extend_from_slice(&[SET_EXG_REGS_COMMAND, *chip, *offset, data.len() as u8]);
                out.extend_from_slice(data);
            }
            Setting::StatusAck(enabled) => {
                out.extend_from_slice(&[ENABLE_STATUS_ACK_COMMAND, u8::from(*enabled)]);
            }
        }
        Ok(())
    }
}

fn push_varlen(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    if data.len() > MAX_VARLEN {
        return Err(DriverError::ArgumentTooLong(data.len()));
    }
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    Ok(())
}

fn read_string<R: Read>(wire: &mut WireReader<R>) -> Result<String> {
    let raw = wire.read_varlen()?;
    String::from_utf8(raw).map_err(|e| DriverError::Protocol(format!("invalid string: {e}")))
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct InquiryResponse {
    pub sampling_rate: f64,
    /// Raw configuration bytes of the device.
    pub config: u32,
    pub buffer_size: u8,
    /// Active channels, without the implicit timestamp.
    pub channels: Vec<ChannelType>,
}

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Text(String),
    SamplingRate(f64),
    Battery(f64),
    ConfigTime(u64),
    Rtc(f64),
    Status(DeviceStatus),
    FirmwareVersion(FirmwareType, FirmwareVersion),
    HardwareVersion(HardwareVersion),
    Inquiry(InquiryResponse),
    ExgRegister(ExgRegister),
    AllCalibration(AllCalibration),
}

// ============================================================================
// Data packets
// ============================================================================

/// One streamed sample: a value per configured channel, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    values: Vec<(ChannelType, i64)>,
}

impl DataPacket {
    /// Consume a data packet (leading marker included) laid out as `stream_types`.
    pub fn receive<R: Read>(
        stream_types: &[(ChannelType, DataType)],
        wire: &mut WireReader<R>,
    ) -> Result<Self> {
        wire.read_response_code(&[DATA_PACKET])?;

        let mut values = Vec::with_capacity(stream_types.len());
        for (channel, dtype) in stream_types {
            let raw = wire.read(dtype.size)?;
            values.push((*channel, dtype.decode(&raw)?));
        }
        debug!("data packet: {} channels", values.len());
        Ok(Self { values })
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelType> + '_ {
        self.values.iter().map(|(ch, _)| *ch)
    }

    pub fn values(&self) -> &[(ChannelType, i64)] {
        &self.values
    }

    pub fn get(&self, channel: ChannelType) -> Option<i64> {
        self.values
            .iter()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, v)| *v)
    }
}
