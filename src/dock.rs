//! Dock UART protocol.
//!
//! While the Shimmer sits in its dock, a second serial line accepts
//! CRC-protected request/response frames:
//!
//! ```text
//! 0x24 <cmd> <len> <component> <property> <data: len-2> <crc16 LE>
//! ```
//!
//! Unlike the Bluetooth protocol every exchange is strictly synchronous, so
//! [`ShimmerDock`] reads the answer directly after writing the request.

use std::io::{self, Read, Write};

use log::{debug, info};
use serde::Serialize;
use serialport::{ClearBuffer, SerialPort};

use crate::device::{sec2ticks, ticks2sec, FirmwareType, FirmwareVersion};
use crate::errors::{DockError, DriverError, Result};
use crate::exg::{ExgRegister, EXG_REGISTER_LEN};
use crate::serial::{hex, WireReader};
use crate::transport::SerialConfig;

// ============================================================================
// Protocol constants
// ============================================================================

pub const START_CHAR: u8 = 0x24;

pub const UART_SET: u8 = 0x01;
pub const UART_RESPONSE: u8 = 0x02;
pub const UART_GET: u8 = 0x03;
pub const UART_BAD_CMD_RESPONSE: u8 = 0xFC;
pub const UART_BAD_ARG_RESPONSE: u8 = 0xFD;
pub const UART_BAD_CRC_RESPONSE: u8 = 0xFE;
pub const UART_ACK_RESPONSE: u8 = 0xFF;

pub const UART_COMP_SHIMMER: u8 = 0x01;
pub const UART_COMP_BAT: u8 = 0x02;
pub const UART_COMP_DAUGHTER_CARD: u8 = 0x03;

pub const UART_PROP_ENABLE: u8 = 0x00;
pub const UART_PROP_SAMPLE_RATE: u8 = 0x01;
pub const UART_PROP_MAC: u8 = 0x02;
pub const UART_PROP_VER: u8 = 0x03;
pub const UART_PROP_RWC_CFG_TIME: u8 = 0x04;
pub const UART_PROP_CURR_LOCAL_TIME: u8 = 0x05;
pub const UART_PROP_INFOMEM: u8 = 0x06;
pub const UART_PROP_CARD_ID: u8 = 0x02;

/// Offset of the ExG register blocks in the info memory.
pub const UART_INFOMEM_EXG_OFFSET: u16 = 0x0A;

pub const CRC_INIT: u16 = 0xB0CA;

/// Largest payload that still fits the one-byte length field.
const MAX_DATA_LEN: usize = u8::MAX as usize - 2;

// ============================================================================
// CRC
// ============================================================================

/// CRC-16/CCITT (polynomial 0x1021, MSB first) over `data`, padded with a
/// zero byte to even length.
pub fn crc16(data: &[u8], init: u16) -> u16 {
    let pad = (data.len() % 2 != 0).then_some(0u8);

    let mut crc = init;
    for byte in data.iter().copied().chain(pad) {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ============================================================================
// Port
// ============================================================================

/// Serial line the dock protocol runs on.
pub trait DockPort: Read + Write {
    /// Drop bytes received but not yet read.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DockPort for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DockOptions {
    /// Discard stale input before every request.
    pub flush_before_req: bool,
    pub crc_init: u16,
}

impl Default for DockOptions {
    fn default() -> Self {
        Self {
            flush_before_req: true,
            crc_init: CRC_INIT,
        }
    }
}

/// Firmware information as reported over the dock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DockFirmwareInfo {
    /// Hardware revision, 3 for a Shimmer3.
    pub hw_version: u8,
    pub fw_type: FirmwareType,
    pub version: FirmwareVersion,
}

// ============================================================================
// Dock API
// ============================================================================

pub struct ShimmerDock<P: DockPort> {
    wire: WireReader<P>,
    options: DockOptions,
}

impl ShimmerDock<Box<dyn SerialPort>> {
    /// Open the dock UART described by `config`.
    pub fn open(config: &SerialConfig, options: DockOptions) -> Result<Self> {
        let port = config.open()?;
        info!("dock opened: path={}", config.path);
        Ok(Self::new(port, options))
    }
}

impl<P: DockPort> ShimmerDock<P> {
    pub fn new(port: P, options: DockOptions) -> Self {
        Self {
            wire: WireReader::new(port),
            options,
        }
    }

    /// Release the underlying port.
    pub fn into_inner(self) -> P {
        self.wire.into_inner()
    }

    fn flush_input(&mut self) -> Result<()> {
        self.wire.discard_buffered();
        self.wire.get_mut().clear_input()?;
        Ok(())
    }

    fn write_packet(&mut self, cmd: u8, comp: u8, prop: u8, data: &[u8]) -> Result<()> {
        if data.len() > MAX_DATA_LEN {
            return Err(DriverError::ArgumentTooLong(data.len()));
        }
        if self.options.flush_before_req {
            self.flush_input()?;
        }

        let mut frame = Vec::with_capacity(data.len() + 7);
        frame.extend_from_slice(&[START_CHAR, cmd, (data.len() + 2) as u8, comp, prop]);
        frame.extend_from_slice(data);
        let crc = crc16(&frame, self.options.crc_init);
        frame.extend_from_slice(&crc.to_le_bytes());

        debug!("dock tx {}", hex(&frame));
        let port = self.wire.get_mut();
        port.write_all(&frame)?;
        port.flush()?;
        Ok(())
    }

    /// Read start byte and frame type, mapping error frames to [`DockError`].
    fn read_frame_type(&mut self, expected: u8, frame: &mut Vec<u8>) -> Result<()> {
        let start = self.wire.read_byte()?;
        if start != START_CHAR {
            return Err(DockError::BadStart(start).into());
        }

        let cmd = self.wire.read_byte()?;
        let err = match cmd {
            UART_BAD_ARG_RESPONSE => DockError::BadArgument,
            UART_BAD_CMD_RESPONSE => DockError::UnknownCommand,
            UART_BAD_CRC_RESPONSE => DockError::BadCrc,
            actual if actual != expected => DockError::WrongResponseType { expected, actual },
            _ => {
                frame.extend_from_slice(&[start, cmd]);
                return Ok(());
            }
        };
        Err(err.into())
    }

    fn verify_crc(&mut self, frame: &[u8]) -> Result<()> {
        let actual = u16::from_le_bytes(self.wire.read_array::<2>()?);
        let expected = crc16(frame, self.options.crc_init);
        if actual != expected {
            debug!(
                "dock CRC mismatch: frame={}, expected={:#06x}, actual={:#06x}",
                hex(frame),
                expected,
                actual
            );
            return Err(DriverError::ChecksumMismatch);
        }
        Ok(())
    }

    /// Read a response frame and return `(component, property, data)`.
    fn read_response(&mut self) -> Result<(u8, u8, Vec<u8>)> {
        let mut frame = Vec::new();
        self.read_frame_type(UART_RESPONSE, &mut frame)?;

        let [len, comp, prop] = self.wire.read_array::<3>()?;
        if len < 2 {
            return Err(DriverError::Protocol(format!(
                "dock response length {len} is shorter than its header"
            )));
        }
        let data = self.wire.read(len as usize - 2)?;
        frame.extend_from_slice(&[len, comp, prop]);
        frame.extend_from_slice(&data);
        self.verify_crc(&frame)?;

        debug!("dock rx {}", hex(&frame));
        Ok((comp, prop, data))
    }

    fn read_response_verify(&mut self, exp_comp: u8, exp_prop: u8) -> Result<Vec<u8>> {
        let (comp, prop, data) = self.read_response()?;
        if comp != exp_comp {
            return Err(DockError::WrongComponent {
                expected: exp_comp,
                actual: comp,
            }
            .into());
        }
        if prop != exp_prop {
            return Err(DockError::WrongProperty {
                expected: exp_prop,
                actual: prop,
            }
            .into());
        }
        Ok(data)
    }

    fn read_ack(&mut self) -> Result<()> {
        let mut frame = Vec::new();
        self.read_frame_type(UART_ACK_RESPONSE, &mut frame)?;
        self.verify_crc(&frame)
    }

    fn get_fixed<const N: usize>(&mut self, comp: u8, prop: u8) -> Result<[u8; N]> {
        self.write_packet(UART_GET, comp, prop, &[])?;
        let data = self.read_response_verify(comp, prop)?;
        data.as_slice().try_into().map_err(|_| {
            DriverError::Protocol(format!(
                "dock property {comp:#04x}/{prop:#04x}: expected {N} bytes, got {}",
                data.len()
            ))
        })
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Bluetooth MAC address, most significant byte first.
    pub fn get_mac_address(&mut self) -> Result<[u8; 6]> {
        self.get_fixed(UART_COMP_SHIMMER, UART_PROP_MAC)
    }

    /// Set the real-time clock to `seconds` (UNIX time).
    pub fn set_rtc(&mut self, seconds: f64) -> Result<()> {
        let ticks = sec2ticks(seconds).to_le_bytes();
        self.write_packet(UART_SET, UART_COMP_SHIMMER, UART_PROP_RWC_CFG_TIME, &ticks)?;
        self.read_ack()
    }

    /// Current value of the real-time clock in seconds.
    pub fn get_rtc(&mut self) -> Result<f64> {
        let ticks = self.get_fixed(UART_COMP_SHIMMER, UART_PROP_CURR_LOCAL_TIME)?;
        Ok(ticks2sec(u64::from_le_bytes(ticks)))
    }

    /// Value the real-time clock was last set to, in seconds.
    pub fn get_config_rtc(&mut self) -> Result<f64> {
        let ticks = self.get_fixed(UART_COMP_SHIMMER, UART_PROP_RWC_CFG_TIME)?;
        Ok(ticks2sec(u64::from_le_bytes(ticks)))
    }

    pub fn get_firmware_version(&mut self) -> Result<DockFirmwareInfo> {
        let [hw, t0, t1, m0, m1, minor, rel] =
            self.get_fixed(UART_COMP_SHIMMER, UART_PROP_VER)?;
        Ok(DockFirmwareInfo {
            hw_version: hw,
            fw_type: FirmwareType::from_id(u16::from_le_bytes([t0, t1]))?,
            version: FirmwareVersion::new(u16::from_le_bytes([m0, m1]), minor, rel),
        })
    }

    pub fn get_firmware_type(&mut self) -> Result<FirmwareType> {
        Ok(self.get_firmware_version()?.fw_type)
    }

    /// Read `len` bytes of info memory starting at `addr`.
    pub fn get_infomem(&mut self, addr: u16, len: u8) -> Result<Vec<u8>> {
        // The firmware only serves infomem reads after a daughter card id
        // request has primed its read state.
        self.write_packet(
            UART_GET,
            UART_COMP_DAUGHTER_CARD,
            UART_PROP_CARD_ID,
            &[0x00, 0x00, 0x00],
        )?;
        self.read_response()?;

        let [a0, a1] = addr.to_le_bytes();
        self.write_packet(UART_GET, UART_COMP_SHIMMER, UART_PROP_INFOMEM, &[len, a0, a1])?;
        self.read_response_verify(UART_COMP_SHIMMER, UART_PROP_INFOMEM)
    }

    /// ExG register block of `chip` (0 or 1) as stored in the info memory.
    pub fn get_exg_register(&mut self, chip: u8) -> Result<ExgRegister> {
        if chip > 1 {
            return Err(DriverError::InvalidArgument(format!(
                "ExG chip must be 0 or 1, got {chip}"
            )));
        }
        let addr = UART_INFOMEM_EXG_OFFSET + chip as u16 * EXG_REGISTER_LEN as u16;
        let data = self.get_infomem(addr, EXG_REGISTER_LEN as u8)?;
        ExgRegister::from_bytes(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::collections::VecDeque;

    /// Answers each written request with the next scripted reply.
    #[derive(Default)]
    struct ScriptedPort {
        replies: VecDeque<Vec<u8>>,
        pending: Vec<u8>,
        written: Vec<u8>,
        clears: usize,
    }

    impl ScriptedPort {
        fn replying(replies: &[&[u8]]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_vec()).collect(),
                ..Self::default()
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            if let Some(reply) = self.replies.pop_front() {
                self.pending.extend(reply);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl DockPort for ScriptedPort {
        fn clear_input(&mut self) -> io::Result<()> {
            self.clears += 1;
            Ok(())
        }
    }

    fn dock(replies: &[&[u8]]) -> ShimmerDock<ScriptedPort> {
        ShimmerDock::new(ScriptedPort::replying(replies), DockOptions::default())
    }

    #[test]
    fn crc_matches_reference_frames() {
        assert_eq!(
            crc16(&[0x24, 0x03, 0x02, 0x01, 0x03], CRC_INIT).to_le_bytes(),
            [0xCA, 0xDC]
        );
        assert_eq!(
            crc16(&[0x24, 0x03, 0x02, 0x01], CRC_INIT).to_le_bytes(),
            [0x4B, 0xC2]
        );
        // odd input is zero padded
        assert_eq!(
            crc16(&[0x24, 0x03, 0x02, 0x01, 0x03], CRC_INIT),
            crc16(&[0x24, 0x03, 0x02, 0x01, 0x03, 0x00], CRC_INIT)
        );
    }

    #[test]
    fn get_mac_address() {
        let mut dock = dock(&[&[
            0x24, 0x02, 0x08, 0x01, 0x02, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x4E, 0x87,
        ]]);
        assert_eq!(dock.get_mac_address().unwrap(), [1, 2, 3, 4, 5, 6]);

        let port = dock.into_inner();
        assert_eq!(port.written, vec![0x24, 0x03, 0x02, 0x01, 0x02, 0xFB, 0xEF]);
        assert_eq!(port.clears, 1);
    }

    #[test]
    fn get_firmware_version() {
        let mut dock = dock(&[&[
            0x24, 0x02, 0x09, 0x01, 0x03, 0x03, 0x03, 0x00, 0x00, 0x00, 0x0B, 0x00, 0x14, 0x33,
        ]]);
        let info = dock.get_firmware_version().unwrap();
        assert_eq!(info.hw_version, 3);
        assert_eq!(info.fw_type, FirmwareType::LogAndStream);
        assert_eq!(info.version, FirmwareVersion::new(0, 11, 0));
        assert_eq!(
            dock.into_inner().written,
            vec![0x24, 0x03, 0x02, 0x01, 0x03, 0xCA, 0xDC]
        );
    }

    #[test]
    fn set_rtc() {
        let mut dock = dock(&[&[0x24, 0xFF, 0xD9, 0xB2]]);
        dock.set_rtc(1.0).unwrap();
        assert_eq!(
            dock.into_inner().written,
            vec![
                0x24, 0x01, 0x0A, 0x01, 0x04, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x1C, 0xD2
            ]
        );
    }

    #[test]
    fn get_rtc_values() {
        let mut dock = dock(&[&[
            0x24, 0x02, 0x0A, 0x01, 0x05, 0x9D, 0x3D, 0x0D, 0x00, 0x00, 0x00, 0x00, 0x00, 0xB0,
            0xC7,
        ]]);
        assert_abs_diff_eq!(dock.get_rtc().unwrap(), 26.481353759765625);

        let mut dock = self::dock(&[&[
            0x24, 0x02, 0x0A, 0x01, 0x04, 0x00, 0x00, 0x15, 0x00, 0x00, 0x00, 0x00, 0x00, 0xE4,
            0xAE,
        ]]);
        assert_eq!(dock.get_config_rtc().unwrap(), 42.0);
        assert_eq!(
            dock.into_inner().written,
            vec![0x24, 0x03, 0x02, 0x01, 0x04, 0x5D, 0x45]
        );
    }

    #[test]
    fn get_exg_register_reads_infomem() {
        let mut dock = dock(&[
            &[0x24, 0x02, 0x02, 0x03, 0x02, 0xCA, 0x2B],
            &[
                0x24, 0x02, 0x0C, 0x01, 0x06, 0x00, 0x80, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x02, 0x01, 0xFF, 0x40,
            ],
        ]);
        let reg = dock.get_exg_register(0).unwrap();
        assert_eq!(
            reg.binary(),
            &[0x00, 0x80, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01]
        );

        let mut expected = vec![0x24, 0x03, 0x05, 0x03, 0x02, 0x00, 0x00, 0x00, 0x3A, 0xD2];
        expected.extend_from_slice(&[0x24, 0x03, 0x05, 0x01, 0x06, 0x0A, 0x0A, 0x00, 0x42, 0x74]);
        assert_eq!(dock.into_inner().written, expected);
    }

    #[test]
    fn get_exg_register_rejects_chip() {
        let mut dock = dock(&[]);
        assert!(matches!(
            dock.get_exg_register(2),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(dock.into_inner().written.is_empty());
    }

    #[rstest::rstest]
    #[test]
    #[case(&[0x25], DockError::BadStart(0x25))]
    #[case(&[0x24, 0xFD], DockError::BadArgument)]
    #[case(&[0x24, 0xFC], DockError::UnknownCommand)]
    #[case(&[0x24, 0xFE], DockError::BadCrc)]
    #[case(&[0x24, 0x03], DockError::WrongResponseType { expected: 0x02, actual: 0x03 })]
    #[case(
        &[0x24, 0x02, 0x02, 0x02, 0x00, 0x98, 0x7A],
        DockError::WrongComponent { expected: 0x01, actual: 0x02 }
    )]
    #[case(
        &[0x24, 0x02, 0x02, 0x01, 0x02, 0xAA, 0x45],
        DockError::WrongProperty { expected: 0x03, actual: 0x02 }
    )]
    fn error_frames(#[case] reply: &[u8], #[case] expected: DockError) {
        let mut dock = dock(&[reply]);
        match dock.get_firmware_version() {
            Err(DriverError::Dock(err)) => assert_eq!(err, expected),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn corrupted_frame_fails_crc() {
        let mut dock = dock(&[&[
            0x24, 0x02, 0x08, 0x01, 0x02, 0x01, 0x02, 0x03, 0x04, 0x05, 0x07, 0x4E, 0x87,
        ]]);
        assert!(matches!(
            dock.get_mac_address(),
            Err(DriverError::ChecksumMismatch)
        ));
    }

    #[test]
    fn flush_can_be_disabled() {
        let options = DockOptions {
            flush_before_req: false,
            ..DockOptions::default()
        };
        let mut dock = ShimmerDock::new(
            ScriptedPort::replying(&[&[0x24, 0xFF, 0xD9, 0xB2]]),
            options,
        );
        dock.set_rtc(1.0).unwrap();
        assert_eq!(dock.into_inner().clears, 0);
    }
}
