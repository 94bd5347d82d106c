//! Blocking driver API for a Shimmer connected over Bluetooth (or a serial
//! bridge speaking the same protocol).
//!
//! [`ShimmerBluetooth`] owns a background thread that feeds every incoming
//! frame to the [`RequestHandler`]; the public methods write a command, then
//! block until the engine has matched the device's ACK and response to it.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::channels::{ChannelType, SensorGroup};
use crate::commands::{Command, DataPacket, InquiryResponse, Query, Response, Setting};
use crate::device::{
    DeviceStatus, FirmwareCapabilities, FirmwareType, FirmwareVersion, HardwareVersion,
};
use crate::dispatch::{lock, CallbackId, RequestHandler};
use crate::errors::{DriverError, Result};
use crate::exg::{AllCalibration, ExgRegister, EXG_REGISTER_LEN};
use crate::serial::WireReader;
use crate::transport::{ReadCanceller, Transport};

const READ_LOOP_THREAD: &str = "shimmer-read-loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShimmerOptions {
    /// Switch off the status ACK preamble on firmware that supports it.
    pub disable_status_ack: bool,
}

impl Default for ShimmerOptions {
    fn default() -> Self {
        Self {
            disable_status_ack: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceInfo {
    capabilities: FirmwareCapabilities,
    hardware: HardwareVersion,
}

pub struct ShimmerBluetooth {
    handler: Arc<RequestHandler>,
    canceller: ReadCanceller,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
    info: Mutex<Option<DeviceInfo>>,
    options: ShimmerOptions,
}

impl ShimmerBluetooth {
    /// Wrap a transport. Nothing is sent until [`initialize`](Self::initialize).
    pub fn new(transport: impl Transport, options: ShimmerOptions) -> Result<Self> {
        let halves = transport.into_halves()?;
        Ok(Self {
            handler: Arc::new(RequestHandler::new(halves.writer)),
            canceller: halves.canceller,
            reader: Mutex::new(Some(halves.reader)),
            read_loop: Mutex::new(None),
            info: Mutex::new(None),
            options,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the read loop and run the connection handshake.
    pub fn initialize(&self) -> Result<()> {
        let reader = lock(&self.reader)
            .take()
            .ok_or_else(|| DriverError::Protocol("read loop already started".into()))?;
        let wire = WireReader::new(reader).with_canceller(self.canceller.clone());
        let handler = self.handler.clone();
        let canceller = self.canceller.clone();
        let handle = thread::Builder::new()
            .name(READ_LOOP_THREAD.into())
            .spawn(move || run_read_loop(&handler, wire, &canceller))?;
        *lock(&self.read_loop) = Some(handle);

        let (fw_type, version) = match self.execute_query(Query::FirmwareVersion)? {
            Response::FirmwareVersion(fw_type, version) => (fw_type, version),
            other => return Err(unexpected(other)),
        };
        let capabilities = FirmwareCapabilities::new(fw_type, version);
        let hardware = match self.execute_query(Query::HardwareVersion)? {
            Response::HardwareVersion(hw) => hw,
            other => return Err(unexpected(other)),
        };

        if capabilities.supports_ack_disable() && self.options.disable_status_ack {
            debug!("disabling status ACK preamble");
            self.execute(Command::Set(Setting::StatusAck(false)))?;
        }

        *lock(&self.info) = Some(DeviceInfo {
            capabilities,
            hardware,
        });
        info!(
            "shimmer initialized: hardware={:?}, firmware={:?} {}",
            hardware, fw_type, version
        );
        Ok(())
    }

    /// Stop the read loop, close the transport and release every blocked
    /// caller. Safe to call more than once.
    pub fn shutdown(&self) {
        self.canceller.cancel();
        if let Some(handle) = lock(&self.read_loop).take() {
            if handle.join().is_err() {
                warn!("read loop thread panicked");
            }
        }
        self.handler.close_writer();
        self.handler.clear_queues();
        if lock(&self.info).take().is_some() {
            info!("shimmer connection closed");
        }
    }

    pub fn initialized(&self) -> bool {
        lock(&self.info).is_some()
    }

    fn device_info(&self) -> Result<DeviceInfo> {
        (*lock(&self.info)).ok_or(DriverError::NotInitialized)
    }

    pub fn capabilities(&self) -> Result<FirmwareCapabilities> {
        Ok(self.device_info()?.capabilities)
    }

    /// Hardware revision reported during the handshake.
    pub fn hardware_version(&self) -> Result<HardwareVersion> {
        Ok(self.device_info()?.hardware)
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    fn execute(&self, cmd: Command) -> Result<Option<Response>> {
        let (completion, response) = self.handler.queue_command(cmd)?;
        if !completion.wait()? {
            return Err(DriverError::RequestReleased);
        }
        match response {
            Some(response) => response
                .wait()?
                .map(Some)
                .ok_or(DriverError::RequestReleased),
            None => Ok(None),
        }
    }

    fn execute_query(&self, query: Query) -> Result<Response> {
        self.execute(Command::Get(query))?
            .ok_or_else(|| DriverError::Protocol(format!("{query:?} returned no response")))
    }

    /// Send a command and wait for its ACK and, if it has one, its response.
    pub fn process_and_wait(&self, cmd: Command) -> Result<Option<Response>> {
        if !self.initialized() {
            return Err(DriverError::NotInitialized);
        }
        self.execute(cmd)
    }

    fn query(&self, query: Query) -> Result<Response> {
        if !self.initialized() {
            return Err(DriverError::NotInitialized);
        }
        self.execute_query(query)
    }

    fn set(&self, setting: Setting) -> Result<()> {
        self.process_and_wait(Command::Set(setting)).map(drop)
    }

    fn get_text(&self, cmd: Command) -> Result<String> {
        match self.process_and_wait(cmd)? {
            Some(Response::Text(text)) => Ok(text),
            Some(other) => Err(unexpected(other)),
            None => Err(DriverError::Protocol("string query returned no response".into())),
        }
    }

    // ========================================================================
    // Device settings
    // ========================================================================

    /// Sampling rate in Hz.
    pub fn get_sampling_rate(&self) -> Result<f64> {
        match self.query(Query::SamplingRate)? {
            Response::SamplingRate(sr) => Ok(sr),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_sampling_rate(&self, sampling_rate: f64) -> Result<()> {
        self.set(Setting::SamplingRate(sampling_rate))
    }

    /// Battery charge, in volts or (if `in_percent`) percent.
    pub fn get_battery_state(&self, in_percent: bool) -> Result<f64> {
        match self.query(Query::Battery { in_percent })? {
            Response::Battery(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_config_time(&self) -> Result<u64> {
        match self.query(Query::ConfigTime)? {
            Response::ConfigTime(time) => Ok(time),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_config_time(&self, time: u64) -> Result<()> {
        self.set(Setting::ConfigTime(time))
    }

    /// Enable exactly the given sensor groups.
    pub fn set_sensors(&self, sensors: &[SensorGroup]) -> Result<()> {
        self.set(Setting::Sensors(sensors.to_vec()))
    }

    /// Real-time clock as UNIX time in seconds.
    pub fn get_rtc(&self) -> Result<f64> {
        match self.query(Query::Rtc)? {
            Response::Rtc(seconds) => Ok(seconds),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_rtc(&self, seconds: f64) -> Result<()> {
        self.set(Setting::Rtc(seconds))
    }

    pub fn get_status(&self) -> Result<DeviceStatus> {
        match self.query(Query::Status)? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_firmware_version(&self) -> Result<(FirmwareType, FirmwareVersion)> {
        match self.query(Query::FirmwareVersion)? {
            Response::FirmwareVersion(fw_type, version) => Ok((fw_type, version)),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_device_hardware_version(&self) -> Result<HardwareVersion> {
        match self.query(Query::HardwareVersion)? {
            Response::HardwareVersion(hw) => Ok(hw),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_exg_register(&self, chip: u8) -> Result<ExgRegister> {
        check_exg_chip(chip)?;
        match self.query(Query::ExgRegisters { chip })? {
            Response::ExgRegister(reg) => Ok(reg),
            other => Err(unexpected(other)),
        }
    }

    /// Overwrite `data.len()` registers of `chip`, starting at `offset`.
    pub fn set_exg_register(&self, chip: u8, offset: u8, data: &[u8]) -> Result<()> {
        check_exg_chip(chip)?;
        if offset as usize + data.len() > EXG_REGISTER_LEN {
            return Err(DriverError::InvalidArgument(format!(
                "ExG write of {} bytes at offset {offset} exceeds the {EXG_REGISTER_LEN} byte register block",
                data.len()
            )));
        }
        self.set(Setting::ExgRegisters {
            chip,
            offset,
            data: data.to_vec(),
        })
    }

    pub fn get_all_calibration(&self) -> Result<AllCalibration> {
        match self.query(Query::AllCalibration)? {
            Response::AllCalibration(cal) => Ok(cal),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_device_name(&self) -> Result<String> {
        self.get_text(Command::get_device_name())
    }

    pub fn set_device_name(&self, name: &str) -> Result<()> {
        self.process_and_wait(Command::set_device_name(name))
            .map(drop)
    }

    pub fn get_experiment_id(&self) -> Result<String> {
        self.get_text(Command::get_experiment_id())
    }

    pub fn set_experiment_id(&self, id: &str) -> Result<()> {
        self.process_and_wait(Command::set_experiment_id(id))
            .map(drop)
    }

    pub fn get_inquiry(&self) -> Result<InquiryResponse> {
        match self.query(Query::Inquiry)? {
            Response::Inquiry(inquiry) => Ok(inquiry),
            other => Err(unexpected(other)),
        }
    }

    /// Channels of a data packet in wire order: timestamp, then the active
    /// channels reported by the inquiry.
    pub fn get_data_types(&self) -> Result<Vec<ChannelType>> {
        let inquiry = self.get_inquiry()?;
        let mut types = Vec::with_capacity(inquiry.channels.len() + 1);
        types.push(ChannelType::Timestamp);
        types.extend(inquiry.channels);
        Ok(types)
    }

    // ========================================================================
    // Streaming and logging
    // ========================================================================

    /// Configure the packet layout from the current sensor set, then start
    /// streaming. Packets are delivered to the stream callbacks.
    pub fn start_streaming(&self) -> Result<()> {
        let layout = self
            .get_data_types()?
            .into_iter()
            .map(|ch| Ok((ch, ch.require_data_type()?)))
            .collect::<Result<Vec<_>>>()?;
        self.handler.set_stream_types(layout);
        self.process_and_wait(Command::start_streaming())?;
        info!("streaming started");
        Ok(())
    }

    pub fn stop_streaming(&self) -> Result<()> {
        self.process_and_wait(Command::stop_streaming())?;
        info!("streaming stopped");
        Ok(())
    }

    pub fn start_logging(&self) -> Result<()> {
        self.process_and_wait(Command::start_logging()).map(drop)
    }

    pub fn stop_logging(&self) -> Result<()> {
        self.process_and_wait(Command::stop_logging()).map(drop)
    }

    /// Round trip a no-op command.
    pub fn send_ping(&self) -> Result<()> {
        self.process_and_wait(Command::dummy()).map(drop)
    }

    pub fn set_status_ack(&self, enabled: bool) -> Result<()> {
        self.set(Setting::StatusAck(enabled))
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Callbacks run on the read loop thread and should return quickly.
    pub fn add_stream_callback(
        &self,
        cb: impl Fn(&DataPacket) + Send + Sync + 'static,
    ) -> CallbackId {
        self.handler.add_stream_callback(cb)
    }

    pub fn remove_stream_callback(&self, id: CallbackId) -> bool {
        self.handler.remove_stream_callback(id)
    }

    pub fn add_status_callback(
        &self,
        cb: impl Fn(&DeviceStatus) + Send + Sync + 'static,
    ) -> CallbackId {
        self.handler.add_status_callback(cb)
    }

    pub fn remove_status_callback(&self, id: CallbackId) -> bool {
        self.handler.remove_status_callback(id)
    }
}

impl Drop for ShimmerBluetooth {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_read_loop<R: Read>(
    handler: &RequestHandler,
    mut wire: WireReader<R>,
    canceller: &ReadCanceller,
) {
    debug!("read loop started");
    loop {
        match handler.process_single_input_event(&mut wire) {
            Ok(()) => {}
            Err(DriverError::ReadAborted) if canceller.is_cancelled() => {
                info!("read loop stopped");
                return;
            }
            Err(DriverError::ReadAborted) => {
                error!("transport closed by the device");
                handler.fail_all("transport closed by the device");
                return;
            }
            Err(e) => {
                error!("read loop failed: {e}");
                handler.fail_all(&e.to_string());
                return;
            }
        }
    }
}

fn check_exg_chip(chip: u8) -> Result<()> {
    if chip > 1 {
        return Err(DriverError::InvalidArgument(format!(
            "ExG chip must be 0 or 1, got {chip}"
        )));
    }
    Ok(())
}

fn unexpected(response: Response) -> DriverError {
    DriverError::Protocol(format!("unexpected response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{self, DeviceEnd};
    use approx::assert_abs_diff_eq;
    use std::sync::mpsc;
    use std::time::Duration;

    const FW_0_11_0: [u8; 8] = [0xFF, 0x2F, 0x03, 0x00, 0x00, 0x00, 0x0B, 0x00];
    const FW_0_15_4: [u8; 8] = [0xFF, 0x2F, 0x03, 0x00, 0x00, 0x00, 0x0F, 0x04];
    const HW_SHIMMER3: [u8; 3] = [0xFF, 0x25, 0x03];

    fn connect(options: ShimmerOptions) -> (ShimmerBluetooth, DeviceEnd) {
        let (halves, device) = testing::pipe();
        (ShimmerBluetooth::new(halves, options).unwrap(), device)
    }

    /// Run `host` on a helper thread while the device side plays `script`.
    fn exchange<T: Send>(
        shimmer: &ShimmerBluetooth,
        device: &mut DeviceEnd,
        host: impl FnOnce(&ShimmerBluetooth) -> T + Send,
        script: impl FnOnce(&mut DeviceEnd),
    ) -> T {
        thread::scope(|s| {
            let handle = s.spawn(|| host(shimmer));
            script(device);
            handle.join().unwrap()
        })
    }

    fn initialized(firmware: &[u8]) -> (ShimmerBluetooth, DeviceEnd) {
        let (shimmer, mut device) = connect(ShimmerOptions::default());
        exchange(
            &shimmer,
            &mut device,
            |s| s.initialize(),
            |d| {
                assert_eq!(d.recv_exact(1), vec![0x2E]);
                d.send(firmware);
                assert_eq!(d.recv_exact(1), vec![0x3F]);
                d.send(&HW_SHIMMER3);
            },
        )
        .unwrap();
        (shimmer, device)
    }

    #[test]
    fn initialize_reads_versions() {
        let (shimmer, mut device) = initialized(&FW_0_11_0);

        assert!(shimmer.initialized());
        let caps = shimmer.capabilities().unwrap();
        assert_eq!(caps.fw_type, FirmwareType::LogAndStream);
        assert_eq!(caps.version, FirmwareVersion::new(0, 11, 0));
        assert!(!caps.supports_ack_disable());
        assert_eq!(shimmer.hardware_version().unwrap(), HardwareVersion::Shimmer3);
        assert!(device.drain().is_empty());
    }

    #[test]
    fn initialize_disables_status_ack_when_supported() {
        let (shimmer, mut device) = connect(ShimmerOptions::default());
        exchange(
            &shimmer,
            &mut device,
            |s| s.initialize(),
            |d| {
                assert_eq!(d.recv_exact(1), vec![0x2E]);
                d.send(&FW_0_15_4);
                assert_eq!(d.recv_exact(1), vec![0x3F]);
                d.send(&HW_SHIMMER3);
                assert_eq!(d.recv_exact(2), vec![0xA3, 0x00]);
                d.send(&[0xFF]);
            },
        )
        .unwrap();
        assert!(shimmer.capabilities().unwrap().supports_ack_disable());
    }

    #[test]
    fn status_ack_stays_on_when_not_requested() {
        let options = ShimmerOptions {
            disable_status_ack: false,
        };
        let (shimmer, mut device) = connect(options);
        exchange(
            &shimmer,
            &mut device,
            |s| s.initialize(),
            |d| {
                d.recv_exact(1);
                d.send(&FW_0_15_4);
                d.recv_exact(1);
                d.send(&HW_SHIMMER3);
            },
        )
        .unwrap();
        assert!(device.drain().is_empty());
    }

    #[test]
    fn commands_require_initialization() {
        let (shimmer, mut device) = connect(ShimmerOptions::default());
        assert!(matches!(
            shimmer.get_device_name(),
            Err(DriverError::NotInitialized)
        ));
        assert!(matches!(
            shimmer.capabilities(),
            Err(DriverError::NotInitialized)
        ));
        assert!(device.drain().is_empty());
    }

    #[test]
    fn getters_and_setters() {
        let (shimmer, mut device) = initialized(&FW_0_11_0);

        let name = exchange(
            &shimmer,
            &mut device,
            |s| s.get_device_name(),
            |d| {
                assert_eq!(d.recv_exact(1), vec![0x7B]);
                d.send(b"\xff\x7a\x05S_PPG");
            },
        );
        assert_eq!(name.unwrap(), "S_PPG");

        exchange(
            &shimmer,
            &mut device,
            |s| s.set_sampling_rate(512.0),
            |d| {
                assert_eq!(d.recv_exact(3), vec![0x05, 0x40, 0x00]);
                d.send(&[0xFF]);
            },
        )
        .unwrap();

        let status = exchange(
            &shimmer,
            &mut device,
            |s| s.get_status(),
            |d| {
                assert_eq!(d.recv_exact(1), vec![0x72]);
                d.send(&[0xFF, 0x8A, 0x71, 0x21]);
            },
        );
        assert!(status.unwrap().sd_present());
    }

    #[test]
    fn concurrent_callers_get_their_own_answers() {
        const CALLERS: usize = 8;
        let (shimmer, mut device) = initialized(&FW_0_11_0);

        let (mut rates, batteries) = thread::scope(|s| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|i| {
                    let shimmer = &shimmer;
                    s.spawn(move || {
                        if i % 2 == 0 {
                            shimmer.get_sampling_rate().map(|sr| (true, sr))
                        } else {
                            shimmer.get_battery_state(true).map(|pct| (false, pct))
                        }
                    })
                })
                .collect();

            // Each sampling rate query gets a distinct divider: 64, 128, ...
            let mut divider = 64u16;
            for _ in 0..CALLERS {
                let cmd = device.recv_exact(1);
                match cmd.as_slice() {
                    [0x03] => {
                        let [lo, hi] = divider.to_le_bytes();
                        device.send(&[0xFF, 0x04, lo, hi]);
                        divider *= 2;
                    }
                    [0x95] => device.send(&[0xFF, 0x8A, 0x94, 0x30, 0x0B, 0x80]),
                    other => panic!("unexpected command {other:02x?}"),
                }
            }

            let mut rates = Vec::new();
            let mut batteries = Vec::new();
            for (i, handle) in handles.into_iter().enumerate() {
                let (is_rate, value) = handle.join().unwrap().unwrap();
                assert_eq!(is_rate, i % 2 == 0);
                if is_rate {
                    rates.push(value);
                } else {
                    batteries.push(value);
                }
            }
            (rates, batteries)
        });

        rates.sort_by(f64::total_cmp);
        assert_eq!(rates, vec![64.0, 128.0, 256.0, 512.0]);
        assert_eq!(batteries.len(), CALLERS / 2);
        for pct in batteries {
            assert_abs_diff_eq!(pct, 100.0);
        }
        assert!(device.drain().is_empty());
    }

    #[test]
    fn exg_arguments_are_validated() {
        let (shimmer, mut device) = initialized(&FW_0_11_0);
        assert!(matches!(
            shimmer.get_exg_register(2),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            shimmer.set_exg_register(0, 8, &[0, 0, 0]),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(device.drain().is_empty());
    }

    #[test]
    fn streaming_delivers_packets() {
        let (shimmer, mut device) = initialized(&FW_0_11_0);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        shimmer.add_stream_callback(move |p| {
            let _ = tx.lock().unwrap().send(p.clone());
        });

        exchange(
            &shimmer,
            &mut device,
            |s| s.start_streaming(),
            |d| {
                assert_eq!(d.recv_exact(1), vec![0x01]);
                d.send(&[0xFF, 0x02, 0x40, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01, 0x12]);
                assert_eq!(d.recv_exact(1), vec![0x07]);
                d.send(&[0xFF]);
            },
        )
        .unwrap();

        device.send(&[0x00, 0xDE, 0xD0, 0xB2, 0x26, 0x07]);
        let packet = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            packet.channels().collect::<Vec<_>>(),
            vec![ChannelType::Timestamp, ChannelType::IntAdc13]
        );
        assert_eq!(packet.get(ChannelType::Timestamp), Some(0xB2D0DE));
        assert_eq!(packet.get(ChannelType::IntAdc13), Some(0x0726));
    }

    #[test]
    fn status_pushes_reach_callbacks() {
        let (shimmer, device) = initialized(&FW_0_11_0);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        shimmer.add_status_callback(move |s| {
            let _ = tx.lock().unwrap().send(s.bits());
        });

        device.send(&[0x8A, 0x71, 0x20]);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            [false, false, false, false, false, true, false, false]
        );
    }

    #[test]
    fn shutdown_releases_blocked_caller() {
        let (shimmer, mut device) = initialized(&FW_0_11_0);
        let result = thread::scope(|s| {
            let handle = s.spawn(|| shimmer.get_device_name());
            assert_eq!(device.recv_exact(1), vec![0x7B]);
            shimmer.shutdown();
            handle.join().unwrap()
        });
        assert!(matches!(result, Err(DriverError::RequestReleased)));
        assert!(!shimmer.initialized());
        shimmer.shutdown();
    }

    #[test]
    fn decode_failure_breaks_connection() {
        let (shimmer, mut device) = initialized(&FW_0_11_0);
        let result = exchange(
            &shimmer,
            &mut device,
            |s| s.get_device_name(),
            |d| {
                d.recv_exact(1);
                d.send(&[0xFF, 0xFE]);
            },
        );
        assert!(matches!(
            result,
            Err(DriverError::UnexpectedResponseCode { .. })
        ));

        let next = exchange(
            &shimmer,
            &mut device,
            |s| s.send_ping(),
            |_| {},
        );
        assert!(matches!(next, Err(DriverError::ConnectionBroken(_))));
    }
}
