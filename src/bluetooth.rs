use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "bluez")]
use std::time::Instant;

#[cfg(feature = "bluez")]
use bluer::agent::{Agent, RequestConfirmationFn, RequestPinCodeFn};
#[cfg(feature = "bluez")]
use bluer::rfcomm::{SocketAddr, Stream};
#[cfg(feature = "bluez")]
use bluer::{AdapterEvent, Address, Session};
#[cfg(feature = "bluez")]
use futures::StreamExt;
use log::{debug, info, warn};
#[cfg(feature = "bluez")]
use tokio::runtime::Runtime;

#[cfg(not(feature = "bluez"))]
use std::thread;

use crate::errors::{BluetoothError, DriverError, Result};
use crate::transport::{ReadCanceller, Transport, TransportHalves, POLL_INTERVAL};

#[cfg(not(feature = "bluez"))]
const AF_BLUETOOTH: libc::c_ushort = 31;
#[cfg(not(feature = "bluez"))]
const BTPROTO_RFCOMM: libc::c_int = 3;

/// Serial port profile channel of the Shimmer3 Bluetooth module.
const SHIMMER_RFCOMM_CHANNEL: u8 = 1;
const SCAN_TIMEOUT_SECS: u64 = 30;
const PAIR_TIMEOUT_SECS: u64 = 15;
const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

fn connection_error(e: impl fmt::Display) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

/// Opens an RFCOMM socket to a Shimmer without needing root.
///
/// - Default build: raw libc RFCOMM socket; the device must already be
///   paired and trusted (e.g. with `bluetoothctl`).
/// - With the `bluez` feature: discovers and pairs (PIN) through BlueZ first.
#[derive(Debug, Clone)]
pub struct BluetoothConnector {
    pub channel: u8,
    /// Write timeout on the socket.
    pub io_timeout: Duration,
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub scan_timeout: Duration,
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub pair_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BluetoothConnector {
    fn default() -> Self {
        Self {
            channel: SHIMMER_RFCOMM_CHANNEL,
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            pair_timeout: Duration::from_secs(PAIR_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl BluetoothConnector {
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * (1 << (attempt - 1).min(3))
    }
}

#[cfg(feature = "bluez")]
impl BluetoothConnector {
    /// Pair (if needed) and open an RFCOMM stream to the Shimmer at `mac`.
    pub fn connect(&self, mac: &str, pin: &str) -> Result<RfcommStream> {
        let rt = Runtime::new().map_err(|e| connection_error(format!("tokio runtime: {e}")))?;
        rt.block_on(self.connect_async(mac, pin))
    }

    async fn connect_async(&self, mac: &str, pin: &str) -> Result<RfcommStream> {
        let session = Session::new().await.map_err(connection_error)?;
        let adapter = session.default_adapter().await.map_err(connection_error)?;
        adapter.set_powered(true).await.map_err(connection_error)?;

        let agent_handle = session
            .register_agent(build_agent(pin.to_string()))
            .await
            .map_err(|e| DriverError::Bluetooth(BluetoothError::Pairing(e.to_string())))?;

        let address: Address = mac
            .parse()
            .map_err(|_| connection_error(format!("invalid mac: {mac}")))?;

        wait_for_device(&adapter, address, self.scan_timeout).await?;
        let device = adapter.device(address).map_err(connection_error)?;

        if !device.is_paired().await.unwrap_or(false) {
            info!("pairing shimmer: mac={}", mac);
            match tokio::time::timeout(self.pair_timeout, device.pair()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(DriverError::Bluetooth(BluetoothError::Pairing(e.to_string())))
                }
                Err(_) => {
                    return Err(DriverError::Bluetooth(BluetoothError::Pairing(
                        "pairing timed out".into(),
                    )))
                }
            }
        }
        if let Err(e) = device.set_trusted(true).await {
            warn!("could not mark shimmer as trusted: mac={}, error={}", mac, e);
        }
        drop(agent_handle);

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                warn!(
                    "retrying RFCOMM connection after {:?} (mac={}, attempt={})",
                    delay, mac, attempt
                );
                tokio::time::sleep(delay).await;
            }

            match open_rfcomm(address, self.channel, self.io_timeout).await {
                Ok(stream) => match stream.verify_connected() {
                    Ok(()) => {
                        info!("RFCOMM connection established: mac={}", mac);
                        return Ok(stream);
                    }
                    Err(e) => {
                        warn!("connection verification failed: mac={}, error={}", mac, e);
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!(
                        "RFCOMM connection attempt failed: mac={}, attempt={}, error={}",
                        mac, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DriverError::Bluetooth(BluetoothError::NotConnected("max retries exceeded".into()))
        }))
    }
}

#[cfg(not(feature = "bluez"))]
impl BluetoothConnector {
    /// Open an RFCOMM stream to an already paired Shimmer. The PIN is only
    /// used by the `bluez` build.
    pub fn connect(&self, mac: &str, _pin: &str) -> Result<RfcommStream> {
        let bdaddr = parse_bdaddr(mac)?;

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                warn!(
                    "retrying RFCOMM connection after {:?} (mac={}, attempt={})",
                    delay, mac, attempt
                );
                thread::sleep(delay);
            }

            match open_rfcomm_raw(bdaddr, self.channel, self.io_timeout) {
                Ok(stream) => match stream.verify_connected() {
                    Ok(()) => {
                        info!("RFCOMM connection established: mac={}", mac);
                        return Ok(stream);
                    }
                    Err(e) => {
                        warn!("connection verification failed: mac={}, error={}", mac, e);
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!(
                        "RFCOMM connection attempt failed: mac={}, attempt={}, error={}",
                        mac, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DriverError::Bluetooth(BluetoothError::NotConnected("max retries exceeded".into()))
        }))
    }
}

// ============================================================================
// Stream
// ============================================================================

/// Blocking RFCOMM socket.
///
/// Reads time out every [`POLL_INTERVAL`] so a cancelled read loop notices
/// the request promptly; the cancel hook additionally shuts the socket's
/// read side down.
pub struct RfcommStream {
    file: File,
}

impl RfcommStream {
    fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    /// Check the socket for a pending connection error.
    pub fn verify_connected(&self) -> Result<()> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                self.file.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if err != 0 {
            return Err(DriverError::Bluetooth(BluetoothError::NotConnected(
                io::Error::from_raw_os_error(err).to_string(),
            )));
        }
        Ok(())
    }
}

impl Read for RfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for RfcommStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Transport for RfcommStream {
    fn into_halves(self) -> Result<TransportHalves> {
        let reader = self.file.try_clone()?;
        // Keeps its own handle so the fd stays valid for as long as the hook.
        let control = Arc::new(self.file.try_clone()?);
        let canceller = ReadCanceller::with_hook(move || {
            if unsafe { libc::shutdown(control.as_raw_fd(), libc::SHUT_RD) } < 0 {
                debug!(
                    "RFCOMM read shutdown failed: {}",
                    io::Error::last_os_error()
                );
            }
        });
        Ok(TransportHalves {
            reader: Box::new(reader),
            writer: Box::new(self.file),
            canceller,
        })
    }
}

fn set_timeout(fd: RawFd, option: libc::c_int, timeout: Duration) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &tv as *const _ as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    Ok(())
}

/// Blocking mode, close-on-exec, poll-friendly read timeout.
fn configure_socket(fd: RawFd, write_timeout: Duration) -> Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    set_timeout(fd, libc::SO_RCVTIMEO, POLL_INTERVAL)?;
    set_timeout(fd, libc::SO_SNDTIMEO, write_timeout)
}

#[cfg(feature = "bluez")]
fn build_agent(pin: String) -> Agent {
    let pin_code_fn: RequestPinCodeFn = Box::new(move |_req| {
        let pin = pin.clone();
        Box::pin(async move { Ok(pin) })
    });
    let confirm_fn: RequestConfirmationFn = Box::new(|_req| Box::pin(async { Ok(()) }));

    Agent {
        request_default: true,
        request_pin_code: Some(pin_code_fn),
        request_confirmation: Some(confirm_fn),
        ..Default::default()
    }
}

#[cfg(feature = "bluez")]
async fn wait_for_device(
    adapter: &bluer::Adapter,
    address: Address,
    timeout: Duration,
) -> Result<()> {
    let mut events = adapter.discover_devices().await.map_err(connection_error)?;
    let deadline = Instant::now() + timeout;

    while let Some(evt) = events.next().await {
        if let AdapterEvent::DeviceAdded(addr) = evt {
            if addr == address {
                info!("shimmer discovered: mac={}", addr);
                return Ok(());
            }
        }
        if Instant::now() > deadline {
            break;
        }
    }

    Err(DriverError::Bluetooth(BluetoothError::NotFound {
        mac: address.to_string(),
    }))
}

#[cfg(feature = "bluez")]
async fn open_rfcomm(address: Address, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!("opening RFCOMM socket: mac={}, channel={}", address, channel);

    let target = SocketAddr::new(address, channel);
    let stream = match tokio::time::timeout(timeout, Stream::connect(target)).await {
        Ok(result) => result.map_err(connection_error)?,
        Err(_) => return Err(connection_error("rfcomm connect timed out")),
    };

    // Own a blocking duplicate of the async socket.
    let fd = unsafe { libc::dup(stream.as_raw_fd()) };
    if fd < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    configure_socket(fd.as_raw_fd(), timeout)?;
    Ok(RfcommStream::from_fd(fd))
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct BdAddr {
    b: [u8; 6],
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

/// Parse `AA:BB:CC:DD:EE:FF`; `bdaddr_t` stores the bytes reversed.
#[cfg(not(feature = "bluez"))]
fn parse_bdaddr(mac: &str) -> Result<BdAddr> {
    let invalid = || connection_error(format!("invalid mac: {mac}"));

    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(invalid());
    }
    let mut addr = BdAddr { b: [0; 6] };
    for (i, part) in parts.iter().enumerate() {
        addr.b[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    Ok(addr)
}

#[cfg(not(feature = "bluez"))]
fn open_rfcomm_raw(address: BdAddr, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!(
        "opening RFCOMM socket: channel={}, addr_bytes={:02X?}",
        channel, address.b
    );

    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH as libc::c_int,
            libc::SOCK_STREAM,
            BTPROTO_RFCOMM,
        )
    };
    if fd < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address,
        rc_channel: channel,
    };
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<SockAddrRc>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }

    configure_socket(fd.as_raw_fd(), timeout)?;
    Ok(RfcommStream::from_fd(fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "bluez"))]
    #[test]
    fn parses_mac_reversed() {
        let addr = parse_bdaddr("00:06:66:AB:CD:EF").unwrap();
        assert_eq!(addr.b, [0xEF, 0xCD, 0xAB, 0x66, 0x06, 0x00]);
        assert!(parse_bdaddr("00:06:66:AB:CD").is_err());
        assert!(parse_bdaddr("00:06:66:AB:CD:XY").is_err());
    }

    #[test]
    fn retry_backoff_is_capped() {
        let connector = BluetoothConnector::default();
        assert_eq!(connector.backoff(1), Duration::from_millis(500));
        assert_eq!(connector.backoff(2), Duration::from_millis(1000));
        assert_eq!(connector.backoff(10), Duration::from_millis(4000));
    }

    #[test]
    fn socket_transport_cancel_unblocks_reader() {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        let (ours, theirs) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let halves = RfcommStream::from_fd(ours).into_halves().unwrap();
        let mut reader = halves.reader;
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf)
        });
        halves.canceller.cancel();
        assert_eq!(handle.join().unwrap().unwrap(), 0);
        drop(theirs);
    }
}
