//! Byte transports the driver runs on.
//!
//! A transport is split once into a read half (owned by the background
//! dispatch thread), a write half (shared by callers behind the submission
//! lock) and a [`ReadCanceller`] that makes a blocked read give up.

use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serialport::SerialPort;

use crate::errors::Result;

/// Default serial baud rate of the Shimmer UART and Bluetooth bridge.
pub const BAUD_RATE: u32 = 115200;

/// Read timeout used to poll the cancel flag on blocking ports.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation for a blocking read.
///
/// Cancelling sets a flag that [`WireReader`](crate::serial::WireReader) polls
/// between reads and runs an optional hook that unblocks the underlying
/// handle (e.g. a socket shutdown).
#[derive(Clone, Default)]
pub struct ReadCanceller {
    flag: Arc<AtomicBool>,
    hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ReadCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            hook: Some(Arc::new(hook)),
        }
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            debug!("cancelling blocked transport read");
            if let Some(hook) = &self.hook {
                hook();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ReadCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadCanceller")
            .field("cancelled", &self.is_cancelled())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// The pieces a transport is split into.
pub struct TransportHalves {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub canceller: ReadCanceller,
}

/// A bidirectional byte stream that can be split for concurrent use.
///
/// Closing the transport is dropping both halves.
pub trait Transport: Send {
    fn into_halves(self) -> Result<TransportHalves>;
}

impl Transport for TransportHalves {
    fn into_halves(self) -> Result<TransportHalves> {
        Ok(self)
    }
}

/// Settings for a wired (or `/dev/rfcomm*` bound) serial port.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub poll_interval: Duration,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: BAUD_RATE,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn open(&self) -> Result<Box<dyn SerialPort>> {
        debug!(
            "opening serial port: path={}, baud={}",
            self.path, self.baud_rate
        );
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.poll_interval)
            .open()?;
        Ok(port)
    }
}

impl Transport for Box<dyn SerialPort> {
    fn into_halves(self) -> Result<TransportHalves> {
        let reader = self.try_clone()?;
        Ok(TransportHalves {
            reader: Box::new(reader),
            writer: Box::new(self),
            canceller: ReadCanceller::new(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory serial line for driving the protocol code from tests.

    use std::io::{self, Read, Write};
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{ReadCanceller, TransportHalves};

    const DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

    struct PipeReader {
        rx: Receiver<Option<Vec<u8>>>,
        pending: Vec<u8>,
        closed: bool,
    }

    impl Read for PipeReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                if self.closed {
                    return Ok(0);
                }
                match self.rx.recv() {
                    Ok(Some(data)) => self.pending = data,
                    Ok(None) | Err(_) => {
                        self.closed = true;
                        return Ok(0);
                    }
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    struct PipeWriter {
        tx: Sender<Vec<u8>>,
    }

    impl Write for PipeWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device end dropped"))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// The device side of the pipe.
    pub struct DeviceEnd {
        to_host: Sender<Option<Vec<u8>>>,
        from_host: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl DeviceEnd {
        pub fn send(&self, data: &[u8]) {
            let _ = self.to_host.send(Some(data.to_vec()));
        }

        /// Block until the host wrote `len` bytes.
        pub fn recv_exact(&mut self, len: usize) -> Vec<u8> {
            while self.pending.len() < len {
                match self.from_host.recv_timeout(DEVICE_TIMEOUT) {
                    Ok(data) => self.pending.extend(data),
                    Err(RecvTimeoutError::Timeout) => panic!("host did not write {len} bytes"),
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            let n = len.min(self.pending.len());
            self.pending.drain(..n).collect()
        }

        /// Everything the host wrote so far, without blocking.
        pub fn drain(&mut self) -> Vec<u8> {
            while let Ok(data) = self.from_host.try_recv() {
                self.pending.extend(data);
            }
            std::mem::take(&mut self.pending)
        }
    }

    /// Create a connected host transport and device end.
    pub fn pipe() -> (TransportHalves, DeviceEnd) {
        let (to_host, host_rx) = mpsc::channel();
        let (host_tx, from_host) = mpsc::channel();

        let wake = to_host.clone();
        let halves = TransportHalves {
            reader: Box::new(PipeReader {
                rx: host_rx,
                pending: Vec::new(),
                closed: false,
            }),
            writer: Box::new(PipeWriter { tx: host_tx }),
            canceller: ReadCanceller::with_hook(move || {
                let _ = wake.send(None);
            }),
        };
        let device = DeviceEnd {
            to_host,
            from_host,
            pending: Vec::new(),
        };
        (halves, device)
    }

    /// Cloneable `Write` sink for inspecting what the host sent.
    #[derive(Clone, Default)]
    pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let canceller = ReadCanceller::with_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!canceller.is_cancelled());
        canceller.cancel();
        canceller.clone().cancel();
        assert!(canceller.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pipe_cancel_unblocks_reader() {
        use crate::errors::DriverError;
        use crate::serial::WireReader;

        let (halves, device) = testing::pipe();
        let mut reader = WireReader::new(halves.reader).with_canceller(halves.canceller.clone());

        device.send(&[0xFF]);
        assert_eq!(reader.read_byte().unwrap(), 0xFF);

        let handle = std::thread::spawn(move || reader.read(1));
        halves.canceller.cancel();
        assert!(matches!(
            handle.join().unwrap(),
            Err(DriverError::ReadAborted)
        ));
    }
}
