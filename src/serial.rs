//! Blocking byte reader shared by the Bluetooth engine and the dock protocol.
//!
//! [`WireReader`] turns any [`Read`] into the `read(n)` / `peek(n)` primitives
//! the protocol code is written against: both block until `n` bytes are
//! buffered, and both fail with [`DriverError::ReadAborted`] once the reader is
//! cancelled or the stream reaches end-of-file.

use std::io::{ErrorKind, Read};

use log::trace;

use crate::errors::{DriverError, Result};
use crate::transport::ReadCanceller;

const CHUNK_SIZE: usize = 256;

/// Format bytes as space separated lowercase hex, e.g. `ff 7a 05`.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Buffered reader with peek support and cooperative cancellation.
pub struct WireReader<R> {
    inner: R,
    buf: Vec<u8>,
    canceller: Option<ReadCanceller>,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            canceller: None,
        }
    }

    /// Abort blocked reads once `canceller` fires.
    pub fn with_canceller(mut self, canceller: ReadCanceller) -> Self {
        self.canceller = Some(canceller);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.canceller.as_ref().is_some_and(|c| c.is_cancelled())
    }

    fn fill(&mut self, len: usize) -> Result<()> {
        let mut chunk = [0u8; CHUNK_SIZE];
        while self.buf.len() < len {
            if self.is_cancelled() {
                return Err(DriverError::ReadAborted);
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(DriverError::ReadAborted),
                Ok(n) => {
                    trace!("rx {}", hex(&chunk[..n]));
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                // Timeouts only exist so the cancel flag gets polled.
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read exactly `len` bytes.
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        self.fill(len)?;
        Ok(self.buf.drain(..len).collect())
    }

    /// Return the next `len` bytes without consuming them.
    pub fn peek(&mut self, len: usize) -> Result<Vec<u8>> {
        self.fill(len)?;
        Ok(self.buf[..len].to_vec())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.fill(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[..N]);
        self.buf.drain(..N);
        Ok(out)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    pub fn peek_byte(&mut self) -> Result<u8> {
        self.fill(1)?;
        Ok(self.buf[0])
    }

    /// Read a length-prefixed field: one length byte followed by that many bytes.
    pub fn read_varlen(&mut self) -> Result<Vec<u8>> {
        let len = self.read_byte()?;
        self.read(len as usize)
    }

    /// Consume a response code and check it byte for byte.
    pub fn read_response_code(&mut self, expected: &[u8]) -> Result<()> {
        let actual = self.read(expected.len())?;
        if actual != expected {
            return Err(DriverError::UnexpectedResponseCode {
                expected: expected.to_vec(),
                actual,
            });
        }
        Ok(())
    }

    /// Drop everything buffered so far.
    pub fn discard_buffered(&mut self) {
        self.buf.clear();
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
