//! Dispatch engine for the Bluetooth command protocol.
//!
//! The device answers every command with an ACK (`0xFF`) and, for queries, a
//! response payload afterwards. Samples (`0x00`) and status pushes (`0x8A 0x71`)
//! are interleaved with those answers at any time. [`RequestHandler`] keeps
//! two FIFOs to pair incoming frames with the commands that caused them:
//!
//! - the ACK queue holds one entry per command written, in write order;
//! - the response queue holds commands whose ACK has arrived and whose payload
//!   has not.
//!
//! [`RequestHandler::process_single_input_event`] consumes exactly one frame.
//! It is driven by a single reader thread; any number of threads may submit
//! commands through [`RequestHandler::queue_command`].

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::channels::{ChannelType, DataType};
use crate::commands::{
    Command, DataPacket, Response, ACK_COMMAND_PROCESSED, DATA_PACKET, FULL_STATUS_RESPONSE,
    INSTREAM_CMD_RESPONSE,
};
use crate::device::DeviceStatus;
use crate::errors::{DriverError, Result};
use crate::serial::{hex, WireReader};

/// Lock a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Pending requests
// ============================================================================

enum Outcome<T> {
    Fulfilled(T),
    Released,
    Failed(DriverError),
}

/// Single-assignment cell a caller can block on.
struct Slot<T> {
    state: Mutex<Option<Outcome<T>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    /// First outcome wins; later ones are dropped.
    fn set(&self, outcome: Outcome<T>) {
        let mut state = lock(&self.state);
        if state.is_none() {
            *state = Some(outcome);
            self.ready.notify_all();
        }
    }

    fn is_set(&self) -> bool {
        lock(&self.state).is_some()
    }

    fn wait(&self) -> Outcome<T> {
        let mut state = lock(&self.state);
        loop {
            if let Some(outcome) = state.take() {
                return outcome;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Fulfilled when the device acknowledges the command.
pub struct RequestCompletion(Arc<Slot<()>>);

impl RequestCompletion {
    pub fn has_completed(&self) -> bool {
        self.0.is_set()
    }

    /// Block until the command is acknowledged (`true`) or released by
    /// [`RequestHandler::clear_queues`] (`false`).
    pub fn wait(self) -> Result<bool> {
        match self.0.wait() {
            Outcome::Fulfilled(()) => Ok(true),
            Outcome::Released => Ok(false),
            Outcome::Failed(e) => Err(e),
        }
    }
}

/// Fulfilled with the decoded response payload of a query.
pub struct RequestResponse(Arc<Slot<Response>>);

impl RequestResponse {
    pub fn has_result(&self) -> bool {
        self.0.is_set()
    }

    /// Block until the response is decoded. `Ok(None)` means the request was
    /// released without an answer.
    pub fn wait(self) -> Result<Option<Response>> {
        match self.0.wait() {
            Outcome::Fulfilled(r) => Ok(Some(r)),
            Outcome::Released => Ok(None),
            Outcome::Failed(e) => Err(e),
        }
    }
}

struct AckEntry {
    completion: Arc<Slot<()>>,
    response: Option<ResponseEntry>,
}

struct ResponseEntry {
    command: Command,
    response: Arc<Slot<Response>>,
}

#[derive(Default)]
struct AckQueue {
    entries: VecDeque<AckEntry>,
    /// Set once the engine is torn down; new submissions are refused.
    broken: Option<String>,
}

// ============================================================================
// Callbacks
// ============================================================================

/// Handle returned when registering a callback, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

type StreamCallback = Arc<dyn Fn(&DataPacket) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(&DeviceStatus) + Send + Sync>;

// ============================================================================
// Request handler
// ============================================================================

pub struct RequestHandler {
    /// Submission lock: held across enqueue and write.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    ack_queue: Mutex<AckQueue>,
    resp_queue: Mutex<VecDeque<ResponseEntry>>,
    stream_types: Mutex<Vec<(ChannelType, DataType)>>,
    stream_cbs: Mutex<Vec<(CallbackId, StreamCallback)>>,
    status_cbs: Mutex<Vec<(CallbackId, StatusCallback)>>,
    next_cb_id: AtomicU64,
}

impl RequestHandler {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            ack_queue: Mutex::new(AckQueue::default()),
            resp_queue: Mutex::new(VecDeque::new()),
            stream_types: Mutex::new(Vec::new()),
            stream_cbs: Mutex::new(Vec::new()),
            status_cbs: Mutex::new(Vec::new()),
            next_cb_id: AtomicU64::new(0),
        }
    }

    /// Channel layout used to decode incoming data packets.
    pub fn set_stream_types(&self, types: Vec<(ChannelType, DataType)>) {
        debug!("stream layout: {:?}", types);
        *lock(&self.stream_types) = types;
    }

    fn next_callback_id(&self) -> CallbackId {
        CallbackId(self.next_cb_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_stream_callback(
        &self,
        cb: impl Fn(&DataPacket) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id();
        lock(&self.stream_cbs).push((id, Arc::new(cb)));
        id
    }

    pub fn remove_stream_callback(&self, id: CallbackId) -> bool {
        let mut cbs = lock(&self.stream_cbs);
        let before = cbs.len();
        cbs.retain(|(cb_id, _)| *cb_id != id);
        cbs.len() != before
    }

    pub fn add_status_callback(
        &self,
        cb: impl Fn(&DeviceStatus) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id();
        lock(&self.status_cbs).push((id, Arc::new(cb)));
        id
    }

    pub fn remove_status_callback(&self, id: CallbackId) -> bool {
        let mut cbs = lock(&self.status_cbs);
        let before = cbs.len();
        cbs.retain(|(cb_id, _)| *cb_id != id);
        cbs.len() != before
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Write `cmd` to the device and register it as pending.
    ///
    /// The returned completion fires on the command's ACK; the response (for
    /// queries only) fires once its payload has been decoded.
    pub fn queue_command(
        &self,
        cmd: Command,
    ) -> Result<(RequestCompletion, Option<RequestResponse>)> {
        let bytes = cmd.encode()?;

        let mut writer = lock(&self.writer);
        let Some(out) = writer.as_mut() else {
            return Err(DriverError::ConnectionBroken("transport closed".into()));
        };

        let completion = Slot::new();
        let response = cmd.has_response().then(Slot::new);
        {
            let mut acks = lock(&self.ack_queue);
            if let Some(reason) = &acks.broken {
                return Err(DriverError::ConnectionBroken(reason.clone()));
            }
            acks.entries.push_back(AckEntry {
                completion: completion.clone(),
                response: response.clone().map(|response| ResponseEntry {
                    command: cmd,
                    response,
                }),
            });
        }

        debug!("tx {}", hex(&bytes));
        if let Err(e) = out.write_all(&bytes).and_then(|()| out.flush()) {
            lock(&self.ack_queue)
                .entries
                .retain(|entry| !Arc::ptr_eq(&entry.completion, &completion));
            return Err(e.into());
        }

        Ok((RequestCompletion(completion), response.map(RequestResponse)))
    }

    /// Drop the write half. Later submissions fail.
    pub fn close_writer(&self) {
        if let Some(mut out) = lock(&self.writer).take() {
            if let Err(e) = out.flush() {
                warn!("flushing transport on close failed: {e}");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Consume and route one frame from the wire.
    pub fn process_single_input_event<R: Read>(&self, wire: &mut WireReader<R>) -> Result<()> {
        match wire.peek_byte()? {
            ACK_COMMAND_PROCESSED => self.process_ack(wire),
            DATA_PACKET => self.process_data_packet(wire),
            INSTREAM_CMD_RESPONSE => self.process_in_stream(wire),
            _ => self.process_queued_response(wire),
        }
    }

    fn process_ack<R: Read>(&self, wire: &mut WireReader<R>) -> Result<()> {
        wire.read_byte()?;

        let Some(entry) = lock(&self.ack_queue).entries.pop_front() else {
            warn!("received ACK without a pending command, ignoring");
            return Ok(());
        };
        if let Some(resp) = entry.response {
            lock(&self.resp_queue).push_back(resp);
        }
        entry.completion.set(Outcome::Fulfilled(()));
        Ok(())
    }

    fn process_data_packet<R: Read>(&self, wire: &mut WireReader<R>) -> Result<()> {
        let types = lock(&self.stream_types).clone();
        let packet = DataPacket::receive(&types, wire)?;

        let cbs: Vec<StreamCallback> = lock(&self.stream_cbs)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in cbs {
            cb(&packet);
        }
        Ok(())
    }

    fn process_in_stream<R: Read>(&self, wire: &mut WireReader<R>) -> Result<()> {
        let signature = wire.peek(FULL_STATUS_RESPONSE.as_bytes().len())?;
        if signature != FULL_STATUS_RESPONSE.as_bytes() {
            return self.process_queued_response(wire);
        }

        let status_pending = lock(&self.resp_queue)
            .front()
            .is_some_and(|entry| entry.command.is_status_query());
        if status_pending {
            self.process_queued_response(wire)
        } else {
            self.process_status_update(wire)
        }
    }

    fn process_status_update<R: Read>(&self, wire: &mut WireReader<R>) -> Result<()> {
        wire.read_response_code(FULL_STATUS_RESPONSE.as_bytes())?;
        let status = DeviceStatus::from_byte(wire.read_byte()?);
        debug!("status update: {:?}", status.bits());

        let cbs: Vec<StatusCallback> = lock(&self.status_cbs)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in cbs {
            cb(&status);
        }
        Ok(())
    }

    fn process_queued_response<R: Read>(&self, wire: &mut WireReader<R>) -> Result<()> {
        let Some(entry) = lock(&self.resp_queue).pop_front() else {
            let byte = wire.read_byte()?;
            warn!("discarding unexpected byte {byte:#04x}: no response pending");
            return Ok(());
        };

        match entry.command.decode(wire) {
            Ok(response) => {
                debug!("response: {:?}", response);
                entry.response.set(Outcome::Fulfilled(response));
                Ok(())
            }
            Err(DriverError::ReadAborted) => {
                entry.response.set(Outcome::Released);
                Err(DriverError::ReadAborted)
            }
            Err(e) => {
                entry.response.set(Outcome::Failed(e.for_waiter()));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Release every pending request without a result.
    pub fn clear_queues(&self) {
        self.drain(|| Outcome::Released, || Outcome::Released);
    }

    /// Refuse further submissions and fail every pending request with
    /// [`DriverError::ConnectionBroken`].
    pub fn fail_all(&self, reason: &str) {
        lock(&self.ack_queue).broken = Some(reason.to_string());
        let broken = || DriverError::ConnectionBroken(reason.to_string());
        self.drain(
            || Outcome::Failed(broken()),
            || Outcome::Failed(broken()),
        );
    }

    fn drain(
        &self,
        completion: impl Fn() -> Outcome<()>,
        response: impl Fn() -> Outcome<Response>,
    ) {
        let acks: Vec<AckEntry> = lock(&self.ack_queue).entries.drain(..).collect();
        let resps: Vec<ResponseEntry> = lock(&self.resp_queue).drain(..).collect();
        if !acks.is_empty() || !resps.is_empty() {
            debug!(
                "releasing {} unacknowledged and {} unanswered requests",
                acks.len(),
                resps.len()
            );
        }

        for entry in acks {
            entry.completion.set(completion());
            if let Some(resp) = entry.response {
                resp.response.set(response());
            }
        }
        for entry in resps {
            entry.response.set(response());
        }
    }
}
