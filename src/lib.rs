//! Shimmer3 sensor driver with optional Python bindings.
//!
//! Two host interfaces are supported:
//!
//! - **Bluetooth** ([`ShimmerBluetooth`]): the streaming/command protocol over
//!   an RFCOMM socket or any serial line speaking it. A background thread
//!   dispatches ACKs, responses, data packets and status pushes; the API
//!   blocks per call.
//! - **Dock** ([`ShimmerDock`]): the CRC-protected request/response protocol
//!   of the docking station UART.
//!
//! # Streaming
//!
//! Samples are delivered to callbacks registered with
//! [`ShimmerBluetooth::add_stream_callback`]. Each [`DataPacket`] starts with
//! the device timestamp (32768 Hz ticks, 24 bit, wrapping); use
//! [`ticks2sec`] to convert.
//!
//! # Features
//!
//! - `python`: PyO3 extension module `_core`.
//! - `bluez`: device discovery and PIN pairing through BlueZ.

mod bluetooth;
pub mod channels;
pub mod commands;
pub mod device;
pub mod dispatch;
pub mod dock;
mod errors;
pub mod exg;
pub mod logging;
#[cfg(feature = "python")]
mod python;
mod serial;
mod shimmer;
pub mod transport;

pub use bluetooth::{BluetoothConnector, RfcommStream};
pub use channels::{ChannelType, DataType, SensorGroup};
pub use commands::{Command, DataPacket, InquiryResponse, Response};
pub use device::{
    sec2ticks, ticks2sec, DeviceStatus, FirmwareCapabilities, FirmwareType, FirmwareVersion,
    HardwareVersion,
};
pub use dispatch::CallbackId;
pub use dock::{DockFirmwareInfo, DockOptions, DockPort, ShimmerDock};
pub use errors::*;
pub use exg::{AllCalibration, ExgRegister};
pub use serial::WireReader;
pub use shimmer::{ShimmerBluetooth, ShimmerOptions};
pub use transport::{ReadCanceller, SerialConfig, Transport, TransportHalves};
