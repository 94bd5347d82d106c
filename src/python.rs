// ============================================================================
// Python Bindings
// ============================================================================

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::bluetooth::BluetoothConnector;
use crate::channels::SensorGroup;
use crate::commands::DataPacket;
use crate::dispatch::CallbackId;
use crate::errors::DriverError;
use crate::logging;
use crate::shimmer::{ShimmerBluetooth, ShimmerOptions};
use crate::transport::SerialConfig;

impl From<DriverError> for PyErr {
    fn from(e: DriverError) -> PyErr {
        let msg = e.to_string();
        match e {
            DriverError::NotInitialized => PyRuntimeError::new_err(msg),
            DriverError::InvalidArgument(_)
            | DriverError::ArgumentTooLong(_)
            | DriverError::ValueOutOfRange { .. } => PyValueError::new_err(msg),
            DriverError::Bluetooth(_)
            | DriverError::ConnectionBroken(_)
            | DriverError::RequestReleased => PyConnectionError::new_err(msg),
            _ => PyIOError::new_err(msg),
        }
    }
}

fn parse_sensor(name: &str) -> PyResult<SensorGroup> {
    SensorGroup::ALL
        .iter()
        .copied()
        .find(|s| format!("{s:?}").eq_ignore_ascii_case(name))
        .ok_or_else(|| PyValueError::new_err(format!("unknown sensor: {name}")))
}

/// One streamed sample.
///
/// Attributes:
///     channels: Channel names in wire order (timestamp first).
///     values: Raw channel values, same order as `channels`.
#[pyclass(name = "DataPacket", frozen)]
#[derive(Clone)]
struct PyDataPacket {
    #[pyo3(get)]
    channels: Vec<String>,
    #[pyo3(get)]
    values: Vec<i64>,
}

#[pymethods]
impl PyDataPacket {
    fn __getitem__(&self, channel: &str) -> PyResult<i64> {
        self.channels
            .iter()
            .position(|c| c == channel)
            .map(|i| self.values[i])
            .ok_or_else(|| pyo3::exceptions::PyKeyError::new_err(channel.to_string()))
    }

    fn __len__(&self) -> usize {
        self.values.len()
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for (name, value) in self.channels.iter().zip(&self.values) {
            dict.set_item(name, value)?;
        }
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        let fields: Vec<String> = self
            .channels
            .iter()
            .zip(&self.values)
            .map(|(c, v)| format!("{c}={v}"))
            .collect();
        format!("DataPacket({})", fields.join(", "))
    }
}

impl From<&DataPacket> for PyDataPacket {
    fn from(p: &DataPacket) -> Self {
        PyDataPacket {
            channels: p.channels().map(|c| format!("{c:?}")).collect(),
            values: p.values().iter().map(|(_, v)| *v).collect(),
        }
    }
}

/// Shimmer3 driver over Bluetooth.
///
/// Blocking calls release the GIL. Callbacks are invoked from the driver's
/// background thread.
///
/// Example:
///     >>> shimmer = ShimmerBluetooth("/dev/rfcomm0")
///     >>> shimmer.initialize()
///     >>> shimmer.add_stream_callback(print)
///     >>> shimmer.start_streaming()
#[pyclass(name = "ShimmerBluetooth", frozen)]
struct PyShimmerBluetooth {
    inner: ShimmerBluetooth,
}

#[pymethods]
impl PyShimmerBluetooth {
    /// Open a serial port (wired UART or a bound `/dev/rfcomm*`).
    #[new]
    #[pyo3(signature = (path, disable_status_ack=true))]
    fn new(path: &str, disable_status_ack: bool) -> PyResult<Self> {
        let port = SerialConfig::new(path).open()?;
        let inner = ShimmerBluetooth::new(port, ShimmerOptions { disable_status_ack })?;
        Ok(Self { inner })
    }

    /// Connect over RFCOMM by MAC address.
    #[staticmethod]
    #[pyo3(signature = (mac, pin="1234", disable_status_ack=true))]
    fn connect(py: Python<'_>, mac: &str, pin: &str, disable_status_ack: bool) -> PyResult<Self> {
        let stream = py.detach(|| BluetoothConnector::default().connect(mac, pin))?;
        let inner = ShimmerBluetooth::new(stream, ShimmerOptions { disable_status_ack })?;
        Ok(Self { inner })
    }

    fn initialize(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.inner.initialize())?)
    }

    fn shutdown(&self, py: Python<'_>) {
        py.detach(|| self.inner.shutdown())
    }

    #[getter]
    fn initialized(&self) -> bool {
        self.inner.initialized()
    }

    /// Hardware revision name, e.g. "Shimmer3".
    #[getter]
    fn hardware_version(&self) -> PyResult<String> {
        Ok(format!("{:?}", self.inner.hardware_version()?))
    }

    fn get_sampling_rate(&self, py: Python<'_>) -> PyResult<f64> {
        Ok(py.detach(|| self.inner.get_sampling_rate())?)
    }

    fn set_sampling_rate(&self, py: Python<'_>, sampling_rate: f64) -> PyResult<()> {
        Ok(py.detach(|| self.inner.set_sampling_rate(sampling_rate))?)
    }

    #[pyo3(signature = (in_percent=true))]
    fn get_battery_state(&self, py: Python<'_>, in_percent: bool) -> PyResult<f64> {
        Ok(py.detach(|| self.inner.get_battery_state(in_percent))?)
    }

    fn get_config_time(&self, py: Python<'_>) -> PyResult<u64> {
        Ok(py.detach(|| self.inner.get_config_time())?)
    }

    fn set_config_time(&self, py: Python<'_>, time: u64) -> PyResult<()> {
        Ok(py.detach(|| self.inner.set_config_time(time))?)
    }

    fn get_rtc(&self, py: Python<'_>) -> PyResult<f64> {
        Ok(py.detach(|| self.inner.get_rtc())?)
    }

    fn set_rtc(&self, py: Python<'_>, seconds: f64) -> PyResult<()> {
        Ok(py.detach(|| self.inner.set_rtc(seconds))?)
    }

    /// Status bits: docked, sensing, rtc_set, logging, streaming, sd_present,
    /// sd_error, red_led.
    fn get_status(&self, py: Python<'_>) -> PyResult<Vec<bool>> {
        Ok(py.detach(|| self.inner.get_status())?.bits().to_vec())
    }

    /// Returns `(firmware_type, (major, minor, rel))`.
    fn get_firmware_version(&self, py: Python<'_>) -> PyResult<(String, (u16, u8, u8))> {
        let (fw_type, v) = py.detach(|| self.inner.get_firmware_version())?;
        Ok((format!("{fw_type:?}"), (v.major, v.minor, v.rel)))
    }

    fn get_device_hardware_version(&self, py: Python<'_>) -> PyResult<String> {
        Ok(format!(
            "{:?}",
            py.detach(|| self.inner.get_device_hardware_version())?
        ))
    }

    fn get_device_name(&self, py: Python<'_>) -> PyResult<String> {
        Ok(py.detach(|| self.inner.get_device_name())?)
    }

    fn set_device_name(&self, py: Python<'_>, name: &str) -> PyResult<()> {
        Ok(py.detach(|| self.inner.set_device_name(name))?)
    }

    fn get_experiment_id(&self, py: Python<'_>) -> PyResult<String> {
        Ok(py.detach(|| self.inner.get_experiment_id())?)
    }

    fn set_experiment_id(&self, py: Python<'_>, id: &str) -> PyResult<()> {
        Ok(py.detach(|| self.inner.set_experiment_id(id))?)
    }

    /// Sensor groups by name, e.g. `["AccelLn", "Gsr"]`.
    fn set_sensors(&self, py: Python<'_>, sensors: Vec<String>) -> PyResult<()> {
        let sensors = sensors
            .iter()
            .map(|s| parse_sensor(s))
            .collect::<PyResult<Vec<_>>>()?;
        Ok(py.detach(|| self.inner.set_sensors(&sensors))?)
    }

    fn get_data_types(&self, py: Python<'_>) -> PyResult<Vec<String>> {
        let types = py.detach(|| self.inner.get_data_types())?;
        Ok(types.iter().map(|t| format!("{t:?}")).collect())
    }

    fn get_exg_register<'py>(&self, py: Python<'py>, chip: u8) -> PyResult<Bound<'py, PyBytes>> {
        let reg = py.detach(|| self.inner.get_exg_register(chip))?;
        Ok(PyBytes::new(py, reg.binary()))
    }

    fn set_exg_register(&self, py: Python<'_>, chip: u8, offset: u8, data: Vec<u8>) -> PyResult<()> {
        Ok(py.detach(|| self.inner.set_exg_register(chip, offset, &data))?)
    }

    fn start_streaming(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.inner.start_streaming())?)
    }

    fn stop_streaming(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.inner.stop_streaming())?)
    }

    fn start_logging(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.inner.start_logging())?)
    }

    fn stop_logging(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.inner.stop_logging())?)
    }

    fn send_ping(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.inner.send_ping())?)
    }

    fn set_status_ack(&self, py: Python<'_>, enabled: bool) -> PyResult<()> {
        Ok(py.detach(|| self.inner.set_status_ack(enabled))?)
    }

    /// Register `callback(packet: DataPacket)`; returns a handle for removal.
    fn add_stream_callback(&self, callback: Py<PyAny>) -> u64 {
        self.inner
            .add_stream_callback(move |packet| {
                Python::attach(|py| {
                    if let Err(e) = callback.call1(py, (PyDataPacket::from(packet),)) {
                        e.print(py);
                    }
                });
            })
            .raw()
    }

    fn remove_stream_callback(&self, handle: u64) -> bool {
        self.inner
            .remove_stream_callback(CallbackId::from_raw(handle))
    }

    /// Register `callback(status: list[bool])`; returns a handle for removal.
    fn add_status_callback(&self, callback: Py<PyAny>) -> u64 {
        self.inner
            .add_status_callback(move |status| {
                Python::attach(|py| {
                    if let Err(e) = callback.call1(py, (status.bits().to_vec(),)) {
                        e.print(py);
                    }
                });
            })
            .raw()
    }

    fn remove_status_callback(&self, handle: u64) -> bool {
        self.inner
            .remove_status_callback(CallbackId::from_raw(handle))
    }

    fn __repr__(&self) -> String {
        format!("ShimmerBluetooth(initialized={})", self.inner.initialized())
    }
}

#[pyfunction]
fn init_logging(py: Python<'_>) -> PyResult<()> {
    logging::init_python_logging(py)
}

#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

#[pyfunction]
fn reset_logging_cache() {
    logging::reset_python_logging_cache()
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyShimmerBluetooth>()?;
    m.add_class::<PyDataPacket>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add_function(wrap_pyfunction!(reset_logging_cache, m)?)?;

    m.add(
        "SENSORS",
        SensorGroup::ALL
            .iter()
            .map(|s| format!("{s:?}"))
            .collect::<Vec<_>>(),
    )?;
    m.add("DEFAULT_BAUD_RATE", crate::transport::BAUD_RATE)?;

    Ok(())
}
