use std::{
    fmt::Display,
    io::{self, Read, Write},
    time::Duration,
};

use serialport::{DataBits, FlowControl, Parity, SerialPortInfo, SerialPortType, StopBits};
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::config::{DeviceFilter, LinkSettings};

/// An attached USB serial device the session could connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub port_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// The two halves of an open handle. The reader is moved onto the blocking
/// reader thread; the writer stays with the session.
pub struct OpenLink {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to enumerate devices. Error: {0}")]
    Enumeration(String),

    #[error("No USB serial devices found.")]
    NoDevice,

    #[error("Permission denied for device {0}.")]
    PermissionDenied(DeviceInfo),

    #[error("No permission answer for device {0} within {1:?}.")]
    PermissionTimeout(DeviceInfo, Duration),

    #[error("Failed to open device {port}. Error: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },
}

/// Platform driver layer: enumeration, permission and opening of devices.
///
/// This separates the platform specifics from the session state machine,
/// which keeps the session testable without hardware.
pub trait DeviceDriver: Send + Sync {
    /// Every attached device this driver can talk to, best candidate first.
    fn discover(&self) -> Result<Vec<DeviceInfo>, SessionError>;

    fn has_permission(&self, device: &DeviceInfo) -> bool;

    /// Ask the platform for access. The answer arrives later through
    /// `DeviceSession::resolve_permission`.
    fn request_permission(&self, device: &DeviceInfo);

    /// Acquire the handle and apply the serial parameters.
    fn open(&self, device: &DeviceInfo, settings: &LinkSettings) -> Result<OpenLink, SessionError>;
}

/// Driver backed by the operating system's serial ports.
///
/// Desktop platforms check access when the port is opened, so permission is
/// always reported as granted.
pub struct SerialPortDriver {
    filter: DeviceFilter,
}

impl SerialPortDriver {
    pub fn new(filter: DeviceFilter) -> Self {
        Self { filter }
    }
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}'", self.port_name)?;
        if let (Some(vid), Some(pid)) = (self.vendor_id, self.product_id) {
            write!(f, " ({:04x}:{:04x})", vid, pid)?;
        }
        Ok(())
    }
}

/// Keep only USB ports. Other port types can't be the controller.
fn usb_device_from_port(port: SerialPortInfo) -> Option<DeviceInfo> {
    trace!("Checking port '{}'.", port.port_name);
    match port.port_type {
        SerialPortType::UsbPort(usb_info) => Some(DeviceInfo {
            port_name: port.port_name,
            vendor_id: Some(usb_info.vid),
            product_id: Some(usb_info.pid),
            product: usb_info.product,
            serial_number: usb_info.serial_number,
        }),
        _ => {
            debug!("Wrong port type.");
            None
        }
    }
}

impl DeviceDriver for SerialPortDriver {
    #[instrument(skip_all)]
    fn discover(&self) -> Result<Vec<DeviceInfo>, SessionError> {
        let ports = serialport::available_ports()
            .map_err(|e| SessionError::Enumeration(e.to_string()))?;
        trace!("Found {} ports to check.", ports.len());

        Ok(ports
            .into_iter()
            .filter_map(usb_device_from_port)
            .filter(|device| {
                let matches = self.filter.matches(device);
                if !matches {
                    debug!("Device {} doesn't match the device filter.", device);
                }
                matches
            })
            .collect())
    }

    fn has_permission(&self, _device: &DeviceInfo) -> bool {
        true
    }

    fn request_permission(&self, device: &DeviceInfo) {
        trace!("Permission for {} is implicit.", device);
    }

    #[instrument(skip_all)]
    fn open(&self, device: &DeviceInfo, settings: &LinkSettings) -> Result<OpenLink, SessionError> {
        let open_error = |e: serialport::Error| SessionError::Open {
            port: device.port_name.clone(),
            source: e.into(),
        };

        let port = serialport::new(device.port_name.as_str(), settings.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(settings.write_timeout())
            .open()
            .map_err(open_error)?;
        let mut reader = port.try_clone().map_err(open_error)?;
        reader
            .set_timeout(settings.read_timeout())
            .map_err(open_error)?;

        debug!(
            "Opened {} at {} baud, 8N1.",
            device, settings.baud_rate
        );
        Ok(OpenLink {
            reader: Box::new(reader),
            writer: Box::new(port),
        })
    }
}
