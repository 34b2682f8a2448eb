use std::fmt;

use serde::Serialize;

use crate::flash::FlashDescriptor;
use crate::operation::OperationEvent;
use crate::protocol::{Protocol, ProtocolError, ProtocolOptions};
use crate::transport::{SerialOptions, SerialTransport, Transport, TransportError};

/// Stable identity of a burner: the bus path of its serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl DeviceInfo {
    /// Info for a serial endpoint identified only by its port name.
    pub fn from_port(port_name: impl Into<String>, vid: u16, pid: u16) -> Self {
        let port_name = port_name.into();
        Self {
            id: DeviceId::new(port_name.clone()),
            port_name,
            vid,
            pid,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Busy,
}

/// An open burner and what is known about its flash chip.
///
/// The descriptor is queried on first use and kept until the device is
/// dropped; reconnecting builds a new `Device` and therefore re-queries.
pub struct Device {
    info: DeviceInfo,
    protocol: Protocol,
    descriptor: Option<FlashDescriptor>,
}

impl Device {
    pub fn new(info: DeviceInfo, protocol: Protocol) -> Self {
        Self {
            info,
            protocol,
            descriptor: None,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn protocol_mut(&mut self) -> &mut Protocol {
        &mut self.protocol
    }

    pub fn descriptor(&self) -> Option<&FlashDescriptor> {
        self.descriptor.as_ref()
    }

    /// Codec plus flash geometry, querying CFI if not cached yet.
    pub fn flash(&mut self) -> Result<(&mut Protocol, &FlashDescriptor), ProtocolError> {
        let descriptor = match self.descriptor.take() {
            Some(d) => d,
            None => self.protocol.query_cfi()?,
        };
        let descriptor = &*self.descriptor.insert(descriptor);
        Ok((&mut self.protocol, descriptor))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Puts the cartridge back into flash mode, then queries flash geometry if
/// not known yet and reports it.
pub(crate) fn enter_flash<F>(device: &mut Device, on_event: &mut F) -> Result<(), ProtocolError>
where
    F: FnMut(OperationEvent),
{
    device.protocol.enter_flash_mode()?;
    if device.descriptor.is_some() {
        return Ok(());
    }
    let descriptor = device.flash()?.1.clone();
    on_event(OperationEvent::FlashIdentified {
        device: device.id().clone(),
        descriptor,
    });
    Ok(())
}

/// Opens the byte channel for a discovered device.
pub trait Connector: Send + Sync {
    fn open(&self, info: &DeviceInfo) -> Result<Box<dyn Transport>, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct SerialConnector {
    pub options: SerialOptions,
}

impl Connector for SerialConnector {
    fn open(&self, info: &DeviceInfo) -> Result<Box<dyn Transport>, TransportError> {
        let t = SerialTransport::open(&info.port_name, &self.options)?;
        Ok(Box::new(t))
    }
}

/// Opens `info` and performs the unlock handshake.
pub fn connect(
    connector: &dyn Connector,
    info: DeviceInfo,
    opts: ProtocolOptions,
) -> Result<Device, ProtocolError> {
    let transport = connector.open(&info)?;
    let mut protocol = Protocol::new(transport, opts);
    protocol.unlock()?;
    tracing::info!(device = %info.id, "device connected");
    Ok(Device::new(info, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{fast_protocol_options, SimCartridge, SimConfig, SimConnector};

    #[test]
    fn descriptor_is_cached_after_first_query() {
        let connector = SimConnector::default();
        let info = DeviceInfo::from_port("sim0", 0x0483, 0x0721);
        let sim = connector.insert(&info.id, SimCartridge::new(SimConfig::default()));

        let mut dev = connect(&connector, info, fast_protocol_options()).unwrap();
        assert!(dev.descriptor().is_none());
        let size = dev.flash().unwrap().1.total_size;
        assert_eq!(size, SimConfig::default().flash_size as u64);

        let frames = sim.frames_seen();
        dev.flash().unwrap();
        assert_eq!(sim.frames_seen(), frames);
    }

    #[test]
    fn device_id_displays_as_port() {
        let info = DeviceInfo::from_port("/dev/ttyACM0", 0x0483, 0x0721);
        assert_eq!(info.id.to_string(), "/dev/ttyACM0");
    }
}
