//! Byte channel to one burner.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;

use crate::cartridge;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out waiting for the device")]
    Timeout,

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl TransportError {
    fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::PermissionDenied => TransportError::Disconnected(e.to_string()),
            _ => TransportError::Io(e),
        }
    }
}

/// Request/response channel to a single device.
///
/// Every read is bounded by the current timeout; a read that does not
/// complete in time fails with [`TransportError::Timeout`] rather than
/// blocking.
pub trait Transport: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Reads exactly `buf.len()` bytes.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    fn timeout(&self) -> Duration;

    /// Drops any bytes already received but not yet read, e.g. a late ack.
    fn discard_input(&mut self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(data)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_exact(buf)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        (**self).discard_input()
    }
}

#[derive(Debug, Clone)]
pub struct SerialOptions {
    pub baud_rate: u32,
    /// Default per-exchange timeout.
    pub timeout: Duration,
    /// Pulse DTR after opening; the burner firmware resets its parser on it.
    pub pulse_dtr: bool,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: cartridge::BAUD_RATE,
            timeout: Duration::from_secs(5),
            pulse_dtr: true,
        }
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    port_name: String,
}

impl SerialTransport {
    pub fn open(port_name: &str, opts: &SerialOptions) -> Result<Self, TransportError> {
        let mut port = serialport::new(port_name, opts.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(opts.timeout)
            .open()?;

        if opts.pulse_dtr {
            port.write_data_terminal_ready(true)?;
            port.write_data_terminal_ready(false)?;
        }

        tracing::info!(port = port_name, baud = opts.baud_rate, "serial port opened");

        Ok(Self {
            port,
            port_name: port_name.to_string(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data).map_err(TransportError::from_io)?;
        self.port.flush().map_err(TransportError::from_io)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.port.read_exact(buf).map_err(TransportError::from_io)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.port.timeout()
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_map_to_timeout() {
        let e = TransportError::from_io(io::Error::new(io::ErrorKind::TimedOut, "t"));
        assert!(matches!(e, TransportError::Timeout));
    }

    #[test]
    fn broken_pipe_maps_to_disconnected() {
        let e = TransportError::from_io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(e, TransportError::Disconnected(_)));
    }
}
