//! Background discovery of attached burners.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::cartridge;
use crate::device::{DeviceId, DeviceInfo};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("serial enumeration failed: {0}")]
    Serial(#[from] serialport::Error),

    #[error("failed to start scanner thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub vid: u16,
    pub pid: u16,
    pub interval: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            vid: cartridge::VID,
            pid: cartridge::PID,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ScanEvent {
    Appeared(DeviceInfo),
    Removed { id: DeviceId },
}

/// Lists the endpoints currently attached.
pub trait Enumerator: Send {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, ScanError>;
}

#[derive(Debug, Clone)]
pub struct SerialEnumerator {
    pub vid: u16,
    pub pid: u16,
}

impl SerialEnumerator {
    pub fn new(opts: &ScanOptions) -> Self {
        Self {
            vid: opts.vid,
            pid: opts.pid,
        }
    }
}

impl Enumerator for SerialEnumerator {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, ScanError> {
        Ok(filter_ports(
            serialport::available_ports()?,
            self.vid,
            self.pid,
        ))
    }
}

/// USB serial ports matching `vid:pid`, sorted by port name.
pub fn filter_ports(ports: Vec<serialport::SerialPortInfo>, vid: u16, pid: u16) -> Vec<DeviceInfo> {
    let mut out: Vec<DeviceInfo> = Vec::new();
    for p in ports {
        let serialport::SerialPortInfo {
            port_name,
            port_type,
        } = p;

        let serialport::SerialPortType::UsbPort(usb) = port_type else {
            continue;
        };
        if usb.vid != vid || usb.pid != pid {
            continue;
        }

        out.push(DeviceInfo {
            id: DeviceId::new(port_name.clone()),
            port_name,
            vid: usb.vid,
            pid: usb.pid,
            serial_number: usb.serial_number,
            manufacturer: usb.manufacturer,
            product: usb.product,
        });
    }
    out.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    out
}

/// Differences between the previously known set and a fresh enumeration.
/// Removals come first so a re-enumerated port is reported as gone then new.
pub fn diff_devices(known: &BTreeMap<DeviceId, DeviceInfo>, now: &[DeviceInfo]) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    for id in known.keys() {
        if !now.iter().any(|d| &d.id == id) {
            events.push(ScanEvent::Removed { id: id.clone() });
        }
    }
    for d in now {
        match known.get(&d.id) {
            Some(prev) if prev == d => {}
            Some(_) => {
                events.push(ScanEvent::Removed { id: d.id.clone() });
                events.push(ScanEvent::Appeared(d.clone()));
            }
            None => events.push(ScanEvent::Appeared(d.clone())),
        }
    }
    events
}

/// Remembers the attached set between polls.
pub struct DeviceScanner<E> {
    enumerator: E,
    known: BTreeMap<DeviceId, DeviceInfo>,
}

impl<E: Enumerator> DeviceScanner<E> {
    pub fn new(enumerator: E) -> Self {
        Self {
            enumerator,
            known: BTreeMap::new(),
        }
    }

    pub fn scan_once(&mut self) -> Result<Vec<ScanEvent>, ScanError> {
        let now = self.enumerator.enumerate()?;
        let events = diff_devices(&self.known, &now);
        self.known = now.into_iter().map(|d| (d.id.clone(), d)).collect();
        Ok(events)
    }

    pub fn known(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.known.values()
    }
}

/// Running scanner loop; stops and joins on [`ScannerHandle::stop`] or drop.
pub struct ScannerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ScannerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ScannerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Polls `enumerator` every `interval` and forwards changes to `tx`. The
/// loop ends when stopped or when the receiver is gone.
pub fn spawn<E>(
    enumerator: E,
    interval: Duration,
    tx: Sender<ScanEvent>,
) -> Result<ScannerHandle, ScanError>
where
    E: Enumerator + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let join = std::thread::Builder::new()
        .name("device-scanner".to_string())
        .spawn(move || {
            let mut scanner = DeviceScanner::new(enumerator);
            while !stop_flag.load(Ordering::SeqCst) {
                match scanner.scan_once() {
                    Ok(events) => {
                        for ev in events {
                            if tx.send(ev).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "device enumeration failed"),
                }

                let deadline = Instant::now() + interval;
                while !stop_flag.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
                }
            }
        })
        .map_err(ScanError::Spawn)?;

    Ok(ScannerHandle {
        stop,
        join: Some(join),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEnumerator;
    use serialport::{SerialPortInfo, SerialPortType, UsbPortInfo};

    fn usb(port: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: port.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    #[test]
    fn filter_keeps_only_matching_identity() {
        let ports = vec![
            usb("COM9", cartridge::VID, cartridge::PID),
            usb("COM3", cartridge::VID, 0x5740),
            usb("COM4", 0x16C0, cartridge::PID),
            SerialPortInfo {
                port_name: "COM1".to_string(),
                port_type: SerialPortType::Unknown,
            },
            usb("COM2", cartridge::VID, cartridge::PID),
        ];
        let found = filter_ports(ports, cartridge::VID, cartridge::PID);
        let names: Vec<_> = found.iter().map(|d| d.port_name.as_str()).collect();
        assert_eq!(names, ["COM2", "COM9"]);
    }

    #[test]
    fn scan_reports_appear_and_remove_once() {
        let sims = SimEnumerator::default();
        let mut scanner = DeviceScanner::new(sims.clone());

        sims.plug(DeviceInfo::from_port("a", 1, 2));
        sims.plug(DeviceInfo::from_port("b", 1, 2));
        let ev = scanner.scan_once().unwrap();
        assert_eq!(ev.len(), 2);
        assert!(scanner.scan_once().unwrap().is_empty());

        sims.unplug(&DeviceId::new("a"));
        let ev = scanner.scan_once().unwrap();
        assert_eq!(ev, vec![ScanEvent::Removed { id: DeviceId::new("a") }]);
    }

    #[test]
    fn spawned_scanner_forwards_events_and_stops() {
        let sims = SimEnumerator::default();
        sims.plug(DeviceInfo::from_port("a", 1, 2));

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = spawn(sims, Duration::from_millis(5), tx).unwrap();
        let ev = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(ev, ScanEvent::Appeared(ref d) if d.port_name == "a"));
        handle.stop();
    }
}
