use thiserror::Error;

use crate::device::{DeviceId, DeviceInfo};

/// How a user names one burner on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Index(usize),
    Port(String),
    Serial(String),
}

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("index out of range: {index} (have {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("no device matched: {selector}")]
    NoMatch { selector: String },

    #[error("multiple devices matched: {selector}")]
    MultipleMatches { selector: String },
}

/// Accepts `index:N`, a bare index, `serial:SN`, `port:NAME` or a bare port name.
pub fn parse_selector(s: &str) -> Result<DeviceSelector, SelectorError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SelectorError::InvalidSelector("empty".to_string()));
    }

    let index = |rest: &str| {
        rest.parse::<usize>()
            .map(DeviceSelector::Index)
            .map_err(|_| SelectorError::InvalidSelector(format!("invalid index: {rest}")))
    };

    if let Some(rest) = s.strip_prefix("index:") {
        return index(rest.trim());
    }
    if let Some(rest) = s.strip_prefix("serial:") {
        return Ok(DeviceSelector::Serial(rest.trim().to_string()));
    }
    if let Some(rest) = s.strip_prefix("port:") {
        return Ok(DeviceSelector::Port(rest.trim().to_string()));
    }

    if s.chars().all(|c| c.is_ascii_digit()) {
        return index(s);
    }

    Ok(DeviceSelector::Port(s.to_string()))
}

pub fn resolve(selector: &DeviceSelector, devices: &[DeviceInfo]) -> Result<Vec<usize>, SelectorError> {
    match selector {
        DeviceSelector::Index(i) => {
            if *i >= devices.len() {
                return Err(SelectorError::IndexOutOfRange {
                    index: *i,
                    len: devices.len(),
                });
            }
            Ok(vec![*i])
        }
        DeviceSelector::Port(name) => Ok(matching(devices, |d| {
            d.port_name == *name || d.id.as_str() == name
        })),
        DeviceSelector::Serial(sn) => Ok(matching(devices, |d| {
            d.serial_number.as_deref() == Some(sn.as_str())
        })),
    }
}

fn matching(devices: &[DeviceInfo], pred: impl Fn(&DeviceInfo) -> bool) -> Vec<usize> {
    devices
        .iter()
        .enumerate()
        .filter_map(|(i, d)| pred(d).then_some(i))
        .collect()
}

pub fn resolve_one<'a>(
    selector: &DeviceSelector,
    devices: &'a [DeviceInfo],
) -> Result<&'a DeviceId, SelectorError> {
    let matches = resolve(selector, devices)?;
    match matches.as_slice() {
        [] => Err(SelectorError::NoMatch {
            selector: selector_string(selector),
        }),
        [i] => Ok(&devices[*i].id),
        _ => Err(SelectorError::MultipleMatches {
            selector: selector_string(selector),
        }),
    }
}

fn selector_string(s: &DeviceSelector) -> String {
    match s {
        DeviceSelector::Index(i) => format!("index:{i}"),
        DeviceSelector::Port(p) => format!("port:{p}"),
        DeviceSelector::Serial(sn) => format!("serial:{sn}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<DeviceInfo> {
        let mut a = DeviceInfo::from_port("/dev/ttyACM0", 0x0483, 0x0721);
        a.serial_number = Some("SC-0001".to_string());
        let b = DeviceInfo::from_port("/dev/ttyACM1", 0x0483, 0x0721);
        vec![a, b]
    }

    #[test]
    fn parses_selector_forms() {
        assert_eq!(parse_selector("index:0").unwrap(), DeviceSelector::Index(0));
        assert_eq!(parse_selector(" 2 ").unwrap(), DeviceSelector::Index(2));
        assert_eq!(
            parse_selector("serial:SC-0001").unwrap(),
            DeviceSelector::Serial("SC-0001".to_string())
        );
        assert_eq!(
            parse_selector("COM6").unwrap(),
            DeviceSelector::Port("COM6".to_string())
        );
        assert!(parse_selector("index:x").is_err());
        assert!(parse_selector("").is_err());
    }

    #[test]
    fn resolves_by_port_and_serial() {
        let devs = devices();
        let sel = parse_selector("/dev/ttyACM1").unwrap();
        assert_eq!(resolve_one(&sel, &devs).unwrap().as_str(), "/dev/ttyACM1");

        let sel = parse_selector("serial:SC-0001").unwrap();
        assert_eq!(resolve_one(&sel, &devs).unwrap(), &devs[0].id);
    }

    #[test]
    fn reports_missing_and_out_of_range() {
        let devs = devices();
        assert!(matches!(
            resolve_one(&DeviceSelector::Index(5), &devs),
            Err(SelectorError::IndexOutOfRange { index: 5, len: 2 })
        ));
        assert!(matches!(
            resolve_one(&parse_selector("COM9").unwrap(), &devs),
            Err(SelectorError::NoMatch { .. })
        ));
    }
}
