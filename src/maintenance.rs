//! Service operations outside the production line: clearing the NOR game
//! table and dumping flash to a file.

use std::io::Write;

use crate::cartridge::{FLASH_META_OFFSET, FLASH_META_SIZE, FRAME_MAX_PAYLOAD};
use crate::device::{self, Device};
use crate::operation::{CancelToken, OperationEvent, StepError};

/// Bytes at the start of the metadata region that must read blank afterwards.
pub const RESET_VERIFY_LEN: usize = 512;

/// Clears PPB protection and erases the flash metadata region so the
/// cartridge menu no longer lists NOR games.
pub fn reset_nor<F>(dev: &mut Device, cancel: &CancelToken, on_event: &mut F) -> Result<(), StepError>
where
    F: FnMut(OperationEvent),
{
    cancel.checkpoint()?;
    device::enter_flash(dev, on_event)?;
    let id = dev.id().clone();
    let (p, desc) = dev.flash()?;

    p.unlock_ppb(desc, 0)?;

    let sectors = desc.sectors_in(FLASH_META_OFFSET, FLASH_META_SIZE);
    on_event(OperationEvent::EraseStart {
        device: id.clone(),
        sectors: sectors.len(),
        bytes: sectors.iter().map(|s| s.size).sum(),
    });
    let total = sectors.len();
    for (index, s) in sectors.into_iter().enumerate() {
        cancel.checkpoint()?;
        p.erase_sector(desc, s.offset)?;
        on_event(OperationEvent::SectorErased {
            device: id.clone(),
            index,
            total,
            offset: s.offset,
        });
    }

    if FLASH_META_OFFSET < desc.total_size {
        let len = RESET_VERIFY_LEN.min((desc.total_size - FLASH_META_OFFSET) as usize);
        let data = p.read_flash(FLASH_META_OFFSET, len)?;
        if let Some(i) = data.iter().position(|b| *b != 0xFF) {
            return Err(StepError::VerifyMismatch {
                offset: FLASH_META_OFFSET + i as u64,
                expected: 0xFF,
                actual: data[i],
            });
        }
    }

    tracing::info!(device = %id, "NOR game table cleared");
    Ok(())
}

/// Streams up to `limit` bytes of flash (capped at the chip size) into
/// `out`. Returns the number of bytes written.
pub fn backup<W, F>(
    dev: &mut Device,
    out: &mut W,
    limit: u64,
    cancel: &CancelToken,
    on_event: &mut F,
) -> Result<u64, StepError>
where
    W: Write,
    F: FnMut(OperationEvent),
{
    cancel.checkpoint()?;
    device::enter_flash(dev, on_event)?;
    let id = dev.id().clone();
    let (p, desc) = dev.flash()?;

    let total = limit.min(desc.total_size);
    let mut read = 0u64;
    while read < total {
        cancel.checkpoint()?;
        let n = (total - read).min(FRAME_MAX_PAYLOAD as u64) as usize;
        let data = p.read_flash(read, n)?;
        out.write_all(&data)?;
        read += n as u64;
        on_event(OperationEvent::Read {
            device: id.clone(),
            read,
            total,
        });
    }
    out.flush()?;

    tracing::info!(device = %id, bytes = total, "flash backup complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{connect, DeviceInfo};
    use crate::error::ErrorKind;
    use crate::sim::{fast_protocol_options, SimCartridge, SimConfig, SimConnector};

    fn setup(cfg: SimConfig) -> (Device, SimCartridge) {
        let connector = SimConnector::default();
        let info = DeviceInfo::from_port("sim", 0x0483, 0x0721);
        let sim = connector.insert(&info.id, SimCartridge::new(cfg));
        let dev = connect(&connector, info, fast_protocol_options()).unwrap();
        (dev, sim)
    }

    #[test]
    fn reset_erases_metadata_only() {
        let (mut dev, sim) = setup(SimConfig {
            ppb_locked: true,
            ..SimConfig::default()
        });
        sim.load_flash(0x100, &[0xAB; 8]);
        sim.load_flash(FLASH_META_OFFSET as usize, &[0x00; 64]);

        reset_nor(&mut dev, &CancelToken::new(), &mut |_| {}).unwrap();

        assert_eq!(sim.flash(FLASH_META_OFFSET as usize, 64), vec![0xFF; 64]);
        assert_eq!(sim.flash(0x100, 8), vec![0xAB; 8]);
        assert!(!sim.ppb_locked(0));
    }

    #[test]
    fn reset_reports_unerasable_metadata() {
        let (mut dev, sim) = setup(SimConfig::default());
        sim.stick_byte(FLASH_META_OFFSET as usize + 3, 0x00);
        let err = reset_nor(&mut dev, &CancelToken::new(), &mut |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerifyMismatch);
        assert_eq!(err.offset(), Some(FLASH_META_OFFSET + 3));
    }

    #[test]
    fn backup_streams_flash_into_a_file() {
        let (mut dev, sim) = setup(SimConfig::default());
        sim.load_flash(0, b"SUPERCHIS");
        sim.load_flash(9000, &[0x42; 3]);

        let mut file = tempfile::tempfile().unwrap();
        let mut last = (0, 0);
        let n = backup(&mut dev, &mut file, 10_000, &CancelToken::new(), &mut |ev| {
            if let OperationEvent::Read { read, total, .. } = ev {
                last = (read, total);
            }
        })
        .unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(last, (10_000, 10_000));

        use std::io::{Read, Seek, SeekFrom};
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut got = Vec::new();
        file.read_to_end(&mut got).unwrap();
        assert_eq!(got.len(), 10_000);
        assert_eq!(&got[..9], b"SUPERCHIS");
        assert_eq!(&got[9000..9003], &[0x42; 3]);
    }

    #[test]
    fn backup_is_capped_at_chip_size() {
        let (mut dev, _sim) = setup(SimConfig::default());
        let mut out = Vec::new();
        let n = backup(&mut dev, &mut out, u64::MAX, &CancelToken::new(), &mut |_| {}).unwrap();
        assert_eq!(n, SimConfig::default().flash_size as u64);
        assert_eq!(out.len() as u64, n);
    }
}
