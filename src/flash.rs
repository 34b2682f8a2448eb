//! CFI geometry of the cartridge NOR flash.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Word offsets (x16 mode) into the CFI query table.
pub mod cfi {
    pub const QUERY_WORD: u32 = 0x55;
    pub const QUERY_CMD: u16 = 0x98;

    /// First word read from the table; covers the `QRY` signature.
    pub const TABLE_START: u32 = 0x10;
    /// Words read from `TABLE_START`, enough for four erase regions.
    pub const TABLE_WORDS: usize = 0x30;

    pub const SIGNATURE: u32 = 0x10;
    pub const WORD_PROGRAM_TYP: u32 = 0x1F;
    pub const BUFFER_PROGRAM_TYP: u32 = 0x20;
    pub const BLOCK_ERASE_TYP: u32 = 0x21;
    pub const CHIP_ERASE_TYP: u32 = 0x22;
    pub const WORD_PROGRAM_MAX: u32 = 0x23;
    pub const BUFFER_PROGRAM_MAX: u32 = 0x24;
    pub const BLOCK_ERASE_MAX: u32 = 0x25;
    pub const CHIP_ERASE_MAX: u32 = 0x26;
    pub const DEVICE_SIZE: u32 = 0x27;
    pub const BUFFER_SIZE: u32 = 0x2A;
    pub const REGION_COUNT: u32 = 0x2C;
    pub const REGION_TABLE: u32 = 0x2D;

    pub const MAX_REGIONS: usize = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChipId {
    pub manufacturer: u16,
    pub device: [u16; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EraseRegion {
    pub sector_size: u64,
    pub sector_count: u32,
}

impl EraseRegion {
    pub fn len(&self) -> u64 {
        self.sector_size * self.sector_count as u64
    }
}

/// A single erasable sector, as an absolute flash range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashDescriptor {
    pub chip_id: ChipId,
    pub total_size: u64,
    pub regions: Vec<EraseRegion>,
    pub sector_erase_timeout: Duration,
    pub chip_erase_timeout: Duration,
    pub word_program_timeout: Duration,
    pub buffer_program_timeout: Duration,
    /// Largest buffered-program length in bytes; zero when unsupported.
    pub buffer_max: usize,
    pub buffer_write: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CfiParseError {
    #[error("CFI signature missing (read {found:02X?})")]
    MissingSignature { found: [u8; 3] },

    #[error("CFI table truncated at {words} words")]
    Truncated { words: usize },
}

impl FlashDescriptor {
    /// Parses the CFI table starting at word [`cfi::TABLE_START`].
    ///
    /// `table` holds one byte per CFI word (the low byte of each x16 read).
    pub fn from_cfi(chip_id: ChipId, table: &[u8]) -> Result<Self, CfiParseError> {
        if table.len() < cfi::TABLE_WORDS {
            return Err(CfiParseError::Truncated { words: table.len() });
        }
        let at = |word: u32| table[(word - cfi::TABLE_START) as usize];

        let sig = [
            at(cfi::SIGNATURE),
            at(cfi::SIGNATURE + 1),
            at(cfi::SIGNATURE + 2),
        ];
        if &sig != b"QRY" {
            return Err(CfiParseError::MissingSignature { found: sig });
        }

        let total_size = 1u64 << at(cfi::DEVICE_SIZE).min(40);

        let region_count = (at(cfi::REGION_COUNT) as usize).min(cfi::MAX_REGIONS);
        let mut regions = Vec::with_capacity(region_count);
        for i in 0..region_count {
            let base = cfi::REGION_TABLE + 4 * i as u32;
            let y = u16::from_le_bytes([at(base), at(base + 1)]) as u32;
            let z = u16::from_le_bytes([at(base + 2), at(base + 3)]) as u64;
            // z == 0 encodes 128-byte sectors per the CFI specification.
            let sector_size = if z == 0 { 128 } else { z * 256 };
            regions.push(EraseRegion {
                sector_size,
                sector_count: y + 1,
            });
        }

        let sector_count: u64 = regions.iter().map(|r| r.sector_count as u64).sum();

        let block_typ = exp2(at(cfi::BLOCK_ERASE_TYP));
        let block_max = block_typ * exp2(at(cfi::BLOCK_ERASE_MAX));
        let sector_erase_timeout = Duration::from_millis(block_max);

        let chip_typ = at(cfi::CHIP_ERASE_TYP);
        let chip_erase_timeout = if chip_typ == 0 {
            sector_erase_timeout.saturating_mul(sector_count.max(1) as u32)
        } else {
            Duration::from_millis(exp2(chip_typ) * exp2(at(cfi::CHIP_ERASE_MAX)))
        };

        let word_program_timeout = Duration::from_micros(
            exp2(at(cfi::WORD_PROGRAM_TYP)) * exp2(at(cfi::WORD_PROGRAM_MAX)),
        );

        let buffer_typ = at(cfi::BUFFER_PROGRAM_TYP);
        let buffer_bits = at(cfi::BUFFER_SIZE);
        let buffer_write = buffer_bits != 0 && buffer_typ != 0;
        let buffer_max = if buffer_write { 1usize << buffer_bits.min(16) } else { 0 };
        let buffer_program_timeout = if buffer_write {
            Duration::from_micros(exp2(buffer_typ) * exp2(at(cfi::BUFFER_PROGRAM_MAX)))
        } else {
            Duration::ZERO
        };

        Ok(Self {
            chip_id,
            total_size,
            regions,
            sector_erase_timeout,
            chip_erase_timeout,
            word_program_timeout,
            buffer_program_timeout,
            buffer_max,
            buffer_write,
        })
    }

    pub fn sector_table_size(&self) -> u64 {
        self.regions.iter().map(EraseRegion::len).sum()
    }

    pub fn has_sector_erase(&self) -> bool {
        !self.regions.is_empty()
    }

    pub fn sectors(&self) -> impl Iterator<Item = Sector> + '_ {
        self.regions
            .iter()
            .scan(0u64, |base, r| {
                let start = *base;
                *base += r.len();
                Some((start, *r))
            })
            .flat_map(|(start, r)| {
                (0..r.sector_count as u64).map(move |i| Sector {
                    offset: start + i * r.sector_size,
                    size: r.sector_size,
                })
            })
    }

    /// The sector containing `offset`, if inside the sector table.
    pub fn sector_at(&self, offset: u64) -> Option<Sector> {
        self.sectors()
            .find(|s| offset >= s.offset && offset < s.offset + s.size)
    }

    /// Minimal ordered set of sectors covering `[0, len)`.
    pub fn sectors_covering(&self, len: u64) -> Vec<Sector> {
        if len == 0 {
            return Vec::new();
        }
        self.sectors().take_while(|s| s.offset < len).collect()
    }

    /// Sectors overlapping `[start, start + len)`.
    pub fn sectors_in(&self, start: u64, len: u64) -> Vec<Sector> {
        let end = start.saturating_add(len);
        self.sectors()
            .filter(|s| s.offset < end && s.offset + s.size > start)
            .collect()
    }

    pub fn sector_count(&self) -> u64 {
        self.regions.iter().map(|r| r.sector_count as u64).sum()
    }
}

fn exp2(n: u8) -> u64 {
    1u64 << n.min(30)
}
