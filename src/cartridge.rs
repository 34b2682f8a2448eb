//! Fixed constants of the SuperChis burner and cartridge address space.

/// USB identity of the supported burner (STM32 CDC bridge).
pub const VID: u16 = 0x0483;
pub const PID: u16 = 0x0721;

pub const BAUD_RATE: u32 = 115_200;

/// Byte address of the magic register inside the 32 MiB ROM window.
pub const MAGIC_ADDRESS: u32 = 0x01FF_FFFE;
pub const MAGIC_UNLOCK: u16 = 0xA55A;
pub const MAGIC_FLASH_MAP: u16 = 0xA558;
/// Written to the magic address to break off a half-entered sequence.
pub const MAGIC_IDLE: u16 = 0x0000;

/// Control nibble sent in the upper half of the config byte.
pub const CTRL_DEFAULT: u8 = 0x8;
/// Control nibble used when only the SRAM bank bit should change.
pub const CTRL_SRAM_BANK: u8 = 0xF ^ (1 << 3);

/// ROM word address of the bank latch used by older cartridge revisions.
pub const SRAM_BANK_LATCH_WORD: u32 = 0x0080_0000;
pub const SRAM_BANK_SIZE: usize = 64 * 1024;
pub const SRAM_BANKS: u8 = 2;

/// The cartridge bus exposes 32 MiB of ROM, split into eight 4 MiB pages
/// that can each be mapped onto any 4 MiB page of the flash chip.
pub const ROM_WINDOW_SIZE: u64 = 32 * 1024 * 1024;
pub const MAP_PAGE_SIZE: u64 = 4 * 1024 * 1024;
pub const MAP_PAGES: usize = 8;

/// Largest payload carried by a single transport frame.
pub const FRAME_MAX_PAYLOAD: usize = 4096;

/// Length of the header region compared before production.
pub const HEADER_SIZE: usize = 4096;

/// Flash metadata region that holds the NOR game table.
pub const FLASH_META_OFFSET: u64 = 0x0020_0000;
pub const FLASH_META_SIZE: u64 = 0x0020_0000;

pub const DEFAULT_BACKUP_SIZE: u64 = 128 * 1024 * 1024;

pub(crate) fn identity_mapping(segment: u8) -> [u8; MAP_PAGES] {
    let base = segment.wrapping_mul(MAP_PAGES as u8);
    let mut m = [0u8; MAP_PAGES];
    for (i, page) in m.iter_mut().enumerate() {
        *page = base.wrapping_add(i as u8);
    }
    m
}
