//! Burner command codec.
//!
//! Every cartridge access is a single frame on the transport:
//!
//! ```text
//! [len:u16][cmd:u8][addr:u32][cmd-specific...][payload...][0x00 0x00]
//! ```
//!
//! `len` counts the whole frame, little-endian throughout. Flash commands
//! are AMD-style word writes issued through ROM writes once the cartridge
//! has been unlocked through the magic register.

use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use crate::cartridge::{self, FRAME_MAX_PAYLOAD, MAP_PAGES, ROM_WINDOW_SIZE};
use crate::error::ErrorKind;
use crate::flash::{cfi, CfiParseError, ChipId, FlashDescriptor};
use crate::poll::{PollPolicy, PollStep, Poller};
use crate::transport::{Transport, TransportError};

pub mod cmd {
    pub const ROM_PROGRAM: u8 = 0xF4;
    pub const ROM_WRITE: u8 = 0xF5;
    pub const ROM_READ: u8 = 0xF6;
    pub const RAM_WRITE: u8 = 0xF7;
    pub const RAM_READ: u8 = 0xF8;
}

/// Status byte returned by a successful buffered program.
pub const PROGRAM_OK: u8 = 0xAA;

/// Bytes preceding the data in a read reply.
pub const READ_REPLY_HEADER: usize = 2;

/// AMD/Spansion command set, word addresses.
pub mod amd {
    pub const UNLOCK1_WORD: u32 = 0x555;
    pub const UNLOCK2_WORD: u32 = 0x2AA;
    pub const UNLOCK1: u16 = 0xAA;
    pub const UNLOCK2: u16 = 0x55;

    pub const RESET: u16 = 0xF0;
    pub const AUTOSELECT: u16 = 0x90;
    pub const PROGRAM: u16 = 0xA0;
    pub const ERASE_SETUP: u16 = 0x80;
    pub const CHIP_ERASE: u16 = 0x10;
    pub const SECTOR_ERASE: u16 = 0x30;
    pub const STATUS_READ: u16 = 0x70;

    pub const PPB_ENTRY: u16 = 0xC0;
    pub const PPB_ERASE_SETUP: u16 = 0x80;
    pub const PPB_ERASE: u16 = 0x30;
    pub const SET_EXIT1: u16 = 0x90;
    pub const SET_EXIT2: u16 = 0x00;

    pub const ID_MANUFACTURER: u32 = 0x00;
    pub const ID_DEVICE: [u32; 3] = [0x01, 0x0E, 0x0F];

    pub const UNLOCK: [(u32, u16); 2] = [(UNLOCK1_WORD, UNLOCK1), (UNLOCK2_WORD, UNLOCK2)];

    pub const DQ0: u16 = 1 << 0;
    pub const DQ6: u16 = 1 << 6;
    pub const DQ7: u16 = 1 << 7;
}

bitflags! {
    /// Low nibble of the cartridge configuration register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConfigBits: u8 {
        /// Map SDRAM instead of flash into the ROM window.
        const SDRAM = 1 << 0;
        const SD_ENABLE = 1 << 1;
        const WRITE_ENABLE = 1 << 2;
        /// Select SRAM bank 1 instead of bank 0.
        const SRAM_BANK = 1 << 3;
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("command 0x{command:02X} at 0x{addr:08X} not acknowledged")]
    NotAcknowledged { command: u8, addr: u32 },

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("no CFI signature (read {found:02X?}); unsupported flash chip")]
    UnsupportedChip { found: [u8; 3] },

    #[error("erase at 0x{addr:08X} did not finish within {timeout:?}")]
    EraseTimeout { addr: u64, timeout: Duration },

    #[error("program at 0x{addr:08X} did not finish within {timeout:?}")]
    ProgramTimeout { addr: u64, timeout: Duration },

    #[error("buffered program at 0x{addr:08X} failed (status 0x{status:02X})")]
    ProgramFailed { addr: u64, status: u8 },

    #[error("sector 0x{sector:08X} is still PPB-locked after the clear sequence")]
    PpbUnlockFailed { sector: u64 },
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Transport(_) => ErrorKind::Transport,
            ProtocolError::NotAcknowledged { .. } | ProtocolError::FrameTooLarge { .. } => {
                ErrorKind::Protocol
            }
            ProtocolError::UnsupportedChip { .. } => ErrorKind::UnsupportedChip,
            ProtocolError::EraseTimeout { .. } => ErrorKind::EraseTimeout,
            ProtocolError::ProgramTimeout { .. } | ProtocolError::ProgramFailed { .. } => {
                ErrorKind::ProgramTimeout
            }
            ProtocolError::PpbUnlockFailed { .. } => ErrorKind::PpbUnlockFailed,
        }
    }

    /// Failures after which the worker must stop talking to the device.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_) | ProtocolError::UnsupportedChip { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// Bound on waiting for a write acknowledgement.
    pub handshake_timeout: Duration,
    /// Bound on waiting for read data.
    pub exchange_timeout: Duration,
    pub poll: PollPolicy,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(500),
            exchange_timeout: Duration::from_secs(5),
            poll: PollPolicy::default(),
        }
    }
}

fn config_value(bits: ConfigBits, ctrl: u8) -> u16 {
    ((ctrl as u16 & 0xF) << 4) | bits.bits() as u16
}

/// How a broken-off command sequence is cleared before it is replayed.
#[derive(Debug, Clone, Copy)]
enum Restart {
    /// Abandon a half-entered magic-register sequence.
    Magic,
    /// As `Magic`, then rewrite the config so page slots start over.
    Mapping,
    /// Leave any command set and return the flash to read mode.
    Flash,
}

/// Encodes one command frame.
pub fn encode_frame(command: u8, addr: u32, params: &[u8], payload: &[u8]) -> Vec<u8> {
    let len = 2 + 1 + 4 + params.len() + payload.len() + 2;
    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&(len as u16).to_le_bytes());
    frame.push(command);
    frame.extend_from_slice(&addr.to_le_bytes());
    frame.extend_from_slice(params);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[0, 0]);
    frame
}

pub struct Protocol<T: Transport = Box<dyn Transport>> {
    transport: T,
    opts: ProtocolOptions,
    config: ConfigBits,
    ctrl: u8,
    mapping: Option<[u8; MAP_PAGES]>,
    current_timeout: Option<Duration>,
}

impl<T: Transport> Protocol<T> {
    pub fn new(transport: T, opts: ProtocolOptions) -> Self {
        Self {
            transport,
            opts,
            config: ConfigBits::empty(),
            ctrl: cartridge::CTRL_DEFAULT,
            mapping: None,
            current_timeout: None,
        }
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.opts
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Last configuration written through [`Protocol::set_config`].
    pub fn config(&self) -> ConfigBits {
        self.config
    }

    fn use_timeout(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        if self.current_timeout != Some(timeout) {
            self.transport.set_timeout(timeout)?;
            self.current_timeout = Some(timeout);
        }
        Ok(())
    }

    /// Sends `frame` and reads `reply_len` bytes. A timeout is retried once
    /// after discarding stale input; a second timeout is surfaced as
    /// [`ProtocolError::NotAcknowledged`]. Only for frames that are safe to
    /// apply twice.
    fn exchange(
        &mut self,
        frame: &[u8],
        reply_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.transact(frame, reply_len, timeout, 2)
    }

    /// Single attempt, for one cycle of a command sequence.
    fn exchange_once(
        &mut self,
        frame: &[u8],
        reply_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.transact(frame, reply_len, timeout, 1)
    }

    fn transact(
        &mut self,
        frame: &[u8],
        reply_len: usize,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.use_timeout(timeout)?;
        let mut reply = vec![0u8; reply_len];
        for attempt in 1..=attempts {
            self.transport.write_all(frame)?;
            match self.transport.read_exact(&mut reply) {
                Ok(()) => return Ok(reply),
                Err(TransportError::Timeout) if attempt < attempts => {
                    tracing::warn!(command = frame[2], "no reply, retrying once");
                    self.transport.discard_input()?;
                }
                Err(TransportError::Timeout) => break,
                Err(e) => return Err(e.into()),
            }
        }
        let addr = u32::from_le_bytes([frame[3], frame[4], frame[5], frame[6]]);
        Err(ProtocolError::NotAcknowledged {
            command: frame[2],
            addr,
        })
    }

    fn check_payload(len: usize) -> Result<(), ProtocolError> {
        if len > FRAME_MAX_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: FRAME_MAX_PAYLOAD,
            });
        }
        Ok(())
    }

    // --- raw memory access -------------------------------------------------

    /// Writes `data` into the ROM window at `word_addr` (16-bit units).
    pub fn write_rom(&mut self, word_addr: u32, data: &[u8]) -> Result<(), ProtocolError> {
        Self::check_payload(data.len())?;
        let frame = encode_frame(cmd::ROM_WRITE, word_addr, &[], data);
        let timeout = self.opts.handshake_timeout;
        self.exchange(&frame, 1, timeout)?;
        Ok(())
    }

    /// Single-word write that is harmless to repeat (reset, query entry,
    /// latch values).
    pub fn write_rom_word(&mut self, word_addr: u32, value: u16) -> Result<(), ProtocolError> {
        self.write_rom(word_addr, &value.to_le_bytes())
    }

    /// One cycle of a command sequence. Never resent on its own: an ack
    /// lost after the cartridge applied the write would repeat the cycle.
    fn write_cycle(&mut self, word_addr: u32, value: u16) -> Result<(), ProtocolError> {
        let frame = encode_frame(cmd::ROM_WRITE, word_addr, &[], &value.to_le_bytes());
        let timeout = self.opts.handshake_timeout;
        self.exchange_once(&frame, 1, timeout)?;
        Ok(())
    }

    /// Runs a multi-cycle write sequence. If a cycle goes unacknowledged the
    /// partial state is cleared and the whole sequence is replayed once from
    /// its first cycle.
    fn sequence<F>(&mut self, restart: Restart, mut cycles: F) -> Result<(), ProtocolError>
    where
        F: FnMut(&mut Self) -> Result<(), ProtocolError>,
    {
        match cycles(self) {
            Err(ProtocolError::NotAcknowledged { command, addr }) => {
                tracing::warn!(command, addr, ?restart, "sequence not acknowledged, restarting");
                self.transport.discard_input()?;
                match restart {
                    Restart::Magic => self.write_magic(cartridge::MAGIC_IDLE)?,
                    Restart::Mapping => {
                        self.write_magic(cartridge::MAGIC_IDLE)?;
                        let value = config_value(self.config, self.ctrl);
                        self.config_cycles(value)?;
                    }
                    Restart::Flash => self.exit_command_set()?,
                }
                cycles(self)
            }
            r => r,
        }
    }

    /// Reads `len` bytes from the ROM window at byte address `addr`.
    pub fn read_rom(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, ProtocolError> {
        Self::check_payload(len)?;
        let frame = encode_frame(cmd::ROM_READ, addr, &(len as u16).to_le_bytes(), &[]);
        let timeout = self.opts.exchange_timeout;
        let mut reply = self.exchange(&frame, READ_REPLY_HEADER + len, timeout)?;
        reply.drain(..READ_REPLY_HEADER);
        Ok(reply)
    }

    pub fn read_rom_word(&mut self, word_addr: u32) -> Result<u16, ProtocolError> {
        let b = self.read_rom(word_addr << 1, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn write_ram(&mut self, addr: u32, data: &[u8]) -> Result<(), ProtocolError> {
        Self::check_payload(data.len())?;
        let frame = encode_frame(cmd::RAM_WRITE, addr, &[], data);
        let timeout = self.opts.handshake_timeout;
        self.exchange(&frame, 1, timeout)?;
        Ok(())
    }

    pub fn read_ram(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, ProtocolError> {
        Self::check_payload(len)?;
        let frame = encode_frame(cmd::RAM_READ, addr, &(len as u16).to_le_bytes(), &[]);
        let timeout = self.opts.exchange_timeout;
        let mut reply = self.exchange(&frame, READ_REPLY_HEADER + len, timeout)?;
        reply.drain(..READ_REPLY_HEADER);
        Ok(reply)
    }

    // --- magic register ----------------------------------------------------

    fn write_magic(&mut self, value: u16) -> Result<(), ProtocolError> {
        self.write_cycle(cartridge::MAGIC_ADDRESS >> 1, value)
    }

    fn config_cycles(&mut self, value: u16) -> Result<(), ProtocolError> {
        for v in [cartridge::MAGIC_UNLOCK, cartridge::MAGIC_UNLOCK, value, value] {
            self.write_magic(v)?;
        }
        Ok(())
    }

    /// Writes the configuration register with the default control nibble.
    pub fn set_config(&mut self, bits: ConfigBits) -> Result<(), ProtocolError> {
        self.set_config_with(bits, cartridge::CTRL_DEFAULT)
    }

    pub fn set_config_with(&mut self, bits: ConfigBits, ctrl: u8) -> Result<(), ProtocolError> {
        let value = config_value(bits, ctrl);
        self.sequence(Restart::Magic, |p| p.config_cycles(value))?;
        self.config = bits;
        self.ctrl = ctrl & 0xF;
        tracing::debug!(config = value, "config register written");
        Ok(())
    }

    /// Programs all eight page slots. A config write sends the cartridge
    /// back to the first slot, so a broken-off mapping restarts from there.
    pub fn set_flash_mapping(&mut self, mapping: [u8; MAP_PAGES]) -> Result<(), ProtocolError> {
        self.mapping = None;
        self.sequence(Restart::Mapping, |p| {
            for page in mapping {
                let page = page as u16;
                for v in [cartridge::MAGIC_FLASH_MAP, cartridge::MAGIC_FLASH_MAP, page, page] {
                    p.write_magic(v)?;
                }
            }
            Ok(())
        })?;
        self.mapping = Some(mapping);
        Ok(())
    }

    /// Maps the `segment`-th 32 MiB slice of flash into the ROM window.
    pub fn map_segment(&mut self, segment: u8) -> Result<(), ProtocolError> {
        let mapping = cartridge::identity_mapping(segment);
        if self.mapping == Some(mapping) {
            return Ok(());
        }
        tracing::debug!(segment, "switching flash segment");
        self.set_flash_mapping(mapping)
    }

    /// Unlock handshake run on connect.
    pub fn unlock(&mut self) -> Result<(), ProtocolError> {
        self.enter_flash_mode()
    }

    /// Write-enabled flash in the ROM window under the default control
    /// nibble, with the first segment mapped. Every flash step starts here,
    /// whatever an earlier SDRAM or SRAM step left behind.
    pub fn enter_flash_mode(&mut self) -> Result<(), ProtocolError> {
        self.set_config(ConfigBits::WRITE_ENABLE)?;
        self.mapping = None;
        self.map_segment(0)
    }

    /// Selects an SRAM bank. Leaves the SRAM control nibble in the config
    /// register; callers going back to flash or SDRAM rewrite the config.
    pub fn sram_bank_select(&mut self, bank: u8) -> Result<(), ProtocolError> {
        self.write_rom_word(cartridge::SRAM_BANK_LATCH_WORD, bank as u16)?;
        let mut bits = self.config;
        bits.set(ConfigBits::SRAM_BANK, bank & 1 == 1);
        self.set_config_with(bits, cartridge::CTRL_SRAM_BANK)
    }

    // --- flash -------------------------------------------------------------

    /// Maps the segment holding `offset` and returns the window byte address.
    fn window(&mut self, offset: u64) -> Result<u32, ProtocolError> {
        let segment = (offset / ROM_WINDOW_SIZE) as u8;
        self.map_segment(segment)?;
        Ok((offset % ROM_WINDOW_SIZE) as u32)
    }

    fn amd_cycles(&mut self, cycles: &[(u32, u16)]) -> Result<(), ProtocolError> {
        self.sequence(Restart::Flash, |p| {
            for &(word, value) in cycles {
                p.write_cycle(word, value)?;
            }
            Ok(())
        })
    }

    fn amd_command(&mut self, word_addr: u32, command: u16) -> Result<(), ProtocolError> {
        let [u1, u2] = amd::UNLOCK;
        self.amd_cycles(&[u1, u2, (word_addr, command)])
    }

    pub fn reset_flash(&mut self) -> Result<(), ProtocolError> {
        self.write_rom_word(0, amd::RESET)
    }

    /// Returns the chip to read mode after a timed-out embedded operation.
    fn abandon(&mut self) {
        if let Err(e) = self.reset_flash() {
            tracing::warn!(error = %e, "flash reset after timeout failed");
        }
    }

    pub fn read_chip_id(&mut self) -> Result<ChipId, ProtocolError> {
        self.map_segment(0)?;
        self.amd_command(amd::UNLOCK1_WORD, amd::AUTOSELECT)?;
        let manufacturer = self.read_rom_word(amd::ID_MANUFACTURER)?;
        let mut device = [0u16; 3];
        for (slot, word) in device.iter_mut().zip(amd::ID_DEVICE) {
            *slot = self.read_rom_word(word)?;
        }
        self.reset_flash()?;
        Ok(ChipId {
            manufacturer,
            device,
        })
    }

    /// Reads chip id and CFI geometry.
    pub fn query_cfi(&mut self) -> Result<FlashDescriptor, ProtocolError> {
        let chip_id = self.read_chip_id()?;

        self.write_rom_word(cfi::QUERY_WORD, cfi::QUERY_CMD)?;
        let raw = self.read_rom(cfi::TABLE_START << 1, cfi::TABLE_WORDS * 2);
        self.reset_flash()?;
        let raw = raw?;

        let table: Vec<u8> = raw.chunks_exact(2).map(|w| w[0]).collect();
        let descriptor = FlashDescriptor::from_cfi(chip_id, &table).map_err(|e| match e {
            CfiParseError::MissingSignature { found } => ProtocolError::UnsupportedChip { found },
            CfiParseError::Truncated { .. } => ProtocolError::UnsupportedChip { found: [0; 3] },
        })?;

        tracing::info!(
            manufacturer = descriptor.chip_id.manufacturer,
            size = descriptor.total_size,
            regions = descriptor.regions.len(),
            buffer = descriptor.buffer_max,
            "flash identified"
        );
        Ok(descriptor)
    }

    /// Reads flash contents, chunked by frame size and segment.
    pub fn read_flash(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        let end = offset + len as u64;
        while pos < end {
            let to_segment_end = ROM_WINDOW_SIZE - (pos % ROM_WINDOW_SIZE);
            let n = (end - pos)
                .min(FRAME_MAX_PAYLOAD as u64)
                .min(to_segment_end) as usize;
            let addr = self.window(pos)?;
            out.extend_from_slice(&self.read_rom(addr, n)?);
            pos += n as u64;
        }
        Ok(out)
    }

    /// Waits for an embedded algorithm to finish using the toggle-bit
    /// technique: while busy, DQ6 flips on every read.
    fn wait_toggle(&mut self, word_addr: u32, timeout: Duration) -> Result<bool, ProtocolError> {
        let mut poller = Poller::new(self.opts.poll, timeout);
        loop {
            let a = self.read_rom_word(word_addr)?;
            let b = self.read_rom_word(word_addr)?;
            let busy = (a ^ b) & amd::DQ6 != 0;
            match poller.next(busy) {
                PollStep::Done => return Ok(true),
                PollStep::Backoff(d) => std::thread::sleep(d),
                PollStep::Expired => {
                    tracing::warn!(
                        word = word_addr,
                        probes = poller.probes(),
                        "device still busy at timeout"
                    );
                    return Ok(false);
                }
            }
        }
    }

    pub fn erase_chip(&mut self, desc: &FlashDescriptor) -> Result<(), ProtocolError> {
        self.map_segment(0)?;
        let [u1, u2] = amd::UNLOCK;
        self.amd_cycles(&[
            u1,
            u2,
            (amd::UNLOCK1_WORD, amd::ERASE_SETUP),
            u1,
            u2,
            (amd::UNLOCK1_WORD, amd::CHIP_ERASE),
        ])?;

        let timeout = desc.chip_erase_timeout;
        if !self.wait_toggle(0, timeout)? {
            // Leave the chip in read mode; it keeps erasing internally.
            self.abandon();
            return Err(ProtocolError::EraseTimeout {
                addr: 0,
                timeout: timeout.max(self.opts.poll.min_timeout),
            });
        }
        tracing::info!("chip erased");
        Ok(())
    }

    pub fn erase_sector(&mut self, desc: &FlashDescriptor, offset: u64) -> Result<(), ProtocolError> {
        let word = self.window(offset)? >> 1;
        let [u1, u2] = amd::UNLOCK;
        self.amd_cycles(&[
            u1,
            u2,
            (amd::UNLOCK1_WORD, amd::ERASE_SETUP),
            u1,
            u2,
            (word, amd::SECTOR_ERASE),
        ])?;

        let timeout = desc.sector_erase_timeout;
        if !self.wait_toggle(word, timeout)? {
            self.abandon();
            return Err(ProtocolError::EraseTimeout {
                addr: offset,
                timeout: timeout.max(self.opts.poll.min_timeout),
            });
        }
        tracing::debug!(offset, "sector erased");
        Ok(())
    }

    /// Programs `data` at flash `offset`.
    ///
    /// Uses one buffered-program transaction when the chip supports it and
    /// `data` fits the write buffer, otherwise programs word by word. The
    /// target range must already be erased and must not cross a segment.
    pub fn program_buffer(
        &mut self,
        desc: &FlashDescriptor,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        if desc.buffer_write && data.len() <= desc.buffer_max {
            return self.program_buffered(desc, offset, data);
        }
        self.program_words(desc, offset, data)
    }

    fn program_buffered(
        &mut self,
        desc: &FlashDescriptor,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let addr = self.window(offset)?;
        // Chips with buffers beyond one frame are driven one frame at a time.
        let buffer = desc.buffer_max.min(FRAME_MAX_PAYLOAD) as u16;
        let frame = encode_frame(cmd::ROM_PROGRAM, addr, &buffer.to_le_bytes(), data);
        // The firmware polls the chip itself before answering.
        let program_timeout = desc.buffer_program_timeout.max(self.opts.poll.min_timeout);
        let timeout = self.opts.handshake_timeout + program_timeout;
        let status = match self.exchange(&frame, 1, timeout) {
            Ok(reply) => reply[0],
            Err(ProtocolError::NotAcknowledged { .. }) => {
                return Err(ProtocolError::ProgramTimeout {
                    addr: offset,
                    timeout: program_timeout,
                });
            }
            Err(e) => return Err(e),
        };
        if status != PROGRAM_OK {
            return Err(ProtocolError::ProgramFailed {
                addr: offset,
                status,
            });
        }
        Ok(())
    }

    fn program_words(
        &mut self,
        desc: &FlashDescriptor,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let base = self.window(offset)? >> 1;
        for (i, pair) in data.chunks(2).enumerate() {
            let value = u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0xFF)]);
            if value == 0xFFFF {
                continue;
            }
            let word = base + i as u32;
            let [u1, u2] = amd::UNLOCK;
            self.amd_cycles(&[u1, u2, (amd::UNLOCK1_WORD, amd::PROGRAM), (word, value)])?;
            if !self.wait_toggle(word, desc.word_program_timeout)? {
                self.abandon();
                return Err(ProtocolError::ProgramTimeout {
                    addr: offset + 2 * i as u64,
                    timeout: desc.word_program_timeout.max(self.opts.poll.min_timeout),
                });
            }
        }
        Ok(())
    }

    fn exit_command_set(&mut self) -> Result<(), ProtocolError> {
        self.write_rom_word(0, amd::SET_EXIT1)?;
        self.write_rom_word(0, amd::SET_EXIT2)?;
        self.reset_flash()
    }

    /// Reads the persistent protection bit of the sector at `offset`.
    pub fn check_ppb_locked(&mut self, offset: u64) -> Result<bool, ProtocolError> {
        let word = self.window(offset)? >> 1;
        self.amd_command(amd::UNLOCK1_WORD, amd::PPB_ENTRY)?;
        let status = self.read_rom_word(word);
        self.exit_command_set()?;
        // DQ0 reads 0 for a protected sector.
        Ok(status? & amd::DQ0 == 0)
    }

    /// Clears all PPBs if the sector at `offset` is locked, then confirms.
    pub fn unlock_ppb(&mut self, desc: &FlashDescriptor, offset: u64) -> Result<(), ProtocolError> {
        if !self.check_ppb_locked(offset)? {
            return Ok(());
        }

        tracing::info!(offset, "clearing PPB protection");
        self.map_segment(0)?;
        let [u1, u2] = amd::UNLOCK;
        self.amd_cycles(&[
            u1,
            u2,
            (amd::UNLOCK1_WORD, amd::PPB_ENTRY),
            (0, amd::PPB_ERASE_SETUP),
            (0, amd::PPB_ERASE),
        ])?;

        let timeout = desc.sector_erase_timeout;
        let mut poller = Poller::new(self.opts.poll, timeout);
        let finished = loop {
            self.write_rom_word(amd::UNLOCK1_WORD, amd::STATUS_READ)?;
            let status = self.read_rom_word(0)?;
            match poller.next(status & amd::DQ7 == 0) {
                PollStep::Done => break true,
                PollStep::Backoff(d) => std::thread::sleep(d),
                PollStep::Expired => break false,
            }
        };
        self.exit_command_set()?;

        if !finished {
            return Err(ProtocolError::EraseTimeout {
                addr: offset,
                timeout: poller.timeout(),
            });
        }
        if self.check_ppb_locked(offset)? {
            return Err(ProtocolError::PpbUnlockFailed { sector: offset });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCartridge, SimConfig};

    fn proto(sim: &SimCartridge) -> Protocol<SimCartridge> {
        Protocol::new(sim.clone(), crate::sim::fast_protocol_options())
    }

    #[test]
    fn frame_layout() {
        let f = encode_frame(cmd::ROM_READ, 0x0102_0304, &[0x00, 0x10], &[]);
        assert_eq!(f, vec![11, 0, 0xF6, 0x04, 0x03, 0x02, 0x01, 0x00, 0x10, 0, 0]);

        let f = encode_frame(cmd::ROM_WRITE, 0x00FF_FFFF, &[], &0xA55Au16.to_le_bytes());
        assert_eq!(f[0], 11);
        assert_eq!(&f[7..9], &[0x5A, 0xA5]);
    }

    #[test]
    fn unlock_sets_config_and_mapping() {
        let sim = SimCartridge::new(SimConfig::default());
        let mut p = proto(&sim);
        p.unlock().unwrap();
        assert_eq!(sim.config_register() & 0xF, ConfigBits::WRITE_ENABLE.bits());
        assert_eq!(sim.mapping(), cartridge::identity_mapping(0));
    }

    #[test]
    fn unacknowledged_sequence_replayed_once_then_surfaced() {
        let sim = SimCartridge::new(SimConfig::default());
        let mut p = proto(&sim);

        sim.drop_frames(1);
        p.set_config(ConfigBits::WRITE_ENABLE).unwrap();

        sim.drop_frames(2);
        let err = p.set_config(ConfigBits::WRITE_ENABLE).unwrap_err();
        assert!(matches!(err, ProtocolError::NotAcknowledged { command: cmd::ROM_WRITE, .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn lost_config_ack_replays_the_whole_sequence() {
        for nth in 1..=4 {
            let sim = SimCartridge::new(SimConfig::default());
            let mut p = proto(&sim);
            sim.drop_ack(nth);
            p.set_config(ConfigBits::WRITE_ENABLE).unwrap();
            assert_eq!(sim.config_register(), 0x84, "ack of cycle {nth} lost");
        }
    }

    #[test]
    fn lost_mapping_ack_restarts_from_the_first_slot() {
        let mapping = cartridge::identity_mapping(1);
        for nth in 1..=(4 * MAP_PAGES as u64) {
            let sim = SimCartridge::new(SimConfig::default());
            let mut p = proto(&sim);
            sim.drop_ack(nth);
            p.set_flash_mapping(mapping).unwrap();
            assert_eq!(sim.mapping(), mapping, "ack of cycle {nth} lost");
        }
    }

    #[test]
    fn lost_unlock_cycle_ack_does_not_derail_flash_commands() {
        for nth in 1..=3 {
            let sim = SimCartridge::new(SimConfig::default());
            let mut p = proto(&sim);
            p.unlock().unwrap();
            sim.drop_ack(nth);
            let id = p.read_chip_id().unwrap();
            assert_eq!(id.manufacturer, SimConfig::default().manufacturer, "ack of cycle {nth} lost");
            assert_eq!(p.read_flash(0, 2).unwrap(), vec![0xFF, 0xFF]);
        }
    }

    #[test]
    fn enter_flash_mode_restores_default_control_nibble() {
        let sim = SimCartridge::new(SimConfig::default());
        let mut p = proto(&sim);
        p.unlock().unwrap();
        p.sram_bank_select(1).unwrap();
        assert_eq!(sim.config_register() >> 4, cartridge::CTRL_SRAM_BANK);
        p.set_config(ConfigBits::SDRAM).unwrap();

        p.enter_flash_mode().unwrap();
        assert_eq!(sim.config_register(), 0x84);
        assert_eq!(sim.mapping(), cartridge::identity_mapping(0));
    }

    #[test]
    fn oversized_write_buffer_is_driven_one_frame_at_a_time() {
        let sim = SimCartridge::new(SimConfig::default());
        let mut p = proto(&sim);
        p.unlock().unwrap();
        let mut d = p.query_cfi().unwrap();
        d.buffer_max = 1 << 16;

        p.erase_sector(&d, 0).unwrap();
        let data = vec![0x5Au8; 256];
        p.program_buffer(&d, 0, &data).unwrap();
        assert_eq!(p.read_flash(0, 256).unwrap(), data);
    }

    #[test]
    fn cfi_query_matches_simulated_geometry() {
        let sim = SimCartridge::new(SimConfig::default());
        let mut p = proto(&sim);
        p.unlock().unwrap();
        let d = p.query_cfi().unwrap();
        assert_eq!(d.total_size, SimConfig::default().flash_size as u64);
        assert_eq!(d.sector_table_size(), d.total_size);
        assert_eq!(d.chip_id.manufacturer, SimConfig::default().manufacturer);
    }

    #[test]
    fn missing_cfi_is_unsupported_chip() {
        let sim = SimCartridge::new(SimConfig {
            cfi_present: false,
            ..SimConfig::default()
        });
        let mut p = proto(&sim);
        p.unlock().unwrap();
        let err = p.query_cfi().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedChip);
    }

    #[test]
    fn word_programming_fallback_writes_data() {
        let sim = SimCartridge::new(SimConfig::default());
        let mut p = proto(&sim);
        p.unlock().unwrap();
        let mut d = p.query_cfi().unwrap();
        d.buffer_write = false;

        p.erase_sector(&d, 0).unwrap();
        p.program_buffer(&d, 0x10, &[1, 2, 3]).unwrap();
        assert_eq!(p.read_flash(0x10, 4).unwrap(), vec![1, 2, 3, 0xFF]);
    }

    #[test]
    fn erase_that_never_finishes_times_out() {
        let sim = SimCartridge::new(SimConfig::default());
        let mut p = proto(&sim);
        p.unlock().unwrap();
        let d = p.query_cfi().unwrap();

        sim.hang_erase(true);
        let err = p.erase_sector(&d, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EraseTimeout);
    }

    #[test]
    fn ppb_unlock_clears_lock() {
        let sim = SimCartridge::new(SimConfig {
            ppb_locked: true,
            ..SimConfig::default()
        });
        let mut p = proto(&sim);
        p.unlock().unwrap();
        let d = p.query_cfi().unwrap();

        assert!(p.check_ppb_locked(0).unwrap());
        p.unlock_ppb(&d, 0).unwrap();
        assert!(!p.check_ppb_locked(0).unwrap());
    }

    #[test]
    fn stuck_ppb_reports_unlock_failure() {
        let sim = SimCartridge::new(SimConfig {
            ppb_locked: true,
            ..SimConfig::default()
        });
        sim.stick_ppb(true);
        let mut p = proto(&sim);
        p.unlock().unwrap();
        let d = p.query_cfi().unwrap();

        let err = p.unlock_ppb(&d, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::PpbUnlockFailed { sector: 0 }));
    }
}
