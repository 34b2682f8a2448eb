//! In-memory SuperChis cartridge behind a burner.
//!
//! [`SimCartridge`] speaks the burner wire protocol and emulates the config
//! register, the flash page mapping, SDRAM, two SRAM banks and an AMD-style
//! NOR flash with CFI, toggle-bit busy reporting and PPB protection. Faults
//! can be injected to exercise the failure paths of the state machines.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::cartridge::{self, MAP_PAGES, MAP_PAGE_SIZE, SRAM_BANK_SIZE};
use crate::device::{Connector, DeviceId, DeviceInfo};
use crate::flash::cfi;
use crate::poll::PollPolicy;
use crate::protocol::{amd, cmd, ConfigBits, ProtocolOptions, PROGRAM_OK};
use crate::scanner::{Enumerator, ScanError};
use crate::transport::{Transport, TransportError};

/// Protocol options tuned for the simulator: short handshakes and a small
/// timeout floor so fault tests finish quickly.
pub fn fast_protocol_options() -> ProtocolOptions {
    ProtocolOptions {
        handshake_timeout: Duration::from_millis(20),
        exchange_timeout: Duration::from_millis(20),
        poll: PollPolicy {
            initial_backoff: Duration::from_micros(100),
            max_backoff: Duration::from_millis(1),
            min_timeout: Duration::from_millis(50),
        },
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub flash_size: usize,
    pub manufacturer: u16,
    pub device_id: [u16; 3],
    /// `(sector_count, sector_size)` per erase region.
    pub regions: Vec<(u32, u64)>,
    /// log2 of the write buffer in bytes; zero disables buffered program.
    pub buffer_bits: u8,
    pub cfi_present: bool,
    pub ppb_locked: bool,
    pub sdram_size: usize,
    /// Busy reads reported after an erase or PPB clear.
    pub erase_busy_reads: u32,
    /// Busy reads reported after a word program.
    pub program_busy_reads: u32,
    /// Delay applied to every frame, to model USB latency.
    pub latency: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            flash_size: 4 * 1024 * 1024,
            manufacturer: 0x0001,
            device_id: [0x227E, 0x2228, 0x2201],
            regions: vec![(8, 8 * 1024), (63, 64 * 1024)],
            buffer_bits: 9,
            cfi_present: true,
            ppb_locked: false,
            sdram_size: 1024 * 1024,
            erase_busy_reads: 3,
            program_busy_reads: 1,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Magic {
    Idle,
    Unlock(u8),
    Config(u16),
    Map(u8),
    MapValue(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlashMode {
    Read,
    Autoselect,
    Query,
    Ppb,
}

#[derive(Debug, Default)]
struct Faults {
    stuck_bytes: BTreeMap<usize, u8>,
    hang_erase: bool,
    corrupt_after_program: Option<usize>,
    stuck_ppb: bool,
    stuck_sram_bank: bool,
    drop_frames: u32,
    /// Frame number whose reply is swallowed.
    drop_ack: Option<u64>,
    bad_sdram: Option<usize>,
    unplugged: bool,
}

struct SimState {
    cfg: SimConfig,
    config_reg: u8,
    mapping: [u8; MAP_PAGES],
    magic: Magic,
    map_index: usize,
    bank_latch: u16,

    sdram: Vec<u8>,
    sram: [Vec<u8>; 2],

    flash: Vec<u8>,
    cfi_table: Vec<u8>,
    mode: FlashMode,
    cycle: u8,
    erase_armed: bool,
    program_armed: bool,
    ppb_erase_armed: bool,
    ppb_exit_armed: bool,
    status_read: bool,
    busy_reads: u32,
    hung: bool,
    toggle: bool,
    ppb: Vec<bool>,

    faults: Faults,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
    frames: u64,
}

impl SimState {
    fn new(cfg: SimConfig) -> Self {
        let sectors = sector_table(&cfg).len();
        let cfi_table = build_cfi(&cfg);
        Self {
            config_reg: 0,
            mapping: cartridge::identity_mapping(0),
            magic: Magic::Idle,
            map_index: 0,
            bank_latch: 0,
            sdram: vec![0; cfg.sdram_size],
            sram: [vec![0; SRAM_BANK_SIZE], vec![0; SRAM_BANK_SIZE]],
            flash: vec![0xFF; cfg.flash_size],
            cfi_table,
            mode: FlashMode::Read,
            cycle: 0,
            erase_armed: false,
            program_armed: false,
            ppb_erase_armed: false,
            ppb_exit_armed: false,
            status_read: false,
            busy_reads: 0,
            hung: false,
            toggle: false,
            ppb: vec![cfg.ppb_locked; sectors.max(1)],
            faults: Faults::default(),
            inbox: Vec::new(),
            outbox: Vec::new(),
            frames: 0,
            cfg,
        }
    }

    fn bits(&self) -> ConfigBits {
        ConfigBits::from_bits_truncate(self.config_reg & 0xF)
    }

    // --- frames ------------------------------------------------------------

    fn pump(&mut self) {
        loop {
            if self.inbox.len() < 2 {
                return;
            }
            let len = u16::from_le_bytes([self.inbox[0], self.inbox[1]]) as usize;
            if len < 9 {
                // Unparseable; drop it like the firmware would.
                self.inbox.clear();
                return;
            }
            if self.inbox.len() < len {
                return;
            }
            let frame: Vec<u8> = self.inbox.drain(..len).collect();
            if self.faults.drop_frames > 0 {
                self.faults.drop_frames -= 1;
                continue;
            }
            self.frames += 1;
            let replied = self.outbox.len();
            self.handle_frame(&frame);
            if self.faults.drop_ack == Some(self.frames) {
                self.faults.drop_ack = None;
                self.outbox.truncate(replied);
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let command = frame[2];
        let addr = u32::from_le_bytes([frame[3], frame[4], frame[5], frame[6]]);
        let body = &frame[7..frame.len() - 2];
        let is_read = matches!(command, cmd::ROM_READ | cmd::RAM_READ | cmd::ROM_PROGRAM);
        if is_read && body.len() < 2 {
            return;
        }
        match command {
            cmd::ROM_WRITE => {
                for (i, w) in body.chunks(2).enumerate() {
                    let value = u16::from_le_bytes([w[0], w.get(1).copied().unwrap_or(0)]);
                    self.write_rom_word(addr + i as u32, value);
                }
                self.outbox.push(0x01);
            }
            cmd::ROM_READ => {
                let len = u16::from_le_bytes([body[0], body[1]]) as usize;
                self.outbox.extend_from_slice(&[0, 0]);
                for i in (0..len).step_by(2) {
                    let w = self.read_rom_word((addr as usize + i) >> 1);
                    let bytes = w.to_le_bytes();
                    self.outbox.push(bytes[0]);
                    if i + 1 < len {
                        self.outbox.push(bytes[1]);
                    }
                }
            }
            cmd::RAM_WRITE => {
                let bank = self.sram_bank();
                for (i, b) in body.iter().enumerate() {
                    let a = (addr as usize + i) % SRAM_BANK_SIZE;
                    self.sram[bank][a] = *b;
                }
                self.outbox.push(0x01);
            }
            cmd::RAM_READ => {
                let len = u16::from_le_bytes([body[0], body[1]]) as usize;
                let bank = self.sram_bank();
                self.outbox.extend_from_slice(&[0, 0]);
                for i in 0..len {
                    let a = (addr as usize + i) % SRAM_BANK_SIZE;
                    self.outbox.push(self.sram[bank][a]);
                }
            }
            cmd::ROM_PROGRAM => {
                let buffer = u16::from_le_bytes([body[0], body[1]]) as usize;
                let data = &body[2..];
                let status = if data.len() > buffer {
                    0x00
                } else {
                    self.buffered_program(addr as usize, data)
                };
                self.outbox.push(status);
            }
            _ => {}
        }
    }

    fn sram_bank(&self) -> usize {
        if self.faults.stuck_sram_bank {
            return 0;
        }
        usize::from(self.bits().contains(ConfigBits::SRAM_BANK))
    }

    // --- ROM window --------------------------------------------------------

    fn flash_addr(&self, window_byte: usize) -> usize {
        let page = (window_byte / MAP_PAGE_SIZE as usize) % MAP_PAGES;
        let within = window_byte % MAP_PAGE_SIZE as usize;
        (self.mapping[page] as usize * MAP_PAGE_SIZE as usize + within) % self.flash.len()
    }

    fn write_rom_word(&mut self, word: u32, value: u16) {
        if word == cartridge::MAGIC_ADDRESS >> 1 {
            self.write_magic(value);
            return;
        }
        if word == cartridge::SRAM_BANK_LATCH_WORD {
            self.bank_latch = value;
            return;
        }
        let byte = (word as usize) << 1;
        let bits = self.bits();
        if bits.contains(ConfigBits::SDRAM) {
            if bits.contains(ConfigBits::WRITE_ENABLE) {
                let a = byte % self.sdram.len();
                self.sdram[a..a + 2].copy_from_slice(&value.to_le_bytes());
            }
            return;
        }
        let flash = self.flash_addr(byte);
        self.flash_write(flash, value);
    }

    fn read_rom_word(&mut self, word: usize) -> u16 {
        let byte = word << 1;
        if self.bits().contains(ConfigBits::SDRAM) {
            let a = byte % self.sdram.len();
            let mut v = u16::from_le_bytes([self.sdram[a], self.sdram[a + 1]]);
            if let Some(bad) = self.faults.bad_sdram {
                if bad & !1 == a {
                    v ^= if bad & 1 == 0 { 0x0010 } else { 0x1000 };
                }
            }
            return v;
        }
        let flash = self.flash_addr(byte);
        self.flash_read(flash)
    }

    fn write_magic(&mut self, value: u16) {
        self.magic = match (self.magic, value) {
            (Magic::Unlock(1), cartridge::MAGIC_UNLOCK) => Magic::Unlock(2),
            (Magic::Unlock(2), v) => Magic::Config(v),
            (Magic::Config(prev), v) if prev == v => {
                self.config_reg = v as u8;
                self.map_index = 0;
                Magic::Idle
            }
            (Magic::Map(1), cartridge::MAGIC_FLASH_MAP) => Magic::Map(2),
            (Magic::Map(2), v) => Magic::MapValue(v),
            (Magic::MapValue(prev), v) if prev == v => {
                self.mapping[self.map_index] = v as u8;
                self.map_index = (self.map_index + 1) % MAP_PAGES;
                Magic::Idle
            }
            (_, cartridge::MAGIC_UNLOCK) => Magic::Unlock(1),
            (_, cartridge::MAGIC_FLASH_MAP) => Magic::Map(1),
            _ => Magic::Idle,
        };
    }

    // --- NOR flash ---------------------------------------------------------

    fn sector_index(&self, addr: usize) -> usize {
        let mut start = 0usize;
        for (i, (_, size)) in sector_table(&self.cfg).into_iter().enumerate() {
            if addr < start + size {
                return i;
            }
            start += size;
        }
        0
    }

    fn locked(&self, addr: usize) -> bool {
        self.ppb.get(self.sector_index(addr)).copied().unwrap_or(false)
    }

    fn flash_write(&mut self, addr: usize, value: u16) {
        let word = addr >> 1;
        let cmd = value & 0xFF;

        if self.mode == FlashMode::Ppb && cmd == amd::STATUS_READ {
            self.status_read = true;
            return;
        }
        if self.busy_reads > 0 || self.hung {
            return;
        }

        if self.program_armed {
            self.program_armed = false;
            if !self.locked(addr) {
                self.flash[addr] &= value as u8;
                self.flash[addr + 1] &= (value >> 8) as u8;
                self.after_program(addr, 2);
            }
            self.busy_reads = self.cfg.program_busy_reads;
            return;
        }

        if cmd == amd::RESET {
            self.reset_mode();
            return;
        }

        if self.mode == FlashMode::Ppb {
            match cmd {
                amd::PPB_ERASE_SETUP if self.cycle == 0 => self.ppb_erase_armed = true,
                amd::PPB_ERASE if self.ppb_erase_armed => {
                    self.ppb_erase_armed = false;
                    if !self.faults.stuck_ppb {
                        self.ppb.iter_mut().for_each(|b| *b = false);
                    }
                    self.busy_reads = self.cfg.erase_busy_reads;
                }
                amd::SET_EXIT1 => self.ppb_exit_armed = true,
                amd::SET_EXIT2 if self.ppb_exit_armed => self.reset_mode(),
                _ => {}
            }
            return;
        }

        if cmd == amd::SET_EXIT1 && self.cycle == 0 && self.mode != FlashMode::Read {
            self.ppb_exit_armed = true;
            return;
        }
        if cmd == amd::SET_EXIT2 && self.ppb_exit_armed {
            self.reset_mode();
            return;
        }

        if cmd == cfi::QUERY_CMD && word & 0xFF == cfi::QUERY_WORD as usize {
            if self.cfg.cfi_present {
                self.mode = FlashMode::Query;
            }
            return;
        }

        match self.cycle {
            0 if cmd == amd::UNLOCK1 && word & 0x7FF == amd::UNLOCK1_WORD as usize => {
                self.cycle = 1;
            }
            1 if cmd == amd::UNLOCK2 && word & 0x7FF == amd::UNLOCK2_WORD as usize => {
                self.cycle = 2;
            }
            2 => {
                self.cycle = 0;
                self.command(addr, cmd);
            }
            _ => self.cycle = 0,
        }
    }

    fn command(&mut self, addr: usize, cmd: u16) {
        match cmd {
            amd::AUTOSELECT => self.mode = FlashMode::Autoselect,
            amd::PROGRAM => self.program_armed = true,
            amd::ERASE_SETUP => self.erase_armed = true,
            amd::CHIP_ERASE if self.erase_armed => {
                self.erase_armed = false;
                let len = self.flash.len();
                self.erase_range(0, len);
            }
            amd::SECTOR_ERASE if self.erase_armed => {
                self.erase_armed = false;
                let (start, size) = self.sector_bounds(addr);
                self.erase_range(start, size);
            }
            amd::PPB_ENTRY => self.mode = FlashMode::Ppb,
            _ => self.erase_armed = false,
        }
    }

    fn sector_bounds(&self, addr: usize) -> (usize, usize) {
        let mut start = 0usize;
        for (_, size) in sector_table(&self.cfg) {
            if addr < start + size {
                return (start, size);
            }
            start += size;
        }
        (0, self.flash.len())
    }

    fn erase_range(&mut self, start: usize, len: usize) {
        if self.faults.hang_erase {
            self.hung = true;
            return;
        }
        let mut offset = start;
        while offset < start + len {
            let (s, size) = self.sector_bounds(offset);
            if !self.locked(s) {
                self.flash[s..s + size].fill(0xFF);
            }
            offset = s + size;
        }
        self.apply_stuck();
        self.busy_reads = self.cfg.erase_busy_reads;
    }

    fn after_program(&mut self, addr: usize, len: usize) {
        if let Some(at) = self.faults.corrupt_after_program {
            if at >= addr && at < addr + len {
                self.flash[at] ^= 0x01;
                self.faults.corrupt_after_program = None;
            }
        }
        self.apply_stuck();
    }

    fn apply_stuck(&mut self) {
        for (&at, &v) in &self.faults.stuck_bytes {
            if let Some(b) = self.flash.get_mut(at) {
                *b = v;
            }
        }
    }

    fn reset_mode(&mut self) {
        self.mode = FlashMode::Read;
        self.cycle = 0;
        self.erase_armed = false;
        self.program_armed = false;
        self.ppb_erase_armed = false;
        self.ppb_exit_armed = false;
        self.status_read = false;
    }

    fn busy(&mut self) -> bool {
        if self.hung {
            return true;
        }
        if self.busy_reads > 0 {
            self.busy_reads -= 1;
            return true;
        }
        false
    }

    fn flash_read(&mut self, addr: usize) -> u16 {
        if self.status_read {
            self.status_read = false;
            return if self.busy() { 0 } else { amd::DQ7 };
        }
        if self.busy() {
            self.toggle = !self.toggle;
            return if self.toggle { amd::DQ6 } else { 0 };
        }
        let word = addr >> 1;
        match self.mode {
            FlashMode::Read => u16::from_le_bytes([self.flash[addr & !1], self.flash[addr | 1]]),
            FlashMode::Autoselect => match word & 0xFF {
                0x00 => self.cfg.manufacturer,
                0x01 => self.cfg.device_id[0],
                0x0E => self.cfg.device_id[1],
                0x0F => self.cfg.device_id[2],
                _ => 0,
            },
            FlashMode::Query => self.cfi_table.get(word & 0xFF).copied().unwrap_or(0) as u16,
            FlashMode::Ppb => {
                if self.locked(addr) {
                    0
                } else {
                    amd::DQ0
                }
            }
        }
    }

    fn buffered_program(&mut self, window_byte: usize, data: &[u8]) -> u8 {
        if self.cfg.buffer_bits == 0 || data.len() > 1 << self.cfg.buffer_bits {
            return 0x00;
        }
        let start = self.flash_addr(window_byte);
        if self.hung || self.locked(start) {
            return 0x00;
        }
        for (i, b) in data.iter().enumerate() {
            let a = (start + i) % self.flash.len();
            self.flash[a] &= *b;
        }
        self.after_program(start, data.len());
        PROGRAM_OK
    }
}

fn sector_table(cfg: &SimConfig) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start = 0usize;
    for &(count, size) in &cfg.regions {
        for _ in 0..count {
            out.push((start, size as usize));
            start += size as usize;
        }
    }
    out
}

fn build_cfi(cfg: &SimConfig) -> Vec<u8> {
    let mut t = vec![0u8; 0x100];
    t[0x10..0x13].copy_from_slice(b"QRY");
    t[cfi::WORD_PROGRAM_TYP as usize] = 4;
    t[cfi::BUFFER_PROGRAM_TYP as usize] = if cfg.buffer_bits == 0 { 0 } else { 8 };
    t[cfi::BLOCK_ERASE_TYP as usize] = 4;
    t[cfi::CHIP_ERASE_TYP as usize] = 6;
    t[cfi::WORD_PROGRAM_MAX as usize] = 1;
    t[cfi::BUFFER_PROGRAM_MAX as usize] = 1;
    t[cfi::BLOCK_ERASE_MAX as usize] = 1;
    t[cfi::CHIP_ERASE_MAX as usize] = 1;
    t[cfi::DEVICE_SIZE as usize] = cfg.flash_size.trailing_zeros() as u8;
    t[cfi::BUFFER_SIZE as usize] = cfg.buffer_bits;
    t[cfi::REGION_COUNT as usize] = cfg.regions.len().min(cfi::MAX_REGIONS) as u8;
    for (i, &(count, size)) in cfg.regions.iter().take(cfi::MAX_REGIONS).enumerate() {
        let base = cfi::REGION_TABLE as usize + 4 * i;
        let y = (count - 1) as u16;
        let z = (size / 256) as u16;
        t[base..base + 2].copy_from_slice(&y.to_le_bytes());
        t[base + 2..base + 4].copy_from_slice(&z.to_le_bytes());
    }
    t
}

/// Shared handle to one simulated cartridge. Clones observe the same state.
#[derive(Clone)]
pub struct SimCartridge {
    state: Arc<Mutex<SimState>>,
    timeout: Duration,
}

impl SimCartridge {
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(cfg))),
            timeout: Duration::from_secs(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config_register(&self) -> u8 {
        self.lock().config_reg
    }

    pub fn mapping(&self) -> [u8; MAP_PAGES] {
        self.lock().mapping
    }

    /// Frames the cartridge has processed.
    pub fn frames_seen(&self) -> u64 {
        self.lock().frames
    }

    /// Writes flash contents directly, bypassing the command set.
    pub fn load_flash(&self, offset: usize, data: &[u8]) {
        self.lock().flash[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn flash(&self, offset: usize, len: usize) -> Vec<u8> {
        self.lock().flash[offset..offset + len].to_vec()
    }

    pub fn sram(&self, bank: usize, offset: usize, len: usize) -> Vec<u8> {
        self.lock().sram[bank][offset..offset + len].to_vec()
    }

    /// Last value written to the compatibility bank latch.
    pub fn bank_latch(&self) -> u16 {
        self.lock().bank_latch
    }

    pub fn ppb_locked(&self, offset: usize) -> bool {
        self.lock().locked(offset)
    }

    /// Pins a flash byte to `value` across every erase and program.
    pub fn stick_byte(&self, offset: usize, value: u8) {
        let mut s = self.lock();
        s.faults.stuck_bytes.insert(offset, value);
        s.apply_stuck();
    }

    /// Erases start but never complete.
    pub fn hang_erase(&self, on: bool) {
        self.lock().faults.hang_erase = on;
    }

    /// Flips one bit of `offset` right after it is next programmed.
    pub fn corrupt_after_program(&self, offset: usize) {
        self.lock().faults.corrupt_after_program = Some(offset);
    }

    pub fn stick_ppb(&self, on: bool) {
        self.lock().faults.stuck_ppb = on;
    }

    /// Bank-select line stuck low: every SRAM access hits bank 0.
    pub fn stick_sram_bank(&self, on: bool) {
        self.lock().faults.stuck_sram_bank = on;
    }

    /// A bad SDRAM cell at `offset` reads back with one bit flipped.
    pub fn bad_sdram_cell(&self, offset: usize) {
        self.lock().faults.bad_sdram = Some(offset);
    }

    /// Discards the next `n` frames without effect or reply.
    pub fn drop_frames(&self, n: u32) {
        self.lock().faults.drop_frames = n;
    }

    /// Applies the `nth` frame from now (1 = the next one) but swallows
    /// its reply, as if the ack was lost on the way back.
    pub fn drop_ack(&self, nth: u64) {
        let mut s = self.lock();
        s.faults.drop_ack = Some(s.frames + nth);
    }

    /// Simulates the USB cable being pulled.
    pub fn unplug(&self) {
        self.lock().faults.unplugged = true;
    }
}

impl Transport for SimCartridge {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let latency = {
            let mut s = self.lock();
            if s.faults.unplugged {
                return Err(TransportError::Disconnected("simulated unplug".to_string()));
            }
            s.inbox.extend_from_slice(data);
            s.pump();
            s.cfg.latency
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut s = self.lock();
        if s.faults.unplugged {
            return Err(TransportError::Disconnected("simulated unplug".to_string()));
        }
        if s.outbox.len() < buf.len() {
            return Err(TransportError::Timeout);
        }
        let bytes: Vec<u8> = s.outbox.drain(..buf.len()).collect();
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.lock().outbox.clear();
        Ok(())
    }
}

/// Hands out transports to simulated cartridges keyed by device id.
#[derive(Clone, Default)]
pub struct SimConnector {
    carts: Arc<Mutex<HashMap<DeviceId, SimCartridge>>>,
}

impl SimConnector {
    pub fn insert(&self, id: &DeviceId, cart: SimCartridge) -> SimCartridge {
        self.carts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), cart.clone());
        cart
    }

    pub fn get(&self, id: &DeviceId) -> Option<SimCartridge> {
        self.carts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl Connector for SimConnector {
    fn open(&self, info: &DeviceInfo) -> Result<Box<dyn Transport>, TransportError> {
        match self.get(&info.id) {
            Some(cart) => Ok(Box::new(cart)),
            None => Err(TransportError::Disconnected(format!(
                "no simulated cartridge at {}",
                info.id
            ))),
        }
    }
}

/// Attached-device list that tests plug and unplug by hand.
#[derive(Clone, Default)]
pub struct SimEnumerator {
    attached: Arc<Mutex<Vec<DeviceInfo>>>,
}

impl SimEnumerator {
    pub fn plug(&self, info: DeviceInfo) {
        let mut list = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        list.retain(|d| d.id != info.id);
        list.push(info);
    }

    pub fn unplug(&self, id: &DeviceId) {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|d| &d.id != id);
    }
}

impl Enumerator for SimEnumerator {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, ScanError> {
        Ok(self
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;

    fn send(sim: &mut SimCartridge, frame: Vec<u8>, reply: usize) -> Vec<u8> {
        sim.write_all(&frame).unwrap();
        let mut buf = vec![0u8; reply];
        sim.read_exact(&mut buf).unwrap();
        buf
    }

    fn magic(sim: &mut SimCartridge, v: u16) {
        let f = encode_frame(cmd::ROM_WRITE, cartridge::MAGIC_ADDRESS >> 1, &[], &v.to_le_bytes());
        send(sim, f, 1);
    }

    #[test]
    fn config_requires_doubled_magic_and_value() {
        let mut sim = SimCartridge::new(SimConfig::default());
        magic(&mut sim, cartridge::MAGIC_UNLOCK);
        magic(&mut sim, 0x84);
        magic(&mut sim, 0x84);
        assert_eq!(sim.config_register(), 0);

        for v in [cartridge::MAGIC_UNLOCK, cartridge::MAGIC_UNLOCK, 0x84, 0x84] {
            magic(&mut sim, v);
        }
        assert_eq!(sim.config_register(), 0x84);
    }

    #[test]
    fn split_frames_are_reassembled() {
        let mut sim = SimCartridge::new(SimConfig::default());
        sim.load_flash(0, &[0x12, 0x34]);
        let f = encode_frame(cmd::ROM_READ, 0, &2u16.to_le_bytes(), &[]);
        sim.write_all(&f[..4]).unwrap();
        sim.write_all(&f[4..]).unwrap();
        let mut buf = [0u8; 4];
        sim.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[2..], &[0x12, 0x34]);
    }

    #[test]
    fn dropped_ack_still_applies_the_frame() {
        let mut sim = SimCartridge::new(SimConfig::default());
        for v in [cartridge::MAGIC_UNLOCK, cartridge::MAGIC_UNLOCK, 0x84] {
            magic(&mut sim, v);
        }
        sim.drop_ack(1);
        let f = encode_frame(cmd::ROM_WRITE, cartridge::MAGIC_ADDRESS >> 1, &[], &0x84u16.to_le_bytes());
        sim.write_all(&f).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(sim.read_exact(&mut buf), Err(TransportError::Timeout)));
        assert_eq!(sim.config_register(), 0x84);
    }

    #[test]
    fn missing_reply_is_a_timeout() {
        let mut sim = SimCartridge::new(SimConfig::default());
        let mut buf = [0u8; 1];
        assert!(matches!(sim.read_exact(&mut buf), Err(TransportError::Timeout)));
    }

    #[test]
    fn unplugged_cartridge_is_disconnected() {
        let mut sim = SimCartridge::new(SimConfig::default());
        sim.unplug();
        let err = sim.write_all(&[0, 0]).unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
    }
}
