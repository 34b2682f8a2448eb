//! Cartridge quality check: SDRAM, SRAM banks, flash blank state, PPB lock.

use serde::Serialize;

use crate::cartridge::{FRAME_MAX_PAYLOAD, SRAM_BANKS, SRAM_BANK_SIZE};
use crate::device::{self, Device, DeviceId};
use crate::operation::{first_mismatch, CancelToken, Failure, OperationEvent, StepError};
use crate::protocol::{ConfigBits, Protocol, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Sdram,
    Sram,
    FlashBlank,
    PpbUnlock,
}

impl CheckName {
    /// Execution order.
    pub const ALL: [CheckName; 4] = [
        CheckName::Sdram,
        CheckName::Sram,
        CheckName::FlashBlank,
        CheckName::PpbUnlock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CheckName::Sdram => "sdram",
            CheckName::Sram => "sram",
            CheckName::FlashBlank => "flash_blank",
            CheckName::PpbUnlock => "ppb_unlock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub check: CheckName,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl CheckResult {
    fn pass(check: CheckName, detail: String) -> Self {
        Self {
            check,
            status: CheckStatus::Pass,
            detail: Some(detail),
            failure: None,
        }
    }

    fn fail(check: CheckName, failure: Failure) -> Self {
        Self {
            check,
            status: CheckStatus::Fail,
            detail: None,
            failure: Some(failure),
        }
    }

    fn skipped(check: CheckName, detail: &str) -> Self {
        Self {
            check,
            status: CheckStatus::Skipped,
            detail: Some(detail.to_string()),
            failure: None,
        }
    }
}

/// Outcome of one quality-check run. Every run builds a fresh report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityCheckReport {
    pub device: DeviceId,
    pub results: Vec<CheckResult>,
    /// Set when a fatal error stopped the run; later checks are `Skipped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<Failure>,
    pub diagnostics: Vec<String>,
}

impl QualityCheckReport {
    pub fn status(&self, check: CheckName) -> Option<CheckStatus> {
        self.results
            .iter()
            .find(|r| r.check == check)
            .map(|r| r.status)
    }

    pub fn passed(&self) -> bool {
        self.aborted.is_none() && self.results.iter().all(|r| r.status != CheckStatus::Fail)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.status == CheckStatus::Fail)
    }
}

/// How thoroughly the SRAM banks are exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SramCheckMode {
    /// A four-byte write and read-back at the start of bank 0.
    Basic,
    /// Every bank, `sram_test_len` bytes each.
    #[default]
    Full,
}

/// What the flash blank check covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashCheckMode {
    /// Read the start of flash and chip-erase it if anything is programmed.
    #[default]
    Blank,
    /// Sector-erase and blank-verify the first and last 4 MiB plus four
    /// 2 MiB regions at seed-chosen offsets.
    Fast,
}

#[derive(Debug, Clone)]
pub struct QualityCheckConfig {
    pub sdram: bool,
    pub sram: bool,
    pub flash_blank: bool,
    pub ppb_unlock: bool,
    pub sram_mode: SramCheckMode,
    pub flash_mode: FlashCheckMode,
    /// Bytes of SDRAM exercised from the start of the window.
    pub sdram_test_len: usize,
    /// Bytes tested in each SRAM bank.
    pub sram_test_len: usize,
    /// Leading flash bytes that must read 0xFF.
    pub blank_check_len: usize,
    /// Drives the test patterns and the fast-check region offsets.
    pub seed: u32,
}

impl Default for QualityCheckConfig {
    fn default() -> Self {
        Self {
            sdram: true,
            sram: true,
            flash_blank: true,
            ppb_unlock: true,
            sram_mode: SramCheckMode::default(),
            flash_mode: FlashCheckMode::default(),
            sdram_test_len: 256 * 1024,
            sram_test_len: SRAM_BANK_SIZE,
            blank_check_len: 4096,
            seed: 0x2545_F491,
        }
    }
}

impl QualityCheckConfig {
    pub fn enabled(&self, check: CheckName) -> bool {
        match check {
            CheckName::Sdram => self.sdram,
            CheckName::Sram => self.sram,
            CheckName::FlashBlank => self.flash_blank,
            CheckName::PpbUnlock => self.ppb_unlock,
        }
    }
}

fn xorshift(x: &mut u32) -> u32 {
    *x ^= *x << 13;
    *x ^= *x >> 17;
    *x ^= *x << 5;
    *x
}

/// Deterministic xorshift32 byte stream.
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    let mut x = seed.max(1);
    let mut out = Vec::with_capacity(len + 3);
    while out.len() < len {
        out.extend_from_slice(&xorshift(&mut x).to_le_bytes());
    }
    out.truncate(len);
    out
}

const MIB: u64 = 1024 * 1024;
pub const FAST_EDGE_LEN: u64 = 4 * MIB;
pub const FAST_SAMPLE_LEN: u64 = 2 * MIB;
pub const FAST_SAMPLES: usize = 4;

/// `(start, len)` regions covered by the fast flash check: both 4 MiB
/// edges, then 2 MiB samples placed between them. Regions are clamped to
/// the chip and may overlap on small parts.
pub fn fast_regions(total_size: u64, seed: u32) -> Vec<(u64, u64)> {
    let edge = FAST_EDGE_LEN.min(total_size);
    let mut regions = vec![(0, edge), (total_size - edge, edge)];

    // Samples start in [edge, total - edge - sample].
    let span = total_size.saturating_sub(2 * FAST_EDGE_LEN + FAST_SAMPLE_LEN);
    if span > 0 {
        let mut x = seed.max(1);
        for _ in 0..FAST_SAMPLES {
            let start = FAST_EDGE_LEN + u64::from(xorshift(&mut x)) % span;
            regions.push((start, FAST_SAMPLE_LEN));
        }
    }
    regions
}

/// Runs the enabled checks in order. A failed check does not stop the run;
/// a fatal error (device gone, unsupported chip, cancellation) does, and the
/// remaining checks are reported as skipped.
pub fn run_quality_check<F>(
    device: &mut Device,
    cfg: &QualityCheckConfig,
    cancel: &CancelToken,
    on_event: &mut F,
) -> QualityCheckReport
where
    F: FnMut(OperationEvent),
{
    let id = device.id().clone();
    let mut results = Vec::with_capacity(CheckName::ALL.len());
    let mut diagnostics = Vec::new();
    let mut aborted: Option<Failure> = None;

    for check in CheckName::ALL {
        let result = if aborted.is_some() {
            CheckResult::skipped(check, "not run after fatal error")
        } else if !cfg.enabled(check) {
            CheckResult::skipped(check, "disabled")
        } else if let Err(e) = cancel.checkpoint() {
            aborted = Some(Failure::from(&e));
            CheckResult::skipped(check, "not run after fatal error")
        } else {
            on_event(OperationEvent::CheckStart {
                device: id.clone(),
                check,
            });
            let outcome = match check {
                CheckName::Sdram => sdram_test(device.protocol_mut(), cfg, cancel),
                CheckName::Sram => sram_test(device.protocol_mut(), cfg, cancel),
                CheckName::FlashBlank => match cfg.flash_mode {
                    FlashCheckMode::Blank => blank_check(device, cfg, on_event),
                    FlashCheckMode::Fast => fast_flash_check(device, cfg, cancel, on_event),
                },
                CheckName::PpbUnlock => ppb_check(device, on_event),
            };
            match outcome {
                Ok(detail) => {
                    tracing::info!(device = %id, check = check.as_str(), "check passed");
                    CheckResult::pass(check, detail)
                }
                Err(e) => {
                    let e = cancel.classify(e);
                    tracing::warn!(device = %id, check = check.as_str(), error = %e, "check failed");
                    diagnostics.push(format!("{}: {e}", check.as_str()));
                    if e.is_fatal() {
                        aborted = Some(Failure::from(&e));
                    }
                    if matches!(e, StepError::Cancelled) {
                        CheckResult::skipped(check, "cancelled")
                    } else {
                        CheckResult::fail(check, Failure::from(&e))
                    }
                }
            }
        };

        on_event(OperationEvent::CheckDone {
            device: id.clone(),
            result: result.clone(),
        });
        results.push(result);
    }

    QualityCheckReport {
        device: id,
        results,
        aborted,
        diagnostics,
    }
}

fn device_gone(e: &StepError) -> bool {
    matches!(
        e,
        StepError::DeviceLost | StepError::Protocol(ProtocolError::Transport(_))
    )
}

fn sdram_test(
    p: &mut Protocol,
    cfg: &QualityCheckConfig,
    cancel: &CancelToken,
) -> Result<String, StepError> {
    let original = p.config();
    p.set_config(ConfigBits::SDRAM | ConfigBits::WRITE_ENABLE)?;
    let result = sdram_pattern(p, cfg, cancel);
    if !matches!(&result, Err(e) if device_gone(e)) {
        p.set_config(original)?;
    }
    result
}

fn sdram_pattern(
    p: &mut Protocol,
    cfg: &QualityCheckConfig,
    cancel: &CancelToken,
) -> Result<String, StepError> {
    let data = pattern(cfg.seed, cfg.sdram_test_len);

    // All writes before any read so address aliasing shows up.
    for (i, chunk) in data.chunks(FRAME_MAX_PAYLOAD).enumerate() {
        cancel.checkpoint()?;
        let offset = (i * FRAME_MAX_PAYLOAD) as u32;
        p.write_rom(offset >> 1, chunk)?;
    }
    for (i, chunk) in data.chunks(FRAME_MAX_PAYLOAD).enumerate() {
        cancel.checkpoint()?;
        let offset = i * FRAME_MAX_PAYLOAD;
        let read = p.read_rom(offset as u32, chunk.len())?;
        if let Some(e) = first_mismatch(offset as u64, chunk, &read) {
            return Err(e);
        }
    }
    Ok(format!("{} bytes verified", data.len()))
}

fn sram_test(
    p: &mut Protocol,
    cfg: &QualityCheckConfig,
    cancel: &CancelToken,
) -> Result<String, StepError> {
    let original = p.config();
    let result = match cfg.sram_mode {
        SramCheckMode::Basic => sram_probe(p),
        SramCheckMode::Full => sram_banks(p, cfg, cancel),
    };
    if !matches!(&result, Err(e) if device_gone(e)) {
        p.sram_bank_select(u8::from(original.contains(ConfigBits::SRAM_BANK)))?;
        // Bank selection leaves the SRAM control nibble behind.
        p.set_config(original)?;
    }
    result
}

pub const SRAM_PROBE: [u8; 4] = [0xAA, 0x55, 0x12, 0x34];

fn sram_probe(p: &mut Protocol) -> Result<String, StepError> {
    p.sram_bank_select(0)?;
    p.write_ram(0, &SRAM_PROBE)?;
    let read = p.read_ram(0, SRAM_PROBE.len())?;
    if let Some(e) = first_mismatch(0, &SRAM_PROBE, &read) {
        return Err(e);
    }
    Ok("bank 0 probe verified".to_string())
}

fn sram_banks(
    p: &mut Protocol,
    cfg: &QualityCheckConfig,
    cancel: &CancelToken,
) -> Result<String, StepError> {
    let len = cfg.sram_test_len.min(SRAM_BANK_SIZE);
    let patterns: Vec<Vec<u8>> = (0..SRAM_BANKS)
        .map(|bank| pattern(cfg.seed ^ (0x9E37_79B9u32.wrapping_mul(bank as u32 + 1)), len))
        .collect();

    // Fill every bank first: a stuck bank-select line makes the last bank
    // overwrite the others, which the read pass then catches.
    for (bank, data) in patterns.iter().enumerate() {
        p.sram_bank_select(bank as u8)?;
        for (i, chunk) in data.chunks(FRAME_MAX_PAYLOAD).enumerate() {
            cancel.checkpoint()?;
            p.write_ram((i * FRAME_MAX_PAYLOAD) as u32, chunk)?;
        }
    }
    for (bank, data) in patterns.iter().enumerate() {
        p.sram_bank_select(bank as u8)?;
        for (i, chunk) in data.chunks(FRAME_MAX_PAYLOAD).enumerate() {
            cancel.checkpoint()?;
            let offset = i * FRAME_MAX_PAYLOAD;
            let read = p.read_ram(offset as u32, chunk.len())?;
            let base = (bank * SRAM_BANK_SIZE + offset) as u64;
            if let Some(e) = first_mismatch(base, chunk, &read) {
                return Err(e);
            }
        }
    }
    Ok(format!("{} banks x {len} bytes verified", SRAM_BANKS))
}

fn first_non_blank(data: &[u8]) -> Option<usize> {
    data.iter().position(|b| *b != 0xFF)
}

fn blank_check<F>(
    device: &mut Device,
    cfg: &QualityCheckConfig,
    on_event: &mut F,
) -> Result<String, StepError>
where
    F: FnMut(OperationEvent),
{
    device::enter_flash(device, on_event)?;
    let id = device.id().clone();
    let (p, desc) = device.flash()?;
    let len = (cfg.blank_check_len as u64).min(desc.total_size) as usize;

    let data = p.read_flash(0, len)?;
    if first_non_blank(&data).is_none() {
        return Ok("already blank".to_string());
    }

    tracing::info!(device = %id, "flash not blank, erasing chip");
    p.erase_chip(desc)?;

    let data = p.read_flash(0, len)?;
    match first_non_blank(&data) {
        None => Ok("blank after chip erase".to_string()),
        Some(i) => Err(StepError::VerifyMismatch {
            offset: i as u64,
            expected: 0xFF,
            actual: data[i],
        }),
    }
}

fn fast_flash_check<F>(
    device: &mut Device,
    cfg: &QualityCheckConfig,
    cancel: &CancelToken,
    on_event: &mut F,
) -> Result<String, StepError>
where
    F: FnMut(OperationEvent),
{
    device::enter_flash(device, on_event)?;
    let id = device.id().clone();
    let (p, desc) = device.flash()?;

    let regions = fast_regions(desc.total_size, cfg.seed);
    let mut sectors: Vec<_> = regions
        .iter()
        .flat_map(|&(start, len)| desc.sectors_in(start, len))
        .collect();
    sectors.sort_by_key(|s| s.offset);
    sectors.dedup_by_key(|s| s.offset);

    let total = sectors.len();
    on_event(OperationEvent::EraseStart {
        device: id.clone(),
        sectors: total,
        bytes: sectors.iter().map(|s| s.size).sum(),
    });
    for (index, s) in sectors.iter().enumerate() {
        cancel.checkpoint()?;
        p.erase_sector(desc, s.offset)?;
        on_event(OperationEvent::SectorErased {
            device: id.clone(),
            index,
            total,
            offset: s.offset,
        });
    }

    for s in &sectors {
        let mut offset = s.offset;
        let end = s.offset + s.size;
        while offset < end {
            cancel.checkpoint()?;
            let n = (end - offset).min(FRAME_MAX_PAYLOAD as u64) as usize;
            let data = p.read_flash(offset, n)?;
            if let Some(i) = first_non_blank(&data) {
                return Err(StepError::VerifyMismatch {
                    offset: offset + i as u64,
                    expected: 0xFF,
                    actual: data[i],
                });
            }
            offset += n as u64;
        }
    }

    let bytes: u64 = sectors.iter().map(|s| s.size).sum();
    Ok(format!("{total} sectors ({bytes} bytes) erased and blank"))
}

fn ppb_check<F>(device: &mut Device, on_event: &mut F) -> Result<String, StepError>
where
    F: FnMut(OperationEvent),
{
    device::enter_flash(device, on_event)?;
    let (p, desc) = device.flash()?;
    if !p.check_ppb_locked(0)? {
        return Ok("sector 0 not locked".to_string());
    }
    p.unlock_ppb(desc, 0)?;
    Ok("sector 0 unlocked".to_string())
}
