//! Writing a ROM image to a cartridge: header compare, erase-as-needed,
//! chunked program, full verify.

use std::sync::Arc;

use serde::Serialize;

use crate::cartridge::{FRAME_MAX_PAYLOAD, HEADER_SIZE};
use crate::device::{self, Device, DeviceId};
use crate::flash::FlashDescriptor;
use crate::operation::{first_mismatch, CancelToken, Failure, OperationEvent, StepError};
use crate::protocol::Protocol;

#[derive(Debug, Clone)]
pub struct ProductionOptions {
    /// Leading bytes compared to decide whether the cartridge already holds
    /// the image.
    pub header_len: usize,
    pub verify_chunk: usize,
}

impl Default for ProductionOptions {
    fn default() -> Self {
        Self {
            header_len: HEADER_SIZE,
            verify_chunk: FRAME_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Pending,
    SkippedAlreadyCorrect,
    WrittenVerified,
    Failed(Failure),
}

impl JobOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            JobOutcome::SkippedAlreadyCorrect | JobOutcome::WrittenVerified
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Pending => "pending",
            JobOutcome::SkippedAlreadyCorrect => "skipped_already_correct",
            JobOutcome::WrittenVerified => "written_verified",
            JobOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub written: u64,
    pub total: u64,
}

/// One production run of one image on one device.
#[derive(Debug, Clone)]
pub struct ProductionJob {
    device: DeviceId,
    rom: Arc<[u8]>,
    progress: Progress,
    outcome: JobOutcome,
}

/// Flash is programmed in 16-bit words; odd images get a trailing zero.
pub fn pad_image(rom: Arc<[u8]>) -> Arc<[u8]> {
    if rom.len() % 2 == 0 {
        return rom;
    }
    let mut v = rom.to_vec();
    v.push(0x00);
    v.into()
}

impl ProductionJob {
    pub fn new(device: DeviceId, rom: Arc<[u8]>) -> Self {
        let rom = pad_image(rom);
        let total = rom.len() as u64;
        Self {
            device,
            rom,
            progress: Progress { written: 0, total },
            outcome: JobOutcome::Pending,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn outcome(&self) -> &JobOutcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> JobOutcome {
        self.outcome
    }

    /// Runs the job to a terminal outcome. Any failure aborts immediately;
    /// sectors already written are left as they are.
    pub fn run<F>(
        &mut self,
        dev: &mut Device,
        opts: &ProductionOptions,
        cancel: &CancelToken,
        on_event: &mut F,
    ) -> &JobOutcome
    where
        F: FnMut(OperationEvent),
    {
        self.outcome = match self.steps(dev, opts, cancel, on_event) {
            Ok(outcome) => outcome,
            Err(e) => {
                let e = cancel.classify(e);
                tracing::warn!(device = %self.device, error = %e, "production failed");
                JobOutcome::Failed(Failure::from(&e))
            }
        };
        &self.outcome
    }

    fn steps<F>(
        &mut self,
        dev: &mut Device,
        opts: &ProductionOptions,
        cancel: &CancelToken,
        on_event: &mut F,
    ) -> Result<JobOutcome, StepError>
    where
        F: FnMut(OperationEvent),
    {
        cancel.checkpoint()?;
        device::enter_flash(dev, on_event)?;
        let (p, desc) = dev.flash()?;

        let len = self.rom.len() as u64;
        if len > desc.total_size {
            return Err(StepError::ImageTooLarge {
                len,
                capacity: desc.total_size,
            });
        }

        // Only the header is compared; a matching header is taken to mean
        // the whole image is already present.
        let header = self.rom.len().min(opts.header_len);
        let current = p.read_flash(0, header)?;
        if current[..] == self.rom[..header] {
            tracing::info!(device = %self.device, "header matches, skipping write");
            on_event(OperationEvent::HeaderMatched {
                device: self.device.clone(),
            });
            return Ok(JobOutcome::SkippedAlreadyCorrect);
        }

        cancel.checkpoint()?;
        self.erase(p, desc, cancel, on_event)?;
        self.write(p, desc, cancel, on_event)?;
        self.verify(p, opts, cancel, on_event)?;

        tracing::info!(device = %self.device, bytes = len, "image written and verified");
        Ok(JobOutcome::WrittenVerified)
    }

    fn erase<F>(
        &mut self,
        p: &mut Protocol,
        desc: &FlashDescriptor,
        cancel: &CancelToken,
        on_event: &mut F,
    ) -> Result<(), StepError>
    where
        F: FnMut(OperationEvent),
    {
        let len = self.rom.len() as u64;
        let sectors = desc.sectors_covering(len);
        let covered = sectors.last().map(|s| s.offset + s.size).unwrap_or(0);

        if sectors.is_empty() || covered < len {
            on_event(OperationEvent::EraseStart {
                device: self.device.clone(),
                sectors: 0,
                bytes: desc.total_size,
            });
            p.erase_chip(desc)?;
            return Ok(());
        }

        on_event(OperationEvent::EraseStart {
            device: self.device.clone(),
            sectors: sectors.len(),
            bytes: covered,
        });
        let total = sectors.len();
        for (index, s) in sectors.into_iter().enumerate() {
            cancel.checkpoint()?;
            p.erase_sector(desc, s.offset)?;
            on_event(OperationEvent::SectorErased {
                device: self.device.clone(),
                index,
                total,
                offset: s.offset,
            });
        }
        Ok(())
    }

    fn write<F>(
        &mut self,
        p: &mut Protocol,
        desc: &FlashDescriptor,
        cancel: &CancelToken,
        on_event: &mut F,
    ) -> Result<(), StepError>
    where
        F: FnMut(OperationEvent),
    {
        let chunk = if desc.buffer_write {
            desc.buffer_max.min(FRAME_MAX_PAYLOAD)
        } else {
            FRAME_MAX_PAYLOAD
        };

        let rom = self.rom.clone();
        let mut offset = 0usize;
        for data in rom.chunks(chunk) {
            cancel.checkpoint()?;
            p.program_buffer(desc, offset as u64, data)?;
            offset += data.len();

            self.progress.written = offset as u64;
            on_event(OperationEvent::Write {
                device: self.device.clone(),
                written: self.progress.written,
                total: self.progress.total,
            });
        }
        Ok(())
    }

    fn verify<F>(
        &mut self,
        p: &mut Protocol,
        opts: &ProductionOptions,
        cancel: &CancelToken,
        on_event: &mut F,
    ) -> Result<(), StepError>
    where
        F: FnMut(OperationEvent),
    {
        on_event(OperationEvent::VerifyStart {
            device: self.device.clone(),
            total: self.progress.total,
        });

        let step = opts.verify_chunk.clamp(2, FRAME_MAX_PAYLOAD);
        let mut offset = 0usize;
        for expected in self.rom.chunks(step) {
            cancel.checkpoint()?;
            let actual = p.read_flash(offset as u64, expected.len())?;
            if let Some(e) = first_mismatch(offset as u64, expected, &actual) {
                return Err(e);
            }
            offset += expected.len();
        }
        Ok(())
    }
}
