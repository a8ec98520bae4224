//! Records released audio to a mono 32-bit float WAV file.

use anyhow::Context;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::segment::AudioBlock;

pub struct WavRecorder {
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
    sample_rate: u32,
    samples: u64,
    duration_ms: u64,
    skipped: usize,
}

impl WavRecorder {
    /// Create (or truncate) `path` for audio at `sample_rate`.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(&path, spec)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            path,
            writer,
            sample_rate,
            samples: 0,
            duration_ms: 0,
            skipped: 0,
        })
    }

    /// Append one block. A block at another sample rate is skipped and
    /// `false` is returned.
    pub fn write_block(&mut self, block: &AudioBlock) -> anyhow::Result<bool> {
        if block.sample_rate != self.sample_rate {
            tracing::warn!(
                expected = self.sample_rate,
                got = block.sample_rate,
                samples = block.len(),
                "Skipping audio block with mismatched sample rate"
            );
            self.skipped += 1;
            return Ok(false);
        }
        for &sample in block.samples.iter() {
            self.writer
                .write_sample(sample)
                .with_context(|| format!("Failed to write {}", self.path.display()))?;
        }
        self.samples += block.len() as u64;
        self.duration_ms += block.duration_ms();
        Ok(true)
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }

    pub fn skipped_blocks(&self) -> usize {
        self.skipped
    }

    /// Fix up the header and flush the file.
    pub fn finalize(self) -> anyhow::Result<()> {
        let Self {
            path,
            writer,
            samples,
            duration_ms,
            skipped,
            ..
        } = self;
        writer
            .finalize()
            .with_context(|| format!("Failed to finalize {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            samples,
            duration_ms,
            skipped,
            "Audio written"
        );
        Ok(())
    }
}
