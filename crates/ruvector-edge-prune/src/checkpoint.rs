//! Run directory and checkpoints.
//!
//! A checkpoint is a pair of files written side by side:
//!
//! - `snapshot{suffix}.safetensors`: mask parameters, modal values and
//!   optimizer moments, plus a `meta.step` marker
//! - `metadata{suffix}.json`: training logs and optimizer step counters
//!
//! Both are written to temporary files and renamed into place. A checkpoint
//! is only loaded when both files exist and their step markers agree.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::log::TrainingLog;

const STEP_KEY: &str = "meta.step";
const FORMAT_VERSION: u32 = 1;

/// JSON side of a checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Layout version of the checkpoint files
    pub format_version: u32,
    /// Logged steps at save time
    pub step: usize,
    /// Per-step loss and sampler metrics
    pub log: TrainingLog,
    /// Parameter step-size metrics
    pub step_log: TrainingLog,
    /// Updates applied by the mask-parameter optimizer
    pub sampling_optim_step: usize,
    /// Updates applied by the modal-value optimizer
    pub modal_optim_step: usize,
}

impl CheckpointMeta {
    /// Metadata for the current training state
    pub fn new(log: TrainingLog, step_log: TrainingLog, sampling_optim_step: usize, modal_optim_step: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            step: log.t(),
            log,
            step_log,
            sampling_optim_step,
            modal_optim_step,
        }
    }
}

/// A loaded checkpoint.
#[derive(Debug)]
pub struct Checkpoint {
    /// Named tensors from the snapshot
    pub tensors: HashMap<String, Tensor>,
    /// Logs and counters
    pub meta: CheckpointMeta,
}

/// Directory holding the checkpoints and diagnostics of one run.
#[derive(Clone, Debug)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    /// Open (and create if needed) a run directory.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Open without touching the filesystem.
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Directory path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot path for a suffix (`""`, `"-{step}"`, `"-final"`)
    pub fn snapshot_path(&self, suffix: &str) -> PathBuf {
        self.root.join(format!("snapshot{suffix}.safetensors"))
    }

    /// Metadata path for a suffix
    pub fn metadata_path(&self, suffix: &str) -> PathBuf {
        self.root.join(format!("metadata{suffix}.json"))
    }

    /// Whether both files of a checkpoint exist
    pub fn exists(&self, suffix: &str) -> bool {
        self.snapshot_path(suffix).is_file() && self.metadata_path(suffix).is_file()
    }

    /// Write a checkpoint atomically per file, creating the directory if needed.
    pub fn save(&self, suffix: &str, tensors: &HashMap<String, Tensor>, meta: &CheckpointMeta) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let snapshot = self.snapshot_path(suffix);
        let metadata = self.metadata_path(suffix);
        let snapshot_tmp = snapshot.with_extension("safetensors.tmp");
        let metadata_tmp = metadata.with_extension("json.tmp");

        let device = tensors.values().next().map(|t| t.device().clone()).unwrap_or(Device::Cpu);
        let mut all = tensors.clone();
        all.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[meta.step as u32], &device)?,
        );
        candle_core::safetensors::save(&all, &snapshot_tmp)?;
        File::open(&snapshot_tmp)?.sync_all()?;

        let file = File::create(&metadata_tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, meta)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        fs::rename(&snapshot_tmp, &snapshot)?;
        fs::rename(&metadata_tmp, &metadata)?;
        tracing::debug!(path = %snapshot.display(), step = meta.step, "checkpoint saved");
        Ok(())
    }

    /// Load a checkpoint. `Ok(None)` when either file is missing.
    pub fn load(&self, suffix: &str, device: &Device) -> Result<Option<Checkpoint>> {
        if !self.exists(suffix) {
            return Ok(None);
        }
        let snapshot = self.snapshot_path(suffix);
        let mut tensors = candle_core::safetensors::load(&snapshot, device)
            .map_err(|e| Error::Checkpoint(format!("{}: {e}", snapshot.display())))?;

        let text = fs::read_to_string(self.metadata_path(suffix))?;
        let meta: CheckpointMeta = serde_json::from_str(&text)
            .map_err(|e| Error::Checkpoint(format!("metadata{suffix}.json: {e}")))?;
        if meta.format_version != FORMAT_VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint version {}",
                meta.format_version
            )));
        }

        let marker = tensors
            .remove(STEP_KEY)
            .ok_or_else(|| Error::Checkpoint(format!("{} has no step marker", snapshot.display())))?
            .to_vec1::<u32>()?;
        if marker.first().copied() != Some(meta.step as u32) {
            return Err(Error::Checkpoint(format!(
                "snapshot step {marker:?} does not match metadata step {}",
                meta.step
            )));
        }
        Ok(Some(Checkpoint { tensors, meta }))
    }
}
