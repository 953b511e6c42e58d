use crate::config::Config;
use crate::metrics::Collector;
use crate::model::State;
use anyhow::{Context, Result, ensure};
use rand_chacha::ChaCha12Rng;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Bumped whenever the layout of [`Checkpoint`] changes.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Complete snapshot of a run between two days.
///
/// Includes the generator so that a resumed run follows the same
/// trajectory as an uninterrupted one.
#[derive(Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub cfg: Config,
    pub state: State,
    pub metrics: Collector,
    pub rng: ChaCha12Rng,
}

/// Borrowed view of a [`Checkpoint`], serialized identically.
#[derive(Serialize)]
pub struct CheckpointRef<'a> {
    pub version: u32,
    pub cfg: &'a Config,
    pub state: &'a State,
    pub metrics: &'a Collector,
    pub rng: &'a ChaCha12Rng,
}

impl CheckpointRef<'_> {
    /// Write the checkpoint to `file`, replacing any previous one atomically.
    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let tmp_file = file.with_extension("msgpack.tmp");
        {
            let handle = File::create(&tmp_file)
                .with_context(|| format!("failed to create {tmp_file:?}"))?;
            let mut writer = BufWriter::new(handle);
            encode::write_named(&mut writer, self).context("failed to serialize checkpoint")?;
            writer.flush().context("failed to flush writer stream")?;
        }
        fs::rename(&tmp_file, file)
            .with_context(|| format!("failed to move {tmp_file:?} to {file:?}"))?;
        log::info!("saved {file:?}");
        Ok(())
    }
}

impl Checkpoint {
    /// Load a previously saved checkpoint.
    ///
    /// # Errors
    /// Returns an error if the file is missing, cannot be deserialized or
    /// was written with a different format version.
    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let handle = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(handle);
        let checkpoint: Checkpoint =
            decode::from_read(&mut reader).context("failed to deserialize checkpoint")?;
        ensure!(
            checkpoint.version == CHECKPOINT_VERSION,
            "checkpoint version is {}, expected {CHECKPOINT_VERSION}",
            checkpoint.version
        );
        Ok(checkpoint)
    }
}

pub fn day_file(run_dir: &Path, day: usize) -> PathBuf {
    run_dir.join(format!("checkpoint-{day:04}.msgpack"))
}

pub fn final_file(run_dir: &Path) -> PathBuf {
    run_dir.join("checkpoint-final.msgpack")
}

/// Day index encoded in a per-day checkpoint file name.
pub fn parse_day(file: &Path) -> Option<usize> {
    file.file_stem()?
        .to_str()?
        .strip_prefix("checkpoint-")?
        .parse()
        .ok()
}
