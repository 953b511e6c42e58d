use crate::analysis::{self, Analyzer};
use crate::checkpoint::{self, Checkpoint};
use crate::config::Config;
use crate::engine::Engine;
use crate::oracle;
use anyhow::{Context, Result, bail};
use glob::glob;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    pub fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        let oracle = oracle::from_config(&self.cfg.oracle).context("failed to construct oracle")?;
        let mut engine = Engine::generate_initial_condition(self.cfg.clone(), oracle)
            .context("failed to generate initial condition")?;

        engine
            .perform_simulation(&run_dir)
            .context("failed to perform simulation")?;

        Ok(())
    }

    /// Continue a run from the checkpoint of `day`, or from its latest
    /// per-day checkpoint.
    pub fn resume_run(&self, run_idx: usize, day: Option<usize>) -> Result<()> {
        let run_dir = self.run_dir(run_idx);
        if !run_dir.is_dir() {
            bail!("{run_dir:?} does not exist");
        }

        let checkpoint_file = match day {
            Some(day) => checkpoint::day_file(&run_dir, day),
            None => self
                .latest_checkpoint_file(&run_dir)
                .context("failed to find latest checkpoint")?,
        };
        let ckpt = Checkpoint::load(&checkpoint_file)
            .with_context(|| format!("failed to load {checkpoint_file:?}"))?;
        if ckpt.cfg != self.cfg {
            bail!("checkpoint config differs from the current config");
        }
        log::info!("loaded {checkpoint_file:?} at day {}", ckpt.state.day);

        let oracle = oracle::from_config(&self.cfg.oracle).context("failed to construct oracle")?;
        let mut engine =
            Engine::from_checkpoint(ckpt, oracle).context("failed to restore engine")?;

        engine
            .perform_simulation(&run_dir)
            .context("failed to perform simulation")?;

        Ok(())
    }

    /// Export the reports of every finished run and summarize them.
    pub fn analyze_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        let mut analyzer = Analyzer::new();

        for run_idx in 0..n_runs {
            let run_dir = self.run_dir(run_idx);
            let final_file = checkpoint::final_file(&run_dir);
            if !final_file.exists() {
                log::warn!("{run_dir:?} has not finished, skipping");
                continue;
            }
            let ckpt = Checkpoint::load(&final_file)
                .with_context(|| format!("failed to load {final_file:?}"))?;

            ckpt.metrics
                .write_csv(run_dir.join("metrics.csv"))
                .context("failed to write metrics")?;
            analysis::write_agent_csv(&ckpt, run_dir.join("agents.csv"))
                .context("failed to write agent data")?;

            analyzer.add_run(&ckpt).context("failed to add run")?;
            log::info!("analyzed {run_dir:?}");
        }

        analyzer
            .save_results(self.sim_dir.join("summary.json"))
            .context("failed to save results")?;

        Ok(())
    }

    pub fn clean_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let run_dir = self.run_dir(run_idx);
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }

        let summary_file = self.sim_dir.join("summary.json");
        if summary_file.exists() {
            fs::remove_file(&summary_file)
                .with_context(|| format!("failed to remove {summary_file:?}"))?;
        }

        Ok(())
    }

    fn count_run_dirs(&self) -> Result<usize> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .count();
        Ok(count)
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    fn latest_checkpoint_file(&self, run_dir: &Path) -> Result<PathBuf> {
        let pattern = run_dir.join("checkpoint-[0-9]*.msgpack");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        glob(pattern)
            .context("failed to glob checkpoint files")?
            .filter_map(Result::ok)
            .filter_map(|file| Some((checkpoint::parse_day(&file)?, file)))
            .max_by_key(|&(day, _)| day)
            .map(|(_, file)| file)
            .with_context(|| format!("no checkpoint found in {run_dir:?}"))
    }
}
