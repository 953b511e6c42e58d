use crate::checkpoint::Checkpoint;
use crate::model::Health;
use crate::stats::Accumulator;
use anyhow::{Context, Result};
use serde::Serialize;
use std::{fs::File, io::BufWriter, path::Path};

/// Observable summarizing one finished run.
pub trait Obs {
    fn update(&mut self, ckpt: &Checkpoint) -> Result<()>;
    fn report(&self) -> serde_json::Value;
}

/// Largest number of simultaneously infected agents.
pub struct PeakInfected {
    acc: Accumulator,
}

impl PeakInfected {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(),
        }
    }
}

impl Obs for PeakInfected {
    fn update(&mut self, ckpt: &Checkpoint) -> Result<()> {
        let infected = ckpt
            .metrics
            .column("Infected")
            .context("metrics have no infected column")?;
        let peak = infected.into_iter().max().unwrap_or(0);
        self.acc.add(peak as f64);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "peak_infected": self.acc.report() })
    }
}

/// Fraction of the population infected at some point during the run.
pub struct AttackRate {
    acc: Accumulator,
}

impl AttackRate {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(),
        }
    }
}

impl Obs for AttackRate {
    fn update(&mut self, ckpt: &Checkpoint) -> Result<()> {
        let state = &ckpt.state;
        let n_agt = state.population();
        let n_sus = ckpt
            .metrics
            .column("Susceptible")
            .and_then(|col| col.last().copied())
            .context("metrics have no susceptible rows")?;
        self.acc.add((n_agt as f64 - n_sus as f64) / n_agt as f64);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "attack_rate": self.acc.report() })
    }
}

/// Number of simulated days.
pub struct EpidemicLength {
    acc: Accumulator,
}

impl EpidemicLength {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(),
        }
    }
}

impl Obs for EpidemicLength {
    fn update(&mut self, ckpt: &Checkpoint) -> Result<()> {
        self.acc.add(ckpt.state.day as f64);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "epidemic_length": self.acc.report() })
    }
}

pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new() -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(PeakInfected::new()),
            Box::new(AttackRate::new()),
            Box::new(EpidemicLength::new()),
        ];
        Self { obs_ptr_vec }
    }

    pub fn add_run(&mut self, ckpt: &Checkpoint) -> Result<()> {
        for obs in &mut self.obs_ptr_vec {
            obs.update(ckpt).context("failed to update observable")?;
        }
        Ok(())
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);

        let reports: Vec<_> = self.obs_ptr_vec.iter().map(|obs| obs.report()).collect();
        serde_json::to_writer_pretty(writer, &reports).context("failed to serialize results")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct AgentDayRow<'a> {
    id: usize,
    name: &'a str,
    age: u32,
    extraversion: &'a str,
    agreeableness: &'a str,
    conscientiousness: &'a str,
    neuroticism: &'a str,
    openness: &'a str,
    day: usize,
    health: &'static str,
    day_infected: Option<u32>,
    narrative: &'a str,
    choice: &'static str,
    fallback: bool,
    rationale: Option<&'a str>,
    location: &'static str,
}

/// Write one row per agent per recorded day.
pub fn write_agent_csv<P: AsRef<Path>>(ckpt: &Checkpoint, file: P) -> Result<()> {
    let file = file.as_ref();
    let mut writer =
        csv::Writer::from_path(file).with_context(|| format!("failed to create {file:?}"))?;

    for agt in &ckpt.state.agents {
        let profile = agt.profile();
        let [extraversion, agreeableness, conscientiousness, neuroticism, openness] =
            &profile.traits;
        for (&day, record) in agt.history() {
            let day_infected = match record.health {
                Health::Infected { day } => Some(day),
                _ => None,
            };
            writer
                .serialize(AgentDayRow {
                    id: agt.id(),
                    name: &profile.name,
                    age: profile.age,
                    extraversion,
                    agreeableness,
                    conscientiousness,
                    neuroticism,
                    openness,
                    day,
                    health: record.health.label(),
                    day_infected,
                    narrative: &record.narrative,
                    choice: record.choice.label(),
                    fallback: record.fallback,
                    rationale: record.rationale.as_deref(),
                    location: record.location.label(),
                })
                .context("failed to write row")?;
        }
    }
    writer.flush().context("failed to flush writer stream")?;

    Ok(())
}
