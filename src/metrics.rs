use crate::model::{Health, Location, State};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pure function of the state producing one value of a metrics row.
pub type Reporter = fn(&State) -> u64;

pub static REPORTERS: [(&str, Reporter); 9] = [
    ("Step", step),
    ("Susceptible", susceptible),
    ("Infected", infected),
    ("Recovered", recovered),
    ("#Home", at_home),
    ("#Outside", outside),
    ("DailyNewCases", daily_new_cases),
    ("TotalContacts", total_contacts),
    ("Day4Infected", day4_infected),
];

fn step(state: &State) -> u64 {
    state.day as u64
}

fn susceptible(state: &State) -> u64 {
    state.count_health(|health| health == Health::Susceptible) as u64
}

fn infected(state: &State) -> u64 {
    state.count_health(|health| matches!(health, Health::Infected { .. })) as u64
}

fn recovered(state: &State) -> u64 {
    state.count_health(|health| health == Health::Recovered) as u64
}

fn at_home(state: &State) -> u64 {
    state.count_location(Location::Home) as u64
}

fn outside(state: &State) -> u64 {
    state.count_location(Location::Outside) as u64
}

fn daily_new_cases(state: &State) -> u64 {
    state.daily_new_cases as u64
}

fn total_contacts(state: &State) -> u64 {
    state.total_contacts as u64
}

fn day4_infected(state: &State) -> u64 {
    state.day4_infected as u64
}

fn standard_reporters() -> &'static [(&'static str, Reporter)] {
    &REPORTERS
}

/// Append-only time series with one column per reporter and one row per
/// collection point.
#[derive(Clone, Serialize, Deserialize)]
pub struct Collector {
    #[serde(skip, default = "standard_reporters")]
    reporters: &'static [(&'static str, Reporter)],
    rows: Vec<Vec<u64>>,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            reporters: standard_reporters(),
            rows: Vec::new(),
        }
    }

    /// Record one row from the current state.
    pub fn collect(&mut self, state: &State) {
        let row = self
            .reporters
            .iter()
            .map(|(_, reporter)| reporter(state))
            .collect();
        self.rows.push(row);
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.reporters.iter().map(|&(name, _)| name)
    }

    #[cfg(test)]
    pub fn rows(&self) -> &[Vec<u64>] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of the named column, one per row.
    pub fn column(&self, name: &str) -> Option<Vec<u64>> {
        let i_col = self.columns().position(|col| col == name)?;
        Some(self.rows.iter().map(|row| row[i_col]).collect())
    }

    pub fn write_csv<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let mut writer =
            csv::Writer::from_path(file).with_context(|| format!("failed to create {file:?}"))?;

        writer
            .write_record(self.columns())
            .context("failed to write header")?;
        for row in &self.rows {
            writer
                .write_record(row.iter().map(u64::to_string))
                .context("failed to write row")?;
        }
        writer.flush().context("failed to flush writer stream")?;

        Ok(())
    }
}
