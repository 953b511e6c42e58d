use crate::persona;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Epidemic model parameters.
    pub model: ModelConfig,
    /// Run length and execution parameters.
    pub run: RunConfig,
    /// Decision oracle selection.
    pub oracle: OracleConfig,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of agents that start susceptible.
    pub n_healthy: usize,
    /// Number of agents that start infected.
    pub n_infected: usize,

    /// Mean number of contacts per day when everyone is outside.
    pub contact_rate: f64,
    /// Transmission probability per infected-susceptible contact.
    pub infection_rate: f64,
    /// Number of infected days before recovery.
    pub heal_time: u32,
}

impl ModelConfig {
    pub fn population(&self) -> usize {
        self.n_healthy + self.n_infected
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum number of simulated days.
    pub max_days: usize,
    /// Size of the worker pool used for decision queries.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seed of the simulation generator (drawn from the OS if absent).
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    AlwaysHome,
    AlwaysOutside,
    Random,
    Chat,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub kind: OracleKind,

    /// Chat completions endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Chat model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries on rate limiting and transient server errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seed of the random stub.
    #[serde(default)]
    pub seed: u64,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    8
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        let n_agt = model.population();
        check_num(n_agt, 1..=persona::identity_pool_size())
            .context("invalid population size (must fit the identity pool)")?;
        check_pos(model.contact_rate).context("invalid contact rate")?;
        check_pos(model.infection_rate).context("invalid infection rate")?;
        check_num(model.infection_rate, ..=1.0).context("invalid infection rate")?;
        check_num(model.heal_time, 1..).context("invalid heal time")?;
        if model.contact_rate > (n_agt - 1) as f64 {
            log::warn!(
                "contact rate {} exceeds the {} possible partners, quotas will go unmet",
                model.contact_rate,
                n_agt - 1
            );
        }

        check_num(self.run.max_days, 1..).context("invalid maximum number of days")?;
        check_num(self.run.workers, 1..=64).context("invalid number of workers")?;

        if self.oracle.kind == OracleKind::Chat {
            if self.oracle.endpoint.is_empty() {
                bail!("chat oracle requires an endpoint");
            }
            check_num(self.oracle.timeout_secs, 1..=600).context("invalid oracle timeout")?;
            check_num(self.oracle.max_retries, 0..=32).context("invalid oracle retries")?;
        }

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_pos(num: f64) -> Result<()> {
    // Also rejects NaN.
    if !(num > 0.0) {
        bail!("number must be positive, but is {num:?}");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config(n_healthy: usize, n_infected: usize) -> Config {
    Config {
        model: ModelConfig {
            n_healthy,
            n_infected,
            contact_rate: 5.0,
            infection_rate: 0.1,
            heal_time: 6,
        },
        run: RunConfig {
            max_days: 10,
            workers: 4,
            seed: Some(42),
        },
        oracle: OracleConfig {
            kind: OracleKind::AlwaysOutside,
            endpoint: default_endpoint(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            seed: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[model]
n_healthy = 18
n_infected = 2
contact_rate = 5.0
infection_rate = 0.1
heal_time = 6

[run]
max_days = 10
seed = 7

[oracle]
kind = "always_outside"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.model.population(), 20);
        assert_eq!(cfg.run.workers, 4);
        assert_eq!(cfg.run.seed, Some(7));
        assert_eq!(cfg.oracle.kind, OracleKind::AlwaysOutside);
        assert_eq!(cfg.oracle.model, "gpt-4o-mini");
    }

    #[test]
    fn rejects_non_positive_rates() {
        let mut cfg = test_config(18, 2);
        cfg.model.contact_rate = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = test_config(18, 2);
        cfg.model.infection_rate = -0.1;
        assert!(cfg.validate().is_err());

        let mut cfg = test_config(18, 2);
        cfg.model.infection_rate = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = test_config(18, 2);
        cfg.model.infection_rate = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_contact_rate_above_population() {
        let cfg = test_config(3, 1);
        assert_eq!(cfg.model.contact_rate, 5.0);
        cfg.validate().unwrap();
    }

    #[test]
    fn accepts_long_heal_times_and_runs() {
        let mut cfg = test_config(18, 2);
        cfg.model.heal_time = 5_000;
        cfg.run.max_days = 1_000_000;
        cfg.validate().unwrap();

        cfg.model.heal_time = 0;
        assert!(cfg.validate().is_err());
        cfg.model.heal_time = 6;
        cfg.run.max_days = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_population_beyond_identity_pool() {
        let cfg = test_config(persona::identity_pool_size(), 1);
        assert!(cfg.validate().is_err());

        let cfg = test_config(0, 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_oracle_kind() {
        let contents = SAMPLE.replace("always_outside", "telepathy");
        assert!(Config::from_toml(&contents).is_err());
    }
}
