use crate::checkpoint::{self, CHECKPOINT_VERSION, Checkpoint, CheckpointRef};
use crate::config::Config;
use crate::infection;
use crate::metrics::Collector;
use crate::model::{DayRecord, Health, Location, State};
use crate::oracle::{self, Decision, Oracle, OracleError, Query};
use crate::persona;
use crate::scheduler;
use anyhow::{Context, Result, ensure};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use std::path::Path;

/// Consecutive zero-infected days that end a run early.
const EARLY_STOP_DAYS: usize = 2;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Reached the configured maximum number of days.
    Completed,
    /// Stopped after the infection disappeared.
    EarlyStop,
}

/// Simulation engine.
///
/// Holds the configuration, current state, collected metrics and random
/// number generator, and steps the simulation one day at a time.
pub struct Engine {
    cfg: Config,
    state: State,
    metrics: Collector,
    rng: ChaCha12Rng,
    oracle: Box<dyn Oracle>,
    pool: ThreadPool,
}

impl Engine {
    /// Create a new `Engine` with the given configuration and a fresh population.
    pub fn generate_initial_condition(cfg: Config, oracle: Box<dyn Oracle>) -> Result<Self> {
        cfg.validate().context("failed to validate config")?;

        let mut rng = match cfg.run.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };
        let agents = persona::generate_population(&cfg.model, &mut rng);
        let state = State::new(agents);

        Self::assemble(cfg, state, Collector::new(), rng, oracle)
    }

    /// Rebuild an `Engine` from a checkpoint, ready to continue at its day.
    pub fn from_checkpoint(ckpt: Checkpoint, oracle: Box<dyn Oracle>) -> Result<Self> {
        ckpt.cfg
            .validate()
            .context("checkpoint holds an invalid config")?;
        let engine = Self::assemble(ckpt.cfg, ckpt.state, ckpt.metrics, ckpt.rng, oracle)?;
        engine
            .check_invariants()
            .context("checkpoint holds an inconsistent state")?;
        Ok(engine)
    }

    fn assemble(
        cfg: Config,
        state: State,
        metrics: Collector,
        rng: ChaCha12Rng,
        oracle: Box<dyn Oracle>,
    ) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(cfg.run.workers)
            .build()
            .context("failed to build decision pool")?;
        Ok(Self {
            cfg,
            state,
            metrics,
            rng,
            oracle,
            pool,
        })
    }

    #[cfg(test)]
    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    #[cfg(test)]
    pub fn state(&self) -> &State {
        &self.state
    }

    #[cfg(test)]
    pub fn metrics(&self) -> &Collector {
        &self.metrics
    }

    /// Save a checkpoint of the entire engine state.
    ///
    /// Can be used to resume the simulation later.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        CheckpointRef {
            version: CHECKPOINT_VERSION,
            cfg: &self.cfg,
            state: &self.state,
            metrics: &self.metrics,
            rng: &self.rng,
        }
        .save(file)
    }

    /// Run days until the day limit or an early stop, writing a checkpoint
    /// into `run_dir` after every day and a final one at the end.
    pub fn perform_simulation(&mut self, run_dir: &Path) -> Result<Outcome> {
        if self.metrics.is_empty() {
            self.metrics.collect(&self.state);
        }

        let outcome = loop {
            if self.state.zero_infected_streak >= EARLY_STOP_DAYS {
                log::info!("no infected agents for {EARLY_STOP_DAYS} days, stopping early");
                break Outcome::EarlyStop;
            }
            if self.state.day >= self.cfg.run.max_days {
                break Outcome::Completed;
            }

            self.perform_day()
                .with_context(|| format!("failed to perform day {}", self.state.day + 1))?;
            self.metrics.collect(&self.state);

            if self.state.currently_infected == 0 {
                self.state.zero_infected_streak += 1;
            } else {
                self.state.zero_infected_streak = 0;
            }

            log::info!(
                "end of day {}: new cases = {}, infected = {}, day-4 infected = {}",
                self.state.day,
                self.state.daily_new_cases,
                self.state.currently_infected,
                self.state.day4_infected
            );

            self.save_checkpoint(checkpoint::day_file(run_dir, self.state.day))
                .context("failed to save checkpoint")?;
        };

        self.save_checkpoint(checkpoint::final_file(run_dir))
            .context("failed to save final checkpoint")?;
        log::info!("run ended after {} days ({outcome:?})", self.state.day);

        Ok(outcome)
    }

    /// Simulate one day.
    pub fn perform_day(&mut self) -> Result<()> {
        // Reset daily counters.
        self.state.daily_new_cases = 0;
        self.state.total_contacts = 0;
        self.state.day4_infected = 0;

        // Query every agent's decision, waiting for all of them.
        self.decide_locations();

        // Build today's contact graph among the agents outside.
        let mut outside = self.state.outside_ids();
        scheduler::schedule_contacts(
            &mut self.state.agents,
            &mut outside,
            self.cfg.model.contact_rate,
            &mut self.rng,
        )
        .context("failed to schedule contacts")?;
        scheduler::check_contacts(&self.state.agents).context("invalid contact graph")?;

        // Transmit along contacts, then advance every agent by one day.
        self.state.total_contacts = infection::transmit(
            &mut self.state.agents,
            self.cfg.model.infection_rate,
            &mut self.rng,
        )
        .context("failed to transmit infection")?;
        let advance = infection::advance_day(&mut self.state.agents, self.cfg.model.heal_time);
        self.state.daily_new_cases = advance.new_cases;

        let tracked = (self.state.currently_infected + advance.new_cases)
            .checked_sub(advance.recovered)
            .context("infected count underflow")?;
        let live = self.state.count_health(|health| matches!(health, Health::Infected { .. }));
        ensure!(
            tracked == live,
            "tracked infected count {tracked} differs from live count {live}"
        );
        self.state.currently_infected = live;

        self.state.day4_infected = self
            .state
            .agents
            .iter()
            .filter(|agt| agt.day_infected() == Some(4))
            .count();
        self.state.yesterday_day4_infected = self.state.day4_infected;

        self.state.day += 1;

        self.check_invariants()
    }

    fn decide_locations(&mut self) {
        let day = self.state.day + 1;
        let day4_percent = self.state.yesterday_day4_percent();
        let queries: Vec<Query> = self
            .state
            .agents
            .iter()
            .map(|agt| Query {
                agent_id: agt.id(),
                day,
                profile: agt.profile().clone(),
                narrative: agt.health_narrative().to_string(),
                day4_percent,
            })
            .collect();

        let oracle = self.oracle.as_ref();
        let results: Vec<Result<Decision, OracleError>> = self.pool.install(|| {
            queries
                .par_iter()
                .map(|query| oracle.decide(query))
                .collect()
        });

        // Fallbacks draw from the engine generator in agent order, so the
        // stream does not depend on which call finished first.
        for ((agt, query), result) in self.state.agents.iter_mut().zip(queries).zip(results) {
            let (choice, rationale, fallback) = match result {
                Ok(decision) => {
                    log::debug!(
                        "agent {} on day {day}: {:?} ({})",
                        agt.id(),
                        decision.choice,
                        decision.rationale
                    );
                    (decision.choice, Some(decision.rationale), false)
                }
                Err(error) => {
                    let choice = oracle::fallback_choice(&mut self.rng);
                    log::warn!(
                        "agent {} on day {day}: {error}; defaulting to {choice:?}",
                        agt.id()
                    );
                    (choice, None, true)
                }
            };

            let location = Location::from(choice);
            agt.set_location(location);
            agt.record_day(
                day,
                DayRecord {
                    health: agt.health(),
                    narrative: query.narrative,
                    choice,
                    rationale,
                    fallback,
                    location,
                },
            );
        }
    }

    /// Check the invariants that hold between days.
    fn check_invariants(&self) -> Result<()> {
        let state = &self.state;
        let n_agt = self.cfg.model.population();
        ensure!(
            state.population() == n_agt,
            "population is {}, expected {n_agt}",
            state.population()
        );
        for (i_agt, agt) in state.agents.iter().enumerate() {
            ensure!(agt.id() == i_agt, "agent {} is stored at index {i_agt}", agt.id());
        }

        let n_pending = state.count_health(|health| health == Health::ToBeInfected);
        ensure!(n_pending == 0, "{n_pending} agents are still pending infection");

        let n_sus = state.count_health(|health| health == Health::Susceptible);
        let n_inf = state.count_health(|health| matches!(health, Health::Infected { .. }));
        let n_rec = state.count_health(|health| health == Health::Recovered);
        ensure!(
            n_sus + n_inf + n_rec == n_agt,
            "health counts {n_sus} + {n_inf} + {n_rec} do not add up to {n_agt}"
        );
        ensure!(
            state.currently_infected == n_inf,
            "tracked infected count {} differs from live count {n_inf}",
            state.currently_infected
        );

        for agt in &state.agents {
            ensure!(
                agt.contacts().is_empty(),
                "agent {} kept contacts past the day",
                agt.id()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::model::Agent;
    use crate::oracle::{AlwaysHome, AlwaysOutside, SeededRandom};

    struct BrokenOracle;

    impl Oracle for BrokenOracle {
        fn decide(&self, _query: &Query) -> Result<Decision, OracleError> {
            Err(OracleError::Malformed("garbled".to_string()))
        }
    }

    fn column(engine: &Engine, name: &str) -> Vec<u64> {
        engine.metrics().column(name).unwrap()
    }

    #[test]
    fn twenty_agent_scenario() {
        let cfg = test_config(18, 2);
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();
        engine.metrics.collect(&engine.state);
        for _ in 0..10 {
            engine.perform_day().unwrap();
            engine.metrics.collect(&engine.state);
        }

        let sus = column(&engine, "Susceptible");
        let inf = column(&engine, "Infected");
        let rec = column(&engine, "Recovered");
        for day in 0..=10 {
            assert_eq!(sus[day] + inf[day] + rec[day], 20, "day {day}");
        }
        assert_eq!(column(&engine, "Step"), (0..=10).collect::<Vec<u64>>());
        assert_eq!(column(&engine, "#Outside"), vec![20; 11]);

        // The initially infected start on day 1 of their infection.
        let day4 = column(&engine, "Day4Infected");
        assert_eq!(&day4[..3], &[0, 0, 0]);
        assert_eq!(day4[3], 2);

        // They recover after day 6; cases from day 1 recover after day 7.
        assert!(rec[..6].iter().all(|&n| n == 0));
        assert_eq!(rec[6], 2);
        assert_eq!(rec[7], 2 + column(&engine, "DailyNewCases")[1]);
    }

    #[test]
    fn staying_home_prevents_contacts() {
        let cfg = test_config(18, 2);
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysHome)).unwrap();
        for _ in 0..3 {
            engine.perform_day().unwrap();
            assert_eq!(engine.state().total_contacts, 0);
            assert_eq!(engine.state().daily_new_cases, 0);
            assert_eq!(engine.state().count_location(Location::Home), 20);
        }
    }

    #[test]
    fn oracle_failures_fall_back_to_coin_flips() {
        let cfg = test_config(150, 50);
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(BrokenOracle)).unwrap();
        engine.perform_day().unwrap();

        let n_home = engine.state().count_location(Location::Home);
        assert!((60..140).contains(&n_home), "{n_home}");
        for agt in &engine.state().agents {
            let record = &agt.history()[&1];
            assert!(record.fallback);
            assert_eq!(record.rationale, None);
            assert_eq!(record.location, agt.location());
        }
    }

    #[test]
    fn history_is_keyed_by_simulated_day() {
        let cfg = test_config(8, 2);
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();
        engine.perform_day().unwrap();
        engine.perform_day().unwrap();

        for agt in &engine.state().agents {
            let days: Vec<_> = agt.history().keys().copied().collect();
            assert_eq!(days, vec![1, 2]);
        }
        let last = engine.state().agents.last().unwrap();
        assert_eq!(last.history()[&1].health, Health::Infected { day: 1 });
    }

    #[test]
    fn stops_after_two_days_without_infection() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(10, 0);
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();

        let outcome = engine.perform_simulation(dir.path()).unwrap();

        assert_eq!(outcome, Outcome::EarlyStop);
        assert_eq!(engine.state().day, 2);
        assert_eq!(engine.metrics().rows().len(), 3);
        assert!(checkpoint::day_file(dir.path(), 1).exists());
        assert!(checkpoint::day_file(dir.path(), 2).exists());
        assert!(checkpoint::final_file(dir.path()).exists());
    }

    #[test]
    fn infected_day_resets_zero_streak() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(10, 0);
        cfg.run.max_days = 3;
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();

        // One zero day, then an infected agent appears.
        engine.perform_day().unwrap();
        engine.state.zero_infected_streak = 1;
        engine.state.agents[0].set_health(Health::Infected { day: 1 });
        engine.state.currently_infected = 1;

        let outcome = engine.perform_simulation(dir.path()).unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(engine.state().day, 3);
        assert_eq!(engine.state().zero_infected_streak, 0);
    }

    #[test]
    fn runs_to_day_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(18, 2);
        cfg.run.max_days = 4;
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();

        let outcome = engine.perform_simulation(dir.path()).unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(engine.state().day, 4);
        assert_eq!(engine.metrics().rows().len(), 5);
    }

    #[test]
    fn resumed_run_follows_the_same_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(60, 5);
        cfg.run.max_days = 8;
        cfg.model.infection_rate = 0.3;

        let mut full =
            Engine::generate_initial_condition(cfg.clone(), Box::new(SeededRandom::new(3))).unwrap();
        full.perform_simulation(dir.path()).unwrap();

        let ckpt = Checkpoint::load(checkpoint::day_file(dir.path(), 4)).unwrap();
        assert_eq!(ckpt.state.day, 4);
        assert_eq!(ckpt.metrics.rows().len(), 5);

        let resumed_dir = tempfile::tempdir().unwrap();
        let mut resumed = Engine::from_checkpoint(ckpt, Box::new(SeededRandom::new(3))).unwrap();
        resumed.perform_simulation(resumed_dir.path()).unwrap();

        assert_eq!(resumed.state(), full.state());
        assert_eq!(resumed.metrics().rows(), full.metrics().rows());
    }

    #[test]
    fn saved_checkpoint_matches_engine() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(18, 2);
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();
        engine.perform_day().unwrap();
        engine.perform_day().unwrap();

        let file = checkpoint::day_file(dir.path(), 2);
        engine.save_checkpoint(&file).unwrap();
        let ckpt = Checkpoint::load(&file).unwrap();

        assert_eq!(&ckpt.cfg, engine.cfg());
        assert_eq!(&ckpt.state, engine.state());
        assert_eq!(ckpt.rng, engine.rng);
    }

    #[test]
    fn inconsistent_checkpoint_is_rejected() {
        let cfg = test_config(18, 2);
        let engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();
        let mut state = engine.state().clone();
        state.agents.push(Agent::new(20, state.agents[0].profile().clone(), Health::Susceptible));

        let ckpt = Checkpoint {
            version: CHECKPOINT_VERSION,
            cfg: engine.cfg().clone(),
            state,
            metrics: Collector::new(),
            rng: engine.rng.clone(),
        };

        assert!(Engine::from_checkpoint(ckpt, Box::new(AlwaysOutside)).is_err());
    }

    #[test]
    fn misordered_agents_are_rejected() {
        let cfg = test_config(18, 2);
        let engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();
        let mut state = engine.state().clone();
        state.agents.swap(0, 1);

        let ckpt = Checkpoint {
            version: CHECKPOINT_VERSION,
            cfg: engine.cfg().clone(),
            state,
            metrics: Collector::new(),
            rng: engine.rng.clone(),
        };

        let error = Engine::from_checkpoint(ckpt, Box::new(AlwaysOutside))
            .err()
            .unwrap();
        assert!(format!("{error:#}").contains("stored at index"), "{error:#}");
    }

    #[test]
    fn contact_rate_above_population_leaves_quotas_unmet() {
        let cfg = test_config(3, 1);
        let mut engine = Engine::generate_initial_condition(cfg, Box::new(AlwaysOutside)).unwrap();
        for _ in 0..5 {
            engine.perform_day().unwrap();
        }
        assert_eq!(engine.state().day, 5);
        assert_eq!(engine.state().population(), 4);
    }
}
