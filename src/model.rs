use crate::oracle::Choice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health state of an agent.
///
/// `ToBeInfected` only exists between the transmission pass and the
/// end-of-day advance of a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Susceptible,
    ToBeInfected,
    Infected { day: u32 },
    Recovered,
}

impl Health {
    pub fn label(&self) -> &'static str {
        match self {
            Health::Susceptible => "Susceptible",
            Health::ToBeInfected => "ToBeInfected",
            Health::Infected { .. } => "Infected",
            Health::Recovered => "Recovered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Home,
    Outside,
}

impl Location {
    pub fn label(&self) -> &'static str {
        match self {
            Location::Home => "home",
            Location::Outside => "outside",
        }
    }
}

impl From<Choice> for Location {
    fn from(choice: Choice) -> Self {
        match choice {
            Choice::StayHome => Location::Home,
            Choice::GoOutside => Location::Outside,
        }
    }
}

/// Fixed identity of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub age: u32,
    pub traits: [String; 5],
}

/// What an agent did on one simulated day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRecord {
    pub health: Health,
    pub narrative: String,
    pub choice: Choice,
    pub rationale: Option<String>,
    pub fallback: bool,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    id: usize,
    profile: Profile,
    health: Health,
    location: Location,

    quota: usize,
    contacts: Vec<usize>,

    history: BTreeMap<usize, DayRecord>,
}

impl Agent {
    pub fn new(id: usize, profile: Profile, health: Health) -> Self {
        Self {
            id,
            profile,
            health,
            location: Location::Outside,
            quota: 0,
            contacts: Vec::new(),
            history: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn set_health(&mut self, health: Health) {
        self.health = health;
    }

    pub fn day_infected(&self) -> Option<u32> {
        match self.health {
            Health::Infected { day } => Some(day),
            _ => None,
        }
    }

    pub fn is_infected(&self) -> bool {
        matches!(self.health, Health::Infected { .. })
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn set_quota(&mut self, quota: usize) {
        self.quota = quota;
    }

    pub fn contacts(&self) -> &[usize] {
        &self.contacts
    }

    pub fn has_capacity(&self) -> bool {
        self.contacts.len() < self.quota
    }

    pub fn add_contact(&mut self, other: usize) {
        self.contacts.push(other);
    }

    pub fn clear_contacts(&mut self) {
        self.contacts.clear();
    }

    pub fn history(&self) -> &BTreeMap<usize, DayRecord> {
        &self.history
    }

    /// Record what the agent did on `day`. Earlier records are never overwritten.
    pub fn record_day(&mut self, day: usize, record: DayRecord) {
        self.history.entry(day).or_insert(record);
    }

    /// How the agent feels, as told to the decision oracle.
    pub fn health_narrative(&self) -> &'static str {
        match self.day_infected() {
            Some(3) | Some(6) => "You have a slight cough.",
            Some(4) | Some(5) => "You have a cough and a fever.",
            _ => "You feel normal.",
        }
    }
}

/// State of the simulation at the boundary between days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Number of completed days.
    pub day: usize,

    pub agents: Vec<Agent>,

    pub daily_new_cases: usize,
    pub total_contacts: usize,
    pub day4_infected: usize,
    pub yesterday_day4_infected: usize,
    pub currently_infected: usize,

    /// Consecutive days that ended with no infected agents.
    pub zero_infected_streak: usize,
}

impl State {
    pub fn new(agents: Vec<Agent>) -> Self {
        let currently_infected = agents.iter().filter(|agt| agt.is_infected()).count();
        Self {
            day: 0,
            agents,
            daily_new_cases: 0,
            total_contacts: 0,
            day4_infected: 0,
            yesterday_day4_infected: 0,
            currently_infected,
            zero_infected_streak: 0,
        }
    }

    pub fn population(&self) -> usize {
        self.agents.len()
    }

    pub fn count_health(&self, pred: impl Fn(Health) -> bool) -> usize {
        self.agents.iter().filter(|agt| pred(agt.health())).count()
    }

    pub fn count_location(&self, location: Location) -> usize {
        self.agents
            .iter()
            .filter(|agt| agt.location() == location)
            .count()
    }

    pub fn outside_ids(&self) -> Vec<usize> {
        self.agents
            .iter()
            .filter(|agt| agt.location() == Location::Outside)
            .map(Agent::id)
            .collect()
    }

    /// Percentage of the population on their fourth infected day yesterday.
    pub fn yesterday_day4_percent(&self) -> f64 {
        100.0 * self.yesterday_day4_infected as f64 / self.population() as f64
    }
}

#[cfg(test)]
pub(crate) fn test_profile(id: usize) -> Profile {
    Profile {
        name: format!("Agent {id}"),
        age: 30,
        traits: [
            "extroverted".to_string(),
            "agreeable".to_string(),
            "conscientious".to_string(),
            "emotionally stable".to_string(),
            "open to experience".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_infected_defined_only_while_infected() {
        let mut agt = Agent::new(0, test_profile(0), Health::Susceptible);
        assert_eq!(agt.day_infected(), None);
        agt.set_health(Health::ToBeInfected);
        assert_eq!(agt.day_infected(), None);
        agt.set_health(Health::Infected { day: 2 });
        assert_eq!(agt.day_infected(), Some(2));
        agt.set_health(Health::Recovered);
        assert_eq!(agt.day_infected(), None);
    }

    #[test]
    fn narrative_follows_infection_day() {
        let mut agt = Agent::new(0, test_profile(0), Health::Susceptible);
        assert_eq!(agt.health_narrative(), "You feel normal.");

        let expected = [
            (1, "You feel normal."),
            (2, "You feel normal."),
            (3, "You have a slight cough."),
            (4, "You have a cough and a fever."),
            (5, "You have a cough and a fever."),
            (6, "You have a slight cough."),
        ];
        for (day, narrative) in expected {
            agt.set_health(Health::Infected { day });
            assert_eq!(agt.health_narrative(), narrative, "day {day}");
        }
    }

    #[test]
    fn history_records_are_append_only() {
        let mut agt = Agent::new(0, test_profile(0), Health::Susceptible);
        let record = DayRecord {
            health: Health::Susceptible,
            narrative: "You feel normal.".to_string(),
            choice: Choice::GoOutside,
            rationale: Some("work".to_string()),
            fallback: false,
            location: Location::Outside,
        };
        agt.record_day(1, record.clone());
        agt.record_day(
            1,
            DayRecord {
                choice: Choice::StayHome,
                location: Location::Home,
                ..record.clone()
            },
        );
        assert_eq!(agt.history()[&1], record);
    }

    #[test]
    fn state_counts_initial_infected() {
        let agents = vec![
            Agent::new(0, test_profile(0), Health::Susceptible),
            Agent::new(1, test_profile(1), Health::Infected { day: 1 }),
        ];
        let state = State::new(agents);
        assert_eq!(state.currently_infected, 1);
        assert_eq!(state.population(), 2);
        assert_eq!(state.outside_ids(), vec![0, 1]);
    }
}
