use crate::config::ModelConfig;
use crate::model::{Agent, Health, Profile};
use rand::{Rng, seq::index};

const FIRST_NAMES: [&str; 40] = [
    "James", "Mary", "Robert", "Patricia", "John", "Jennifer", "Michael", "Linda", "David",
    "Elizabeth", "William", "Barbara", "Richard", "Susan", "Joseph", "Jessica", "Thomas", "Sarah",
    "Charles", "Karen", "Daniel", "Lisa", "Matthew", "Nancy", "Anthony", "Betty", "Mark",
    "Margaret", "Donald", "Sandra", "Steven", "Ashley", "Paul", "Kimberly", "Andrew", "Emily",
    "Joshua", "Donna", "Kenneth", "Michelle",
];

const SURNAMES: [&str; 25] = [
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez",
    "Martinez", "Hernandez", "Lopez", "Gonzalez", "Wilson", "Anderson", "Thomas", "Taylor",
    "Moore", "Jackson", "Martin", "Lee", "Perez", "Thompson", "White", "Harris",
];

const TRAIT_PAIRS: [[&str; 2]; 5] = [
    ["extroverted", "introverted"],
    ["agreeable", "antagonistic"],
    ["conscientious", "unconscientious"],
    ["neurotic", "emotionally stable"],
    ["open to experience", "closed to experience"],
];

const AGE_MIN: u32 = 18;
const AGE_MAX: u32 = 65;

/// Number of distinct identities available.
pub const fn identity_pool_size() -> usize {
    FIRST_NAMES.len() * SURNAMES.len()
}

fn identity_name(idx: usize) -> String {
    let first = FIRST_NAMES[idx % FIRST_NAMES.len()];
    let last = SURNAMES[idx / FIRST_NAMES.len()];
    format!("{first} {last}")
}

fn generate_traits<R: Rng>(rng: &mut R) -> [String; 5] {
    TRAIT_PAIRS.map(|pair| pair[usize::from(rng.random_bool(0.5))].to_string())
}

/// Create the initial population.
///
/// The first `n_healthy` agents start susceptible and the rest start
/// infected on their first day. Names are drawn without replacement.
pub fn generate_population<R: Rng>(model: &ModelConfig, rng: &mut R) -> Vec<Agent> {
    let n_agt = model.population();
    let name_idxs = index::sample(&mut *rng, identity_pool_size(), n_agt).into_vec();

    name_idxs
        .into_iter()
        .enumerate()
        .map(|(id, name_idx)| {
            let profile = Profile {
                name: identity_name(name_idx),
                age: rng.random_range(AGE_MIN..=AGE_MAX),
                traits: generate_traits(&mut *rng),
            };
            let health = if id < model.n_healthy {
                Health::Susceptible
            } else {
                Health::Infected { day: 1 }
            };
            Agent::new(id, profile, health)
        })
        .collect()
}
