use crate::model::{Agent, Health};
use anyhow::Result;
use rand::prelude::*;
use rand_distr::Bernoulli;

/// Changes produced by one end-of-day advance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub new_cases: usize,
    pub recovered: usize,
}

/// Evaluate transmission once across every contact edge and clear the
/// contact lists.
///
/// Newly infected agents become `ToBeInfected`, so they cannot pass the
/// infection on before the end-of-day advance. Returns the total number of
/// contacts, counting each edge once per endpoint.
pub fn transmit<R: Rng>(agents: &mut [Agent], infection_rate: f64, rng: &mut R) -> Result<usize> {
    let infect_dist = Bernoulli::new(infection_rate)?;

    let mut total_contacts = 0;
    let mut edges = Vec::new();
    for agt in agents.iter() {
        total_contacts += agt.contacts().len();
        edges.extend(
            agt.contacts()
                .iter()
                .filter(|&&other| agt.id() < other)
                .map(|&other| (agt.id(), other)),
        );
    }

    for (i_agt, j_agt) in edges {
        let target = match (agents[i_agt].health(), agents[j_agt].health()) {
            (Health::Infected { .. }, Health::Susceptible) => j_agt,
            (Health::Susceptible, Health::Infected { .. }) => i_agt,
            _ => continue,
        };
        if infect_dist.sample(rng) {
            agents[target].set_health(Health::ToBeInfected);
        }
    }

    agents.iter_mut().for_each(Agent::clear_contacts);

    Ok(total_contacts)
}

/// Advance every agent by one day.
///
/// `ToBeInfected` agents become infected and count their first day;
/// infected agents past `heal_time` days recover. Quotas are reset.
pub fn advance_day(agents: &mut [Agent], heal_time: u32) -> Advance {
    let mut advance = Advance::default();
    for agt in agents.iter_mut() {
        agt.set_quota(0);

        // A new case starts at day 0 and counts today as its first day.
        let day = match agt.health() {
            Health::Susceptible | Health::Recovered => continue,
            Health::ToBeInfected => {
                advance.new_cases += 1;
                1
            }
            Health::Infected { day } => day + 1,
        };

        if day > heal_time {
            agt.set_health(Health::Recovered);
            advance.recovered += 1;
        } else {
            agt.set_health(Health::Infected { day });
        }
    }
    advance
}
