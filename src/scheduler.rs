use crate::model::Agent;
use anyhow::{Result, ensure};
use rand::prelude::*;
use rand_distr::Bernoulli;

/// Assign today's contact quotas and build the contact graph among the
/// agents listed in `outside`.
///
/// Agents not in `outside` are left without contacts.
pub fn schedule_contacts<R: Rng>(
    agents: &mut [Agent],
    outside: &mut [usize],
    contact_rate: f64,
    rng: &mut R,
) -> Result<()> {
    outside.shuffle(rng);
    assign_quotas(agents, outside, contact_rate, rng)?;
    pair_agents(agents, outside, rng);
    Ok(())
}

/// Scale the contact rate by the fraction of agents outside and give each
/// outside agent its integer part plus one extra contact with probability
/// equal to the fractional part.
fn assign_quotas<R: Rng>(
    agents: &mut [Agent],
    outside: &[usize],
    contact_rate: f64,
    rng: &mut R,
) -> Result<()> {
    let eff_rate = outside.len() as f64 / agents.len() as f64 * contact_rate;
    ensure!(eff_rate >= 0.0, "negative effective contact rate {eff_rate}");
    let base = eff_rate.trunc() as usize;
    let extra_dist = Bernoulli::new(eff_rate.fract())?;

    for &i_agt in outside {
        let quota = base + usize::from(extra_dist.sample(rng));
        agents[i_agt].set_quota(quota);
    }
    Ok(())
}

/// Greedy pairing in the order of `outside`.
///
/// Each agent draws partners uniformly among the outside agents it has not
/// met yet that still have spare quota. Agents late in the order may be
/// left below their quota.
fn pair_agents<R: Rng>(agents: &mut [Agent], outside: &[usize], rng: &mut R) {
    let mut candidates = Vec::with_capacity(outside.len());
    for &i_agt in outside {
        if !agents[i_agt].has_capacity() {
            continue;
        }

        candidates.clear();
        candidates.extend(outside.iter().copied().filter(|&j_agt| {
            j_agt != i_agt
                && agents[j_agt].has_capacity()
                && !agents[i_agt].contacts().contains(&j_agt)
        }));

        // Pairing only changes the capacity of the two endpoints, so the
        // remaining candidates stay eligible.
        while agents[i_agt].has_capacity() && !candidates.is_empty() {
            let j_agt = candidates.swap_remove(rng.random_range(0..candidates.len()));
            agents[i_agt].add_contact(j_agt);
            agents[j_agt].add_contact(i_agt);
        }
    }
}

/// Check that the contact graph is symmetric, simple and within quotas.
pub fn check_contacts(agents: &[Agent]) -> Result<()> {
    for agt in agents {
        let contacts = agt.contacts();
        ensure!(
            contacts.len() <= agt.quota(),
            "agent {} has {} contacts but a quota of {}",
            agt.id(),
            contacts.len(),
            agt.quota()
        );
        for (pos, &other) in contacts.iter().enumerate() {
            ensure!(other != agt.id(), "agent {} is paired with itself", agt.id());
            ensure!(
                !contacts[..pos].contains(&other),
                "agent {} is paired twice with agent {other}",
                agt.id()
            );
            ensure!(
                agents[other].contacts().contains(&agt.id()),
                "contact {} -> {other} is not symmetric",
                agt.id()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Health, Location, test_profile};
    use rand_chacha::ChaCha12Rng;

    fn population(n_agt: usize) -> Vec<Agent> {
        (0..n_agt)
            .map(|id| Agent::new(id, test_profile(id), Health::Susceptible))
            .collect()
    }

    #[test]
    fn contact_graph_is_symmetric_and_within_quota() {
        for seed in 0..50 {
            let mut rng = ChaCha12Rng::seed_from_u64(seed);
            let mut agents = population(40);
            let mut outside: Vec<usize> = (0..40).filter(|_| rng.random_bool(0.7)).collect();

            schedule_contacts(&mut agents, &mut outside, 7.3, &mut rng).unwrap();
            check_contacts(&agents).unwrap();
        }
    }

    #[test]
    fn home_agents_have_no_contacts() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let mut agents = population(20);
        for agt in agents.iter_mut().skip(10) {
            agt.set_location(Location::Home);
        }
        let state_outside: Vec<usize> = agents
            .iter()
            .filter(|agt| agt.location() == Location::Outside)
            .map(Agent::id)
            .collect();
        let mut outside = state_outside.clone();

        schedule_contacts(&mut agents, &mut outside, 5.0, &mut rng).unwrap();

        for agt in &agents[10..] {
            assert!(agt.contacts().is_empty());
            assert_eq!(agt.quota(), 0);
        }
        for agt in &agents[..10] {
            assert!(agt.contacts().iter().all(|j| state_outside.contains(j)));
        }
    }

    #[test]
    fn quotas_average_the_effective_rate() {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let n_agt = 1000;
        let mut agents = population(n_agt);
        let outside: Vec<usize> = (0..n_agt / 2).collect();

        // Half the population outside: 0.5 * 5.0 = 2.5 contacts.
        assign_quotas(&mut agents, &outside, 5.0, &mut rng).unwrap();

        let quotas: Vec<usize> = outside.iter().map(|&i| agents[i].quota()).collect();
        assert!(quotas.iter().all(|&q| q == 2 || q == 3));
        let mean = quotas.iter().sum::<usize>() as f64 / quotas.len() as f64;
        assert!((mean - 2.5).abs() < 0.1, "{mean}");
    }

    #[test]
    fn integral_rate_gives_exact_quotas() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let mut agents = population(20);
        let mut outside: Vec<usize> = (0..20).collect();

        schedule_contacts(&mut agents, &mut outside, 5.0, &mut rng).unwrap();

        assert!(agents.iter().all(|agt| agt.quota() == 5));
        let n_contacts: usize = agents.iter().map(|agt| agt.contacts().len()).sum();
        assert_eq!(n_contacts % 2, 0);
        assert!(n_contacts > 0);
    }

    #[test]
    fn lone_agent_outside_meets_nobody() {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let mut agents = population(10);
        let mut outside = vec![3];

        schedule_contacts(&mut agents, &mut outside, 9.0, &mut rng).unwrap();

        assert!(agents.iter().all(|agt| agt.contacts().is_empty()));
    }
}
