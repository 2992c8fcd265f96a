//! Server selection among eligible candidates.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::server::ServerState;
use crate::config::LoadBalancingStrategy;
use crate::random::RandomSource;

pub(crate) struct Balancer {
    strategy: LoadBalancingStrategy,
    cursor: AtomicUsize,
    random: Arc<dyn RandomSource>,
}

impl Balancer {
    pub fn new(strategy: LoadBalancingStrategy, random: Arc<dyn RandomSource>) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            random,
        }
    }

    /// Pick one of `candidates` (indices into `servers`).
    pub fn select(&self, candidates: &[usize], servers: &[ServerState]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let picked = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
                candidates[turn % candidates.len()]
            }
            LoadBalancingStrategy::LeastConnections => {
                // Load relative to weight: a/wa < b/wb  <=>  a*wb < b*wa.
                let load = |i: usize| {
                    let s = &servers[i];
                    (s.current_connections as u64, u64::from(s.config.weight.max(1)))
                };
                *candidates.iter().min_by(|&&a, &&b| {
                    let (ca, wa) = load(a);
                    let (cb, wb) = load(b);
                    (ca * wb).cmp(&(cb * wa))
                })?
            }
            LoadBalancingStrategy::Random => {
                let total: u64 = candidates
                    .iter()
                    .map(|&i| u64::from(servers[i].config.weight.max(1)))
                    .sum();
                let mut roll = self.random.below(total);
                let mut chosen = candidates[candidates.len() - 1];
                for &i in candidates {
                    let weight = u64::from(servers[i].config.weight.max(1));
                    if roll < weight {
                        chosen = i;
                        break;
                    }
                    roll -= weight;
                }
                chosen
            }
        };
        Some(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, ServerRole};
    use crate::random::{OsRandom, SequenceRandom};

    fn servers(weights: &[u32]) -> Vec<ServerState> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &weight)| {
                ServerState::new(
                    ServerConfig {
                        name: format!("db{i}"),
                        role: ServerRole::Replica,
                        host: "localhost".into(),
                        port: 5432,
                        database: "crm".into(),
                        username: "crm".into(),
                        password: None,
                        weight,
                        max_connections: None,
                    },
                    10,
                )
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles() {
        let balancer = Balancer::new(LoadBalancingStrategy::RoundRobin, Arc::new(OsRandom));
        let servers = servers(&[1, 1, 1]);
        let picks: Vec<_> = (0..4)
            .map(|_| balancer.select(&[0, 2], &servers).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
    }

    #[test]
    fn least_connections_respects_weight() {
        let balancer =
            Balancer::new(LoadBalancingStrategy::LeastConnections, Arc::new(OsRandom));
        let mut servers = servers(&[1, 3]);
        servers[0].current_connections = 2;
        servers[1].current_connections = 4;
        // 2/1 vs 4/3: the heavier server is relatively less loaded.
        assert_eq!(balancer.select(&[0, 1], &servers), Some(1));
    }

    #[test]
    fn random_is_weighted() {
        let servers = servers(&[1, 3]);
        let balancer = Balancer::new(
            LoadBalancingStrategy::Random,
            Arc::new(SequenceRandom::new(vec![0, 1, 3])),
        );
        assert_eq!(balancer.select(&[0, 1], &servers), Some(0));
        assert_eq!(balancer.select(&[0, 1], &servers), Some(1));
        assert_eq!(balancer.select(&[0, 1], &servers), Some(1));
    }

    #[test]
    fn empty_candidates() {
        let balancer = Balancer::new(LoadBalancingStrategy::RoundRobin, Arc::new(OsRandom));
        assert_eq!(balancer.select(&[], &servers(&[1])), None);
    }
}
