//! Backend selection policies.
//!
//! A [`LoadBalancer`] is built once per link from the configured
//! [`BalanceMode`] and backend pool, then asked for a backend index per
//! accepted connection. Every policy returns an index in `[0, N)` for a
//! pool of `N` backends; construction with an empty pool fails.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use portlink_config::{BackendConfig, BalanceMode};
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("cannot balance over an empty backend set")]
    NoBackends,
}

/// Smooth weighted round-robin state: cursor plus the classic
/// current-weight / max-weight / gcd walk over the weight list.
#[derive(Debug)]
struct WeightedState {
    weights: Vec<u32>,
    cursor: usize,
    current: i64,
    max_weight: i64,
    gcd: u32,
}

impl WeightedState {
    fn new(weights: Vec<u32>) -> Self {
        let max_weight = i64::from(weights.iter().copied().max().unwrap_or(1));
        let gcd = weights.iter().copied().fold(0, gcd);
        Self {
            weights,
            cursor: 0,
            current: max_weight,
            max_weight,
            gcd: gcd.max(1),
        }
    }

    fn next(&mut self) -> usize {
        loop {
            self.cursor = (self.cursor + 1) % self.weights.len();
            if self.cursor == 0 {
                self.current -= i64::from(self.gcd);
                if self.current <= 0 {
                    self.current = self.max_weight;
                }
            }
            if i64::from(self.weights[self.cursor]) >= self.current {
                return self.cursor;
            }
        }
    }
}

fn gcd(m: u32, n: u32) -> u32 {
    if m == 0 {
        n
    } else {
        gcd(n % m, m)
    }
}

/// One backend-selection policy. The set is closed: each configured mode
/// maps to exactly one policy, selected at link construction.
#[derive(Debug)]
pub struct LoadBalancer {
    policy: Policy,
}

#[derive(Debug)]
enum Policy {
    Random {
        len: usize,
    },
    RoundRobin {
        next: AtomicUsize,
        len: usize,
    },
    WeightedRoundRobin {
        state: Mutex<WeightedState>,
    },
    AddressHash {
        len: usize,
    },
    // Prefers the first non-standby backend; failover to standby members
    // is connection-time logic in the link instance.
    MainStandby {
        primary: usize,
    },
}

impl LoadBalancer {
    pub fn new(mode: BalanceMode, backends: &[BackendConfig]) -> Result<Self, BalanceError> {
        if backends.is_empty() {
            return Err(BalanceError::NoBackends);
        }
        let len = backends.len();
        let policy = match mode {
            BalanceMode::Random => Policy::Random { len },
            BalanceMode::RoundRobin => Policy::RoundRobin {
                next: AtomicUsize::new(0),
                len,
            },
            BalanceMode::WeightedRoundRobin => {
                let weights = backends.iter().map(|b| b.weight.max(1)).collect();
                Policy::WeightedRoundRobin {
                    state: Mutex::new(WeightedState::new(weights)),
                }
            }
            BalanceMode::AddressHash => Policy::AddressHash { len },
            BalanceMode::MainStandby => Policy::MainStandby {
                primary: backends.iter().position(|b| !b.standby).unwrap_or(0),
            },
        };
        Ok(Self { policy })
    }

    /// Pick a backend index for a new connection. `client_key` is the
    /// client's remote-address string; only AddressHash looks at it.
    pub fn next(&self, client_key: &str) -> usize {
        match &self.policy {
            Policy::Random { len } => rand::thread_rng().gen_range(0..*len),
            Policy::RoundRobin { next, len } => next.fetch_add(1, Ordering::Relaxed) % len,
            Policy::WeightedRoundRobin { state } => state.lock().unwrap().next(),
            Policy::AddressHash { len } => address_hash(client_key) % len,
            Policy::MainStandby { primary } => *primary,
        }
    }
}

/// Sum of the client IP's raw bytes. IPv4 addresses are widened to their
/// 16-byte IPv6-mapped form so v4 and v4-mapped-v6 clients hash alike;
/// keys that are not addresses fall back to summing the key's own bytes.
fn address_hash(client_key: &str) -> usize {
    let ip = client_key
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .or_else(|_| portlink_config::host_of(client_key).parse::<IpAddr>());

    match ip {
        Ok(IpAddr::V4(v4)) => v4
            .to_ipv6_mapped()
            .octets()
            .iter()
            .map(|&b| b as usize)
            .sum(),
        Ok(IpAddr::V6(v6)) => v6.octets().iter().map(|&b| b as usize).sum(),
        Err(_) => client_key.bytes().map(|b| b as usize).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portlink_config::{ProtocolFamily, TlsMode};

    fn backend(weight: u32, standby: bool) -> BackendConfig {
        BackendConfig {
            address: "10.0.0.1:80".to_string(),
            protocol: ProtocolFamily::Tcp,
            tls: TlsMode::Null,
            dial_timeout_secs: 0,
            weight,
            standby,
        }
    }

    fn pool(n: usize) -> Vec<BackendConfig> {
        (0..n).map(|_| backend(1, false)).collect()
    }

    #[test]
    fn test_empty_backends_rejected() {
        for mode in [
            BalanceMode::Random,
            BalanceMode::RoundRobin,
            BalanceMode::WeightedRoundRobin,
            BalanceMode::AddressHash,
            BalanceMode::MainStandby,
        ] {
            assert!(LoadBalancer::new(mode, &[]).is_err());
        }
    }

    #[test]
    fn test_random_stays_in_range() {
        let lb = LoadBalancer::new(BalanceMode::Random, &pool(3)).unwrap();
        for _ in 0..200 {
            assert!(lb.next("1.2.3.4:5") < 3);
        }
    }

    #[test]
    fn test_round_robin_cycles_every_index() {
        for n in 1..=5 {
            let lb = LoadBalancer::new(BalanceMode::RoundRobin, &pool(n)).unwrap();
            for cycle in 0..3 {
                let picks: Vec<usize> = (0..n).map(|_| lb.next("k")).collect();
                let expected: Vec<usize> = (0..n).collect();
                assert_eq!(picks, expected, "cycle {cycle} with {n} backends");
            }
        }
    }

    #[test]
    fn test_weighted_round_robin_distribution() {
        let backends = vec![backend(1, false), backend(1, false), backend(2, false)];
        let lb = LoadBalancer::new(BalanceMode::WeightedRoundRobin, &backends).unwrap();

        let mut counts = [0usize; 3];
        for _ in 0..400 {
            counts[lb.next("k")] += 1;
        }
        assert_eq!(counts, [100, 100, 200]);
    }

    #[test]
    fn test_weighted_round_robin_is_smooth() {
        // A heavy backend must not be picked in one long burst: with
        // weights [1, 5] the light backend appears within any window of
        // six consecutive picks.
        let backends = vec![backend(1, false), backend(5, false)];
        let lb = LoadBalancer::new(BalanceMode::WeightedRoundRobin, &backends).unwrap();
        let picks: Vec<usize> = (0..60).map(|_| lb.next("k")).collect();
        for window in picks.windows(6) {
            assert!(window.contains(&0), "light backend starved in {window:?}");
        }
    }

    #[test]
    fn test_address_hash_is_pure() {
        let lb = LoadBalancer::new(BalanceMode::AddressHash, &pool(4)).unwrap();
        let first = lb.next("192.168.1.7:51000");
        for port in 0..50 {
            // Same client IP, different ephemeral ports.
            assert_eq!(lb.next(&format!("192.168.1.7:{port}")), first);
        }
    }

    #[test]
    fn test_address_hash_v6_and_bad_keys() {
        let lb = LoadBalancer::new(BalanceMode::AddressHash, &pool(4)).unwrap();
        let v6 = lb.next("[::1]:9999");
        assert_eq!(lb.next("[::1]:1"), v6);
        // Unparseable keys still map deterministically.
        assert_eq!(lb.next("not-an-address"), lb.next("not-an-address"));
    }

    #[test]
    fn test_main_standby_prefers_first_non_standby() {
        let backends = vec![backend(1, true), backend(1, false), backend(1, true)];
        let lb = LoadBalancer::new(BalanceMode::MainStandby, &backends).unwrap();
        assert_eq!(lb.next("k"), 1);

        let all_standby = vec![backend(1, true), backend(1, true)];
        let lb = LoadBalancer::new(BalanceMode::MainStandby, &all_standby).unwrap();
        assert_eq!(lb.next("k"), 0);
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(7, 13), 1);
        assert_eq!(gcd(0, 5), 5);
    }
}
