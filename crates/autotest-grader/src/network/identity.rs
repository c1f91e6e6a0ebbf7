// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run network identities.
//!
//! Each grading container gets a locally administered unicast MAC address
//! (`02:XX:XX:XX:XX:XX`). The address is the key the firewall uses to divert
//! the container's traffic into its own chain, so two in-flight runs must
//! never hold the same one.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// A MAC address string in `02:XX:XX:XX:XX:XX` form (uppercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacAddress(String);

impl MacAddress {
    /// Build an address from the five random octets following the fixed `02` prefix.
    pub fn from_octets(octets: [u8; 5]) -> Self {
        let tail: Vec<String> = octets.iter().map(|b| format!("{:02X}", b)).collect();
        Self(format!("02:{}", tail.join(":")))
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The twelve hex digits without separators.
    pub fn compact(&self) -> String {
        self.0.replace(':', "")
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of candidate addresses.
pub trait AddressSource: Send {
    /// Produce the next candidate. May repeat earlier values.
    fn next_candidate(&mut self) -> MacAddress;
}

/// Random candidates from a seedable RNG.
pub struct RandomSource {
    rng: StdRng,
}

impl RandomSource {
    /// Seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic source.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl AddressSource for RandomSource {
    fn next_candidate(&mut self) -> MacAddress {
        MacAddress::from_octets(self.rng.r#gen())
    }
}

struct PoolState {
    held: HashSet<MacAddress>,
    source: Box<dyn AddressSource>,
}

/// Process-wide set of acquired addresses.
///
/// `acquire` and `release` share one critical section.
pub struct MacAddressPool {
    state: Mutex<PoolState>,
}

impl Default for MacAddressPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MacAddressPool {
    /// Pool drawing random addresses.
    pub fn new() -> Self {
        Self::with_source(Box::new(RandomSource::from_entropy()))
    }

    /// Pool drawing candidates from `source`.
    pub fn with_source(source: Box<dyn AddressSource>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                held: HashSet::new(),
                source,
            }),
        }
    }

    /// Acquire an address not currently held by any other run.
    ///
    /// Retries until the source yields a free candidate.
    pub fn acquire(&self) -> MacAddress {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let candidate = state.source.next_candidate();
            if state.held.insert(candidate.clone()) {
                debug!(mac = %candidate, attempts, "Acquired MAC address");
                return candidate;
            }
        }
    }

    /// Release an address. Releasing an address that is not held is a no-op.
    pub fn release(&self, address: &MacAddress) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.held.remove(address) {
            debug!(mac = %address, "Released MAC address");
        }
    }

    /// Whether `address` is currently held.
    pub fn is_held(&self, address: &MacAddress) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .held
            .contains(address)
    }

    /// Number of addresses currently held.
    pub fn held_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .held
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed list of candidates, repeating the last one forever.
    struct Scripted(VecDeque<MacAddress>);

    impl AddressSource for Scripted {
        fn next_candidate(&mut self) -> MacAddress {
            if self.0.len() > 1 {
                self.0.pop_front().unwrap()
            } else {
                self.0.front().cloned().unwrap()
            }
        }
    }

    fn mac(last: u8) -> MacAddress {
        MacAddress::from_octets([0xAA, 0xBB, 0xCC, 0xDD, last])
    }

    #[test]
    fn test_format() {
        let addr = MacAddress::from_octets([0x0a, 0x1b, 0x2c, 0x3d, 0x4e]);
        assert_eq!(addr.as_str(), "02:0A:1B:2C:3D:4E");
        assert_eq!(addr.compact(), "020A1B2C3D4E");
        assert_eq!(addr.to_string(), "02:0A:1B:2C:3D:4E");
    }

    #[test]
    fn test_random_addresses_are_locally_administered() {
        let mut source = RandomSource::seeded(42);
        for _ in 0..50 {
            let addr = source.next_candidate();
            assert!(addr.as_str().starts_with("02:"));
            assert_eq!(addr.as_str().len(), 17);
            assert!(
                addr.compact()
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
            );
        }
    }

    #[test]
    fn test_acquire_unique_without_release() {
        let pool = MacAddressPool::new();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            assert!(seen.insert(pool.acquire()));
        }
        assert_eq!(pool.held_count(), 500);
    }

    #[test]
    fn test_acquire_retries_on_collision() {
        let source = Scripted(VecDeque::from(vec![mac(1), mac(1), mac(1), mac(2)]));
        let pool = MacAddressPool::with_source(Box::new(source));

        let first = pool.acquire();
        let second = pool.acquire();

        assert_eq!(first, mac(1));
        assert_eq!(second, mac(2));
    }

    #[test]
    fn test_reuse_after_release() {
        let source = Scripted(VecDeque::from(vec![mac(1), mac(1), mac(2), mac(1)]));
        let pool = MacAddressPool::with_source(Box::new(source));

        let first = pool.acquire();
        assert_eq!(first, mac(1));
        // mac(1) is held, so the pool skips it
        assert_eq!(pool.acquire(), mac(2));

        pool.release(&first);
        assert!(!pool.is_held(&first));
        assert_eq!(pool.acquire(), mac(1));
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let pool = MacAddressPool::new();
        let held = pool.acquire();
        pool.release(&mac(9));
        pool.release(&mac(9));
        assert!(pool.is_held(&held));
        assert_eq!(pool.held_count(), 1);
    }

    #[test]
    fn test_concurrent_acquire_is_unique() {
        let pool = std::sync::Arc::new(MacAddressPool::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..100).map(|_| pool.acquire()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for addr in handle.join().unwrap() {
                assert!(all.insert(addr));
            }
        }
        assert_eq!(pool.held_count(), 800);
    }
}
