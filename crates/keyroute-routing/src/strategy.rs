//! Smooth weighted round-robin
//!
//! Deterministic, interleaved weighted rotation for round-robin tiers
//! (the Nginx algorithm):
//!
//! 1. Add each selectable key's current weight to its credit
//! 2. Pick the key with the highest credit (earlier target on ties)
//! 3. Debit the picked key by the total weight of this round
//!
//! Weights are supplied fresh on every call because health decay changes
//! them continuously. Each key's share converges to its weight share with
//! no randomness involved.
//!
//! ## Starvation guard
//!
//! Plain SWRR can leave a low-weight key waiting slightly longer than
//! `k / min_multiplier` picks. A key that has waited `bound - 1` picks is
//! chosen outright, so every selectable key is picked at least once in any
//! `bound` consecutive selections.
//!
//! ## Thread Safety
//!
//! Credits live behind one mutex per tier, so updates within a tier are
//! serialized while different tiers never contend.

use dashmap::DashMap;
use keyroute_core::ProviderKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Credit state of one tier
#[derive(Debug, Default)]
struct TierCredits {
    credits: HashMap<ProviderKey, i64>,
    /// Selections since each key was last picked
    waiting: HashMap<ProviderKey, usize>,
}

/// Smooth weighted round-robin selector keyed by tier identity
#[derive(Debug, Default)]
pub struct SmoothWeightedRoundRobin {
    tiers: DashMap<String, Arc<Mutex<TierCredits>>>,
}

/// Picks within which every one of `candidates` keys is guaranteed a turn
pub fn starvation_bound(candidates: usize, min_multiplier: f64) -> usize {
    if candidates == 0 {
        return 0;
    }
    let bound = (candidates as f64 / min_multiplier).ceil() as usize;
    bound.max(candidates)
}

impl SmoothWeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select from `candidates` (key, weight) in config order
    ///
    /// Returns `None` when there is no candidate or every weight is zero.
    pub fn select(
        &self,
        tier_id: &str,
        candidates: &[(ProviderKey, u32)],
        bound: usize,
    ) -> Option<ProviderKey> {
        let total: i64 = candidates.iter().map(|(_, w)| i64::from(*w)).sum();
        if total == 0 {
            return None;
        }

        let state = self
            .tiers
            .entry(tier_id.to_string())
            .or_default()
            .clone();
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let TierCredits { credits, waiting } = &mut *state;

        // Keys leaving the rotation restart from zero when they come back
        credits.retain(|key, _| candidates.iter().any(|(k, _)| k == key));
        waiting.retain(|key, _| candidates.iter().any(|(k, _)| k == key));

        for (key, weight) in candidates {
            *credits.entry(key.clone()).or_insert(0) += i64::from(*weight);
        }

        // Longest-waiting overdue key; the earlier key wins equal waits
        let mut overdue: Option<(&ProviderKey, usize)> = None;
        for (key, weight) in candidates {
            let wait = waiting.get(key).copied().unwrap_or(0);
            if *weight == 0 || wait + 1 < bound {
                continue;
            }
            match overdue {
                Some((_, longest)) if longest >= wait => {}
                _ => overdue = Some((key, wait)),
            }
        }

        let picked = match overdue {
            Some((key, _)) => key,
            None => {
                let mut best: Option<(&ProviderKey, i64)> = None;
                for (key, _) in candidates {
                    let credit = credits.get(key).copied().unwrap_or(0);
                    match best {
                        Some((_, best_credit)) if best_credit >= credit => {}
                        _ => best = Some((key, credit)),
                    }
                }
                best.map(|(key, _)| key)?
            }
        };

        if let Some(credit) = credits.get_mut(picked) {
            *credit -= total;
        }
        for (key, _) in candidates {
            *waiting.entry(key.clone()).or_insert(0) += 1;
        }
        waiting.insert(picked.clone(), 0);

        Some(picked.clone())
    }

    /// Drop all credits (on config publish)
    pub fn reset(&self) {
        self.tiers.clear();
    }
}
