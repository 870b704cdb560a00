//! Priority selection
//!
//! Targets are partitioned into contiguous `(provider, model)` groups in
//! config order. Groups score 100, 90, 80, ... and aliases inside a group
//! score 100, 99, 98, ... on top of that. The key's recent error penalty is
//! subtracted, so one transient error never flips the order but repeated
//! errors eventually demote a key below the next group.

use keyroute_core::ProviderKey;

const GROUP_BASE: i64 = 100;
const GROUP_STEP: i64 = 10;
const ALIAS_BASE: i64 = 100;
const ALIAS_STEP: i64 = 1;

/// Deterministic selector for priority-mode tiers
#[derive(Debug, Clone, Copy, Default)]
pub struct PrioritySelector;

impl PrioritySelector {
    pub fn new() -> Self {
        Self
    }

    /// Static score of every target, in config order
    pub fn base_scores(targets: &[ProviderKey]) -> Vec<i64> {
        let mut scores = Vec::with_capacity(targets.len());
        let mut group: i64 = 0;
        let mut alias: i64 = 0;

        for (index, key) in targets.iter().enumerate() {
            if index > 0 {
                if key.same_model(&targets[index - 1]) {
                    alias += 1;
                } else {
                    group += 1;
                    alias = 0;
                }
            }
            scores.push((GROUP_BASE - GROUP_STEP * group) + (ALIAS_BASE - ALIAS_STEP * alias));
        }
        scores
    }

    /// Pick the selectable target with the highest effective priority
    ///
    /// Ties go to the earlier target. `None` means the tier is exhausted.
    pub fn select<F, P>(&self, targets: &[ProviderKey], is_selectable: F, penalty: P) -> Option<ProviderKey>
    where
        F: Fn(&ProviderKey) -> bool,
        P: Fn(&ProviderKey) -> u32,
    {
        let scores = Self::base_scores(targets);
        let mut best: Option<(&ProviderKey, i64)> = None;

        for (key, score) in targets.iter().zip(scores) {
            if !is_selectable(key) {
                continue;
            }
            let effective = score - i64::from(penalty(key));
            match best {
                Some((_, best_score)) if best_score >= effective => {}
                _ => best = Some((key, effective)),
            }
        }

        best.map(|(key, _)| key.clone())
    }
}
