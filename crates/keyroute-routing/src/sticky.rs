//! Sticky session routing
//!
//! A session can be bound to a model (any alias serving it) or to a single
//! key, and can carry provider allowlists and disabled targets. A bound
//! session selects from its own ordered candidate queue instead of the route
//! tiers. Failing keys rotate to the tail of the queue so the next pick
//! prefers a different alias; hard-blocked keys leave the queue.
//!
//! When no queued candidate is selectable, the binding is cleared and the
//! caller falls through to normal tier selection. Filters survive the clear.
//!
//! ## Lock order
//!
//! Session state is locked before the selectability callback runs, and the
//! callback only touches quota and series state. Nothing here calls back
//! into the sticky map while a session is locked.

use dashmap::DashMap;
use keyroute_core::{ProviderKey, RequestHint, TargetSelector};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Binding mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StickyMode {
    #[default]
    None,
    StickyModel,
    StickyKey,
}

/// Provider allowlist and disabled targets of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    /// Empty means every provider is allowed
    pub allowed_providers: BTreeSet<String>,
    pub disabled_targets: Vec<TargetSelector>,
}

impl SessionFilter {
    pub fn permits(&self, key: &ProviderKey) -> bool {
        (self.allowed_providers.is_empty() || self.allowed_providers.contains(&key.provider_id))
            && !self.disabled_targets.iter().any(|target| target.matches(key))
    }

    pub fn is_empty(&self) -> bool {
        self.allowed_providers.is_empty() && self.disabled_targets.is_empty()
    }
}

/// Routing state of one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StickySessionState {
    pub mode: StickyMode,
    /// Bound (provider, model), if any
    pub target: Option<(String, String)>,
    /// Candidates in preference order
    pub queue: VecDeque<ProviderKey>,
    #[serde(flatten)]
    pub filter: SessionFilter,
}

impl StickySessionState {
    fn unbind(&mut self) {
        self.mode = StickyMode::None;
        self.target = None;
        self.queue.clear();
    }
}

/// Outcome of a sticky selection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StickyOutcome {
    /// No binding applies to this request
    NotApplicable,
    Selected(ProviderKey),
    /// The binding had no selectable candidate left and was cleared
    Cleared,
}

type SharedSession = Arc<Mutex<StickySessionState>>;

/// Per-session sticky state
#[derive(Debug, Default)]
pub struct StickySessionSelector {
    sessions: DashMap<String, SharedSession>,
}

impl StickySessionSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, session: &str) -> SharedSession {
        self.sessions
            .entry(session.to_string())
            .or_default()
            .clone()
    }

    fn existing(&self, session: &str) -> Option<SharedSession> {
        self.sessions.get(session).map(|state| state.clone())
    }

    /// Bind a session to every key serving `provider_id`/`model_id`
    ///
    /// `pool` is the candidate set in config order. Returns false (and
    /// leaves the session untouched) if the pool is empty.
    pub fn set_sticky_model(
        &self,
        session: &str,
        provider_id: &str,
        model_id: &str,
        pool: Vec<ProviderKey>,
    ) -> bool {
        if pool.is_empty() {
            tracing::warn!(
                session = %session,
                provider = %provider_id,
                model = %model_id,
                "Sticky model has no configured keys, ignoring"
            );
            return false;
        }

        let shared = self.session(session);
        let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.mode = StickyMode::StickyModel;
        state.target = Some((provider_id.to_string(), model_id.to_string()));
        state.queue = pool.into();

        tracing::info!(
            session = %session,
            provider = %provider_id,
            model = %model_id,
            candidates = state.queue.len(),
            "Session bound to sticky model"
        );
        true
    }

    /// Bind a session to one key
    pub fn set_sticky_key(&self, session: &str, key: ProviderKey) {
        let shared = self.session(session);
        let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.mode = StickyMode::StickyKey;
        state.target = Some((key.provider_id.clone(), key.model_id.clone()));
        tracing::info!(session = %session, key = %key, "Session bound to sticky key");
        state.queue = VecDeque::from([key]);
    }

    /// Restrict the session to the given providers (empty lifts the restriction)
    pub fn set_allowlist(&self, session: &str, providers: impl IntoIterator<Item = String>) {
        let shared = self.session(session);
        let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.filter.allowed_providers = providers.into_iter().collect();
        tracing::debug!(session = %session, allowed = ?state.filter.allowed_providers, "Session allowlist set");
    }

    pub fn set_disabled(&self, session: &str, target: TargetSelector) {
        let shared = self.session(session);
        let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.filter.disabled_targets.contains(&target) {
            tracing::debug!(session = %session, provider = %target.provider_id, "Session target disabled");
            state.filter.disabled_targets.push(target);
        }
    }

    /// Lift a previous disable of exactly this target
    pub fn set_enabled(&self, session: &str, target: &TargetSelector) {
        let Some(shared) = self.existing(session) else {
            return;
        };
        let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.filter.disabled_targets.retain(|disabled| disabled != target);
    }

    /// Drop all routing state of a session
    pub fn clear(&self, session: &str) -> bool {
        let removed = self.sessions.remove(session).is_some();
        if removed {
            tracing::info!(session = %session, "Sticky session cleared");
        }
        removed
    }

    /// Copy of a session's state
    pub fn view(&self, session: &str) -> Option<StickySessionState> {
        self.existing(session).map(|shared| {
            shared
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        })
    }

    /// Session filters applied to normal tier selection
    pub fn filter(&self, session: &str) -> Option<SessionFilter> {
        let shared = self.existing(session)?;
        let state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (!state.filter.is_empty()).then(|| state.filter.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Select from the session's sticky queue
    ///
    /// Any request hint bypasses sticky routing, and so does a route that
    /// serves none of the queued keys (`in_route`); the binding is kept for
    /// the routes that do. With `recover` set, the candidate with the highest
    /// current weight wins instead of the queue head; ties go to the earlier
    /// queue position.
    pub fn select<R, F, W>(
        &self,
        session: &str,
        hint: Option<RequestHint>,
        in_route: R,
        is_selectable: F,
        weight: W,
        recover: bool,
    ) -> StickyOutcome
    where
        R: Fn(&ProviderKey) -> bool,
        F: Fn(&ProviderKey) -> bool,
        W: Fn(&ProviderKey) -> u32,
    {
        if hint.is_some() {
            return StickyOutcome::NotApplicable;
        }
        let Some(shared) = self.existing(session) else {
            return StickyOutcome::NotApplicable;
        };

        let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.mode == StickyMode::None || !state.queue.iter().any(&in_route) {
            return StickyOutcome::NotApplicable;
        }

        let mut candidates = state
            .queue
            .iter()
            .filter(|key| in_route(*key) && state.filter.permits(key) && is_selectable(*key));

        let picked = if recover {
            let mut best: Option<(&ProviderKey, u32)> = None;
            for key in candidates {
                let w = weight(key);
                match best {
                    Some((_, best_weight)) if best_weight >= w => {}
                    _ => best = Some((key, w)),
                }
            }
            best.map(|(key, _)| key.clone())
        } else {
            candidates.next().cloned()
        };

        if let Some(key) = picked {
            return StickyOutcome::Selected(key);
        }

        tracing::info!(
            session = %session,
            mode = ?state.mode,
            "Sticky pool exhausted, clearing binding"
        );
        state.unbind();
        let keep_filters = !state.filter.is_empty();
        drop(state);

        if !keep_filters {
            self.sessions.remove_if(session, |_, current| Arc::ptr_eq(current, &shared));
        }
        StickyOutcome::Cleared
    }

    /// Rotate a failing key to the tail of a sticky-model queue
    ///
    /// Hard-blocked keys are removed instead. Sticky-key bindings are left
    /// alone; they clear on the next selection if the key stays blocked.
    pub fn on_failure(&self, session: &str, key: &ProviderKey, hard_block: bool) {
        let Some(shared) = self.existing(session) else {
            return;
        };
        let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.mode != StickyMode::StickyModel {
            return;
        }

        let Some(position) = state.queue.iter().position(|queued| queued == key) else {
            return;
        };
        if let Some(failed) = state.queue.remove(position) {
            if !hard_block {
                state.queue.push_back(failed);
            }
        }
        tracing::debug!(
            session = %session,
            key = %key,
            removed = hard_block,
            "Sticky candidate rotated after failure"
        );
    }
}
