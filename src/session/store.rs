use super::{ImageContext, SessionBinding};
use crate::models::InjectionPolicy;
use crate::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Result of [`SessionStore::consume`] for a known key.
#[derive(Debug, Clone, PartialEq)]
pub enum Consumed {
    /// First consumer: the context as it was before being marked injected.
    Fresh(ImageContext),
    AlreadyInjected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindOutcome {
    pub binding: SessionBinding,
    /// False when the same pair was already bound.
    pub newly_bound: bool,
    /// Whether the temporary key had a context that is now reachable through the binding.
    /// A context already held by the durable key alone does not count.
    pub has_context: bool,
    /// Context previously stored under the durable key and displaced by the move.
    pub replaced: Option<ImageContext>,
}

#[derive(Debug)]
struct BindingEntry {
    durable_key: String,
    bound_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoreState {
    contexts: HashMap<String, ImageContext>,
    bindings: HashMap<String, BindingEntry>,
}

impl StoreState {
    fn canonical(&self, key: &str) -> String {
        self.bindings
            .get(key)
            .map(|entry| entry.durable_key.clone())
            .unwrap_or_else(|| key.to_string())
    }

    fn drop_bindings_to(&mut self, canonical: &str) {
        self.bindings.retain(|_, entry| entry.durable_key != canonical);
    }
}

/// Process-wide map from session key to image context.
///
/// Every operation takes the single lock for its whole duration, so `consume`
/// is linearizable per key: two racing completions never both see an
/// un-injected image.
#[derive(Debug)]
pub struct SessionStore {
    state: Mutex<StoreState>,
    policy: InjectionPolicy,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(InjectionPolicy::default())
    }
}

impl SessionStore {
    pub fn new(policy: InjectionPolicy) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> InjectionPolicy {
        self.policy
    }

    /// Insert or replace the context for `key`, returning the one it displaced.
    ///
    /// A bound temporary key stores under its durable key.
    pub fn put(&self, key: &str, mut context: ImageContext) -> Option<ImageContext> {
        let mut state = self.state.lock();
        let canonical = state.canonical(key);
        context.session_key = canonical.clone();
        context.last_accessed_at = Utc::now();
        state.contexts.insert(canonical, context)
    }

    pub fn get(&self, key: &str) -> Result<ImageContext> {
        let state = self.state.lock();
        let canonical = state.canonical(key);
        state
            .contexts
            .get(&canonical)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no image context for session '{}'", key)))
    }

    /// True when the key names a stored context or a binding.
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock();
        state.bindings.contains_key(key) || state.contexts.contains_key(key)
    }

    pub fn resolve(&self, key: &str) -> String {
        self.state.lock().canonical(key)
    }

    pub fn bind(&self, temporary_key: &str, durable_key: &str) -> Result<BindOutcome> {
        if temporary_key == durable_key {
            return Err(Error::malformed("temporaryKey and durableKey must differ"));
        }

        let mut state = self.state.lock();
        let binding = SessionBinding {
            temporary_key: temporary_key.to_string(),
            durable_key: durable_key.to_string(),
        };

        if let Some(existing) = state.bindings.get(temporary_key) {
            if existing.durable_key != durable_key {
                return Err(Error::BindingConflict {
                    temporary_key: temporary_key.to_string(),
                    existing: existing.durable_key.clone(),
                    requested: durable_key.to_string(),
                });
            }
            return Ok(BindOutcome {
                binding,
                newly_bound: false,
                has_context: state.contexts.contains_key(durable_key),
                replaced: None,
            });
        }

        state.bindings.insert(
            temporary_key.to_string(),
            BindingEntry {
                durable_key: durable_key.to_string(),
                bound_at: Utc::now(),
            },
        );

        let moved = state.contexts.remove(temporary_key);
        let has_context = moved.is_some();
        let replaced = moved.and_then(|mut context| {
            context.session_key = durable_key.to_string();
            context.last_accessed_at = Utc::now();
            state.contexts.insert(durable_key.to_string(), context)
        });

        Ok(BindOutcome {
            binding,
            newly_bound: true,
            has_context,
            replaced,
        })
    }

    /// Atomically hand out the context for `key` at most once.
    pub fn consume(&self, key: &str) -> Result<Consumed> {
        let mut state = self.state.lock();
        let canonical = state.canonical(key);

        let context = state
            .contexts
            .get_mut(&canonical)
            .ok_or_else(|| Error::NotFound(format!("no image context for session '{}'", key)))?;

        context.last_accessed_at = Utc::now();
        if context.injected {
            return Ok(Consumed::AlreadyInjected);
        }

        let snapshot = context.clone();
        context.injected = true;

        if self.policy == InjectionPolicy::DeleteAfterUse {
            state.contexts.remove(&canonical);
            state.drop_bindings_to(&canonical);
        }

        Ok(Consumed::Fresh(snapshot))
    }

    /// Remove the context reachable from `key` along with its bindings.
    pub fn evict(&self, key: &str) -> Option<ImageContext> {
        let mut state = self.state.lock();
        let canonical = state.canonical(key);
        let removed = state.contexts.remove(&canonical);
        state.bindings.remove(key);
        state.drop_bindings_to(&canonical);
        removed
    }

    pub fn evict_expired(&self, max_age: Duration) -> Vec<ImageContext> {
        self.evict_expired_at(max_age, Utc::now())
    }

    /// Evict contexts idle for longer than `max_age` as of `now`.
    ///
    /// Bindings older than `max_age` that lead to no context are pruned too.
    pub fn evict_expired_at(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<ImageContext> {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .contexts
            .iter()
            .filter(|(_, context)| now.signed_duration_since(context.last_accessed_at) > max_age)
            .map(|(key, _)| key.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(context) = state.contexts.remove(&key) {
                evicted.push(context);
            }
            state.drop_bindings_to(&key);
        }

        let StoreState { contexts, bindings } = &mut *state;
        bindings.retain(|_, entry| {
            contexts.contains_key(&entry.durable_key)
                || now.signed_duration_since(entry.bound_at) <= max_age
        });

        evicted
    }

    pub fn len(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }
}
