//! Watch state of every store.
//!
//! The [`StateHolder`] publishes an immutable [`StateSnapshot`]. Writers take a
//! [`StateHolder::pending`] copy, modify it and swap it in whole with
//! [`StateHolder::update_state`], so readers such as the health endpoint never
//! block and never see a half-applied update.

use crate::backoff::{calculate_backoff, deadline_after};
use crate::types::WatchKey;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct State {
    watch_keys: Vec<WatchKey>,
    next_refresh_check: Instant,
    refresh_interval_secs: i64,
    refresh_attempts: u32,
}

impl State {
    pub fn new(watch_keys: Vec<WatchKey>, refresh_interval_secs: i64) -> Self {
        State {
            watch_keys,
            next_refresh_check: deadline_after(Instant::now(), interval(refresh_interval_secs)),
            refresh_interval_secs,
            refresh_attempts: 0,
        }
    }

    pub fn watch_keys(&self) -> &[WatchKey] {
        &self.watch_keys
    }

    pub fn next_refresh_check(&self) -> Instant {
        self.next_refresh_check
    }

    pub fn refresh_interval_secs(&self) -> i64 {
        self.refresh_interval_secs
    }

    pub fn refresh_attempts(&self) -> u32 {
        self.refresh_attempts
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_refresh_check
    }
}

// Negative intervals mean "check on every cycle".
fn interval(secs: i64) -> Duration {
    Duration::from_secs(secs.max(0) as u64)
}

/// Computes the next check of an expired timer after a failed cycle. Timers
/// that have not expired yet are left alone.
fn next_check_after_failure(
    current: Instant,
    attempts: u32,
    interval_secs: i64,
    min_backoff: Duration,
    max_backoff: Duration,
    now: Instant,
) -> Option<Instant> {
    if now < current {
        return None;
    }

    let min_backoff_secs = i64::try_from(min_backoff.as_secs()).unwrap_or(i64::MAX);
    let delay = if interval_secs < min_backoff_secs {
        calculate_backoff(attempts, min_backoff, max_backoff)
    } else {
        interval(interval_secs)
    };
    Some(deadline_after(now, delay))
}

#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    states: HashMap<String, State>,
    feature_flag_states: HashMap<String, State>,
    load_state: HashMap<String, bool>,
    load_state_feature_flag: HashMap<String, bool>,
    next_forced_refresh: Option<Instant>,
    forced_refresh_attempts: u32,
}

impl StateSnapshot {
    pub fn get_state(&self, origin: &str) -> Option<&State> {
        self.states.get(origin)
    }

    pub fn get_state_feature_flag(&self, origin: &str) -> Option<&State> {
        self.feature_flag_states.get(origin)
    }

    pub fn get_load_state(&self, origin: &str) -> bool {
        self.load_state.get(origin).copied().unwrap_or(false)
    }

    pub fn get_load_state_feature_flag(&self, origin: &str) -> bool {
        self.load_state_feature_flag
            .get(origin)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_state(
        &mut self,
        origin: &str,
        watch_keys: Vec<WatchKey>,
        refresh_interval_secs: i64,
    ) -> &mut Self {
        self.states.insert(
            origin.to_string(),
            State::new(watch_keys, refresh_interval_secs),
        );
        self
    }

    pub fn set_state_feature_flag(
        &mut self,
        origin: &str,
        watch_keys: Vec<WatchKey>,
        refresh_interval_secs: i64,
    ) -> &mut Self {
        self.feature_flag_states.insert(
            origin.to_string(),
            State::new(watch_keys, refresh_interval_secs),
        );
        self
    }

    pub fn set_load_state(&mut self, origin: &str, loaded: bool) -> &mut Self {
        self.load_state.insert(origin.to_string(), loaded);
        self
    }

    pub fn set_load_state_feature_flag(&mut self, origin: &str, loaded: bool) -> &mut Self {
        self.load_state_feature_flag
            .insert(origin.to_string(), loaded);
        self
    }

    /// Makes the store due on the next cycle. States with a negative refresh
    /// interval are left unchanged.
    pub fn expire_state(&mut self, origin: &str) -> &mut Self {
        let now = Instant::now();
        for states in [&mut self.states, &mut self.feature_flag_states] {
            if let Some(state) = states.get_mut(origin)
                && state.refresh_interval_secs >= 0
            {
                state.next_refresh_check = now;
            }
        }
        self
    }

    pub fn next_forced_refresh(&self) -> Option<Instant> {
        self.next_forced_refresh
    }

    pub fn is_forced_refresh_due(&self, now: Instant) -> bool {
        self.next_forced_refresh.is_some_and(|t| now >= t)
    }

    pub fn schedule_forced_refresh(&mut self, refresh_interval: Duration) -> &mut Self {
        self.next_forced_refresh = Some(deadline_after(Instant::now(), refresh_interval));
        self.forced_refresh_attempts = 0;
        self
    }

    /// Pushes every expired timer out after a failed cycle so that a failing
    /// store is not retried on every tick. Intervals shorter than the minimum
    /// backoff are replaced by an exponential backoff.
    pub fn update_next_refresh_time(
        &mut self,
        forced_refresh_interval: Option<Duration>,
        min_backoff: Duration,
        max_backoff: Duration,
    ) -> &mut Self {
        let now = Instant::now();

        if let (Some(refresh_interval), Some(current)) =
            (forced_refresh_interval, self.next_forced_refresh)
        {
            let attempts = self.forced_refresh_attempts.saturating_add(1);
            let interval_secs = i64::try_from(refresh_interval.as_secs()).unwrap_or(i64::MAX);
            if let Some(next) =
                next_check_after_failure(current, attempts, interval_secs, min_backoff, max_backoff, now)
            {
                self.next_forced_refresh = Some(next);
                self.forced_refresh_attempts = attempts;
            }
        }

        for state in self
            .states
            .values_mut()
            .chain(self.feature_flag_states.values_mut())
        {
            let attempts = state.refresh_attempts.saturating_add(1);
            if let Some(next) = next_check_after_failure(
                state.next_refresh_check,
                attempts,
                state.refresh_interval_secs,
                min_backoff,
                max_backoff,
                now,
            ) {
                state.next_refresh_check = next;
                state.refresh_attempts = attempts;
            }
        }

        self
    }
}

/// Process wide holder of the current [`StateSnapshot`].
#[derive(Default)]
pub struct StateHolder {
    snapshot: ArcSwap<StateSnapshot>,
}

impl StateHolder {
    pub fn new() -> Self {
        StateHolder::default()
    }

    pub fn current(&self) -> Arc<StateSnapshot> {
        self.snapshot.load_full()
    }

    /// A copy of the current snapshot to modify and commit with [`Self::update_state`].
    pub fn pending(&self) -> StateSnapshot {
        self.snapshot.load().as_ref().clone()
    }

    pub fn update_state(&self, snapshot: StateSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn get_state(&self, origin: &str) -> Option<State> {
        self.snapshot.load().get_state(origin).cloned()
    }

    pub fn get_state_feature_flag(&self, origin: &str) -> Option<State> {
        self.snapshot.load().get_state_feature_flag(origin).cloned()
    }

    pub fn get_load_state(&self, origin: &str) -> bool {
        self.snapshot.load().get_load_state(origin)
    }

    pub fn get_load_state_feature_flag(&self, origin: &str) -> bool {
        self.snapshot.load().get_load_state_feature_flag(origin)
    }
}
