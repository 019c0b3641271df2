//! Identifier types and the deterministic ULID factory
//!
//! Every identifier in the system is a ULID carried as a string. Correlation
//! IDs are prefixed by the kind of primitive they belong to (`step_`,
//! `wait_`, `hook_`); run-lifecycle events correlate on the bare run ID.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_type! {
    /// Identifier of a single workflow run.
    RunId
}

id_type! {
    /// Identifier of an event within a run's log.
    ///
    /// Event IDs are monotonic ULIDs: sorting a run's events by ID yields
    /// append order.
    EventId
}

id_type! {
    /// Identifier of a logical step invocation, shared across retries.
    StepId
}

id_type! {
    /// Identifier of a hook rendez-vous point.
    HookId
}

impl RunId {
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl StepId {
    pub fn correlation(&self) -> CorrelationId {
        CorrelationId::from(self.0.as_str())
    }
}

impl HookId {
    pub fn correlation(&self) -> CorrelationId {
        CorrelationId::from(self.0.as_str())
    }
}

/// The kind of primitive a correlation ID belongs to, derived from its
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationKind {
    /// Run-lifecycle events (bare run ULID).
    Run,
    Step,
    Wait,
    Hook,
}

/// Ties a `*_created`/`*_started` event to its matching completion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub const STEP_PREFIX: &'static str = "step_";
    pub const WAIT_PREFIX: &'static str = "wait_";
    pub const HOOK_PREFIX: &'static str = "hook_";

    pub fn step(ulid: Ulid) -> Self {
        Self(format!("{}{ulid}", Self::STEP_PREFIX))
    }

    pub fn wait(ulid: Ulid) -> Self {
        Self(format!("{}{ulid}", Self::WAIT_PREFIX))
    }

    pub fn hook(ulid: Ulid) -> Self {
        Self(format!("{}{ulid}", Self::HOOK_PREFIX))
    }

    pub fn run(run_id: &RunId) -> Self {
        Self(run_id.as_str().to_string())
    }

    pub fn kind(&self) -> CorrelationKind {
        if self.0.starts_with(Self::STEP_PREFIX) {
            CorrelationKind::Step
        } else if self.0.starts_with(Self::WAIT_PREFIX) {
            CorrelationKind::Wait
        } else if self.0.starts_with(Self::HOOK_PREFIX) {
            CorrelationKind::Hook
        } else {
            CorrelationKind::Run
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_step_id(&self) -> StepId {
        StepId::from(self.0.as_str())
    }

    pub fn as_hook_id(&self) -> HookId {
        HookId::from(self.0.as_str())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Monotonic ULID source.
///
/// Two modes:
/// - [`UlidFactory::system`] draws the timestamp from the wall clock and the
///   randomness from the thread RNG. Used by storage backends for event IDs.
/// - [`UlidFactory::deterministic`] freezes the timestamp and seeds the RNG
///   from the run ID, so the Nth ULID it hands out is identical on every
///   replay of the same run. Used by the orchestrator VM for correlation IDs.
///
/// Successive ULIDs from one factory are strictly increasing.
#[derive(Debug)]
pub struct UlidFactory {
    timestamp_ms: Option<u64>,
    rng: StdRng,
    last: Option<Ulid>,
}

impl UlidFactory {
    /// Wall-clock factory with OS-seeded randomness.
    pub fn system() -> Self {
        Self {
            timestamp_ms: None,
            rng: StdRng::from_entropy(),
            last: None,
        }
    }

    /// Replay-stable factory: frozen timestamp, RNG seeded from the run ID.
    pub fn deterministic(run_id: &RunId, frozen_at: DateTime<Utc>) -> Self {
        let mut hasher = DefaultHasher::new();
        run_id.as_str().hash(&mut hasher);
        Self {
            timestamp_ms: Some(frozen_at.timestamp_millis().max(0) as u64),
            rng: StdRng::seed_from_u64(hasher.finish()),
            last: None,
        }
    }

    pub fn next(&mut self) -> Ulid {
        let ts = self
            .timestamp_ms
            .unwrap_or_else(|| Utc::now().timestamp_millis().max(0) as u64);
        let mut candidate = Ulid::from_parts(ts, self.rng.gen());
        if let Some(last) = self.last {
            if candidate <= last {
                candidate = last
                    .increment()
                    .unwrap_or_else(|| Ulid::from_parts(ts.saturating_add(1), 0));
            }
        }
        self.last = Some(candidate);
        candidate
    }

    /// A seeded f64 in `[0, 1)`, the replay-safe stand-in for ambient
    /// randomness inside a workflow body.
    pub fn random(&mut self) -> f64 {
        self.rng.gen()
    }
}

/// Generate an opaque high-entropy hook token.
pub fn generate_token() -> String {
    use rand::distributions::Alphanumeric;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_kinds() {
        let factory = &mut UlidFactory::system();
        assert_eq!(
            CorrelationId::step(factory.next()).kind(),
            CorrelationKind::Step
        );
        assert_eq!(
            CorrelationId::wait(factory.next()).kind(),
            CorrelationKind::Wait
        );
        assert_eq!(
            CorrelationId::hook(factory.next()).kind(),
            CorrelationKind::Hook
        );
        assert_eq!(
            CorrelationId::run(&RunId::generate()).kind(),
            CorrelationKind::Run
        );
    }

    #[test]
    fn test_deterministic_factory_is_replay_stable() {
        let run_id = RunId::generate();
        let frozen = Utc::now();

        let mut a = UlidFactory::deterministic(&run_id, frozen);
        let mut b = UlidFactory::deterministic(&run_id, frozen);

        for _ in 0..64 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn test_factories_for_distinct_runs_diverge() {
        let frozen = Utc::now();
        let mut a = UlidFactory::deterministic(&RunId::generate(), frozen);
        let mut b = UlidFactory::deterministic(&RunId::generate(), frozen);

        assert_ne!(a.next(), b.next());
    }

    #[test]
    fn test_monotonic_within_factory() {
        let mut factory = UlidFactory::deterministic(&RunId::generate(), Utc::now());
        let mut prev = factory.next();
        for _ in 0..256 {
            let next = factory.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_token_entropy() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 48);
        assert_ne!(a, b);
    }
}
