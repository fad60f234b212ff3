//! Error types for the Bootstrap controller

use std::time::Duration;

use thiserror::Error;

use crate::source::SourceError;

/// Error variants are aligned with the condition reasons published on
/// `Ready=False`, so every failure mode maps to exactly one reason string.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create temp folder: {0}")]
    TempFolder(#[source] std::io::Error),

    #[error("failed to fetch source: {0}")]
    Fetch(#[from] SourceError),

    #[error("failed to create resource manager: {0}")]
    ResourceManager(String),

    #[error("failed to construct objects to apply: {0}")]
    ReadObjects(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("breaking schema changes detected: {0}")]
    BreakingChange(String),

    #[error("failed to apply manifests: {0}")]
    Apply(#[source] kube::Error),

    #[error("failed to wait for objects to be ready: {0}")]
    Wait(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{primary} (status patch also failed: {patch})")]
    WithStatusPatchFailure {
        primary: Box<Error>,
        patch: Box<Error>,
    },
}

impl Error {
    /// The reason string published on the `Ready` condition for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::TempFolder(_) => "TempFolderFailedToCreate",
            Error::Fetch(_) => "CRDFetchFailed",
            Error::ResourceManager(_) => "ResourceManagerCreateFailed",
            Error::ReadObjects(_) => "ReadingObjectsToApplyFailed",
            Error::Validation(_) => "CRDValidationFailed",
            Error::BreakingChange(_) => "BreakingChangeDetected",
            Error::Apply(_) => "ApplyingCRDSFailed",
            Error::Wait(_) => "WaitingOnObjectsFailed",
            Error::Kube(_) | Error::Serialization(_) => "ReconciliationFailed",
            Error::WithStatusPatchFailure { primary, .. } => primary.reason(),
        }
    }

    /// Whether the work-queue should retry this error with backoff. Spec
    /// mistakes (bad manifests, failing templates, breaking changes) stay
    /// failed until the spec changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TempFolder(_)
            | Error::Fetch(_)
            | Error::ResourceManager(_)
            | Error::Apply(_)
            | Error::Wait(_) => true,
            Error::ReadObjects(_) | Error::Validation(_) | Error::BreakingChange(_) => false,
            Error::Kube(e) => match e {
                kube::Error::Api(api_err) => {
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        code == 409 || code == 429
                    } else {
                        true
                    }
                }
                _ => true,
            },
            Error::Serialization(_) => false,
            Error::WithStatusPatchFailure { primary, .. } => primary.is_retryable(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Retry pacing for failed reconciles. The delay doubles with every
/// consecutive failure of the same object and saturates at `cap`; a random
/// spread keeps a burst of failing Bootstraps from retrying in lockstep.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling no delay exceeds (before the spread is applied).
    pub cap: Duration,
    /// Fractional spread around the computed delay, in [0, 1). A spread of
    /// 0.25 lands the delay anywhere within ±25% of the computed value.
    pub spread: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(900),
            spread: 0.25,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt`, where 0 is the first retry.
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let capped = doubled.min(self.cap);

        let factor = 1.0 + self.spread * (rand::random::<f64>() * 2.0 - 1.0);

        capped.mul_f64(factor.max(0.0))
    }

    /// Delay for a failed reconcile. Retryable errors climb the exponential
    /// curve; non-retryable ones park at the cap, where they still get the
    /// occasional re-run in case the upstream fixed itself.
    pub fn delay_for(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay(attempt)
        } else {
            self.cap
        }
    }
}

/// Consecutive-failure counts per object, keyed by `namespace/name`.
///
/// `error_policy` reads and bumps the count to pick a backoff delay; the
/// first successful reconcile (and teardown) clears it.
#[derive(Default)]
pub struct RetryLedger {
    counts: std::sync::Mutex<std::collections::HashMap<String, u32>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    /// Records one more failure and returns the attempt number to back off
    /// with: 0 for the first failure, 1 for the second, and so on.
    pub fn note_failure(&self, namespace: &str, name: &str) -> u32 {
        let mut counts = self.counts.lock().expect("retry ledger lock poisoned");
        let count = counts.entry(Self::key(namespace, name)).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);

        attempt
    }

    /// Forgets the object's failure history.
    pub fn reset(&self, namespace: &str, name: &str) {
        let mut counts = self.counts.lock().expect("retry ledger lock poisoned");
        counts.remove(&Self::key(namespace, name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(base_secs: u64, cap_secs: u64) -> Backoff {
        // spread 0 makes delays deterministic for assertions
        Backoff {
            base: Duration::from_secs(base_secs),
            cap: Duration::from_secs(cap_secs),
            spread: 0.0,
        }
    }

    #[test]
    fn retry_delays_double_up_to_the_cap() {
        let backoff = exact(2, 900);

        assert_eq!(backoff.delay(0), Duration::from_secs(2));
        assert_eq!(backoff.delay(1), Duration::from_secs(4));
        assert_eq!(backoff.delay(2), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(64));

        // 2 * 2^9 = 1024s, past the cap.
        assert_eq!(backoff.delay(9), Duration::from_secs(900));
        // Absurd attempt numbers must not overflow.
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(900));
    }

    #[test]
    fn spread_stays_within_bounds() {
        let backoff = Backoff {
            base: Duration::from_secs(4),
            cap: Duration::from_secs(900),
            spread: 0.25,
        };

        for _ in 0..50 {
            let delay = backoff.delay(2);
            assert!(delay >= Duration::from_secs(12), "got {delay:?}");
            assert!(delay <= Duration::from_secs(20), "got {delay:?}");
        }
    }

    #[test]
    fn non_retryable_errors_park_at_the_cap() {
        let backoff = exact(2, 900);
        let err = Error::Validation("template mismatch".to_string());

        assert!(!err.is_retryable());
        assert_eq!(backoff.delay_for(&err, 0), Duration::from_secs(900));
        assert_eq!(backoff.delay_for(&err, 7), Duration::from_secs(900));
    }

    #[test]
    fn retryable_errors_climb_with_the_ledger() {
        let backoff = exact(2, 900);
        let ledger = RetryLedger::new();
        let err = Error::Wait("CRD never established".to_string());

        let mut last = Duration::ZERO;
        for _ in 0..5 {
            let attempt = ledger.note_failure("default", "bootstrap-sample");
            let delay = backoff.delay_for(&err, attempt);
            assert!(delay > last, "delay {delay:?} did not grow past {last:?}");
            last = delay;
        }

        // A success wipes the history and the next failure starts over.
        ledger.reset("default", "bootstrap-sample");
        assert_eq!(ledger.note_failure("default", "bootstrap-sample"), 0);
    }

    #[test]
    fn ledger_tracks_objects_independently() {
        let ledger = RetryLedger::new();

        assert_eq!(ledger.note_failure("default", "a"), 0);
        assert_eq!(ledger.note_failure("default", "a"), 1);
        assert_eq!(ledger.note_failure("other", "a"), 0);
        assert_eq!(ledger.note_failure("default", "b"), 0);
    }
}
