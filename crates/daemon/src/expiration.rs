// Lease expiration policy: a pure predicate over (now, renewal, expiration).
//
// The policy is immutable after construction. Garbage collection is off by
// default; a disabled policy never expires anything, which turns the
// crawler's sweep into a scan-only pass.

use holdfast_common::types::ShareType;

/// How lease expiry is computed when the policy is enabled.
///
/// Invalid combinations (a cutoff date in age mode, an override duration in
/// cutoff-date mode) are unrepresentable; the config layer maps user input
/// into this enum and rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationMode {
    /// Each lease expires on its own schedule, optionally overridden by a
    /// server-wide duration measured from the last renewal.
    Age { override_lease_duration: Option<i64> },
    /// Every lease renewed before the cutoff is expired, regardless of its
    /// own expiration time.
    CutoffDate { cutoff_date: i64 },
}

/// The "configured-expiration-mode" 4-tuple embedded in history entries:
/// `(mode, override_lease_duration, cutoff_date, sharetypes)`.
pub type PolicyParameters = (&'static str, Option<i64>, Option<i64>, Vec<&'static str>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    enabled: bool,
    mode: ExpirationMode,
}

impl ExpirationPolicy {
    pub fn new(enabled: bool, mode: ExpirationMode) -> Self {
        Self { enabled, mode }
    }

    /// Scan-only policy: never expires anything.
    pub fn disabled() -> Self {
        Self::new(false, ExpirationMode::Age { override_lease_duration: None })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> ExpirationMode {
        self.mode
    }

    /// Has a lease with the given timestamps expired as of `now`?
    pub fn should_expire(&self, now: i64, renewal_time: i64, expiration_time: i64) -> bool {
        if !self.enabled {
            return false;
        }

        let expiry_time = match self.mode {
            ExpirationMode::Age { override_lease_duration: None } => expiration_time,
            ExpirationMode::Age { override_lease_duration: Some(duration) } => {
                renewal_time + duration
            }
            ExpirationMode::CutoffDate { cutoff_date } => cutoff_date,
        };

        now >= expiry_time
    }

    /// Parameters as recorded in the "configured-expiration-mode" field of a
    /// history entry.
    pub fn parameters(&self) -> PolicyParameters {
        let (mode, override_lease_duration, cutoff_date) = match self.mode {
            ExpirationMode::Age { override_lease_duration } => {
                ("age", override_lease_duration, None)
            }
            ExpirationMode::CutoffDate { cutoff_date } => ("cutoff-date", None, Some(cutoff_date)),
        };

        let sharetypes = if self.enabled {
            vec![ShareType::Mutable.as_str(), ShareType::Immutable.as_str()]
        } else {
            Vec::new()
        };

        (mode, override_lease_duration, cutoff_date, sharetypes)
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}
