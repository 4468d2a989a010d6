use crate::error::Error;

/// The default number of total attempts for retryable faults.
pub const DEFAULT_ATTEMPTS: u32 = 2;

/// An explicit retry policy parameterized by fault classification.
///
/// Call sites that generate fresh randomness per attempt (session create,
/// rotation, token issue) take a [`RetryBudget`] and loop themselves, so
/// the retry is visible where it happens instead of wrapping every call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy with the given total attempt count (minimum 1).
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
        }
    }

    /// Starts a fresh budget for one logical operation.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            remaining: self.max_attempts - 1,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS)
    }
}

/// The remaining attempts for one logical operation.
#[derive(Debug)]
pub struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    /// Whether the fault should be retried: it must be classified as
    /// retryable and the budget must not be exhausted. Consumes one
    /// attempt when it answers `true`.
    pub fn permits(&mut self, error: &Error) -> bool {
        if self.remaining == 0 || !error.is_retryable() {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_fault_consumes_budget() {
        let mut budget = RetryPolicy::new(2).budget();
        assert!(budget.permits(&Error::Collision));
        assert!(!budget.permits(&Error::Collision));
    }

    #[test]
    fn fatal_fault_never_permitted() {
        let mut budget = RetryPolicy::new(5).budget();
        assert!(!budget.permits(&Error::ConcurrentUpdate));
        assert!(!budget.permits(&Error::NotLoaded));
    }

    #[test]
    fn unique_violation_is_retryable() {
        let mut budget = RetryPolicy::default().budget();
        assert!(budget.permits(&Error::UniqueViolation));
        assert!(!budget.permits(&Error::UniqueViolation));
    }
}
