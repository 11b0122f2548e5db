//! Retry budgets for transiently failing exchanges

use std::time::Duration;

/// How often, and after what delays, a transiently failed exchange is retried
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_retries: u32,
    first_delay: Duration,
    max_delay: Duration,
    growth: u32,
}

impl Default for RetryPolicy {
    /// Retries twice, waiting 100 ms and then 200 ms
    ///
    /// Delays double on each retry, up to 15 seconds.
    fn default() -> Self {
        Self {
            max_retries: 2,
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(15),
            growth: 2,
        }
    }
}

impl RetryPolicy {
    /// Constructs a retry policy
    ///
    /// The first retry waits `first_delay`. Each later retry waits `growth`
    /// times longer than the one before, but never longer than `max_delay`.
    pub fn new(max_retries: u32, first_delay: Duration, max_delay: Duration, growth: u32) -> Self {
        Self {
            max_retries,
            first_delay,
            max_delay,
            growth,
        }
    }

    /// A policy that never retries
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// The number of retries allowed after the first failure
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Starts a fresh budget for one attempt
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            policy: self.clone(),
            spent: 0,
            last_delay: None,
        }
    }
}

/// The retries left to one attempt
#[derive(Debug)]
pub struct RetryBudget {
    policy: RetryPolicy,
    spent: u32,
    last_delay: Option<Duration>,
}

impl RetryBudget {
    /// Spends a retry, returning how long to wait before it
    ///
    /// Returns `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.spent >= self.policy.max_retries {
            return None;
        }

        let delay = match self.last_delay {
            Some(last) => last
                .saturating_mul(self.policy.growth)
                .min(self.policy.max_delay),
            None => self.policy.first_delay.min(self.policy.max_delay),
        };

        self.spent += 1;
        self.last_delay = Some(delay);
        Some(delay)
    }

    /// The retries spent so far
    pub fn spent(&self) -> u32 {
        self.spent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_up_to_the_cap_until_spent() {
        let mut budget =
            RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(350), 2).budget();

        assert_eq!(budget.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(budget.spent(), 4);
        assert_eq!(budget.next_delay(), None);
        assert_eq!(budget.spent(), 4);
    }

    #[test]
    fn each_budget_starts_afresh() {
        let policy = RetryPolicy::default();
        let mut first = policy.budget();
        while first.next_delay().is_some() {}

        let mut second = policy.budget();
        assert_eq!(second.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn never_retries() {
        assert_eq!(RetryPolicy::never().budget().next_delay(), None);
    }
}
