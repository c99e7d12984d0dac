use std::time::{Duration, Instant};

use rand::{seq::SliceRandom, Rng};
use tracing::debug;

use crate::config::ClientConfig;

/// What to do after a connection attempt failed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RetryDecision {
    /// Retry after the given delay, staying within the current budget
    Disconnected(Duration),
    /// The budget is exhausted; retry after the given delay with a fresh one
    Suspended(Duration),
}

/// Attempts made since the last successful connection
#[derive(Debug)]
struct RetryBudget {
    attempts: usize,
    started: Instant,
    /// Untried fallback hosts, in the order they will be used
    candidates: Vec<String>,
    /// Whether the candidate list has been drawn for this budget
    drawn: bool,
}

/// Reconnection delays and host selection
///
/// Two budgets are tracked independently: the per-budget attempt count and elapsed time decide
/// between Disconnected and Suspended, while the fallback window decides how long the primary
/// host is avoided after it failed.
#[derive(Debug)]
pub(crate) struct Reconnect {
    primary: String,
    fallbacks: Vec<String>,
    max_attempts: usize,
    max_duration: Duration,
    disconnected_retry: Duration,
    suspended_retry: Duration,
    fallback_window: Duration,

    budget: Option<RetryBudget>,
    /// Host of the attempt in progress
    current: Option<String>,
    /// Whether the next attempt should reuse `current`
    retry_same: bool,
    /// When the primary host last failed
    primary_failed_at: Option<Instant>,
    /// Fallback host that last connected successfully
    preferred: Option<String>,
}

impl Reconnect {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        Self {
            primary: config.primary_host.clone(),
            fallbacks: config.fallback_hosts.clone(),
            max_attempts: config.http_max_retry_count,
            max_duration: config.http_max_retry_duration,
            disconnected_retry: config.disconnected_retry_timeout,
            suspended_retry: config.suspended_retry_timeout,
            fallback_window: config.fallback_retry_timeout,
            budget: None,
            current: None,
            retry_same: false,
            primary_failed_at: None,
            preferred: None,
        }
    }

    /// Whether `now` still falls inside the window in which the primary host is avoided
    fn avoiding_primary(&self, now: Instant) -> bool {
        self.primary_failed_at
            .is_some_and(|t| now.saturating_duration_since(t) < self.fallback_window)
    }

    /// Choose the host for the next attempt and record it as in progress
    pub(crate) fn next_host<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> String {
        let avoiding_primary = self.avoiding_primary(now);
        if !avoiding_primary {
            self.primary_failed_at = None;
            self.preferred = None;
        }

        let budget = self.budget.get_or_insert_with(|| RetryBudget {
            attempts: 0,
            started: now,
            candidates: Vec::new(),
            drawn: false,
        });

        let host = match self.current.take() {
            Some(host) if self.retry_same => host,
            _ if budget.attempts == 0 => match &self.preferred {
                Some(preferred) if avoiding_primary => preferred.clone(),
                _ => self.primary.clone(),
            },
            _ if !avoiding_primary => self.primary.clone(),
            _ => {
                if !budget.drawn {
                    let mut candidates = self
                        .fallbacks
                        .iter()
                        .filter(|h| Some(*h) != self.preferred.as_ref())
                        .cloned()
                        .collect::<Vec<_>>();
                    candidates.shuffle(rng);
                    candidates.truncate(self.max_attempts);
                    // Popped from the back
                    candidates.reverse();
                    budget.candidates = candidates;
                    budget.drawn = true;
                }
                budget
                    .candidates
                    .pop()
                    .unwrap_or_else(|| self.primary.clone())
            }
        };
        self.retry_same = false;
        self.current = Some(host.clone());
        host
    }

    /// Account for a failed attempt
    ///
    /// `host_failure` is set for transport-level failures and server faults, which move the next
    /// attempt to a different host; other failures retry the same host.
    pub(crate) fn on_failure(&mut self, now: Instant, host_failure: bool) -> RetryDecision {
        if host_failure {
            match self.current.as_deref() {
                Some(host) if host == self.primary => self.primary_failed_at = Some(now),
                Some(host) if Some(host) == self.preferred.as_deref() => {
                    // A preferred fallback that stops working is no longer preferred, but the
                    // primary stays avoided for the rest of the window.
                    self.preferred = None;
                    self.primary_failed_at.get_or_insert(now);
                }
                _ => {}
            }
        }
        self.retry_same = !host_failure;

        let budget = self.budget.get_or_insert_with(|| RetryBudget {
            attempts: 0,
            started: now,
            candidates: Vec::new(),
            drawn: false,
        });
        budget.attempts += 1;
        let elapsed = now.saturating_duration_since(budget.started);
        if budget.attempts >= self.max_attempts || elapsed >= self.max_duration {
            debug!(
                attempts = budget.attempts,
                ?elapsed,
                "retry budget exhausted"
            );
            self.budget = None;
            RetryDecision::Suspended(self.suspended_retry)
        } else {
            RetryDecision::Disconnected(self.disconnected_retry)
        }
    }

    /// Account for a successful connection
    pub(crate) fn on_success(&mut self, now: Instant) {
        self.budget = None;
        self.retry_same = false;
        match self.current.take() {
            Some(host) if host == self.primary => {
                self.primary_failed_at = None;
                self.preferred = None;
            }
            Some(host) if self.avoiding_primary(now) => self.preferred = Some(host),
            _ => {}
        }
    }

    /// Forget the attempt in progress and the current budget
    pub(crate) fn reset(&mut self) {
        self.budget = None;
        self.current = None;
        self.retry_same = false;
    }

    /// Host of the attempt in progress
    pub(crate) fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }
}
