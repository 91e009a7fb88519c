//! Candidate budgets, call timeouts and retry knobs shared by the pipeline and binaries.

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default number of ANN candidates.
pub const DEFAULT_K0: usize = 100;
/// Default number of stage-1 survivors.
pub const DEFAULT_K1: usize = 30;
/// Default number of final results.
pub const DEFAULT_K2: usize = 15;

/// Rejected budget combinations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    /// A budget was zero.
    #[error("{name} must be a positive integer")]
    Zero {
        /// Budget name (`k0`, `k1` or `k2`).
        name: &'static str,
    },
    /// Budgets were not non-increasing.
    #[error("budgets must satisfy k0 >= k1 >= k2 (got k0={k0}, k1={k1}, k2={k2})")]
    NotMonotone {
        /// ANN candidates.
        k0: usize,
        /// Stage-1 survivors.
        k1: usize,
        /// Final results.
        k2: usize,
    },
    /// A budget exceeded its configured ceiling.
    #[error("{name}={value} exceeds the maximum of {max}")]
    AboveCeiling {
        /// Budget name.
        name: &'static str,
        /// Requested value.
        value: usize,
        /// Allowed maximum.
        max: usize,
    },
}

/// Candidate counts for each cascade stage, guaranteed `k0 >= k1 >= k2 >= 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Budgets {
    k0: usize,
    k1: usize,
    k2: usize,
}

impl Budgets {
    /// Validates and builds a budget triple.
    pub fn new(k0: usize, k1: usize, k2: usize) -> Result<Self, BudgetError> {
        for (name, value) in [("k0", k0), ("k1", k1), ("k2", k2)] {
            if value == 0 {
                return Err(BudgetError::Zero { name });
            }
        }
        if k1 > k0 || k2 > k1 {
            return Err(BudgetError::NotMonotone { k0, k1, k2 });
        }
        Ok(Self { k0, k1, k2 })
    }

    /// ANN candidates fetched from the index.
    pub fn k0(&self) -> usize {
        self.k0
    }

    /// Survivors of the title-only stage.
    pub fn k1(&self) -> usize {
        self.k1
    }

    /// Final result count.
    pub fn k2(&self) -> usize {
        self.k2
    }

    /// Applies optional per-request overrides on top of `self`, then revalidates.
    pub fn with_overrides(
        &self,
        k0: Option<usize>,
        k1: Option<usize>,
        k2: Option<usize>,
    ) -> Result<Self, BudgetError> {
        Self::new(
            k0.unwrap_or(self.k0),
            k1.unwrap_or(self.k1),
            k2.unwrap_or(self.k2),
        )
    }

    /// Rejects budgets above the given ceilings.
    pub fn within(&self, ceilings: &BudgetCeilings) -> Result<Self, BudgetError> {
        for (name, value, max) in [
            ("k0", self.k0, ceilings.k0),
            ("k1", self.k1, ceilings.k1),
            ("k2", self.k2, ceilings.k2),
        ] {
            if value > max {
                return Err(BudgetError::AboveCeiling { name, value, max });
            }
        }
        Ok(*self)
    }
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            k0: DEFAULT_K0,
            k1: DEFAULT_K1,
            k2: DEFAULT_K2,
        }
    }
}

/// Upper bounds applied to caller-supplied budgets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BudgetCeilings {
    /// Maximum ANN candidates.
    pub k0: usize,
    /// Maximum stage-1 survivors.
    pub k1: usize,
    /// Maximum final results.
    pub k2: usize,
}

impl Default for BudgetCeilings {
    fn default() -> Self {
        Self {
            k0: 2000,
            k1: 200,
            k2: 100,
        }
    }
}

/// Per-collaborator timeouts. Exceeding one counts as a failed call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Query encoder call.
    pub encoder: Duration,
    /// Query enricher call.
    pub enricher: Duration,
    /// One ranking-oracle attempt.
    pub oracle: Duration,
    /// Catalog fetch.
    pub catalog: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            encoder: Duration::from_secs(30),
            enricher: Duration::from_secs(30),
            oracle: Duration::from_secs(60),
            catalog: Duration::from_secs(10),
        }
    }
}

/// Bounded exponential backoff for oracle transport failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Builds a policy allowing `max_retries` retries after the first attempt.
    pub fn new(max_retries: usize, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Policy that never retries and never sleeps.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Delay before retry number `attempt` (1-based), doubling and capped.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let scaled = self.initial_backoff.saturating_mul(1u32 << exponent);
        scaled.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }
}

/// What a cascade stage does when the oracle picks fewer valid items than requested.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallPolicy {
    /// Discard the partial pick and truncate the input in similarity order.
    #[default]
    Fallback,
    /// Keep the oracle's picks and top them up from the input in similarity order.
    Backfill,
}

/// Budget flags shared by binaries that run or call the pipeline.
#[derive(Args, Debug, Clone)]
pub struct BudgetArgs {
    /// ANN candidates retrieved from the embedding index
    #[arg(long, env = "CASCADE_K0", default_value_t = DEFAULT_K0)]
    pub k0: usize,

    /// Candidates kept after the title-only oracle stage
    #[arg(long, env = "CASCADE_K1", default_value_t = DEFAULT_K1)]
    pub k1: usize,

    /// Final ranked results
    #[arg(long, env = "CASCADE_K2", default_value_t = DEFAULT_K2)]
    pub k2: usize,
}

impl BudgetArgs {
    /// Validates the parsed flags into [`Budgets`].
    pub fn build_budgets(&self) -> Result<Budgets, BudgetError> {
        Budgets::new(self.k0, self.k1, self.k2)
    }
}

/// Timeout and retry flags for external collaborators.
#[derive(Args, Debug, Clone)]
pub struct CallArgs {
    /// Seconds before a query-encoder call is abandoned
    #[arg(long, env = "CASCADE_ENCODER_TIMEOUT_SECS", default_value_t = 30)]
    pub encoder_timeout_secs: u64,

    /// Seconds before a query-enrichment call is abandoned
    #[arg(long, env = "CASCADE_ENRICHER_TIMEOUT_SECS", default_value_t = 30)]
    pub enricher_timeout_secs: u64,

    /// Seconds before a single ranking-oracle attempt is abandoned
    #[arg(long, env = "CASCADE_ORACLE_TIMEOUT_SECS", default_value_t = 60)]
    pub oracle_timeout_secs: u64,

    /// Seconds before a catalog fetch is abandoned
    #[arg(long, env = "CASCADE_CATALOG_TIMEOUT_SECS", default_value_t = 10)]
    pub catalog_timeout_secs: u64,

    /// Retries after a failed oracle attempt before falling back to similarity order
    #[arg(long, env = "CASCADE_ORACLE_MAX_RETRIES", default_value_t = 3)]
    pub oracle_max_retries: usize,

    /// Initial oracle retry backoff in milliseconds (doubles per attempt)
    #[arg(long, env = "CASCADE_ORACLE_BACKOFF_MS", default_value_t = 500)]
    pub oracle_backoff_ms: u64,

    /// Behaviour when the oracle selects fewer items than requested
    #[arg(long, env = "CASCADE_SHORTFALL", value_enum, default_value_t = ShortfallPolicy::Fallback)]
    pub shortfall: ShortfallPolicy,
}

impl CallArgs {
    /// Converts the parsed flags into [`CallTimeouts`].
    pub fn build_timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            encoder: Duration::from_secs(self.encoder_timeout_secs.max(1)),
            enricher: Duration::from_secs(self.enricher_timeout_secs.max(1)),
            oracle: Duration::from_secs(self.oracle_timeout_secs.max(1)),
            catalog: Duration::from_secs(self.catalog_timeout_secs.max(1)),
        }
    }

    /// Converts the parsed flags into a [`RetryPolicy`].
    pub fn build_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.oracle_max_retries,
            Duration::from_millis(self.oracle_backoff_ms),
            Duration::from_secs(10),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn budgets_require_non_increasing_order() {
        assert!(Budgets::new(100, 30, 15).is_ok());
        assert!(Budgets::new(3, 3, 3).is_ok());
        assert_eq!(
            Budgets::new(10, 20, 5),
            Err(BudgetError::NotMonotone {
                k0: 10,
                k1: 20,
                k2: 5
            })
        );
        assert_eq!(
            Budgets::new(10, 5, 6),
            Err(BudgetError::NotMonotone {
                k0: 10,
                k1: 5,
                k2: 6
            })
        );
        assert_eq!(Budgets::new(10, 5, 0), Err(BudgetError::Zero { name: "k2" }));
    }

    #[test]
    fn overrides_are_revalidated() {
        let base = Budgets::default();
        let narrowed = base.with_overrides(Some(40), None, Some(5)).unwrap();
        assert_eq!((narrowed.k0(), narrowed.k1(), narrowed.k2()), (40, 30, 5));
        assert!(base.with_overrides(Some(10), None, None).is_err());
    }

    #[test]
    fn ceilings_reject_oversized_budgets() {
        let budgets = Budgets::new(5000, 30, 15).unwrap();
        assert_eq!(
            budgets.within(&BudgetCeilings::default()),
            Err(BudgetError::AboveCeiling {
                name: "k0",
                value: 5000,
                max: 2000
            })
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(9), Duration::from_secs(2));
    }

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        budgets: BudgetArgs,
        #[command(flatten)]
        calls: CallArgs,
    }

    #[test]
    fn flags_build_controls() {
        let parsed = Harness::parse_from([
            "harness",
            "--k0",
            "50",
            "--k1",
            "10",
            "--k2",
            "3",
            "--shortfall",
            "backfill",
        ]);
        let budgets = parsed.budgets.build_budgets().unwrap();
        assert_eq!((budgets.k0(), budgets.k1(), budgets.k2()), (50, 10, 3));
        assert_eq!(parsed.calls.shortfall, ShortfallPolicy::Backfill);
        assert_eq!(parsed.calls.build_retry().max_retries(), 3);
    }
}
