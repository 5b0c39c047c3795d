//! Spend rate and budget health.

use serde::Serialize;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// One point of cumulative spend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSample {
    pub total_usd: f64,
    pub at_ms: u64,
}

/// USD per hour between the oldest and newest sample.
///
/// `None` with fewer than two samples, zero elapsed time, a decreasing total
/// (counter reset) or any non-finite result.
pub fn burn_rate<'a>(samples: impl IntoIterator<Item = &'a CostSample>) -> Option<f64> {
    let mut iter = samples.into_iter();
    let oldest = iter.next()?;
    let newest = iter.last()?;
    let elapsed_ms = newest.at_ms.checked_sub(oldest.at_ms)?;
    if elapsed_ms == 0 {
        return None;
    }
    let delta = newest.total_usd - oldest.total_usd;
    if delta < 0.0 {
        return None;
    }
    let rate = delta / elapsed_ms as f64 * MS_PER_HOUR;
    rate.is_finite().then_some(rate)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetHealth {
    /// Below 75 % of the budget.
    Healthy,
    /// 75 % up to 90 %.
    Warning,
    /// 90 % up to 100 %.
    Critical,
    Exhausted,
}

impl BudgetHealth {
    pub fn from_fraction(fraction: f64) -> Self {
        if fraction >= 1.0 {
            Self::Exhausted
        } else if fraction >= 0.9 {
            Self::Critical
        } else if fraction >= 0.75 {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub limit_usd: f64,
    pub spent_usd: f64,
    /// Spent share of the budget, `0.0..`.
    pub fraction: f64,
    pub health: BudgetHealth,
    /// Projected seconds until the budget runs out at the current burn rate.
    pub seconds_to_exhaustion: Option<f64>,
}

impl BudgetStatus {
    /// `None` when `limit_usd` is not a positive finite number.
    pub fn evaluate(limit_usd: f64, spent_usd: f64, burn_per_hour: Option<f64>) -> Option<Self> {
        if !(limit_usd.is_finite() && limit_usd > 0.0) {
            return None;
        }
        let spent_usd = spent_usd.max(0.0);
        let fraction = spent_usd / limit_usd;
        let remaining = limit_usd - spent_usd;
        let seconds_to_exhaustion = match burn_per_hour {
            _ if remaining <= 0.0 => Some(0.0),
            Some(rate) if rate > 0.0 => Some(remaining / rate * 3600.0),
            _ => None,
        };
        Some(Self {
            limit_usd,
            spent_usd,
            fraction,
            health: BudgetHealth::from_fraction(fraction),
            seconds_to_exhaustion,
        })
    }
}
