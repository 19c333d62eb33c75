//! Upstream rate limiting.
//!
//! Providers publish allowances per second, minute or hour. The limiter
//! reduces whatever tiers are configured to one effective per-second rate,
//! splits that budget across endpoints, and answers two questions:
//!
//! - `ms_until_next_execution(endpoint)`: how long the background executor
//!   should sleep before the endpoint's next cycle. This is pacing, not
//!   enforcement; background loops follow it voluntarily.
//! - `is_under_limits()`: whether a foreground request may be admitted right
//!   now, judged against a sliding window of recorded executions.
//!
//! Endpoints with an explicit allocation percentage take that share of the
//! budget; the remainder is split evenly among the rest.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitSettings;
use crate::error::AdapterError;

/// Fallback cadence when no rate limit tier is configured.
pub const DEFAULT_INTERVAL_MS: u64 = 5000;

/// Provider allowances as declared by an adapter.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateLimitTiers {
    /// Requests allowed per second.
    pub rate_limit_1s: Option<f64>,
    /// Requests allowed per minute.
    pub rate_limit_1m: Option<f64>,
    /// Requests allowed per hour.
    pub rate_limit_1h: Option<f64>,
}

impl RateLimitTiers {
    /// Applies environment overrides on top of the declared tiers.
    fn overridden(mut self, overrides: &RateLimitSettings) -> Self {
        if overrides.capacity_second.is_some() {
            self.rate_limit_1s = overrides.capacity_second;
        }
        if overrides.capacity_minute.is_some() {
            self.rate_limit_1m = overrides.capacity_minute;
        }
        if overrides.capacity_hour.is_some() {
            self.rate_limit_1h = overrides.capacity_hour;
        }
        self
    }

    fn any_set(&self) -> bool {
        self.rate_limit_1s.is_some() || self.rate_limit_1m.is_some() || self.rate_limit_1h.is_some()
    }

    /// The tightest per-second rate implied by the configured tiers.
    fn effective_per_second(&self) -> Option<f64> {
        let candidates = [
            self.rate_limit_1s,
            self.rate_limit_1m.map(|m| m / 60.0),
            self.rate_limit_1h.map(|h| h / 3600.0),
        ];
        candidates
            .into_iter()
            .flatten()
            .filter(|r| *r > 0.0)
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// One endpoint's share of the budget, as declared by the adapter.
#[derive(Clone, Debug)]
pub struct EndpointAllocation {
    pub endpoint_name: String,
    pub allocation_percentage: Option<u8>,
}

/// Per-adapter rate limiter shared by all transports.
#[derive(Debug)]
pub struct RateLimiter {
    intervals: HashMap<String, u64>,
    tiers: Option<RateLimitTiers>,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Resolves tiers (declared plus overrides) into per-endpoint intervals.
    ///
    /// Fails when explicit allocations exceed 100 percent.
    pub fn new(
        declared: Option<RateLimitTiers>,
        overrides: &RateLimitSettings,
        endpoints: &[EndpointAllocation],
    ) -> Result<Self, AdapterError> {
        let tiers = declared
            .unwrap_or_default()
            .overridden(overrides);
        let tiers = tiers.any_set().then_some(tiers);

        let mut intervals = HashMap::with_capacity(endpoints.len());

        let Some(per_second) = tiers.as_ref().and_then(|t| t.effective_per_second()) else {
            for endpoint in endpoints {
                intervals.insert(endpoint.endpoint_name.clone(), DEFAULT_INTERVAL_MS);
            }
            return Ok(Self {
                intervals,
                tiers,
                window: Mutex::new(VecDeque::new()),
            });
        };

        let allocated: u32 = endpoints
            .iter()
            .filter_map(|e| e.allocation_percentage)
            .map(u32::from)
            .sum();
        if allocated > 100 {
            return Err(AdapterError::Setup(format!(
                "endpoint rate limit allocations total {allocated}%, must not exceed 100%"
            )));
        }

        let unallocated = endpoints
            .iter()
            .filter(|e| e.allocation_percentage.is_none())
            .count();
        let remaining_share = if unallocated > 0 {
            f64::from(100 - allocated) / unallocated as f64
        } else {
            0.0
        };

        for endpoint in endpoints {
            let share = endpoint
                .allocation_percentage
                .map(f64::from)
                .unwrap_or(remaining_share);
            let rate = per_second * share / 100.0;
            let interval = if rate > 0.0 {
                (1000.0 / rate).ceil() as u64
            } else {
                DEFAULT_INTERVAL_MS
            };
            intervals.insert(endpoint.endpoint_name.clone(), interval);
        }

        Ok(Self {
            intervals,
            tiers,
            window: Mutex::new(VecDeque::new()),
        })
    }

    /// Milliseconds the background executor should wait before invoking this
    /// endpoint's background handler again.
    pub fn ms_until_next_execution(&self, endpoint_name: &str) -> u64 {
        self.intervals
            .get(endpoint_name)
            .copied()
            .unwrap_or(DEFAULT_INTERVAL_MS)
    }

    /// Records one upstream execution into the sliding window.
    pub fn record_execution(&self) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.push_back(now);
        Self::prune(&mut window, now);
    }

    /// Whether an additional upstream request right now would stay inside
    /// every configured tier.
    pub fn is_under_limits(&self) -> bool {
        let Some(tiers) = &self.tiers else {
            return true;
        };
        let now = Instant::now();
        let mut window = self.window.lock();
        Self::prune(&mut window, now);

        let within = |cutoff: Duration| {
            window
                .iter()
                .rev()
                .take_while(|at| now.duration_since(**at) < cutoff)
                .count() as f64
        };

        if let Some(limit) = tiers.rate_limit_1s {
            if within(Duration::from_secs(1)) >= limit {
                return false;
            }
        }
        if let Some(limit) = tiers.rate_limit_1m {
            if within(Duration::from_secs(60)) >= limit {
                return false;
            }
        }
        if let Some(limit) = tiers.rate_limit_1h {
            if within(Duration::from_secs(3600)) >= limit {
                return false;
            }
        }
        true
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant) {
        let horizon = Duration::from_secs(3600);
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= horizon {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(specs: &[(&str, Option<u8>)]) -> Vec<EndpointAllocation> {
        specs
            .iter()
            .map(|(name, pct)| EndpointAllocation {
                endpoint_name: name.to_string(),
                allocation_percentage: *pct,
            })
            .collect()
    }

    #[test]
    fn no_tiers_yields_default_interval() {
        let limiter =
            RateLimiter::new(None, &RateLimitSettings::default(), &endpoints(&[("a", None)]))
                .unwrap();
        assert_eq!(limiter.ms_until_next_execution("a"), DEFAULT_INTERVAL_MS);
        assert!(limiter.is_under_limits());
    }

    #[test]
    fn even_split_of_one_rps_across_two_endpoints() {
        let tiers = RateLimitTiers {
            rate_limit_1s: Some(1.0),
            ..Default::default()
        };
        let limiter = RateLimiter::new(
            Some(tiers),
            &RateLimitSettings::default(),
            &endpoints(&[("a", None), ("b", None)]),
        )
        .unwrap();
        assert_eq!(limiter.ms_until_next_execution("a"), 2000);
        assert_eq!(limiter.ms_until_next_execution("b"), 2000);
    }

    #[test]
    fn explicit_allocation_takes_its_share() {
        let tiers = RateLimitTiers {
            rate_limit_1s: Some(10.0),
            ..Default::default()
        };
        let limiter = RateLimiter::new(
            Some(tiers),
            &RateLimitSettings::default(),
            &endpoints(&[("big", Some(80)), ("small", None)]),
        )
        .unwrap();
        // big: 8 rps -> 125 ms; small: remaining 20% = 2 rps -> 500 ms.
        assert_eq!(limiter.ms_until_next_execution("big"), 125);
        assert_eq!(limiter.ms_until_next_execution("small"), 500);
    }

    #[test]
    fn minute_tier_constrains_tighter_than_second_tier() {
        let tiers = RateLimitTiers {
            rate_limit_1s: Some(10.0),
            rate_limit_1m: Some(60.0),
            ..Default::default()
        };
        let limiter = RateLimiter::new(
            Some(tiers),
            &RateLimitSettings::default(),
            &endpoints(&[("a", None)]),
        )
        .unwrap();
        // 60/min is 1 rps, tighter than the 10 rps second tier.
        assert_eq!(limiter.ms_until_next_execution("a"), 1000);
    }

    #[test]
    fn over_allocation_is_a_setup_error() {
        let tiers = RateLimitTiers {
            rate_limit_1s: Some(1.0),
            ..Default::default()
        };
        let err = RateLimiter::new(
            Some(tiers),
            &RateLimitSettings::default(),
            &endpoints(&[("a", Some(70)), ("b", Some(50))]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("100%"));
    }

    #[test]
    fn env_overrides_replace_declared_tiers() {
        let tiers = RateLimitTiers {
            rate_limit_1s: Some(100.0),
            ..Default::default()
        };
        let overrides = RateLimitSettings {
            capacity_second: Some(2.0),
            ..Default::default()
        };
        let limiter =
            RateLimiter::new(Some(tiers), &overrides, &endpoints(&[("a", None)])).unwrap();
        assert_eq!(limiter.ms_until_next_execution("a"), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_blocks_at_the_second_tier() {
        let tiers = RateLimitTiers {
            rate_limit_1s: Some(2.0),
            ..Default::default()
        };
        let limiter = RateLimiter::new(
            Some(tiers),
            &RateLimitSettings::default(),
            &endpoints(&[("a", None)]),
        )
        .unwrap();

        assert!(limiter.is_under_limits());
        limiter.record_execution();
        limiter.record_execution();
        assert!(!limiter.is_under_limits());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.is_under_limits());
    }
}
