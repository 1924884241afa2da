use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Calls to the provider's REST API made on behalf of reads and reconciliation.
pub const PROVIDER_API_BUCKET: &str = "provider-api";
/// Payment and invoice lookups triggered by inbound events.
pub const PAYMENT_PROCESSING_BUCKET: &str = "payment-processing";
/// Webhook deliveries from the provider.
pub const INBOUND_EVENTS_BUCKET: &str = "inbound-events";

/// Advisory gate over one class of outbound work. `allow` never blocks;
/// callers decide what to do when the budget is spent (serve stale data,
/// drop, defer).
pub trait RateLimiter: Send + Sync {
    fn allow(&self, bucket_key: &str) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct BucketBudget {
    pub limit: u32,
    pub window: Duration,
}

impl Default for BucketBudget {
    fn default() -> Self {
        Self {
            limit: 60,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct RateLimitWindow {
    count: u32,
    window_reset_at: DateTime<Utc>,
}

/// Fixed-window limiter. Windows are reset lazily on access: a window whose
/// reset time has passed is logically empty whatever its stored count says.
/// Buckets are independent, so a burst in one class cannot starve another.
pub struct FixedWindowRateLimiter {
    budgets: HashMap<String, BucketBudget>,
    default_budget: BucketBudget,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl FixedWindowRateLimiter {
    pub fn new(budgets: HashMap<String, BucketBudget>) -> Self {
        Self {
            budgets,
            default_budget: BucketBudget::default(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_budget(mut self, budget: BucketBudget) -> Self {
        self.default_budget = budget;
        self
    }

    fn budget_for(&self, bucket_key: &str) -> BucketBudget {
        self.budgets
            .get(bucket_key)
            .copied()
            .unwrap_or(self.default_budget)
    }

    fn allow_at(&self, bucket_key: &str, now: DateTime<Utc>) -> bool {
        let budget = self.budget_for(bucket_key);
        let window_duration = chrono::Duration::from_std(budget.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut windows = self.windows.lock();
        let window = windows
            .entry(bucket_key.to_string())
            .or_insert_with(|| RateLimitWindow {
                count: 0,
                window_reset_at: now + window_duration,
            });

        if now >= window.window_reset_at {
            window.count = 0;
            window.window_reset_at = now + window_duration;
        }

        if window.count < budget.limit {
            window.count += 1;
            true
        } else {
            false
        }
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn allow(&self, bucket_key: &str) -> bool {
        self.allow_at(bucket_key, Utc::now())
    }
}
