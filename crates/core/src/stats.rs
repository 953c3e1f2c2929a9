//! Cumulative API usage accounting.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Spend and token counters for model calls.
///
/// `total_cost` survives attempt resets and is checked against the global
/// spend limit; `instance_cost` is the per-attempt spend checked against the
/// per-instance limit. Only the model client mutates these, immediately
/// after each successful call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiStats {
    pub total_cost: f64,
    pub instance_cost: f64,
    pub tokens_sent: u64,
    pub tokens_received: u64,
    pub api_calls: u64,
}

impl ApiStats {
    /// Fresh per-attempt stats carrying an existing total spend forward.
    pub fn with_carried_total(total_cost: f64) -> Self {
        Self {
            total_cost,
            ..Self::default()
        }
    }

    /// Record one successful call.
    pub fn record_call(&mut self, cost: f64, tokens_sent: u64, tokens_received: u64) {
        self.total_cost += cost;
        self.instance_cost += cost;
        self.tokens_sent += tokens_sent;
        self.tokens_received += tokens_received;
        self.api_calls += 1;
    }
}

impl Add for ApiStats {
    type Output = ApiStats;

    fn add(self, other: ApiStats) -> ApiStats {
        ApiStats {
            total_cost: self.total_cost + other.total_cost,
            instance_cost: self.instance_cost + other.instance_cost,
            tokens_sent: self.tokens_sent + other.tokens_sent,
            tokens_received: self.tokens_received + other.tokens_received,
            api_calls: self.api_calls + other.api_calls,
        }
    }
}

impl AddAssign<&ApiStats> for ApiStats {
    fn add_assign(&mut self, other: &ApiStats) {
        self.total_cost += other.total_cost;
        self.instance_cost += other.instance_cost;
        self.tokens_sent += other.tokens_sent;
        self.tokens_received += other.tokens_received;
        self.api_calls += other.api_calls;
    }
}
