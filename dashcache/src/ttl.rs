// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Adaptive TTL computation
//!
//! `compute_ttl` is a pure function of the configuration and the context.
//! The only notion of time it uses is `TtlContext::now`.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use std::time::Duration;

use crate::config::TtlConfig;

/// Inputs to a TTL decision
#[derive(Debug, Clone, PartialEq)]
pub struct TtlContext {
    pub data_type: String,
    pub now: DateTime<Utc>,
    /// 0.0 (idle) ..= 1.0 (saturated)
    pub system_load: f64,
    /// 0.0 (nobody around) ..= 1.0 (users actively editing)
    pub user_activity: f64,
}

impl TtlContext {
    pub fn at(data_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            data_type: data_type.into(),
            now,
            system_load: 0.0,
            user_activity: 0.0,
        }
    }

    pub fn with_load(mut self, system_load: f64) -> Self {
        self.system_load = system_load;
        self
    }

    pub fn with_activity(mut self, user_activity: f64) -> Self {
        self.user_activity = user_activity;
        self
    }
}

/// Host-reported load and activity levels
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSignals {
    pub system_load: f64,
    pub user_activity: f64,
}

/// Which adjustments fired for a decision
#[derive(Debug, Clone, PartialEq)]
pub struct TtlDecision {
    pub ttl: Duration,
    pub base: Duration,
    pub high_activity: bool,
    pub business_hours: bool,
    pub high_load: bool,
    pub clamped: bool,
}

#[derive(Debug, Clone)]
pub struct AdaptiveTtlEngine {
    config: TtlConfig,
}

impl AdaptiveTtlEngine {
    pub fn new(config: TtlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TtlConfig {
        &self.config
    }

    pub fn compute_ttl(&self, context: &TtlContext) -> Duration {
        self.explain(context).ttl
    }

    /// Same as [`compute_ttl`](Self::compute_ttl), with the reasons attached
    pub fn explain(&self, context: &TtlContext) -> TtlDecision {
        let config = &self.config;
        let base = self.base_ttl(&context.data_type);
        let activity = unit(context.user_activity);
        let load = unit(context.system_load);

        let high_activity = activity >= config.high_activity_threshold;
        let business_hours = self.is_business_hours(context.now);
        let high_load = load >= config.high_load_threshold;

        let mut secs = base.as_secs_f64();
        if high_activity {
            secs *= config.high_activity_factor;
        }
        if business_hours {
            secs *= config.business_hours_factor;
        } else {
            secs *= config.off_hours_factor;
        }
        if high_load {
            secs *= config.high_load_factor;
        }

        let min = config.min_ttl.as_secs_f64();
        let max = config.max_ttl.as_secs_f64();
        let bounded = if secs.is_finite() { secs.clamp(min, max) } else { max };

        TtlDecision {
            ttl: Duration::from_millis((bounded * 1000.0).round() as u64),
            base,
            high_activity,
            business_hours,
            high_load,
            clamped: bounded != secs,
        }
    }

    pub fn base_ttl(&self, data_type: &str) -> Duration {
        self.config
            .base_ttls
            .get(data_type)
            .copied()
            .unwrap_or(self.config.default_base)
    }

    /// Business hours in the configured local offset; `start > end` wraps midnight
    pub fn is_business_hours(&self, now: DateTime<Utc>) -> bool {
        let config = &self.config;
        let local = now + ChronoDuration::minutes(i64::from(config.utc_offset_minutes));

        if config.weekdays_only && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let hour = local.hour();
        let (start, end) = (config.business_hours_start, config.business_hours_end);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
