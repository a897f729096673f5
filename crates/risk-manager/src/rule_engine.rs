//! Ordered, first-match-wins evaluation of exit rules.

use chrono::{DateTime, FixedOffset, Utc};
use options_core::config::RiskConfig;
use options_core::types::{Position, UnderlyingState};
use options_core::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Decision to close a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub rule: String,
    pub reason: String,
    pub metadata: serde_json::Value,
}

impl ExitSignal {
    pub fn new(rule: &str, reason: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            rule: rule.to_string(),
            reason: reason.into(),
            metadata,
        }
    }
}

/// Outcome of one rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleResult {
    Exit(ExitSignal),
    NoAction,
    /// Not enough data to decide this cycle.
    Skip(String),
}

/// Read-only view a rule evaluates against.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub position: &'a Position,
    pub now: DateTime<Utc>,
    /// `now` in the market's local time.
    pub market_now: DateTime<FixedOffset>,
    pub underlying: Option<&'a UnderlyingState>,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        position: &'a Position,
        config: &RiskConfig,
        now: DateTime<Utc>,
        underlying: Option<&'a UnderlyingState>,
    ) -> Self {
        Self {
            position,
            now,
            market_now: config.market_local(now),
            underlying,
        }
    }
}

/// An exit condition. Thresholds are bound at construction; `evaluate` is
/// pure.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower runs first.
    fn priority(&self) -> u32;

    fn enabled(&self) -> bool {
        true
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult>;
}

/// Result of running the engine on one position.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// `Exit` from the deciding rule, otherwise `NoAction`.
    pub result: RuleResult,
    pub deciding_rule: Option<&'static str>,
    pub skipped: Vec<(&'static str, String)>,
    pub errors: u32,
}

impl Evaluation {
    pub fn exit_signal(&self) -> Option<&ExitSignal> {
        match &self.result {
            RuleResult::Exit(signal) => Some(signal),
            _ => None,
        }
    }
}

pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
    errors: AtomicU64,
}

impl RuleEngine {
    /// Build from `rules`, dropping disabled ones and sorting by priority.
    /// Equal priorities keep registration order.
    pub fn new(rules: Vec<Box<dyn Rule>>, disabled: &[String]) -> Self {
        let mut rules: Vec<Box<dyn Rule>> = rules
            .into_iter()
            .filter(|rule| rule.enabled() && !disabled.iter().any(|d| d == rule.name()))
            .collect();
        rules.sort_by_key(|rule| rule.priority());

        debug!(
            rules = ?rules.iter().map(|r| r.name()).collect::<Vec<_>>(),
            "Rule engine ready"
        );
        Self {
            rules,
            errors: AtomicU64::new(0),
        }
    }

    /// The standard rule set configured from `config`.
    pub fn standard(config: &RiskConfig) -> Result<Self> {
        let rules = crate::rules::standard_rules(config)?;
        Ok(Self::new(rules, &config.disabled_rules))
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Run rules in order; the first `Exit` wins and later rules never run.
    /// A failing rule is logged, counted and treated as skipped.
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Evaluation {
        let mut skipped = Vec::new();
        let mut errors = 0;

        for rule in &self.rules {
            match rule.evaluate(ctx) {
                Ok(RuleResult::Exit(signal)) => {
                    return Evaluation {
                        result: RuleResult::Exit(signal),
                        deciding_rule: Some(rule.name()),
                        skipped,
                        errors,
                    };
                }
                Ok(RuleResult::NoAction) => {}
                Ok(RuleResult::Skip(reason)) => skipped.push((rule.name(), reason)),
                Err(e) => {
                    warn!(
                        position_id = %ctx.position.id,
                        rule = rule.name(),
                        error = %e,
                        "Rule failed, skipping for this cycle"
                    );
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    errors += 1;
                    skipped.push((rule.name(), e.to_string()));
                }
            }
        }

        Evaluation {
            result: RuleResult::NoAction,
            deciding_rule: None,
            skipped,
            errors,
        }
    }

    /// Rule failures since startup.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
