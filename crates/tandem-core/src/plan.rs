//! Plan gate: role-specific review of a worker's proposed plan.
//!
//! Review is a pure function of the plan's declared targets and rationale, the
//! submitting worker's boundary and the gate config. Each [`Role`] maps to a
//! fixed list of rules in [`rules_for`]; every rule returns `Some(feedback)`
//! when it objects.

use crate::config::PlanGateConfig;
use crate::error::{Result, TandemError};
use crate::ownership::Boundary;
use crate::types::Role;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: String,
    pub worker_id: String,
    pub targets: Vec<String>,
    pub rationale: String,
    pub submitted_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        targets: Vec<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            targets,
            rationale: rationale.into(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReview {
    pub approved: bool,
    pub feedback: Vec<String>,
}

impl PlanReview {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: Vec::new(),
        }
    }

    pub fn reject(feedback: Vec<String>) -> Self {
        Self {
            approved: false,
            feedback,
        }
    }
}

// ---------------------------------------------------------------------------
// Review inputs
// ---------------------------------------------------------------------------

/// Everything a rule may look at besides the plan itself.
pub struct ReviewContext<'a> {
    pub boundary: &'a Boundary,
    pub test_files: &'a Boundary,
    pub config: &'a PlanGateConfig,
}

type Rule = fn(&Plan, &ReviewContext<'_>) -> Option<String>;

const COMMON_RULES: &[Rule] = &[targets_within_boundary, rationale_is_substantive];
const TEST_WRITER_RULES: &[Rule] = &[
    declares_targets,
    targets_are_tests,
    covers_edge_cases,
    assertions_are_meaningful,
];
const IMPLEMENTER_RULES: &[Rule] = &[declares_targets, minimal_change, leaves_tests_alone];
const REFACTORER_RULES: &[Rule] = &[declares_targets, leaves_tests_alone, preserves_behavior];
const READ_ONLY_RULES: &[Rule] = &[declares_no_targets];

pub fn rules_for(role: Role) -> &'static [Rule] {
    match role {
        Role::TestWriter => TEST_WRITER_RULES,
        Role::Implementer => IMPLEMENTER_RULES,
        Role::Refactorer => REFACTORER_RULES,
        Role::Reviewer | Role::Analyst => READ_ONLY_RULES,
    }
}

/// Apply the common rules and the rules for `role`.
pub fn review(plan: &Plan, role: Role, ctx: &ReviewContext<'_>) -> PlanReview {
    let feedback: Vec<String> = COMMON_RULES
        .iter()
        .chain(rules_for(role))
        .filter_map(|rule| rule(plan, ctx))
        .collect();
    if feedback.is_empty() {
        PlanReview::approve()
    } else {
        PlanReview::reject(feedback)
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn targets_within_boundary(plan: &Plan, ctx: &ReviewContext<'_>) -> Option<String> {
    let outside: Vec<&str> = plan
        .targets
        .iter()
        .filter(|t| !ctx.boundary.matches(t))
        .map(String::as_str)
        .collect();
    if outside.is_empty() {
        return None;
    }
    Some(format!(
        "targets outside your ownership boundary ({}): {}; use a shared change request instead",
        ctx.boundary.patterns().join(", "),
        outside.join(", ")
    ))
}

fn rationale_is_substantive(plan: &Plan, ctx: &ReviewContext<'_>) -> Option<String> {
    let len = plan.rationale.trim().chars().count();
    (len < ctx.config.min_rationale_chars).then(|| {
        format!(
            "rationale is too short ({len} chars, need {})",
            ctx.config.min_rationale_chars
        )
    })
}

fn declares_targets(plan: &Plan, _ctx: &ReviewContext<'_>) -> Option<String> {
    plan.targets
        .is_empty()
        .then(|| "plan declares no file targets".to_string())
}

fn declares_no_targets(plan: &Plan, _ctx: &ReviewContext<'_>) -> Option<String> {
    (!plan.targets.is_empty()).then(|| {
        format!(
            "read-only role must not modify files (declared: {})",
            plan.targets.join(", ")
        )
    })
}

fn targets_are_tests(plan: &Plan, ctx: &ReviewContext<'_>) -> Option<String> {
    let non_tests: Vec<&str> = plan
        .targets
        .iter()
        .filter(|t| !ctx.test_files.matches(t))
        .map(String::as_str)
        .collect();
    (!non_tests.is_empty())
        .then(|| format!("test-writing plan targets non-test files: {}", non_tests.join(", ")))
}

fn covers_edge_cases(plan: &Plan, _ctx: &ReviewContext<'_>) -> Option<String> {
    (!edge_case_re().is_match(&plan.rationale)).then(|| {
        "rationale does not mention edge cases (empty input, boundaries, invalid values, errors)"
            .to_string()
    })
}

fn assertions_are_meaningful(plan: &Plan, _ctx: &ReviewContext<'_>) -> Option<String> {
    if trivial_assertion_re().is_match(&plan.rationale) {
        return Some("plan relies on trivial or placeholder assertions".to_string());
    }
    (!assertion_re().is_match(&plan.rationale))
        .then(|| "rationale does not describe what the tests assert".to_string())
}

fn minimal_change(plan: &Plan, ctx: &ReviewContext<'_>) -> Option<String> {
    let max = ctx.config.max_implementation_targets;
    if plan.targets.len() > max {
        return Some(format!(
            "implementation touches {} files (max {max}); keep the change minimal",
            plan.targets.len()
        ));
    }
    sweeping_change_re()
        .is_match(&plan.rationale)
        .then(|| "rationale describes a sweeping rewrite; implement only what the tests require".to_string())
}

fn leaves_tests_alone(plan: &Plan, ctx: &ReviewContext<'_>) -> Option<String> {
    let tests: Vec<&str> = plan
        .targets
        .iter()
        .filter(|t| ctx.test_files.matches(t))
        .map(String::as_str)
        .collect();
    (!tests.is_empty()).then(|| format!("plan modifies test-owned files: {}", tests.join(", ")))
}

fn preserves_behavior(plan: &Plan, _ctx: &ReviewContext<'_>) -> Option<String> {
    (!behavior_re().is_match(&plan.rationale)).then(|| {
        "refactoring rationale must state that behavior is preserved and tests stay green"
            .to_string()
    })
}

static EDGE_CASE_RE: OnceLock<Regex> = OnceLock::new();
static ASSERTION_RE: OnceLock<Regex> = OnceLock::new();
static TRIVIAL_ASSERTION_RE: OnceLock<Regex> = OnceLock::new();
static SWEEPING_RE: OnceLock<Regex> = OnceLock::new();
static BEHAVIOR_RE: OnceLock<Regex> = OnceLock::new();

fn edge_case_re() -> &'static Regex {
    EDGE_CASE_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(edge|boundar|empty|invalid|error|overflow|null|none|negative|zero|limit)")
            .unwrap()
    })
}

fn assertion_re() -> &'static Regex {
    ASSERTION_RE.get_or_init(|| Regex::new(r"(?i)\b(assert|expect|verif|check)").unwrap())
}

fn trivial_assertion_re() -> &'static Regex {
    TRIVIAL_ASSERTION_RE.get_or_init(|| {
        Regex::new(r"(?i)(assert!?\(\s*true\s*\)|assert\s+true\b|placeholder|todo!|unimplemented!)")
            .unwrap()
    })
}

fn sweeping_change_re() -> &'static Regex {
    SWEEPING_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(rewrite everything|rewrite the (whole|entire)|from scratch|overhaul)")
            .unwrap()
    })
}

fn behavior_re() -> &'static Regex {
    BEHAVIOR_RE.get_or_init(|| {
        Regex::new(r"(?i)(behavio(u)?r|tests? (stay|remain|still) (green|pass)|no functional change)")
            .unwrap()
    })
}

// ---------------------------------------------------------------------------
// PlanGate
// ---------------------------------------------------------------------------

/// Reviews plans and escalates tasks whose plans keep failing review.
pub struct PlanGate {
    config: PlanGateConfig,
    test_files: Boundary,
    max_rejections: u32,
}

/// What the orchestrator should do after a review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Approved,
    /// Send feedback and let the worker revise.
    Revise(PlanReview),
    /// Rejection threshold reached; the task goes to Blocked.
    Escalate(PlanReview),
}

impl PlanGate {
    pub fn new(config: PlanGateConfig, max_rejections: u32) -> Result<Self> {
        let test_files = Boundary::new(&config.test_patterns)?;
        Ok(Self {
            config,
            test_files,
            max_rejections: max_rejections.max(1),
        })
    }

    pub fn max_rejections(&self) -> u32 {
        self.max_rejections
    }

    pub fn review(&self, plan: &Plan, role: Role, boundary: &Boundary) -> PlanReview {
        let ctx = ReviewContext {
            boundary,
            test_files: &self.test_files,
            config: &self.config,
        };
        review(plan, role, &ctx)
    }

    /// Turn a rejection count into an outcome. `rejections` already includes
    /// the rejection being decided.
    pub fn decide(&self, review: PlanReview, rejections: u32) -> GateOutcome {
        if review.approved {
            GateOutcome::Approved
        } else if rejections >= self.max_rejections {
            GateOutcome::Escalate(review)
        } else {
            GateOutcome::Revise(review)
        }
    }

    pub fn escalation_error(&self, task_id: &str, rejections: u32) -> TandemError {
        TandemError::RepeatedPlanRejection {
            task: task_id.to_string(),
            rejections,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
