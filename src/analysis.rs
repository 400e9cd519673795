//! Analysis kernel: pure, reproducible functions over one or two runs.
//!
//! Nothing here mutates artifacts. Findings are reported, never raised.

use crate::record::StepRecord;
use crate::store::LoadedRun;
use crate::types::{AlignmentKind, StepStatus};
use serde::Serialize;
use std::fmt::Write as _;

// ── Step alignment (two-run) ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentEntry {
    pub index: usize,
    pub kind: AlignmentKind,
    pub a_step: Option<u64>,
    pub b_step: Option<u64>,
}

/// Position-wise alignment of two runs, out to the longer of the two.
pub fn align_runs(a: &LoadedRun, b: &LoadedRun) -> Vec<AlignmentEntry> {
    let len = a.steps.len().max(b.steps.len());
    let mut out = Vec::with_capacity(len);
    for index in 0..len {
        let a_step = a.steps.get(index);
        let b_step = b.steps.get(index);
        let kind = match (a_step, b_step) {
            (Some(sa), Some(sb)) if sa.phase == sb.phase && sa.input == sb.input => {
                AlignmentKind::Exact
            }
            (Some(sa), Some(sb)) if sa.phase == sb.phase => AlignmentKind::Phase,
            _ => AlignmentKind::Mismatch,
        };
        out.push(AlignmentEntry {
            index,
            kind,
            a_step: a_step.map(|s| s.step_id),
            b_step: b_step.map(|s| s.step_id),
        });
    }
    out
}

/// First step at which input or output payloads differ, as run `A`'s step
/// identifier. When lengths differ but all shared positions are identical,
/// the divergence is the last shared identifier.
pub fn divergence_point(a: &LoadedRun, b: &LoadedRun) -> Option<u64> {
    let shared = a.steps.len().min(b.steps.len());
    for index in 0..shared {
        let sa = &a.steps[index];
        let sb = &b.steps[index];
        if sa.input != sb.input || sa.output != sb.output {
            return Some(sa.step_id);
        }
    }
    if a.steps.len() != b.steps.len() {
        return a.steps.get(shared.checked_sub(1)?).map(|s| s.step_id);
    }
    None
}

// ── Tool classification ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolClass {
    Exploratory,
    Committing,
}

/// Name-based default classifier: `search`/`ls`/`read` tools explore,
/// `write`/`edit` tools commit.
pub fn classify_tool(name: &str) -> Option<ToolClass> {
    let name = name.to_ascii_lowercase();
    if ["search", "ls", "read"].iter().any(|n| name.contains(n)) {
        return Some(ToolClass::Exploratory);
    }
    if ["write", "edit"].iter().any(|n| name.contains(n)) {
        return Some(ToolClass::Committing);
    }
    None
}

// ── Invariant checks (single-run) ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// A registered check is a pure predicate over the step list.
pub trait InvariantCheck {
    fn name(&self) -> &'static str;
    fn evaluate(&self, steps: &[StepRecord]) -> CheckResult;
}

/// Retries must stay at or below a fixed share of total steps.
pub struct RetryCeiling {
    pub max_ratio: f64,
}

impl Default for RetryCeiling {
    fn default() -> Self {
        Self { max_ratio: 0.5 }
    }
}

impl InvariantCheck for RetryCeiling {
    fn name(&self) -> &'static str {
        "retry_ceiling"
    }

    fn evaluate(&self, steps: &[StepRecord]) -> CheckResult {
        let total = steps.len();
        let retries = steps
            .iter()
            .filter(|s| s.status == StepStatus::Retry)
            .count();
        let passed = total == 0 || (retries as f64) <= (total as f64) * self.max_ratio;
        CheckResult {
            name: self.name().to_string(),
            passed,
            detail: format!(
                "{retries} retries across {total} steps (ceiling {:.0}%)",
                self.max_ratio * 100.0
            ),
        }
    }
}

/// A declared ordering rule over tool classes: every tool of `then` must be
/// preceded by at least one tool of `first`.
#[derive(Debug, Clone, Copy)]
pub struct OrderingConstraint {
    pub first: ToolClass,
    pub then: ToolClass,
}

/// Tool-ordering check. The default constraint set is empty, so the check
/// passes until constraints are declared.
#[derive(Default)]
pub struct ToolOrdering {
    pub constraints: Vec<OrderingConstraint>,
}

impl ToolOrdering {
    pub fn read_before_write() -> Self {
        Self {
            constraints: vec![OrderingConstraint {
                first: ToolClass::Exploratory,
                then: ToolClass::Committing,
            }],
        }
    }
}

impl InvariantCheck for ToolOrdering {
    fn name(&self) -> &'static str {
        "tool_ordering"
    }

    fn evaluate(&self, steps: &[StepRecord]) -> CheckResult {
        let mut violations = Vec::new();
        for constraint in &self.constraints {
            let mut seen_first = false;
            for step in steps {
                let Some(name) = step.tool_name() else {
                    continue;
                };
                match classify_tool(name) {
                    Some(class) if class == constraint.first => seen_first = true,
                    Some(class) if class == constraint.then && !seen_first => {
                        violations.push(format!(
                            "step {} uses {name:?} before any {:?} tool",
                            step.step_id, constraint.first
                        ));
                    }
                    _ => {}
                }
            }
        }
        CheckResult {
            name: self.name().to_string(),
            passed: violations.is_empty(),
            detail: if violations.is_empty() {
                format!("{} constraints, no violations", self.constraints.len())
            } else {
                violations.join("; ")
            },
        }
    }
}

/// Check registry. Extensible: additional checks may be registered on top
/// of the defaults.
pub struct Analyzer {
    checks: Vec<Box<dyn InvariantCheck>>,
}

impl Analyzer {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    pub fn with_default_checks() -> Self {
        let mut analyzer = Self::new();
        analyzer.register(Box::new(RetryCeiling::default()));
        analyzer.register(Box::new(ToolOrdering::default()));
        analyzer
    }

    pub fn register(&mut self, check: Box<dyn InvariantCheck>) {
        self.checks.push(check);
    }

    pub fn run_checks(&self, run: &LoadedRun) -> Vec<CheckResult> {
        self.checks
            .iter()
            .map(|check| check.evaluate(&run.steps))
            .collect()
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::with_default_checks()
    }
}

// ── Semantic labels ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepLabels {
    pub step_id: u64,
    pub labels: Vec<String>,
}

/// Heuristic per-step tags. Artifacts are never mutated; labels live only
/// in the report.
pub fn semantic_labels(steps: &[StepRecord]) -> Vec<StepLabels> {
    let mut labelled: Vec<StepLabels> = Vec::new();
    let mut labels_for: Vec<Vec<String>> = vec![Vec::new(); steps.len()];

    // retry-loop: two or more consecutive retry statuses.
    let mut run_start = None;
    for index in 0..=steps.len() {
        let in_retry = steps
            .get(index)
            .is_some_and(|s| s.status == StepStatus::Retry);
        match (run_start, in_retry) {
            (None, true) => run_start = Some(index),
            (Some(start), false) => {
                if index - start >= 2 {
                    for slot in labels_for.iter_mut().take(index).skip(start) {
                        slot.push("retry-loop".to_string());
                    }
                }
                run_start = None;
            }
            _ => {}
        }
    }

    for (index, step) in steps.iter().enumerate() {
        if let Some(name) = step.tool_name() {
            match classify_tool(name) {
                Some(ToolClass::Exploratory) => {
                    labels_for[index].push("exploration".to_string())
                }
                Some(ToolClass::Committing) => {
                    labels_for[index].push("commitment".to_string())
                }
                None => {}
            }
        }
    }

    for (index, labels) in labels_for.into_iter().enumerate() {
        if !labels.is_empty() {
            labelled.push(StepLabels {
                step_id: steps[index].step_id,
                labels,
            });
        }
    }
    labelled
}

// ── Root cause ────────────────────────────────────────────────────────────────

const ROOT_CAUSE_CONFIDENCE: f64 = 0.8;
const ROOT_CAUSE_CHAIN_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RootCause {
    pub failure_step: u64,
    /// Up to three preceding step identifiers, in execution order.
    pub chain: Vec<u64>,
    pub confidence: f64,
    pub description: String,
}

/// The first `error` step is the failure step; its causal chain is the up
/// to three steps before it. Returns `None` for runs without an error step.
pub fn root_cause(run: &LoadedRun) -> Option<RootCause> {
    let position = run
        .steps
        .iter()
        .position(|s| s.status == StepStatus::Error)?;
    let failure = &run.steps[position];
    let chain: Vec<u64> = run.steps[position.saturating_sub(ROOT_CAUSE_CHAIN_LEN)..position]
        .iter()
        .map(|s| s.step_id)
        .collect();
    let description = if chain.is_empty() {
        format!(
            "step {} ({}) failed with no preceding steps",
            failure.step_id,
            failure.phase.as_str()
        )
    } else {
        format!(
            "step {} ({}) failed; preceded by steps {}",
            failure.step_id,
            failure.phase.as_str(),
            chain
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
    };
    Some(RootCause {
        failure_step: failure.step_id,
        chain,
        confidence: ROOT_CAUSE_CONFIDENCE,
        description,
    })
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub run_id: String,
    pub step_count: usize,
    pub partial: bool,
    pub checks: Vec<CheckResult>,
    pub labels: Vec<StepLabels>,
    pub root_cause: Option<RootCause>,
}

/// Full single-run analysis with the default check set.
pub fn analyze_run(run: &LoadedRun) -> AnalysisReport {
    AnalysisReport {
        run_id: run.meta.run_id.clone(),
        step_count: run.steps.len(),
        partial: run.partial,
        checks: Analyzer::with_default_checks().run_checks(run),
        labels: semantic_labels(&run.steps),
        root_cause: root_cause(run),
    }
}

impl AnalysisReport {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "run {} ({} steps{})",
            self.run_id,
            self.step_count,
            if self.partial { ", partial" } else { "" }
        );
        for check in &self.checks {
            let _ = writeln!(
                out,
                "  check {}: {} ({})",
                check.name,
                if check.passed { "pass" } else { "fail" },
                check.detail
            );
        }
        for labels in &self.labels {
            let _ = writeln!(
                out,
                "  step {}: {}",
                labels.step_id,
                labels.labels.join(", ")
            );
        }
        match &self.root_cause {
            Some(cause) => {
                let _ = writeln!(
                    out,
                    "  root cause: {} (confidence {:.1})",
                    cause.description, cause.confidence
                );
            }
            None => {
                let _ = writeln!(out, "  root cause: none (no error step)");
            }
        }
        out
    }
}
