//! Consistency checker.
//!
//! [`evaluate`] is a pure function of its inputs: the same invariants over the
//! same outcomes (in any order) always produce the same violations, in the
//! same order. It can be re-run offline over a persisted outcome stream.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{WeaverError, WeaverResult};
use crate::outcome::{Outcome, OutcomeRef};

/// Name under which sequence integrity is always checked
pub const SEQUENCE_INTEGRITY: &str = "sequence_integrity";

/// What a balance invariant sums per outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    /// Each successful outcome counts 1
    #[default]
    Count,
    /// Rows returned
    Rows,
    /// Rows affected
    Affected,
}

impl Measure {
    fn of(&self, outcome: &Outcome) -> u64 {
        match self {
            Measure::Count => 1,
            Measure::Rows => outcome.row_count,
            Measure::Affected => outcome.affected,
        }
    }
}

/// Predicate over accumulated outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvariantRule {
    /// Successful `left` outcomes and successful `right` outcomes sum to the
    /// same `measure`
    Balance {
        left: String,
        right: String,
        #[serde(default)]
        measure: Measure,
    },
    /// Every outcome (only those tagged `tag` when given) succeeded
    NoErrors {
        #[serde(default)]
        tag: Option<String>,
    },
    /// Every successful outcome tagged `tag` returned `min..=max` rows
    RowRange {
        tag: String,
        #[serde(default)]
        min: Option<u64>,
        #[serde(default)]
        max: Option<u64>,
    },
    /// Every outcome tagged `tag` finished within `limit_ms`
    MaxDuration { tag: String, limit_ms: u64 },
    /// Per worker, sequences run 1..=n without gaps or repeats
    SequenceIntegrity,
}

/// A named invariant declaration. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invariant {
    pub name: String,
    #[serde(flatten)]
    pub rule: InvariantRule,
}

impl Invariant {
    pub fn new(name: impl Into<String>, rule: InvariantRule) -> WeaverResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(WeaverError::Config("invariant name must not be empty".into()));
        }
        if let InvariantRule::RowRange {
            min: Some(min),
            max: Some(max),
            ..
        } = &rule
        {
            if min > max {
                return Err(WeaverError::Config(format!(
                    "invariant '{}': min {} exceeds max {}",
                    name, min, max
                )));
            }
        }
        Ok(Self { name, rule })
    }

    pub fn sequence_integrity() -> Self {
        Self {
            name: SEQUENCE_INTEGRITY.to_string(),
            rule: InvariantRule::SequenceIntegrity,
        }
    }

    pub fn balance(name: impl Into<String>, left: &str, right: &str, measure: Measure) -> WeaverResult<Self> {
        Self::new(
            name,
            InvariantRule::Balance {
                left: left.to_string(),
                right: right.to_string(),
                measure,
            },
        )
    }
}

/// A failed invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    /// Offending outcomes in (worker, sequence) order
    pub outcomes: Vec<OutcomeRef>,
    pub explanation: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.explanation)
    }
}

impl From<&Violation> for WeaverError {
    fn from(v: &Violation) -> Self {
        WeaverError::InvariantViolation(v.to_string())
    }
}

/// Evaluate `invariants` over `outcomes`.
///
/// Violations are sorted by invariant name, then by their first offending
/// outcome. Invariants with duplicate names are evaluated once, first wins.
pub fn evaluate(invariants: &[Invariant], outcomes: &[Outcome]) -> Vec<Violation> {
    let mut ordered: Vec<&Outcome> = outcomes.iter().collect();
    ordered.sort_by_key(|o| (o.worker, o.sequence));

    let mut seen = std::collections::HashSet::new();
    let mut violations = Vec::new();
    for invariant in invariants {
        if !seen.insert(invariant.name.as_str()) {
            continue;
        }
        violations.extend(check(invariant, &ordered));
    }

    violations.sort_by(|a, b| {
        a.invariant
            .cmp(&b.invariant)
            .then_with(|| a.outcomes.first().cmp(&b.outcomes.first()))
            .then_with(|| a.explanation.cmp(&b.explanation))
    });
    violations
}

fn check(invariant: &Invariant, outcomes: &[&Outcome]) -> Vec<Violation> {
    let violation = |outcomes: Vec<OutcomeRef>, explanation: String| Violation {
        invariant: invariant.name.clone(),
        outcomes,
        explanation,
    };

    match &invariant.rule {
        InvariantRule::Balance {
            left,
            right,
            measure,
        } => {
            let (left_total, left_outcomes) = tagged_total(outcomes, left, *measure);
            let (right_total, right_outcomes) = tagged_total(outcomes, right, *measure);
            if left_total == right_total {
                return Vec::new();
            }

            let (larger, surplus) = if left_total > right_total {
                (left_outcomes, left_total - right_total)
            } else {
                (right_outcomes, right_total - left_total)
            };
            vec![violation(
                surplus_refs(&larger, *measure, surplus),
                format!(
                    "{} of '{}' is {} but {} of '{}' is {}",
                    measure_name(*measure),
                    left,
                    left_total,
                    measure_name(*measure),
                    right,
                    right_total
                ),
            )]
        }
        InvariantRule::NoErrors { tag } => {
            let failed: Vec<&Outcome> = outcomes
                .iter()
                .copied()
                .filter(|o| tag.as_deref().map_or(true, |t| o.has_tag(t)))
                .filter(|o| !o.is_success())
                .collect();
            if failed.is_empty() {
                return Vec::new();
            }
            let first = failed[0];
            vec![violation(
                failed.iter().map(|o| o.reference()).collect(),
                format!(
                    "{} outcome(s) did not succeed; first {} was {}: {}",
                    failed.len(),
                    first.reference(),
                    first.status,
                    first.error.as_deref().unwrap_or("no error message")
                ),
            )]
        }
        InvariantRule::RowRange { tag, min, max } => {
            let out_of_range: Vec<&Outcome> = outcomes
                .iter()
                .copied()
                .filter(|o| o.is_success() && o.has_tag(tag))
                .filter(|o| {
                    min.is_some_and(|m| o.row_count < m) || max.is_some_and(|m| o.row_count > m)
                })
                .collect();
            if out_of_range.is_empty() {
                return Vec::new();
            }
            vec![violation(
                out_of_range.iter().map(|o| o.reference()).collect(),
                format!(
                    "{} '{}' outcome(s) returned a row count outside {}..={}; first {} returned {}",
                    out_of_range.len(),
                    tag,
                    min.map_or_else(String::new, |m| m.to_string()),
                    max.map_or_else(String::new, |m| m.to_string()),
                    out_of_range[0].reference(),
                    out_of_range[0].row_count
                ),
            )]
        }
        InvariantRule::MaxDuration { tag, limit_ms } => {
            let limit_us = limit_ms.saturating_mul(1000);
            let slow: Vec<&Outcome> = outcomes
                .iter()
                .copied()
                .filter(|o| o.has_tag(tag) && o.duration_us > limit_us)
                .collect();
            let Some(slowest) = slow.iter().max_by_key(|o| o.duration_us) else {
                return Vec::new();
            };
            vec![violation(
                slow.iter().map(|o| o.reference()).collect(),
                format!(
                    "{} '{}' outcome(s) exceeded {}ms; slowest {} took {}us",
                    slow.len(),
                    tag,
                    limit_ms,
                    slowest.reference(),
                    slowest.duration_us
                ),
            )]
        }
        InvariantRule::SequenceIntegrity => {
            let mut per_worker: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
            for outcome in outcomes {
                per_worker.entry(outcome.worker).or_default().push(outcome.sequence);
            }

            let mut violations = Vec::new();
            for (worker, sequences) in per_worker {
                // Sorted by sequence already, so expected is just the position.
                let mut offending = Vec::new();
                let mut expected = 1u64;
                for &sequence in &sequences {
                    if sequence != expected {
                        offending.push(OutcomeRef { worker, sequence });
                    }
                    if sequence >= expected {
                        expected = sequence + 1;
                    }
                }
                if !offending.is_empty() {
                    violations.push(violation(
                        offending,
                        format!(
                            "worker {} sequences are not contiguous from 1 ({} recorded, highest {})",
                            worker,
                            sequences.len(),
                            sequences.last().copied().unwrap_or_default()
                        ),
                    ));
                }
            }
            violations
        }
    }
}

fn measure_name(measure: Measure) -> &'static str {
    match measure {
        Measure::Count => "count",
        Measure::Rows => "rows",
        Measure::Affected => "affected",
    }
}

/// Sum of `measure` over the successful outcomes tagged `tag`, plus those outcomes.
fn tagged_total<'a>(outcomes: &[&'a Outcome], tag: &str, measure: Measure) -> (u64, Vec<&'a Outcome>) {
    let matching: Vec<&'a Outcome> = outcomes
        .iter()
        .copied()
        .filter(|o| o.is_success() && o.has_tag(tag))
        .collect();
    (matching.iter().map(|o| measure.of(o)).sum(), matching)
}

/// The trailing outcomes of `larger` whose measures cover `surplus`.
fn surplus_refs(larger: &[&Outcome], measure: Measure, surplus: u64) -> Vec<OutcomeRef> {
    let mut refs = Vec::new();
    let mut covered = 0u64;
    for outcome in larger.iter().rev() {
        if covered >= surplus {
            break;
        }
        let value = measure.of(outcome);
        if value == 0 {
            continue;
        }
        covered += value;
        refs.push(outcome.reference());
    }
    refs.reverse();
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionRequest};
    use crate::backend::Rows;
    use crate::outcome::OutcomeStatus;
    use std::time::Duration;

    fn ok(worker: u32, sequence: u64, tag: &str, rows: usize) -> Outcome {
        let action = Action {
            worker,
            sequence,
            backend: "main".into(),
            request: ActionRequest::new("x").with_tag(tag),
        };
        let result = Rows {
            columns: vec!["v".into()],
            rows: vec![vec![]; rows],
            affected: if tag == "insert" { 1 } else { 0 },
        };
        Outcome::for_action("run", &action, String::new()).with_rows(&result)
    }

    fn failed(worker: u32, sequence: u64, tag: &str) -> Outcome {
        let action = Action {
            worker,
            sequence,
            backend: "main".into(),
            request: ActionRequest::new("x").with_tag(tag),
        };
        Outcome::for_action("run", &action, String::new())
            .with_failure(OutcomeStatus::Error, "boom")
    }

    #[test]
    fn test_balance_names_the_surplus() {
        let mut outcomes = Vec::new();
        for seq in 1..=10 {
            outcomes.push(ok(1, seq, "insert", 0));
        }
        for seq in 1..=9 {
            outcomes.push(ok(2, seq, "select", 1));
        }
        let invariants =
            vec![Invariant::balance("inserted == selected", "insert", "select", Measure::Count).unwrap()];

        let violations = evaluate(&invariants, &outcomes);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "inserted == selected");
        assert_eq!(
            violations[0].outcomes,
            vec![OutcomeRef {
                worker: 1,
                sequence: 10
            }]
        );
    }

    #[test]
    fn test_balance_ignores_failed_outcomes() {
        let outcomes = vec![
            ok(1, 1, "insert", 0),
            failed(1, 2, "insert"),
            ok(2, 1, "select", 1),
        ];
        let invariants = vec![Invariant::balance("b", "insert", "select", Measure::Count).unwrap()];
        assert!(evaluate(&invariants, &outcomes).is_empty());
    }

    #[test]
    fn test_balance_by_rows() {
        let outcomes = vec![ok(1, 1, "insert", 0), ok(1, 2, "insert", 0), ok(2, 1, "select", 3)];
        let invariants = vec![
            Invariant::balance("count", "insert", "select", Measure::Count).unwrap(),
            Invariant::new(
                "rows",
                InvariantRule::Balance {
                    left: "select".into(),
                    right: "insert".into(),
                    measure: Measure::Rows,
                },
            )
            .unwrap(),
        ];
        let violations = evaluate(&invariants, &outcomes);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].invariant, "count");
        assert_eq!(violations[1].invariant, "rows");
        assert_eq!(violations[1].outcomes.len(), 1);
    }

    #[test]
    fn test_no_errors_with_and_without_tag() {
        let outcomes = vec![ok(1, 1, "insert", 0), failed(1, 2, "select")];
        let any = Invariant::new("clean", InvariantRule::NoErrors { tag: None }).unwrap();
        let inserts = Invariant::new(
            "clean inserts",
            InvariantRule::NoErrors {
                tag: Some("insert".into()),
            },
        )
        .unwrap();

        let violations = evaluate(&[any, inserts], &outcomes);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "clean");
        assert!(violations[0].explanation.contains("boom"));
    }

    #[test]
    fn test_row_range() {
        let outcomes = vec![ok(1, 1, "select", 1), ok(1, 2, "select", 5)];
        let invariant = Invariant::new(
            "one row",
            InvariantRule::RowRange {
                tag: "select".into(),
                min: Some(1),
                max: Some(1),
            },
        )
        .unwrap();
        let violations = evaluate(&[invariant], &outcomes);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].outcomes[0].sequence, 2);

        assert!(Invariant::new(
            "bad",
            InvariantRule::RowRange {
                tag: "t".into(),
                min: Some(3),
                max: Some(1)
            }
        )
        .is_err());
    }

    #[test]
    fn test_max_duration() {
        let slow = ok(1, 1, "select", 1).with_duration(Duration::from_millis(30));
        let fast = ok(1, 2, "select", 1).with_duration(Duration::from_millis(1));
        let invariant = Invariant::new(
            "fast selects",
            InvariantRule::MaxDuration {
                tag: "select".into(),
                limit_ms: 10,
            },
        )
        .unwrap();
        let violations = evaluate(&[invariant], &[slow, fast]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].outcomes.len(), 1);
    }

    #[test]
    fn test_sequence_integrity_detects_gaps_and_repeats() {
        let outcomes = vec![
            ok(1, 1, "a", 0),
            ok(1, 3, "a", 0),
            ok(2, 1, "a", 0),
            ok(2, 1, "a", 0),
            ok(3, 1, "a", 0),
            ok(3, 2, "a", 0),
        ];
        let violations = evaluate(&[Invariant::sequence_integrity()], &outcomes);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].outcomes, vec![OutcomeRef { worker: 1, sequence: 3 }]);
        assert_eq!(violations[1].outcomes, vec![OutcomeRef { worker: 2, sequence: 1 }]);
    }

    #[test]
    fn test_duplicate_names_first_wins() {
        let outcomes = vec![failed(1, 1, "a")];
        let strict = Invariant::new("x", InvariantRule::NoErrors { tag: None }).unwrap();
        let lenient = Invariant::new(
            "x",
            InvariantRule::NoErrors {
                tag: Some("other".into()),
            },
        )
        .unwrap();
        assert_eq!(evaluate(&[strict.clone(), lenient.clone()], &outcomes).len(), 1);
        assert!(evaluate(&[lenient, strict], &outcomes).is_empty());
    }

    #[test]
    fn test_invariant_serde_shape() {
        let invariant: Invariant = serde_json::from_str(
            r#"{ "name": "b", "kind": "balance", "left": "insert", "right": "select" }"#,
        )
        .unwrap();
        assert_eq!(
            invariant.rule,
            InvariantRule::Balance {
                left: "insert".into(),
                right: "select".into(),
                measure: Measure::Count
            }
        );
    }
}
