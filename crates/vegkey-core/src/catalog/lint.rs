//! Static review of a catalog, independent of any registry.
//!
//! Lint never changes evaluation. It surfaces rules a reviewer should look at:
//! disabled entries, rules whose `current` guard can never hold, duplicated
//! identifiers, unparsable expressions and free-form review notes.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::Serialize;

use crate::catalog::expr::{self, BinOp, Expr};
use crate::catalog::{Catalog, TargetSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Rule is present but skipped by the engine.
    Disabled,
    /// Rule requires `current` to hold a code no earlier rule can produce.
    DeadRule,
    /// Rule carries a review note.
    Review,
    DuplicateId,
    /// Condition or derived quantity does not parse.
    Syntax,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FindingKind::Disabled => "disabled",
            FindingKind::DeadRule => "dead-rule",
            FindingKind::Review => "review",
            FindingKind::DuplicateId => "duplicate-id",
            FindingKind::Syntax => "syntax",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub rule: String,
    pub phase: String,
    pub kind: FindingKind,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({}): {}", self.kind, self.rule, self.phase, self.message)
    }
}

/// Codes `current` may hold when a rule is evaluated.
#[derive(Debug, Clone)]
enum Reachable {
    Codes(BTreeSet<i64>),
    /// An earlier rule copies a layer, so any value is possible.
    Anything,
}

impl Reachable {
    fn admits(&self, guard: &Guard) -> bool {
        match (self, guard) {
            (Reachable::Anything, _) => true,
            (Reachable::Codes(codes), Guard::Set(set)) => set.iter().any(|v| codes.contains(&(*v as i64)) && v.fract() == 0.0),
            (Reachable::Codes(codes), Guard::Range(lo, hi)) => codes.iter().any(|&c| (c as f64) >= *lo && (c as f64) <= *hi),
        }
    }
}

/// A constraint on `current` found among a condition's top-level conjuncts.
#[derive(Debug, Clone, PartialEq)]
enum Guard {
    Set(Vec<f64>),
    Range(f64, f64),
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Set(items) => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "in [{}]", items.join(", "))
            }
            Guard::Range(lo, hi) => write!(f, "in {lo}..={hi}"),
        }
    }
}

fn conjuncts<'a>(e: &'a Expr, out: &mut Vec<&'a Expr>) {
    match e {
        Expr::Binary(BinOp::And, l, r) => {
            conjuncts(l, out);
            conjuncts(r, out);
        }
        other => out.push(other),
    }
}

fn is_current(e: &Expr) -> bool {
    matches!(e, Expr::Ident(name) if name == "current")
}

fn guards(e: &Expr) -> Vec<Guard> {
    let mut parts = Vec::new();
    conjuncts(e, &mut parts);
    parts
        .into_iter()
        .filter_map(|p| match p {
            Expr::Binary(BinOp::Eq, l, r) => match (l.as_ref(), r.as_ref()) {
                (a, Expr::Number(n)) | (Expr::Number(n), a) if is_current(a) => Some(Guard::Set(vec![*n])),
                _ => None,
            },
            Expr::InList(v, items) if is_current(v) => Some(Guard::Set(items.clone())),
            Expr::InRange(v, lo, hi) if is_current(v) => Some(Guard::Range(*lo, *hi)),
            _ => None,
        })
        .collect()
}

/// Review `catalog` and return findings in catalog order.
pub fn lint(catalog: &Catalog) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut seen = HashSet::new();
    let mut reachable = Reachable::Codes(BTreeSet::from([catalog.base_code]));

    for d in &catalog.derive {
        if let Some(note) = &d.review {
            findings.push(Finding {
                rule: d.name.clone(),
                phase: "derive".into(),
                kind: FindingKind::Review,
                message: note.clone(),
            });
        }
        if let Err(message) = expr::parse(&d.expr) {
            findings.push(Finding {
                rule: d.name.clone(),
                phase: "derive".into(),
                kind: FindingKind::Syntax,
                message,
            });
        }
    }

    for (phase, rule) in catalog.rules() {
        let phase = catalog.phases[phase].name.clone();
        let mut push = |kind, message: String| {
            findings.push(Finding { rule: rule.id.clone(), phase: phase.clone(), kind, message })
        };

        if !seen.insert(rule.id.as_str()) {
            push(FindingKind::DuplicateId, format!("rule id '{}' appears more than once", rule.id));
        }
        if let Some(note) = &rule.review {
            push(FindingKind::Review, note.clone());
        }
        if !rule.enabled {
            push(FindingKind::Disabled, "rule is skipped during evaluation".into());
            continue;
        }

        match expr::parse(&rule.when) {
            Ok(parsed) => {
                for guard in guards(&parsed) {
                    if !reachable.admits(&guard) {
                        push(
                            FindingKind::DeadRule,
                            format!("condition requires current {guard}, which no earlier rule produces"),
                        );
                        break;
                    }
                }
            }
            Err(message) => push(FindingKind::Syntax, message),
        }

        match (&rule.then, &mut reachable) {
            (TargetSpec::Layer { .. }, r) => *r = Reachable::Anything,
            (TargetSpec::Code(code), Reachable::Codes(codes)) => {
                codes.insert(*code);
            }
            (TargetSpec::Code(_), Reachable::Anything) => {}
        }
    }
    findings
}
