//! Execution Plan Analysis
//!
//! Heuristic scan of explain-plan text. Each line is matched against a fixed
//! set of operation patterns, and the largest reported cost and row estimate
//! are extracted. This is substring matching, not plan-tree parsing:
//! unfamiliar plan formats simply produce no warnings.
//!
//! # Recognized Formats
//! - `DBMS_XPLAN` pipe tables (`| Id | Operation | Name | Rows | ... | Cost (%CPU)|`)
//! - `key=value` plan text (`Cost=12 Card=100`)
//! - `PostgreSQL` `EXPLAIN` output (`Seq Scan on t  (cost=0.00..35.50 rows=2550 width=4)`)

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Cost above which a high-severity warning is raised
pub const HIGH_COST_THRESHOLD: f64 = 100_000.0;

/// Cost above which a medium-severity warning is raised
pub const MEDIUM_COST_THRESHOLD: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCategory {
    FullTableScan,
    IndexFullScan,
    CartesianJoin,
    Sort,
    HighCost,
}

/// A single finding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanWarning {
    pub category: WarningCategory,
    pub severity: Severity,
    pub message: String,
    pub suggestion: &'static str,
    /// The plan line that triggered the warning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
}

/// Structured result of [`analyze_plan`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanAnalysis {
    pub warnings: Vec<PlanWarning>,
    pub estimated_cost: Option<f64>,
    pub estimated_rows: Option<u64>,
    pub summary: String,
}

struct Rule {
    pattern: &'static LazyLock<Regex>,
    category: WarningCategory,
    severity: Severity,
    message: &'static str,
    suggestion: &'static str,
}

static FULL_TABLE_SCAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bTABLE ACCESS (?:STORAGE )?FULL\b|\bSeq Scan\b").expect("static regex"));

static INDEX_FULL_SCAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bINDEX (?:FAST )?FULL SCAN\b").expect("static regex"));

static CARTESIAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bCARTESIAN\b").expect("static regex"));

static SORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i:\bSORT (?:ORDER BY|GROUP BY|UNIQUE|JOIN)\b)|^\s*(?:->\s+)?(?:Incremental )?Sort\s+\(")
        .expect("static regex")
});

static COST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcost=(?:\d+(?:\.\d+)?\.\.)?(\d+(?:\.\d+)?)").expect("static regex")
});

static ROWS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:rows|card)=(\d+)").expect("static regex"));

static RULES: &[Rule] = &[
    Rule {
        pattern: &FULL_TABLE_SCAN,
        category: WarningCategory::FullTableScan,
        severity: Severity::High,
        message: "Full table scan detected",
        suggestion: "Add an index on the filtered columns or narrow the WHERE clause",
    },
    Rule {
        pattern: &INDEX_FULL_SCAN,
        category: WarningCategory::IndexFullScan,
        severity: Severity::Medium,
        message: "Full index scan detected",
        suggestion: "Use a more selective predicate so a range scan can be used",
    },
    Rule {
        pattern: &CARTESIAN,
        category: WarningCategory::CartesianJoin,
        severity: Severity::High,
        message: "Cartesian join detected",
        suggestion: "Check that every joined table has a join condition",
    },
    Rule {
        pattern: &SORT,
        category: WarningCategory::Sort,
        severity: Severity::Low,
        message: "Sort operation detected",
        suggestion: "An index matching the ORDER BY or GROUP BY columns can avoid the sort",
    },
];

/// Analyze explain-plan lines
#[must_use]
pub fn analyze_plan<S: AsRef<str>>(lines: &[S]) -> PlanAnalysis {
    let mut warnings = Vec::new();
    let mut cost: Option<f64> = None;
    let mut rows: Option<u64> = None;
    let mut table = PipeTable::default();

    for line in lines {
        let line = line.as_ref();

        for rule in RULES {
            if rule.pattern.is_match(line) {
                warnings.push(PlanWarning {
                    category: rule.category,
                    severity: rule.severity,
                    message: rule.message.to_string(),
                    suggestion: rule.suggestion,
                    line: Some(line.trim().to_string()),
                });
            }
        }

        let (line_cost, line_rows) = table.observe(line);
        let line_cost = line_cost.or_else(|| capture(&COST, line).and_then(|c| c.parse::<f64>().ok()));
        let line_rows = line_rows.or_else(|| capture(&ROWS, line).and_then(|r| r.parse::<u64>().ok()));

        cost = max_of(cost, line_cost);
        rows = rows.max(line_rows);
    }

    if let Some(cost) = cost {
        let tier = if cost > HIGH_COST_THRESHOLD {
            Some(Severity::High)
        } else if cost > MEDIUM_COST_THRESHOLD {
            Some(Severity::Medium)
        } else {
            None
        };
        if let Some(severity) = tier {
            warnings.push(PlanWarning {
                category: WarningCategory::HighCost,
                severity,
                message: format!("Estimated cost {cost} is high"),
                suggestion: "Review the plan for scans over large tables and missing indexes",
                line: None,
            });
        }
    }

    let summary = summarize(&warnings);
    PlanAnalysis { warnings, estimated_cost: cost, estimated_rows: rows, summary }
}

fn summarize(warnings: &[PlanWarning]) -> String {
    if warnings.is_empty() {
        return "No potential issues found in the execution plan".to_string();
    }

    let count = |severity| warnings.iter().filter(|w| w.severity == severity).count();
    let noun = if warnings.len() == 1 { "issue" } else { "issues" };
    format!(
        "Found {} potential {noun} ({} high, {} medium, {} low)",
        warnings.len(),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low)
    )
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn max_of(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Column positions of a `DBMS_XPLAN` pipe table, learned from its header row
#[derive(Default)]
struct PipeTable {
    rows_col: Option<usize>,
    cost_col: Option<usize>,
}

impl PipeTable {
    fn observe(&mut self, line: &str) -> (Option<f64>, Option<u64>) {
        let trimmed = line.trim();
        if !trimmed.starts_with('|') {
            return (None, None);
        }
        let cells: Vec<&str> = trimmed.split('|').map(str::trim).collect();

        if cells.iter().any(|c| c.eq_ignore_ascii_case("Operation")) {
            self.rows_col = cells.iter().position(|c| c.eq_ignore_ascii_case("Rows"));
            self.cost_col = cells.iter().position(|c| c.to_ascii_lowercase().starts_with("cost"));
            return (None, None);
        }

        let cost = self
            .cost_col
            .and_then(|i| cells.get(i))
            .and_then(|c| c.split_whitespace().next())
            .and_then(parse_scaled);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rows = self.rows_col.and_then(|i| cells.get(i)).and_then(|c| parse_scaled(c)).map(|r| r as u64);
        (cost, rows)
    }
}

/// Parse `15`, `15K`, `2M`, `1G`
fn parse_scaled(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let (digits, scale) = match raw.chars().last()? {
        'K' | 'k' => (&raw[..raw.len() - 1], 1e3),
        'M' | 'm' => (&raw[..raw.len() - 1], 1e6),
        'G' | 'g' => (&raw[..raw.len() - 1], 1e9),
        _ => (raw, 1.0),
    };
    digits.parse::<f64>().ok().map(|n| n * scale)
}
