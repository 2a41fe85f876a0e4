//! SQL Building and Read Validation
//!
//! Pagination, point-in-time rewrites and read-path validation. All of this is
//! textual: there is no SQL parser behind it, only anchored patterns and
//! word-boundary token matching.
//!
//! # Known Gaps
//! - `build_point_in_time_sql` rewrites only the first `FROM <identifier>`;
//!   joined tables and subqueries read current data
//! - keywords inside string literals or comments count as tokens, so the
//!   read validator can reject harmless statements (never the reverse)

use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{ClassifiedError, Result};

/// Keywords that may not appear anywhere in a read statement
pub const READ_FORBIDDEN_KEYWORDS: &[&str] =
    &["DROP", "DELETE", "UPDATE", "INSERT", "TRUNCATE", "ALTER", "CREATE"];

static READ_FORBIDDEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b({})\b", READ_FORBIDDEN_KEYWORDS.join("|"))).expect("static regex")
});

static SELECT_START: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^SELECT\b").expect("static regex"));

static FIRST_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bFROM\s+("?[A-Za-z_][\w$#]*"?(?:\."?[A-Za-z_][\w$#]*"?)?)"#).expect("static regex")
});

static TABLE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:JOIN|INTO|UPDATE)\s+("?[A-Za-z_][\w$#]*"?(?:\."?[A-Za-z_][\w$#]*"?)?)"#)
        .expect("static regex")
});

static FROM_KEYWORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bFROM\b").expect("static regex"));

/// `EXTRACT(YEAR FROM col)` and friends: a `FROM` that does not start a table list
static FUNCTION_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:EXTRACT|TRIM|SUBSTRING|OVERLAY)\s*\([^()]*$").expect("static regex")
});

static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^"?[A-Za-z_][\w$#]*"?(?:\."?[A-Za-z_][\w$#]*"?)?"#).expect("static regex")
});

static ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^\s*(?:AS\s+)?"?[A-Za-z_][\w$#]*"?"#).expect("static regex"));

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$#]*(\.[A-Za-z_][A-Za-z0-9_$#]*)?$").expect("static regex")
});

static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})(?:[T ](\d{2}:\d{2}:\d{2}))?(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?$")
        .expect("static regex")
});

/// Validate that a statement is a plain read
///
/// Must start with `SELECT` and must not contain any of
/// [`READ_FORBIDDEN_KEYWORDS`] as a standalone token.
pub fn validate_read_sql(sql: &str) -> Result<()> {
    let upper = sql.trim().to_uppercase();
    if upper.is_empty() {
        return Err(ClassifiedError::syntax("SQL statement must be a non-empty string"));
    }

    if !SELECT_START.is_match(&upper) {
        return Err(ClassifiedError::syntax("Only SELECT statements are allowed on the read path")
            .with_suggestion("Use the write operation for INSERT or UPDATE statements"));
    }

    if let Some(found) = READ_FORBIDDEN.find(&upper) {
        return Err(ClassifiedError::syntax(format!(
            "Read statements may not contain the keyword {}",
            found.as_str()
        ))
        .with_detail("keyword", found.as_str()));
    }

    Ok(())
}

/// Validate a table argument: a plain or schema-qualified identifier
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name.trim()) {
        Ok(())
    } else {
        Err(ClassifiedError::syntax(format!("'{name}' is not a valid table identifier")))
    }
}

/// Append an `OFFSET … ROWS FETCH NEXT … ROWS ONLY` clause
///
/// A single trailing `;` is removed. `OFFSET` is emitted only for a positive
/// offset, `FETCH NEXT` only for a positive limit; `FETCH` without an offset
/// gets `OFFSET 0 ROWS` first because the dialect requires it.
#[must_use]
pub fn build_paginated_sql(base: &str, limit: Option<u64>, offset: Option<u64>) -> String {
    let trimmed = base.trim();
    let mut sql = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end().to_string();

    let offset = offset.filter(|o| *o > 0);
    let limit = limit.filter(|l| *l > 0);

    if let Some(offset) = offset {
        sql.push_str(&format!(" OFFSET {offset} ROWS"));
    }
    if let Some(limit) = limit {
        if offset.is_none() {
            sql.push_str(" OFFSET 0 ROWS");
        }
        sql.push_str(&format!(" FETCH NEXT {limit} ROWS ONLY"));
    }

    sql
}

/// Parse an ISO-8601 timestamp into a naive date-time
///
/// Fractional seconds and zone suffixes are discarded; a bare date means
/// midnight.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let invalid = || {
        ClassifiedError::syntax(format!("'{raw}' is not an ISO-8601 timestamp"))
            .with_suggestion("Use the form YYYY-MM-DDTHH:MM:SS")
    };

    let caps = ISO_TIMESTAMP.captures(raw.trim()).ok_or_else(invalid)?;
    let date = caps.get(1).map_or("", |m| m.as_str());
    let time = caps.get(2).map_or("00:00:00", |m| m.as_str());

    NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").map_err(|_| invalid())
}

/// Native timestamp literal for a point-in-time clause
#[must_use]
pub fn timestamp_literal(ts: &NaiveDateTime) -> String {
    format!("TO_TIMESTAMP('{}', 'YYYY-MM-DD HH24:MI:SS')", ts.format("%Y-%m-%d %H:%M:%S"))
}

/// Rewrite the first `FROM <identifier>` to read as of a timestamp
///
/// Returns the SQL unchanged when no timestamp is given. Fails when the
/// timestamp is invalid or there is no `FROM <identifier>` to qualify.
pub fn build_point_in_time_sql(base: &str, timestamp: Option<&str>) -> Result<String> {
    let Some(raw) = timestamp else {
        return Ok(base.to_string());
    };

    let literal = timestamp_literal(&parse_timestamp(raw)?);

    let from = FIRST_FROM.captures(base).ok_or_else(|| {
        ClassifiedError::syntax("Point-in-time reads need a FROM <table> clause to qualify")
    })?;
    let (whole, table) = match (from.get(0), from.get(1)) {
        (Some(whole), Some(table)) => (whole, table.as_str()),
        _ => return Err(ClassifiedError::syntax("Point-in-time reads need a FROM <table> clause")),
    };

    Ok(format!(
        "{}FROM {table} AS OF TIMESTAMP {literal}{}",
        &base[..whole.start()],
        &base[whole.end()..]
    ))
}

/// Table names referenced after `FROM`, `JOIN`, `INTO` or `UPDATE`, in textual order
///
/// Used for whitelist checks on raw SQL. Every item of a comma-separated
/// `FROM` list is reported; parenthesized subqueries are skipped as items
/// but the tables inside them are reported through their own `FROM`.
/// `DUAL` is never reported.
#[must_use]
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = Vec::new();

    for from in FROM_KEYWORD.find_iter(sql) {
        if FUNCTION_FROM.is_match(&sql[..from.start()]) {
            continue;
        }
        from_list_items(sql, from.end(), &mut found);
    }
    for caps in TABLE_REFERENCE.captures_iter(sql) {
        if let Some(name) = caps.get(1) {
            found.push((name.start(), name.as_str()));
        }
    }
    found.sort_by_key(|(position, _)| *position);

    let mut tables: Vec<String> = Vec::new();
    for (_, name) in found {
        let name = name.replace('"', "");
        if name.eq_ignore_ascii_case("DUAL") || tables.contains(&name) {
            continue;
        }
        tables.push(name);
    }
    tables
}

/// Collect the items of the `FROM` list starting at byte `start`
///
/// Walks `item [[AS] alias] , item ...` until something other than a comma
/// follows an item.
fn from_list_items<'a>(sql: &'a str, start: usize, found: &mut Vec<(usize, &'a str)>) {
    let mut rest = &sql[start..];
    loop {
        rest = rest.trim_start();
        if rest.starts_with('(') {
            rest = skip_parenthesized(rest);
        } else {
            let Some(item) = LIST_ITEM.find(rest) else { return };
            found.push((sql.len() - rest.len(), item.as_str()));
            rest = &rest[item.end()..];
        }

        if let Some(alias) = ALIAS.find(rest) {
            rest = &rest[alias.end()..];
        }
        match rest.trim_start().strip_prefix(',') {
            Some(next) => rest = next,
            None => return,
        }
    }
}

/// The text after the group opened by the leading `(`; empty when unbalanced
fn skip_parenthesized(text: &str) -> &str {
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[i + 1..];
                }
            }
            _ => {}
        }
    }
    ""
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_paginate_offset_and_limit() {
        insta::assert_snapshot!(
            build_paginated_sql("SELECT * FROM T", Some(100), Some(50)),
            @"SELECT * FROM T OFFSET 50 ROWS FETCH NEXT 100 ROWS ONLY"
        );
    }

    #[test]
    fn test_paginate_limit_only_emits_offset_zero() {
        insta::assert_snapshot!(
            build_paginated_sql("SELECT * FROM T;", Some(10), None),
            @"SELECT * FROM T OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn test_paginate_offset_only() {
        assert_eq!(build_paginated_sql("SELECT 1 FROM DUAL", None, Some(5)), "SELECT 1 FROM DUAL OFFSET 5 ROWS");
    }

    #[test]
    fn test_paginate_nothing_requested() {
        assert_eq!(build_paginated_sql("SELECT * FROM T", None, Some(0)), "SELECT * FROM T");
        assert_eq!(build_paginated_sql("SELECT * FROM T;", None, None), "SELECT * FROM T");
    }

    #[test]
    fn test_read_validation() {
        assert!(validate_read_sql("  select * from employees").is_ok());
        assert!(validate_read_sql("SELECT DELETED_FLAG FROM T").is_ok());
        assert!(validate_read_sql("WITH x AS (SELECT 1 FROM DUAL) SELECT * FROM x").is_err());
        assert!(validate_read_sql("SELECT * FROM T WHERE 1=1; DROP TABLE T").is_err());
        assert!(validate_read_sql("SELECTX FROM T").is_err());
    }

    #[test]
    fn test_read_validation_empty() {
        let err = validate_read_sql(" \n ").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
    }

    #[test]
    fn test_point_in_time_rewrite() {
        let sql = build_point_in_time_sql(
            "SELECT * FROM employees e WHERE e.id = 1",
            Some("2024-01-15T10:30:00.123Z"),
        )
        .unwrap();
        insta::assert_snapshot!(
            sql,
            @"SELECT * FROM employees AS OF TIMESTAMP TO_TIMESTAMP('2024-01-15 10:30:00', 'YYYY-MM-DD HH24:MI:SS') e WHERE e.id = 1"
        );
    }

    #[test]
    fn test_point_in_time_first_from_only() {
        let sql = build_point_in_time_sql("SELECT * FROM a JOIN b ON a.id = b.id", Some("2024-01-15 08:00:00"))
            .unwrap();
        assert_eq!(sql.matches("AS OF TIMESTAMP").count(), 1);
        assert!(sql.starts_with("SELECT * FROM a AS OF TIMESTAMP"));
    }

    #[test]
    fn test_point_in_time_absent_is_identity() {
        assert_eq!(build_point_in_time_sql("SELECT 1 FROM T", None).unwrap(), "SELECT 1 FROM T");
    }

    #[test]
    fn test_point_in_time_invalid() {
        assert!(build_point_in_time_sql("SELECT * FROM T", Some("yesterday")).is_err());
        assert!(build_point_in_time_sql("SELECT * FROM T", Some("2024-13-40T00:00:00")).is_err());
        assert!(build_point_in_time_sql("SELECT 1", Some("2024-01-01")).is_err());
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let ts = parse_timestamp("2024-02-29").unwrap();
        assert_eq!(ts.to_string(), "2024-02-29 00:00:00");
        let ts = parse_timestamp("2024-02-29T23:59:58+02:00").unwrap();
        assert_eq!(ts.to_string(), "2024-02-29 23:59:58");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("EMPLOYEES").is_ok());
        assert!(validate_identifier("hr.employees").is_ok());
        assert!(validate_identifier("t; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_referenced_tables() {
        let tables = referenced_tables(
            "SELECT * FROM hr.employees e JOIN departments d ON 1=1 WHERE x IN (SELECT 1 FROM DUAL)",
        );
        assert_eq!(tables, vec!["hr.employees", "departments"]);
        assert_eq!(referenced_tables("INSERT INTO \"ORDERS\" VALUES (1)"), vec!["ORDERS"]);
        assert_eq!(referenced_tables("UPDATE t SET a = 1 WHERE b = 2"), vec!["t"]);
        assert_eq!(referenced_tables("SELECT * FROM employees, orders"), vec!["employees", "orders"]);
    }

    #[test]
    fn test_referenced_tables_comma_joins() {
        assert_eq!(referenced_tables("SELECT * FROM EMPLOYEES e, ORDERS o"), vec!["EMPLOYEES", "ORDERS"]);
        assert_eq!(
            referenced_tables("SELECT * FROM a AS x , hr.b y,c WHERE x.id = y.id ORDER BY 1, 2"),
            vec!["a", "hr.b", "c"]
        );
        assert_eq!(
            referenced_tables("SELECT * FROM (SELECT id FROM payroll) p, salaries s"),
            vec!["payroll", "salaries"]
        );
        assert_eq!(referenced_tables("SELECT * FROM t GROUP BY a, b"), vec!["t"]);
    }

    #[test]
    fn test_referenced_tables_ignores_function_from() {
        assert_eq!(
            referenced_tables("SELECT EXTRACT(YEAR FROM hired), TRIM(BOTH ' ' FROM name) FROM employees"),
            vec!["employees"]
        );
    }
}
