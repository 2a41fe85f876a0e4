//! Security Policy
//!
//! Table whitelist, row ceilings, large-object truncation limits and the DML
//! verb/keyword policy. Everything here is a pure function over configuration
//! and strings.
//!
//! # Limitations
//! These checks are pattern-based and advisory. They catch the common
//! mistakes an agent makes but cannot catch every obfuscation (comments
//! splitting keywords, dynamic SQL inside PL/SQL blocks, ...). Database-level
//! grants on the connecting user remain the real security boundary.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::error::{ClassifiedError, Result};
use crate::mapper::MapperLimits;

static WHERE_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bWHERE\b").expect("static regex"));

/// Process-wide security policy, read-only once loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Allowed tables (upper-case). `None` means unrestricted.
    #[serde(deserialize_with = "deserialize_whitelist")]
    pub table_whitelist: Option<BTreeSet<String>>,

    /// Hard ceiling on rows returned by any read
    pub max_rows: usize,

    /// Row limit used when the caller does not request one
    pub default_limit: usize,

    /// Strings longer than this many characters are truncated
    pub clob_max_chars: usize,

    /// Binary values longer than this many bytes are truncated before encoding
    pub blob_max_bytes: usize,

    /// Statement verbs accepted by the DML path
    pub dml_allowed_verbs: Vec<String>,

    /// Keywords that may not appear anywhere in a DML statement
    pub dml_blacklist_keywords: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            table_whitelist: None,
            max_rows: 1000,
            default_limit: 100,
            clob_max_chars: 4000,
            blob_max_bytes: 4096,
            dml_allowed_verbs: vec!["INSERT".to_string(), "UPDATE".to_string()],
            dml_blacklist_keywords: ["DELETE", "TRUNCATE", "DROP", "ALTER", "CREATE", "GRANT", "REVOKE"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl SecurityPolicy {
    /// Replace the whitelist, normalizing names to upper-case
    #[must_use]
    pub fn with_whitelist<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.table_whitelist = normalize_whitelist(tables);
        self
    }

    /// Truncation limits for the result mapper
    #[must_use]
    pub const fn mapper_limits(&self) -> MapperLimits {
        MapperLimits { clob_max_chars: self.clob_max_chars, blob_max_bytes: self.blob_max_bytes }
    }

    /// Check whether a table may be accessed
    ///
    /// Always allowed without a whitelist. Comparison is case-insensitive and
    /// a schema prefix (`HR.EMPLOYEES`) is ignored.
    pub fn check_table_access(&self, name: &str) -> Result<()> {
        let Some(whitelist) = &self.table_whitelist else {
            return Ok(());
        };

        let upper = name.trim().to_uppercase();
        let table = upper.rsplit('.').next().unwrap_or(&upper).trim_matches('"');

        if whitelist.contains(table) || whitelist.contains(upper.as_str()) {
            return Ok(());
        }

        let allowed = whitelist.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
        Err(ClassifiedError::access_denied(format!(
            "Access to table '{table}' is denied. Allowed tables: {allowed}"
        ))
        .with_detail("table", table)
        .with_suggestion("Query one of the whitelisted tables"))
    }

    /// Effective row limit for a request
    ///
    /// Absent → `min(default_limit, max_rows)`; otherwise clamped to `1..=max_rows`.
    #[must_use]
    pub fn enforce_row_limit(&self, requested: Option<i64>) -> usize {
        let ceiling = self.max_rows.max(1);
        match requested {
            None => self.default_limit.clamp(1, ceiling),
            Some(n) => usize::try_from(n.max(1)).unwrap_or(usize::MAX).min(ceiling),
        }
    }

    /// Validate a DML statement and return its verb
    ///
    /// The first failing check determines the reported reason:
    /// 1. must start with an allowed verb
    /// 2. must not contain a blacklisted keyword as a standalone token
    /// 3. `UPDATE` must contain a standalone `WHERE`
    pub fn validate_dml_sql(&self, sql: &str) -> Result<String> {
        let upper = sql.trim().to_uppercase();
        if upper.is_empty() {
            return Err(ClassifiedError::syntax("SQL statement must be a non-empty string"));
        }

        let verb = self
            .dml_allowed_verbs
            .iter()
            .map(|v| v.to_uppercase())
            .find(|v| starts_with_token(&upper, v))
            .ok_or_else(|| {
                ClassifiedError::syntax(format!(
                    "Only {} statements are allowed on the write path",
                    self.dml_allowed_verbs.join(", ")
                ))
            })?;

        if let Some(keyword) =
            self.dml_blacklist_keywords.iter().find(|kw| contains_token(&upper, &kw.to_uppercase()))
        {
            return Err(ClassifiedError::syntax(format!(
                "Statement contains forbidden keyword: {}",
                keyword.to_uppercase()
            ))
            .with_detail("keyword", keyword.to_uppercase()));
        }

        if verb == "UPDATE" && !WHERE_TOKEN.is_match(&upper) {
            return Err(ClassifiedError::syntax("UPDATE statements require a WHERE clause")
                .with_suggestion("Add a WHERE clause restricting the rows to update"));
        }

        Ok(verb)
    }
}

/// Parse a comma-separated whitelist, e.g. from an environment variable
///
/// Blank input yields `None` (unrestricted).
#[must_use]
pub fn parse_whitelist(raw: &str) -> Option<BTreeSet<String>> {
    normalize_whitelist(raw.split(','))
}

fn normalize_whitelist<I, S>(tables: I) -> Option<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = tables
        .into_iter()
        .map(|t| t.as_ref().trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect();
    (!set.is_empty()).then_some(set)
}

fn deserialize_whitelist<'de, D>(deserializer: D) -> std::result::Result<Option<BTreeSet<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<String>>::deserialize(deserializer)?;
    Ok(raw.and_then(normalize_whitelist))
}

/// True if `token` appears in `haystack` delimited by word boundaries
///
/// `DELETED_FLAG` does not contain the token `DELETE`.
#[must_use]
pub fn contains_token(haystack: &str, token: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(token))).is_ok_and(|re| re.is_match(haystack))
}

fn starts_with_token(haystack: &str, token: &str) -> bool {
    Regex::new(&format!(r"^{}\b", regex::escape(token))).is_ok_and(|re| re.is_match(haystack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn policy() -> SecurityPolicy {
        SecurityPolicy::default()
    }

    #[test]
    fn test_no_whitelist_allows_everything() {
        assert!(policy().check_table_access("anything").is_ok());
    }

    #[test]
    fn test_whitelist_denies_and_lists_allowed() {
        let policy = policy().with_whitelist(["employees"]);
        let err = policy.check_table_access("orders").unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessDenied);
        assert!(err.message.contains("EMPLOYEES"));
        assert!(err.message.contains("ORDERS"));
    }

    #[test]
    fn test_whitelist_case_insensitive_and_schema_prefix() {
        let policy = policy().with_whitelist(["Employees"]);
        assert!(policy.check_table_access("employees").is_ok());
        assert!(policy.check_table_access("hr.EMPLOYEES").is_ok());
    }

    #[test]
    fn test_parse_whitelist() {
        let set = parse_whitelist(" employees, ,Departments ").unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["DEPARTMENTS", "EMPLOYEES"]);
        assert!(parse_whitelist(" , ").is_none());
    }

    #[test]
    fn test_enforce_row_limit() {
        let policy = SecurityPolicy { max_rows: 500, default_limit: 100, ..policy() };
        assert_eq!(policy.enforce_row_limit(None), 100);
        assert_eq!(policy.enforce_row_limit(Some(0)), 1);
        assert_eq!(policy.enforce_row_limit(Some(-7)), 1);
        assert_eq!(policy.enforce_row_limit(Some(250)), 250);
        assert_eq!(policy.enforce_row_limit(Some(10_000)), 500);
    }

    #[test]
    fn test_default_limit_above_ceiling() {
        let policy = SecurityPolicy { max_rows: 50, default_limit: 100, ..policy() };
        assert_eq!(policy.enforce_row_limit(None), 50);
    }

    #[test]
    fn test_update_requires_where() {
        let err = policy().validate_dml_sql("UPDATE EMPLOYEES SET SALARY=1").unwrap_err();
        assert!(err.message.contains("WHERE"));

        let verb = policy().validate_dml_sql("UPDATE EMPLOYEES SET SALARY=1 WHERE ID=1").unwrap();
        assert_eq!(verb, "UPDATE");
    }

    #[test]
    fn test_insert_allowed() {
        let verb = policy().validate_dml_sql("  insert into t (a) values (1)").unwrap();
        assert_eq!(verb, "INSERT");
    }

    #[test]
    fn test_disallowed_verb() {
        let err = policy().validate_dml_sql("DELETE FROM T WHERE ID = 1").unwrap_err();
        assert!(err.message.contains("Only INSERT, UPDATE"));
        assert!(policy().validate_dml_sql("MERGE INTO T USING S ON (1=1)").is_err());
        assert!(policy().validate_dml_sql("INSERTS INTO T VALUES (1)").is_err());
    }

    #[test]
    fn test_blacklisted_keyword_standalone_only() {
        let err = policy()
            .validate_dml_sql("UPDATE T SET A = 1 WHERE ID IN (SELECT ID FROM X); DROP TABLE T")
            .unwrap_err();
        assert!(err.message.contains("DROP"));

        let verb = policy().validate_dml_sql("UPDATE T SET DELETED_FLAG = 1 WHERE ID = 2").unwrap();
        assert_eq!(verb, "UPDATE");
    }

    #[test]
    fn test_empty_dml_is_syntax_error() {
        let err = policy().validate_dml_sql("   ").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
    }

    #[test]
    fn test_where_inside_identifier_is_not_a_where() {
        let err = policy().validate_dml_sql("UPDATE T SET NOWHERE_COL = 1").unwrap_err();
        assert!(err.message.contains("WHERE clause"));
    }

    #[test]
    fn test_deserialize_normalizes_whitelist() {
        let policy: SecurityPolicy =
            serde_json::from_str(r#"{"table_whitelist": ["employees", " "], "max_rows": 10}"#).unwrap();
        assert!(policy.table_whitelist.unwrap().contains("EMPLOYEES"));
        assert_eq!(policy.max_rows, 10);
        assert_eq!(policy.default_limit, 100);
    }
}
