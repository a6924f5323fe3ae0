//! Declarative field-rewriting rules
//!
//! At most one rule applies per event: the first, in declaration order,
//! whose database and table match (empty pattern = any, comparisons
//! case-insensitive). A matching rule rewrites every row in `rows` and
//! `old_rows`: static `add_fields` are seeded first so a same-named input
//! field overwrites the static default, then each input field runs the
//! exclude/include gate and the rename map.

use crate::common::{CdcError, ChangeEvent, Result, Row};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One declarative rule as it appears in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformRule {
    /// Database to match; empty matches any.
    #[serde(default)]
    pub database: String,
    /// Table to match; empty matches any.
    #[serde(default)]
    pub table: String,
    /// Keep only these fields. Mutually exclusive with `exclude`.
    #[serde(default)]
    pub include: Vec<String>,
    /// Drop these fields. Mutually exclusive with `include`.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Original field name → output field name.
    #[serde(default)]
    pub rename: HashMap<String, String>,
    /// Static fields added to every output row.
    #[serde(default)]
    pub add_fields: HashMap<String, String>,
}

#[derive(Debug)]
struct CompiledRule {
    database: String,
    table: String,
    include: HashSet<String>,
    exclude: HashSet<String>,
    /// keyed by lowercased source name
    rename: HashMap<String, String>,
    add_fields: HashMap<String, String>,
}

impl CompiledRule {
    fn matches(&self, database: &str, table: &str) -> bool {
        (self.database.is_empty() || self.database.eq_ignore_ascii_case(database))
            && (self.table.is_empty() || self.table.eq_ignore_ascii_case(table))
    }

    fn apply_row(&self, row: &Row) -> Row {
        let mut out = Row::new();

        // statics first; input fields with the same name overwrite them
        for (key, value) in &self.add_fields {
            out.insert(key.clone(), serde_json::Value::String(value.clone()));
        }

        for (key, value) in row {
            let key_lower = key.to_lowercase();

            if !self.exclude.is_empty() && self.exclude.contains(&key_lower) {
                continue;
            }
            if !self.include.is_empty() && !self.include.contains(&key_lower) {
                continue;
            }

            let output_key = self
                .rename
                .get(&key_lower)
                .cloned()
                .unwrap_or_else(|| key.clone());
            out.insert(output_key, value.clone());
        }

        out
    }
}

/// Compiled, validated rule list.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile and validate. Rejected at load time:
    /// - `include` and `exclude` both non-empty on the same rule
    /// - a `rename` source missing from a non-empty `include`
    pub fn compile(rules: &[TransformRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());

        for (idx, rule) in rules.iter().enumerate() {
            if !rule.include.is_empty() && !rule.exclude.is_empty() {
                return Err(CdcError::config(format!(
                    "transform rule {idx}: cannot specify both `include` and `exclude`"
                )));
            }

            if !rule.include.is_empty() {
                for source in rule.rename.keys() {
                    if !rule
                        .include
                        .iter()
                        .any(|inc| inc.eq_ignore_ascii_case(source))
                    {
                        return Err(CdcError::config(format!(
                            "transform rule {idx}: rename key '{source}' not found in include list"
                        )));
                    }
                }
            }

            compiled.push(CompiledRule {
                database: rule.database.clone(),
                table: rule.table.clone(),
                include: rule.include.iter().map(|s| s.to_lowercase()).collect(),
                exclude: rule.exclude.iter().map(|s| s.to_lowercase()).collect(),
                rename: rule
                    .rename
                    .iter()
                    .map(|(k, v)| (k.to_lowercase(), v.clone()))
                    .collect(),
                add_fields: rule.add_fields.clone(),
            });
        }

        Ok(Self { rules: compiled })
    }

    /// Apply the first matching rule; no match leaves the event untouched.
    pub fn apply(&self, event: ChangeEvent) -> ChangeEvent {
        let rule = match self
            .rules
            .iter()
            .find(|rule| rule.matches(&event.database, &event.table))
        {
            Some(rule) => rule,
            None => return event,
        };

        let rows = event.rows.iter().map(|row| rule.apply_row(row)).collect();
        let old_rows = event
            .old_rows
            .iter()
            .map(|row| rule.apply_row(row))
            .collect();

        ChangeEvent {
            rows,
            old_rows,
            ..event
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        let mut map = Row::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    fn users_rule() -> TransformRule {
        TransformRule {
            database: "shop".into(),
            table: "users".into(),
            exclude: vec!["password".into()],
            rename: HashMap::from([("email".to_string(), "user_email".to_string())]),
            add_fields: HashMap::from([("source".to_string(), "mysql-cdc".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn test_exclude_rename_add_fields() {
        let rules = RuleSet::compile(&[users_rule()]).unwrap();
        let event = ChangeEvent::insert(
            "shop",
            "users",
            vec![row(&[
                ("id", json!(7)),
                ("email", json!("a@b")),
                ("password", json!("x")),
            ])],
            0,
        );

        let out = rules.apply(event);
        let out_row = &out.rows[0];

        assert_eq!(out_row["source"], json!("mysql-cdc"));
        assert_eq!(out_row["id"], json!(7));
        assert_eq!(out_row["user_email"], json!("a@b"));
        assert!(!out_row.contains_key("password"));
        assert!(!out_row.contains_key("email"));
        assert_eq!(out_row.len(), 3);
    }

    #[test]
    fn test_include_gate() {
        let rule = TransformRule {
            include: vec!["id".into(), "name".into()],
            ..Default::default()
        };
        let rules = RuleSet::compile(&[rule]).unwrap();
        let event = ChangeEvent::insert(
            "db",
            "t",
            vec![row(&[
                ("id", json!(1)),
                ("name", json!("a")),
                ("secret", json!("s")),
            ])],
            0,
        );

        let out = rules.apply(event);
        assert!(out.rows[0].contains_key("id"));
        assert!(out.rows[0].contains_key("name"));
        assert!(!out.rows[0].contains_key("secret"));
    }

    #[test]
    fn test_case_insensitive_match_and_fields() {
        let rule = TransformRule {
            database: "SHOP".into(),
            table: "Users".into(),
            exclude: vec!["PASSWORD".into()],
            ..Default::default()
        };
        let rules = RuleSet::compile(&[rule]).unwrap();
        let event = ChangeEvent::insert(
            "shop",
            "users",
            vec![row(&[("Password", json!("x")), ("id", json!(1))])],
            0,
        );

        let out = rules.apply(event);
        assert!(!out.rows[0].contains_key("Password"));
        assert!(out.rows[0].contains_key("id"));
    }

    #[test]
    fn test_first_match_wins() {
        let first = TransformRule {
            table: "users".into(),
            exclude: vec!["a".into()],
            ..Default::default()
        };
        let second = TransformRule {
            table: "users".into(),
            exclude: vec!["b".into()],
            ..Default::default()
        };
        let rules = RuleSet::compile(&[first, second]).unwrap();

        let event = ChangeEvent::insert(
            "db",
            "users",
            vec![row(&[("a", json!(1)), ("b", json!(2))])],
            0,
        );
        let out = rules.apply(event);

        assert!(!out.rows[0].contains_key("a"));
        assert!(out.rows[0].contains_key("b"));
    }

    #[test]
    fn test_no_match_is_identity() {
        let rules = RuleSet::compile(&[users_rule()]).unwrap();
        let event = ChangeEvent::insert(
            "shop",
            "orders",
            vec![row(&[("password", json!("kept"))])],
            0,
        );
        let out = rules.apply(event);
        assert!(out.rows[0].contains_key("password"));
    }

    #[test]
    fn test_input_overwrites_static_field() {
        let rule = TransformRule {
            add_fields: HashMap::from([("source".to_string(), "default".to_string())]),
            ..Default::default()
        };
        let rules = RuleSet::compile(&[rule]).unwrap();
        let event = ChangeEvent::insert(
            "db",
            "t",
            vec![row(&[("source", json!("from-row"))])],
            0,
        );
        let out = rules.apply(event);
        assert_eq!(out.rows[0]["source"], json!("from-row"));
    }

    #[test]
    fn test_old_rows_rewritten_too() {
        let rules = RuleSet::compile(&[users_rule()]).unwrap();
        let event = ChangeEvent::update(
            "shop",
            "users",
            vec![row(&[("email", json!("new@b")), ("password", json!("x"))])],
            vec![row(&[("email", json!("old@b")), ("password", json!("x"))])],
            0,
        );

        let out = rules.apply(event);
        assert_eq!(out.old_rows[0]["user_email"], json!("old@b"));
        assert!(!out.old_rows[0].contains_key("password"));
    }

    #[test]
    fn test_include_and_exclude_rejected() {
        let rule = TransformRule {
            include: vec!["a".into()],
            exclude: vec!["b".into()],
            ..Default::default()
        };
        assert!(RuleSet::compile(&[rule]).is_err());
    }

    #[test]
    fn test_rename_source_must_be_included() {
        let rule = TransformRule {
            include: vec!["id".into()],
            rename: HashMap::from([("email".to_string(), "user_email".to_string())]),
            ..Default::default()
        };
        assert!(RuleSet::compile(&[rule]).is_err());

        // case-insensitive membership is fine
        let rule = TransformRule {
            include: vec!["Email".into()],
            rename: HashMap::from([("email".to_string(), "user_email".to_string())]),
            ..Default::default()
        };
        assert!(RuleSet::compile(&[rule]).is_ok());
    }

    #[test]
    fn test_identity_include_matches_disabled_mode() {
        // include = full column list, no renames, no statics
        let rule = TransformRule {
            include: vec!["id".into(), "name".into()],
            ..Default::default()
        };
        let rules = RuleSet::compile(&[rule]).unwrap();

        let input = row(&[("id", json!(1)), ("name", json!("a"))]);
        let event = ChangeEvent::insert("db", "t", vec![input.clone()], 0);
        let out = rules.apply(event);

        assert_eq!(out.rows[0], input);
    }
}
