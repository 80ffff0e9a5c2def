//! Rule and card management for `ibl rules` and `ibl cards`.
//!
//! Rules are data. They are authored in TOML, imported into the store,
//! and compiled each time a batch starts:
//!
//! ```toml
//! [[rules]]
//! name = "Acme Bank card alert"
//! priority = 10
//! sender_pattern = "alerts@acmebank\\.com"
//! amount_pattern = "\\$([\\d,]+\\.\\d{2})"
//! merchant_pattern = "at (.+?)\\."
//! date_pattern = "on (\\d{2}/\\d{2}/\\d{4})"
//! date_format = "%m/%d/%Y"
//! card_pattern = "ending in (\\d{3,4})"
//! ```

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use inbox_ledger_core::extract::normalize_card_suffix;
use inbox_ledger_core::rules::validate_rules;
use inbox_ledger_core::{Card, Rule, RuleIssue, Store};

use crate::report::print_json;

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Parse a TOML rules document.
pub fn parse_rules_file(content: &str) -> Result<Vec<Rule>> {
    let file: RulesFile = toml::from_str(content).context("Failed to parse rules file")?;
    Ok(file.rules)
}

/// Import every rule from a TOML file. Rules with invalid patterns are
/// rejected up front so the store only holds rules that compile.
pub async fn import_rules(store: &dyn Store, path: &Path) -> Result<Vec<Rule>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file: {}", path.display()))?;
    let rules = parse_rules_file(&content)?;

    let issues = validate_rules(&rules);
    if !issues.is_empty() {
        for issue in &issues {
            eprintln!("  {}: {}", issue.rule_name, issue.error);
        }
        bail!(
            "{} of {} rules in {} are invalid; nothing imported",
            issues.len(),
            rules.len(),
            path.display()
        );
    }

    let mut stored = Vec::with_capacity(rules.len());
    for rule in &rules {
        stored.push(store.insert_rule(rule).await?);
    }
    info!(count = stored.len(), file = %path.display(), "rules imported");
    Ok(stored)
}

/// Add one rule, rejecting it when a pattern does not compile.
pub async fn add_rule(store: &dyn Store, rule: Rule) -> Result<Rule> {
    if let Some(issue) = validate_rules(std::slice::from_ref(&rule)).into_iter().next() {
        return Err(issue.error.into());
    }
    store.insert_rule(&rule).await
}

/// Compile every stored rule and report the ones that would be skipped.
pub async fn validate_stored(store: &dyn Store) -> Result<Vec<RuleIssue>> {
    let rules = store.list_rules().await?;
    Ok(validate_rules(&rules))
}

pub async fn list_rules(store: &dyn Store, json: bool) -> Result<()> {
    let rules = store.list_rules().await?;
    if json {
        return print_json(&rules);
    }
    if rules.is_empty() {
        println!("No rules. Import some with `ibl rules import <file.toml>`.");
        return Ok(());
    }

    println!(
        "{:<38} {:<28} {:>8} {:>6} {:>6}",
        "ID", "NAME", "PRIORITY", "ACTIVE", "HITS"
    );
    for r in &rules {
        println!(
            "{:<38} {:<28} {:>8} {:>6} {:>6}",
            r.id,
            r.name,
            r.priority,
            if r.is_active { "yes" } else { "no" },
            r.hit_count
        );
    }
    Ok(())
}

pub fn print_issues(issues: &[RuleIssue], json: bool) -> Result<()> {
    if json {
        return print_json(&issues);
    }
    if issues.is_empty() {
        println!("All rules compile.");
        return Ok(());
    }
    for issue in issues {
        println!("{} ({}): {}", issue.rule_name, issue.rule_id, issue.error);
    }
    Ok(())
}

/// Register a card. Three-digit suffixes are stored padded, matching the
/// form the parse engine looks them up by.
pub async fn add_card(
    store: &dyn Store,
    suffix: &str,
    owner: &str,
    label: Option<String>,
) -> Result<Card> {
    let suffix = suffix.trim();
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        bail!("card suffix must be digits, got '{}'", suffix);
    }
    let card = Card {
        id: uuid::Uuid::new_v4().to_string(),
        suffix: normalize_card_suffix(suffix),
        label,
        owner: Some(owner.to_string()),
    };
    store.insert_card(&card).await?;
    Ok(card)
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_ledger_core::InMemoryStore;

    const RULES: &str = r#"
[[rules]]
name = "Acme"
priority = 10
sender_pattern = "alerts@acme\\.com"
amount_pattern = "\\$([\\d,.]+)"

[[rules]]
name = "Other"
amount_pattern = "USD ([\\d.]+)"
is_active = false
"#;

    #[test]
    fn rules_file_defaults() {
        let rules = parse_rules_file(RULES).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 10);
        assert!(rules[0].is_active);
        assert!(!rules[1].is_active);
        assert_ne!(rules[0].id, rules[1].id);
    }

    #[test]
    fn example_rules_compile() {
        let rules = parse_rules_file(include_str!("../config/rules.example.toml")).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(validate_rules(&rules).is_empty());
    }

    #[tokio::test]
    async fn invalid_rule_is_not_added() {
        let store = InMemoryStore::new();
        let mut rule = Rule::new("broken", r"\$([\d.]+)");
        rule.subject_pattern = Some("(unclosed".into());
        assert!(add_rule(&store, rule).await.is_err());
        assert!(store.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn three_digit_card_is_padded() {
        let store = InMemoryStore::new();
        let card = add_card(&store, "123", "Dana", None).await.unwrap();
        assert_eq!(card.suffix, "0123");
        assert!(store.find_card_by_suffix("0123").await.unwrap().is_some());
        assert!(add_card(&store, "12a4", "Dana", None).await.is_err());
    }
}
