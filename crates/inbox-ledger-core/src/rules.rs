//! Rule compilation and selection.
//!
//! Rules are data: every pattern is a user-authored regular expression that
//! is compiled once when a [`RuleSet`] is built. A rule whose pattern fails
//! to compile (or whose amount pattern has no capture group) is recorded as
//! a [`RuleIssue`] and left out of the evaluation order, so one bad rule can
//! never fault a batch.
//!
//! # Evaluation order
//!
//! Active rules only, sorted by:
//!
//! 1. `priority` descending,
//! 2. `created_seq` descending (most recently created first),
//! 3. `id` ascending, so the order is total even for hand-built rules.
//!
//! All patterns are compiled case-insensitively.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};

use crate::error::LedgerError;
use crate::models::{Message, Rule};

/// Upper bound on compiled pattern size. Rules are user input.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// A rule that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleIssue {
    pub rule_id: String,
    pub rule_name: String,
    pub error: LedgerError,
}

impl serde::Serialize for RuleIssue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("RuleIssue", 4)?;
        s.serialize_field("rule_id", &self.rule_id)?;
        s.serialize_field("rule_name", &self.rule_name)?;
        s.serialize_field("code", self.error.code())?;
        s.serialize_field("error", &self.error.to_string())?;
        s.end()
    }
}

/// A rule together with its compiled pattern cache.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    sender: Option<Regex>,
    subject: Option<Regex>,
    body: Option<Regex>,
    pub(crate) amount: Regex,
    pub(crate) merchant: Option<Regex>,
    pub(crate) date: Option<Regex>,
    pub(crate) card: Option<Regex>,
    pub(crate) description: Option<Regex>,
}

impl CompiledRule {
    /// Compile every pattern of `rule`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRulePattern`] naming the first field
    /// whose pattern does not compile, or `amount` if the amount pattern is
    /// empty or has no capture group.
    pub fn compile(rule: &Rule) -> Result<Self, LedgerError> {
        let amount = match compile_optional(rule, "amount", Some(&rule.amount_pattern))? {
            Some(re) => re,
            None => {
                return Err(invalid(rule, "amount", "pattern is required"));
            }
        };
        if amount.captures_len() < 2 {
            return Err(invalid(rule, "amount", "pattern must contain a capture group"));
        }

        Ok(Self {
            sender: compile_optional(rule, "sender", rule.sender_pattern.as_deref())?,
            subject: compile_optional(rule, "subject", rule.subject_pattern.as_deref())?,
            body: compile_optional(rule, "body", rule.body_pattern.as_deref())?,
            amount,
            merchant: compile_optional(rule, "merchant", rule.merchant_pattern.as_deref())?,
            date: compile_optional(rule, "date", rule.date_pattern.as_deref())?,
            card: compile_optional(rule, "card", rule.card_pattern.as_deref())?,
            description: compile_optional(
                rule,
                "description",
                rule.description_pattern.as_deref(),
            )?,
            rule: rule.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.rule.id
    }

    /// True when every present matching pattern fires on its field.
    /// Unset matching patterns always match.
    pub fn matches(&self, message: &Message) -> bool {
        field_matches(&self.sender, &message.sender)
            && field_matches(&self.subject, &message.subject)
            && field_matches(&self.body, &message.body)
    }
}

fn field_matches(pattern: &Option<Regex>, text: &str) -> bool {
    pattern.as_ref().map_or(true, |re| re.is_match(text))
}

fn compile_optional(
    rule: &Rule,
    field: &'static str,
    pattern: Option<&str>,
) -> Result<Option<Regex>, LedgerError> {
    let pattern = match pattern.map(str::trim) {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(None),
    };
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .map(Some)
        .map_err(|e| invalid(rule, field, &e.to_string()))
}

fn invalid(rule: &Rule, field: &'static str, message: &str) -> LedgerError {
    LedgerError::InvalidRulePattern {
        rule: rule.name.clone(),
        field,
        message: message.to_string(),
    }
}

/// Deterministic evaluation order between two rules.
pub fn evaluation_order(a: &Rule, b: &Rule) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.created_seq.cmp(&a.created_seq))
        .then_with(|| a.id.cmp(&b.id))
}

/// Active, compiled rules in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    ordered: Vec<CompiledRule>,
    issues: Vec<RuleIssue>,
}

impl RuleSet {
    /// Filter to active rules, order them, and compile each one.
    ///
    /// Inactive rules are ignored entirely (they are not validated).
    pub fn compile(rules: &[Rule]) -> Self {
        let mut active: Vec<&Rule> = rules.iter().filter(|r| r.is_active).collect();
        active.sort_by(|a, b| evaluation_order(a, b));

        let mut ordered = Vec::with_capacity(active.len());
        let mut issues = Vec::new();
        for rule in active {
            match CompiledRule::compile(rule) {
                Ok(compiled) => ordered.push(compiled),
                Err(error) => issues.push(RuleIssue {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    error,
                }),
            }
        }

        Self { ordered, issues }
    }

    /// The first rule, in evaluation order, whose matching patterns all
    /// fire. Matching is exclusive: later rules are never consulted once
    /// one matches.
    pub fn select(&self, message: &Message) -> Option<&CompiledRule> {
        self.ordered.iter().find(|rule| rule.matches(message))
    }

    /// Rules left out because they failed to compile.
    pub fn issues(&self) -> &[RuleIssue] {
        &self.issues
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.ordered
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Validate every rule, active or not, without building an evaluation order.
pub fn validate_rules(rules: &[Rule]) -> Vec<RuleIssue> {
    rules
        .iter()
        .filter_map(|rule| {
            CompiledRule::compile(rule).err().map(|error| RuleIssue {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                error,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawMessage;

    fn message(sender: &str, subject: &str, body: &str) -> Message {
        Message::from_raw(
            "acct",
            RawMessage {
                external_id: "m1".into(),
                sender: sender.into(),
                subject: subject.into(),
                body: body.into(),
                received_at: None,
            },
        )
    }

    fn rule(id: &str, priority: i64, seq: i64) -> Rule {
        let mut r = Rule::new(id, r"\$([\d,.]+)");
        r.id = id.to_string();
        r.priority = priority;
        r.created_seq = seq;
        r
    }

    #[test]
    fn empty_rule_set_selects_nothing() {
        let set = RuleSet::compile(&[]);
        assert!(set.select(&message("a", "b", "c")).is_none());
    }

    #[test]
    fn higher_priority_wins() {
        let set = RuleSet::compile(&[rule("low", 1, 5), rule("high", 10, 1)]);
        let selected = set.select(&message("bank", "alert", "$5")).unwrap();
        assert_eq!(selected.id(), "high");
    }

    #[test]
    fn equal_priority_prefers_most_recently_created() {
        let set = RuleSet::compile(&[rule("older", 3, 1), rule("newer", 3, 2)]);
        let selected = set.select(&message("bank", "alert", "$5")).unwrap();
        assert_eq!(selected.id(), "newer");
    }

    #[test]
    fn full_tie_falls_back_to_id() {
        let set = RuleSet::compile(&[rule("b", 0, 0), rule("a", 0, 0)]);
        assert_eq!(set.rules()[0].id(), "a");
    }

    #[test]
    fn matching_patterns_are_and_combined_and_case_insensitive() {
        let mut r = rule("r", 0, 0);
        r.sender_pattern = Some("alerts@bank".into());
        r.subject_pattern = Some("purchase".into());
        let set = RuleSet::compile(&[r]);

        assert!(set
            .select(&message("ALERTS@BANK.COM", "Card PURCHASE", "x"))
            .is_some());
        assert!(set
            .select(&message("alerts@bank.com", "Payment received", "x"))
            .is_none());
    }

    #[test]
    fn empty_pattern_means_always_match() {
        let mut r = rule("r", 0, 0);
        r.sender_pattern = Some("   ".into());
        r.body_pattern = Some(String::new());
        let set = RuleSet::compile(&[r]);
        assert!(set.select(&message("anyone", "anything", "")).is_some());
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut r = rule("off", 100, 0);
        r.is_active = false;
        let set = RuleSet::compile(&[r, rule("on", 0, 0)]);
        assert_eq!(set.select(&message("a", "b", "c")).unwrap().id(), "on");
    }

    #[test]
    fn malformed_pattern_skips_rule_without_panicking() {
        let mut broken = rule("broken", 100, 0);
        broken.subject_pattern = Some("([unclosed".into());
        let set = RuleSet::compile(&[broken, rule("fallback", 0, 0)]);

        assert_eq!(set.issues().len(), 1);
        assert_eq!(set.issues()[0].rule_id, "broken");
        assert_eq!(set.select(&message("a", "b", "c")).unwrap().id(), "fallback");
    }

    #[test]
    fn amount_pattern_requires_capture_group() {
        let mut r = rule("r", 0, 0);
        r.amount_pattern = r"\$\d+".into();
        let err = CompiledRule::compile(&r).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidRulePattern { field: "amount", .. }
        ));
    }

    #[test]
    fn validate_reports_inactive_rules_too() {
        let mut r = rule("r", 0, 0);
        r.is_active = false;
        r.card_pattern = Some("(".into());
        let issues = validate_rules(&[r]);
        assert_eq!(issues.len(), 1);
    }
}
