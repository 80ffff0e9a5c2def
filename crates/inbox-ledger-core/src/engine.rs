//! The parse engine: rule selection → field extraction → date resolution.
//!
//! [`ParseEngine::parse`] is pure. It performs no I/O and does not read the
//! clock, so the same message and rule set always yield the same
//! [`ParseOutcome`]. Production batches and dry runs share it.

use crate::dates::resolve_date;
use crate::error::ParseFailure;
use crate::extract::extract;
use crate::models::{Message, ParseOutcome, ParsedFields, Rule};
use crate::rules::{RuleIssue, RuleSet};

/// A compiled rule set ready to parse messages.
#[derive(Debug, Clone, Default)]
pub struct ParseEngine {
    rules: RuleSet,
}

impl ParseEngine {
    /// Compile `rules` (active only) into an engine. Rules that fail to
    /// compile are excluded and reported by [`ParseEngine::rule_issues`].
    pub fn new(rules: &[Rule]) -> Self {
        Self {
            rules: RuleSet::compile(rules),
        }
    }

    pub fn rule_issues(&self) -> &[RuleIssue] {
        self.rules.issues()
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rules
    }

    pub fn parse(&self, message: &Message) -> ParseOutcome {
        let rule = match self.rules.select(message) {
            Some(rule) => rule,
            None => {
                return ParseOutcome {
                    rule_id: None,
                    result: Err(ParseFailure::NoMatchingRule),
                }
            }
        };

        let result = extract(message, rule).and_then(|fields| {
            let date = resolve_date(
                fields.raw_date.as_deref(),
                rule.rule.date_format.as_deref(),
                message.received_at,
            )?;
            Ok(ParsedFields {
                amount: fields.amount,
                merchant: fields.merchant,
                description: fields.description,
                card_suffix: fields.card_suffix,
                raw_date: fields.raw_date,
                date,
            })
        });

        ParseOutcome {
            rule_id: Some(rule.id().to_string()),
            result,
        }
    }
}

/// One-shot parse: compile `rules` and parse a single message.
pub fn parse(message: &Message, rules: &[Rule]) -> ParseOutcome {
    ParseEngine::new(rules).parse(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawMessage, TransactionDate};
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn bank_message(body: &str) -> Message {
        Message::from_raw(
            "acct",
            RawMessage {
                external_id: "ext-1".into(),
                sender: "alerts@firstbank.example".into(),
                subject: "Card purchase alert".into(),
                body: body.into(),
                received_at: Some(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()),
            },
        )
    }

    fn bank_rule() -> Rule {
        let mut rule = Rule::new("First Bank purchase", r"Amount:\s*\$([\d,]+\.\d{2})");
        rule.sender_pattern = Some("firstbank".into());
        rule.merchant_pattern = Some(r"Merchant:\s*(.+)".into());
        rule.date_pattern = Some(r"Date:\s*(\d{4}-\d{2}-\d{2})".into());
        rule.card_pattern = Some(r"ending in (\d{3,4})".into());
        rule.date_format = Some("%Y-%m-%d".into());
        rule
    }

    const BODY: &str = "Amount: $1,020.00\nMerchant: Coffee Corner\nDate: 2026-03-01\nCard ending in 123";

    #[test]
    fn full_parse_produces_all_fields() {
        let rule = bank_rule();
        let outcome = parse(&bank_message(BODY), &[rule.clone()]);
        let fields = outcome.fields().expect("parse should succeed");

        assert_eq!(outcome.rule_id.as_deref(), Some(rule.id.as_str()));
        assert_eq!(fields.amount, Decimal::from_str("1020.00").unwrap());
        assert_eq!(fields.merchant.as_deref(), Some("Coffee Corner"));
        assert_eq!(fields.card_suffix.as_deref(), Some("0123"));
        assert_eq!(fields.description.as_deref(), Some("Card purchase alert"));
        assert_eq!(
            fields.date,
            TransactionDate::Day(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
        );
    }

    #[test]
    fn parse_is_pure() {
        let rules = vec![bank_rule()];
        let message = bank_message(BODY);
        let engine = ParseEngine::new(&rules);
        assert_eq!(engine.parse(&message), engine.parse(&message));
        assert_eq!(parse(&message, &rules), parse(&message, &rules));
    }

    #[test]
    fn no_rule_means_no_matching_rule() {
        let outcome = parse(&bank_message(BODY), &[]);
        assert_eq!(outcome.result, Err(ParseFailure::NoMatchingRule));
        assert_eq!(outcome.rule_id, None);
    }

    #[test]
    fn missing_amount_fails_even_if_other_patterns_match() {
        let outcome = parse(
            &bank_message("Merchant: Coffee Corner\nDate: 2026-03-01"),
            &[bank_rule()],
        );
        assert!(matches!(outcome.result, Err(ParseFailure::ExtractionFailed(_))));
        assert!(outcome.rule_id.is_some());
    }

    #[test]
    fn selection_is_exclusive() {
        // The higher priority rule matches but cannot extract; the lower one
        // could, but is never consulted.
        let mut strict = Rule::new("strict", r"EUR ([\d.]+)");
        strict.priority = 10;
        let outcome = parse(&bank_message(BODY), &[bank_rule(), strict.clone()]);
        assert_eq!(outcome.rule_id.as_deref(), Some(strict.id.as_str()));
        assert!(!outcome.is_success());
    }

    #[test]
    fn falls_back_to_received_at() {
        let mut rule = bank_rule();
        rule.date_pattern = None;
        let message = bank_message(BODY);
        let outcome = parse(&message, &[rule]);
        assert_eq!(
            outcome.fields().unwrap().date,
            TransactionDate::Instant(message.received_at.unwrap())
        );
    }

    #[test]
    fn undeterminable_date_fails_the_parse() {
        let mut message = bank_message("Amount: $3.00");
        message.received_at = None;
        let outcome = parse(&message, &[bank_rule()]);
        assert_eq!(outcome.result, Err(ParseFailure::DateUnresolvable));
    }
}
