//! Field extraction from a message under a selected rule.
//!
//! The amount is mandatory: if its pattern does not match, or the capture
//! is not a positive number, extraction fails as a whole. Merchant, date,
//! card suffix and description are best-effort and never fail.

use std::str::FromStr;

use regex::Regex;
use rust_decimal::Decimal;

use crate::error::ParseFailure;
use crate::models::Message;
use crate::rules::CompiledRule;

/// Currency scale for stored amounts.
const AMOUNT_SCALE: u32 = 2;

/// Fields pulled out of a message before the date is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFields {
    pub amount: Decimal,
    pub merchant: Option<String>,
    pub description: Option<String>,
    pub card_suffix: Option<String>,
    pub raw_date: Option<String>,
}

/// Extract fields from `message` using `rule`'s extraction patterns.
///
/// Patterns are applied to the subject and body joined by a newline.
pub fn extract(message: &Message, rule: &CompiledRule) -> Result<ExtractedFields, ParseFailure> {
    let text = search_text(message);

    let raw_amount = first_capture(&rule.amount, &text).ok_or_else(|| {
        ParseFailure::ExtractionFailed("amount pattern did not match".to_string())
    })?;
    let amount = parse_amount(&raw_amount).ok_or_else(|| {
        ParseFailure::ExtractionFailed(format!("'{}' is not a positive amount", raw_amount))
    })?;

    let merchant = optional_capture(&rule.merchant, &text);
    let raw_date = optional_capture(&rule.date, &text);
    let card_suffix = optional_capture(&rule.card, &text).map(|s| normalize_card_suffix(&s));
    let description = optional_capture(&rule.description, &text).or_else(|| {
        let subject = message.subject.trim();
        (!subject.is_empty()).then(|| subject.to_string())
    });

    Ok(ExtractedFields {
        amount,
        merchant,
        description,
        card_suffix,
        raw_date,
    })
}

fn search_text(message: &Message) -> String {
    format!("{}\n{}", message.subject, message.body)
}

fn optional_capture(pattern: &Option<Regex>, text: &str) -> Option<String> {
    pattern.as_ref().and_then(|re| first_capture(re, text))
}

/// The first non-empty capture group of the first match, left to right.
fn first_capture(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    caps.iter()
        .skip(1)
        .flatten()
        .map(|m| m.as_str().trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse a captured amount after stripping thousands separators.
///
/// Returns `None` unless the result is strictly positive. The value is
/// rounded to currency scale.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    if value <= Decimal::ZERO {
        return None;
    }
    Some(value.round_dp(AMOUNT_SCALE))
}

/// One issuer prints three-digit card suffixes; pad those to four. Any
/// other length is left untouched.
pub fn normalize_card_suffix(raw: &str) -> String {
    if raw.len() == 3 && raw.chars().all(|c| c.is_ascii_digit()) {
        format!("0{}", raw)
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawMessage, Rule};

    fn message(subject: &str, body: &str) -> Message {
        Message::from_raw(
            "acct",
            RawMessage {
                external_id: "m1".into(),
                sender: "alerts@bank.example".into(),
                subject: subject.into(),
                body: body.into(),
                received_at: None,
            },
        )
    }

    fn compiled(rule: Rule) -> CompiledRule {
        CompiledRule::compile(&rule).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn amount_strips_thousands_separators() {
        let rule = compiled(Rule::new("r", r"USD\s*([\d,]+\.\d{2})"));
        let fields = extract(&message("Purchase", "Amount USD 1,234.50 at ACME"), &rule).unwrap();
        assert_eq!(fields.amount, dec("1234.50"));
    }

    #[test]
    fn amount_must_match() {
        let rule = compiled(Rule::new("r", r"USD\s*([\d,.]+)"));
        let err = extract(&message("Purchase", "Total EUR 3.00"), &rule).unwrap_err();
        assert_eq!(err.code(), "extraction_failed");
    }

    #[test]
    fn zero_or_non_numeric_amount_fails() {
        let rule = compiled(Rule::new("r", r"Amount:\s*(\S+)"));
        assert!(extract(&message("x", "Amount: 0.00"), &rule).is_err());
        assert!(extract(&message("x", "Amount: pending"), &rule).is_err());
    }

    #[test]
    fn amount_failure_wins_over_other_fields() {
        let mut rule = Rule::new("r", r"USD ([\d.]+)");
        rule.merchant_pattern = Some(r"at (\w+)".into());
        let err = extract(&message("x", "EUR 9.99 at ACME"), &compiled(rule)).unwrap_err();
        assert!(matches!(err, ParseFailure::ExtractionFailed(_)));
    }

    #[test]
    fn first_non_empty_group_is_used() {
        let mut rule = Rule::new("r", r"\$([\d.]+)");
        rule.merchant_pattern = Some(r"(?:at ([A-Z]+)|merchant: ([A-Za-z]+))".into());
        let fields = extract(&message("x", "$4.00 merchant: Bakery"), &compiled(rule)).unwrap();
        assert_eq!(fields.merchant.as_deref(), Some("Bakery"));
    }

    #[test]
    fn optional_fields_absent_when_unmatched() {
        let mut rule = Rule::new("r", r"\$([\d.]+)");
        rule.merchant_pattern = Some(r"at (\w+)".into());
        rule.card_pattern = Some(r"card ending (\d+)".into());
        let fields = extract(&message("", "$4.00"), &compiled(rule)).unwrap();
        assert_eq!(fields.merchant, None);
        assert_eq!(fields.card_suffix, None);
        assert_eq!(fields.description, None);
    }

    #[test]
    fn three_digit_card_suffix_is_padded() {
        let mut rule = Rule::new("r", r"\$([\d.]+)");
        rule.card_pattern = Some(r"ending (\d+)".into());
        let fields = extract(&message("x", "$1.00 card ending 123"), &compiled(rule)).unwrap();
        assert_eq!(fields.card_suffix.as_deref(), Some("0123"));
    }

    #[test]
    fn other_suffix_lengths_are_untouched() {
        assert_eq!(normalize_card_suffix("4321"), "4321");
        assert_eq!(normalize_card_suffix("12"), "12");
        assert_eq!(normalize_card_suffix("12a"), "12a");
    }

    #[test]
    fn description_defaults_to_subject() {
        let rule = compiled(Rule::new("r", r"\$([\d.]+)"));
        let fields = extract(&message("  Card purchase  ", "$2.00"), &rule).unwrap();
        assert_eq!(fields.description.as_deref(), Some("Card purchase"));
    }

    #[test]
    fn amount_can_come_from_subject() {
        let rule = compiled(Rule::new("r", r"charged \$([\d.]+)"));
        let fields = extract(&message("You were charged $7.25", "details inside"), &rule).unwrap();
        assert_eq!(fields.amount, dec("7.25"));
    }
}
