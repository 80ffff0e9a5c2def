//! Terminal rendering of run summaries and reports.
//!
//! Every batch command prints either plain text lines on stdout or, with
//! `--json`, the same structure serialized as pretty JSON.

use anyhow::Result;
use serde::Serialize;

use inbox_ledger_core::{AuditReport, Finding, RunSummary};

use crate::ingest::DryRunReport;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_summary(summary: &RunSummary) {
    println!("{} {}", summary.operation, summary.account_id);
    if summary.operation == "sync" {
        println!("  fetched: {}", summary.fetched);
        println!("  already present: {}", summary.already_present);
    }
    println!("  processed: {}", summary.processed);
    println!("  succeeded: {}", summary.succeeded);
    println!("  failed: {}", summary.failed);
    println!("  skipped: {}", summary.skipped);
    if summary.reset > 0 {
        println!("  reset: {}", summary.reset);
    }
    for failure in summary.failures.iter().take(20) {
        println!(
            "    {} [{}] {}",
            failure.item_id, failure.code, failure.reason
        );
    }
    if summary.failures.len() > 20 {
        println!("    ... and {} more", summary.failures.len() - 20);
    }

    match (&summary.aborted, summary.cancelled) {
        (Some(abort), _) => println!("aborted: {}", abort.message()),
        (None, true) => println!("cancelled"),
        (None, false) => println!("ok"),
    }
}

pub fn print_dry_run(report: &DryRunReport) {
    println!("dry-run {}", report.account_id);
    println!("  active rules: {}", report.active_rules);
    for issue in &report.rule_issues {
        println!("  rule skipped: {} ({})", issue.rule_name, issue.error);
    }
    for id in &report.missing {
        println!("  not found: {}", id);
    }
    println!();

    for item in &report.items {
        match (item.outcome.fields(), item.outcome.failure()) {
            (Some(fields), _) => println!(
                "  ok    {}  {}  {}  {}",
                item.message_id,
                fields.amount,
                fields.date,
                fields.merchant.as_deref().unwrap_or("-")
            ),
            (None, Some(failure)) => println!(
                "  fail  {}  [{}] {}  ({})",
                item.message_id,
                failure.code(),
                failure,
                item.subject
            ),
            (None, None) => {}
        }
    }

    println!();
    println!(
        "  {} would succeed, {} would fail",
        report.succeeded, report.failed
    );
}

fn print_finding(name: &str, finding: &Finding) {
    println!("  {:<22} {}", name, finding.count);
    for sample in &finding.samples {
        println!("      {}  {}", sample.id, sample.detail);
    }
}

pub fn print_audit(report: &AuditReport) {
    println!("audit {}", report.account_id);
    println!("  messages:              {}", report.messages);
    println!("  transactions:          {}", report.transactions);
    print_finding("orphaned:", &report.orphaned);
    print_finding("duplicated:", &report.duplicated);
    print_finding("parse errors:", &report.parse_errors);
    print_finding("broken links:", &report.broken_links);
    print_finding("dead rule references:", &report.dead_rule_references);
    if report.is_clean() {
        println!("clean");
    }
}
