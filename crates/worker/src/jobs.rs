//! Job bodies and result logging

use crm_billing::{
    BackfillSync, InvariantCheckSummary, InvariantChecker, SyncReport, ViolationSeverity,
};
use tracing::{error, info, warn};

/// Log results of a backfill run
pub fn log_sync_report(report: &SyncReport) {
    info!(
        customers_seen = report.customers.seen,
        subscriptions_seen = report.subscriptions.seen,
        subscriptions_applied = report.subscriptions.applied,
        subscriptions_skipped = report.subscriptions.skipped,
        invoices_seen = report.invoices.seen,
        invoices_applied = report.invoices.applied,
        charges_seen = report.charges.seen,
        charges_applied = report.charges.applied,
        failures = report.failures.len(),
        "Backfill cycle complete"
    );

    // Log individual failures
    for failure in &report.failures {
        error!(
            object = failure.object,
            id = %failure.id,
            error = %failure.error,
            "Backfill failed for object"
        );
    }
}

/// Log results of a consistency check run. Returns true when a critical
/// violation was found.
pub fn log_invariant_summary(summary: &InvariantCheckSummary) -> bool {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants hold");
        return false;
    }

    for violation in &summary.violations {
        let context = serde_json::to_string(&violation.context).unwrap_or_default();
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                subjects = ?violation.subjects,
                context = %context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                subjects = ?violation.subjects,
                context = %context,
                "{}",
                violation.description
            ),
        }
    }

    let critical = summary.has_critical();
    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        critical = critical,
        "Billing invariant check found violations"
    );
    critical
}

pub async fn run_backfill(sync: &BackfillSync) -> SyncReport {
    info!("Running scheduled billing backfill");
    let report = sync.run(None).await;
    log_sync_report(&report);
    report
}

pub async fn run_invariant_checks(checker: &InvariantChecker) {
    info!("Running billing invariant checks");
    match checker.run_all_checks().await {
        Ok(summary) => {
            if log_invariant_summary(&summary) {
                error!("Critical billing invariant violation, manual reconciliation required");
            }
        }
        Err(e) => error!(error = %e, "Failed to run billing invariant checks"),
    }
}
