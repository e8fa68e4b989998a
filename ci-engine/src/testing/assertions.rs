//! Test assertions for stage reports.

use crate::core::StepStatus;
use crate::executor::StageReport;

/// Asserts that a step finished with the expected status.
pub fn assert_step_status(report: &StageReport, step_id: &str, expected: StepStatus) {
    let record = report
        .step(step_id)
        .unwrap_or_else(|| panic!("No record for step '{step_id}'. Steps: {:?}", report.step_ids()));
    assert_eq!(
        record.status, expected,
        "Expected step '{}' to be {}, got {}",
        step_id, expected, record.status
    );
}

/// Asserts that every listed step was cleaned up.
pub fn assert_cleaned_up(report: &StageReport, step_ids: &[&str]) {
    for step_id in step_ids {
        let cleaned = report.step(step_id).is_some_and(|record| record.cleaned_up);
        assert!(cleaned, "Expected step '{step_id}' to be cleaned up");
    }
}

/// Asserts that the stage failed and the root cause is attributed to a step.
pub fn assert_stage_failed_at(report: &StageReport, step_id: &str) {
    let error = report
        .error
        .as_ref()
        .unwrap_or_else(|| panic!("Expected stage to fail at '{step_id}', but it succeeded"));
    assert_eq!(
        error.root_cause().step_id(),
        Some(step_id),
        "Expected failure at '{}', got: {}",
        step_id,
        error
    );
}
