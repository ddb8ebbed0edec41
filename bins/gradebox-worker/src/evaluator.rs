//! Result Evaluator - Comparison Logic
//!
//! **Core Responsibility:**
//! Turn the raw completion of one harness run into a `TestExecutionResult`,
//! and a list of those into an `AggregateRunResult`.
//!
//! **Critical Properties:**
//! - Knows nothing about Docker
//! - Knows nothing about Redis or the submission store
//! - Pure functions: (completion, captured output, test case) → result
//!
//! **Comparison Rules:**
//! - Actual value: last non-empty stdout line decoded as JSON, otherwise the
//!   trimmed stdout as a string
//! - Both sides go through the Value Codec before comparing
//! - Ints and floats compare numerically
//! - Non-zero exit or timeout: never passes, `actual_output` is `None`

use crate::engine::{CapturedOutput, Completion};
use gradebox_common::value::convert;
use gradebox_common::{AggregateRunResult, ProblemConfiguration, TestCase, TestExecutionResult, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decode the value printed by the harness
pub fn decode_output(stdout: &str) -> Value {
    let last_line = stdout.lines().rev().map(str::trim).find(|line| !line.is_empty());

    match last_line {
        Some(line) => match serde_json::from_str::<serde_json::Value>(line) {
            Ok(json) => Value::from(json),
            Err(_) => Value::String(stdout.trim().to_string()),
        },
        None => Value::String(String::new()),
    }
}

/// Message for a process that exited non-zero
pub fn exit_error(code: i64, output: &CapturedOutput) -> String {
    let mut message = format!("Process exited with code {}: {}", code, output.combined());
    match code {
        137 => message.push_str("\n(killed: the process likely exceeded its memory limit)"),
        139 => message.push_str("\n(segmentation fault)"),
        _ => {}
    }
    message
}

/// Evaluate a single harness run against its test case
///
/// Priority:
/// 1. Timeout
/// 2. Non-zero exit
/// 3. Value comparison
pub fn evaluate_test(
    test_case: &TestCase,
    completion: Completion,
    output: &CapturedOutput,
    elapsed: Duration,
    timeout: Duration,
) -> TestExecutionResult {
    let (actual_output, passed, error) = match completion {
        Completion::TimedOut => (
            None,
            false,
            Some(format!("Execution timed out after {}ms", timeout.as_millis())),
        ),
        Completion::Exited(code) if code != 0 => (None, false, Some(exit_error(code, output))),
        Completion::Exited(_) => {
            let actual = decode_output(&output.stdout);
            let passed = convert(actual.clone()) == convert(test_case.expected_output.clone());
            (Some(actual), passed, None)
        }
    };

    TestExecutionResult {
        test_id: test_case.id,
        parameters: test_case.parameters.clone(),
        expected_output: test_case.expected_output.clone(),
        actual_output,
        passed,
        error,
        execution_time: Some(elapsed),
    }
}

/// Aggregate per-test results into the problem verdict
pub fn aggregate(problem_index: usize, results: Vec<TestExecutionResult>) -> AggregateRunResult {
    for result in &results {
        if result.passed {
            debug!(test_id = result.test_id, "Test passed");
        } else if let Some(error) = &result.error {
            warn!(test_id = result.test_id, error = %error, "Test failed with error");
        } else {
            debug!(
                test_id = result.test_id,
                expected = %result.expected_output,
                actual = ?result.actual_output,
                "Output mismatch"
            );
        }
    }

    let aggregate = AggregateRunResult::from_results(problem_index, results);
    info!(
        problem_index,
        passed = aggregate.passed_tests,
        total = aggregate.total_tests,
        all_passed = aggregate.all_passed,
        "Evaluation complete"
    );
    aggregate
}

/// Analysis runs for enabled problems on failure, or always with `analyze_on_success`
pub fn should_analyze(problem: &ProblemConfiguration, all_passed: bool) -> bool {
    problem.analysis_enabled && (!all_passed || problem.analyze_on_success)
}
