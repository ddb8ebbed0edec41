//! Problem Catalog
//!
//! Turns the raw deployment configuration into [`ProblemConfiguration`]s.
//! Pure transform: nothing here touches the container engine.
//!
//! ```json
//! {
//!   "problems": [{
//!     "function_name": "add",
//!     "description": "Return the sum of a and b",
//!     "parameter_names": ["a", "b"],
//!     "test_cases": [{ "parameters": ["2", "3"], "expected": "5" }],
//!     "analysis": { "analyze_good_submissions": true, "model": "gpt-4o-mini" }
//!   }]
//! }
//! ```

use crate::error::{GradingError, Result};
use crate::types::{AnalysisModelParams, ProblemConfiguration, TestCase};
use crate::value::{convert, Value};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::debug;

const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_TOP_P: f32 = 1.0;

#[derive(Debug, Deserialize)]
struct RawDeployment {
    #[serde(default)]
    problems: Vec<RawProblem>,
}

#[derive(Debug, Deserialize)]
struct RawProblem {
    #[serde(default)]
    function_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameter_names: Vec<String>,
    #[serde(default)]
    test_cases: Vec<RawTestCase>,
    #[serde(default)]
    analysis: Option<RawAnalysis>,
}

#[derive(Debug, Deserialize)]
struct RawTestCase {
    #[serde(default)]
    parameters: Vec<serde_json::Value>,
    expected: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    analyze_good_submissions: bool,
    #[serde(default)]
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

/// Parse a deployment configuration into its problems
pub fn parse(raw: &serde_json::Value) -> Result<Vec<ProblemConfiguration>> {
    let deployment: RawDeployment = serde_json::from_value(raw.clone())
        .map_err(|e| GradingError::config(format!("malformed deployment configuration: {}", e)))?;

    if deployment.problems.is_empty() {
        return Err(GradingError::config("no problems configured"));
    }

    deployment
        .problems
        .into_iter()
        .enumerate()
        .map(|(index, block)| parse_problem(index, block))
        .collect()
}

/// Load and parse a deployment configuration file
pub fn load(path: &Path) -> Result<Vec<ProblemConfiguration>> {
    let content = fs::read_to_string(path).map_err(|e| {
        GradingError::config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let raw: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        GradingError::config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    parse(&raw)
}

fn parse_problem(index: usize, block: RawProblem) -> Result<ProblemConfiguration> {
    if !is_identifier(&block.function_name) {
        return Err(GradingError::config(format!(
            "problem {}: function_name '{}' is not a valid identifier",
            index, block.function_name
        )));
    }
    if block.test_cases.is_empty() {
        return Err(GradingError::config(format!("problem {}: no test cases", index)));
    }

    let mut test_cases = Vec::with_capacity(block.test_cases.len());
    for (position, raw) in block.test_cases.into_iter().enumerate() {
        let id = (position + 1) as u32;
        if !block.parameter_names.is_empty() && raw.parameters.len() != block.parameter_names.len() {
            return Err(GradingError::config(format!(
                "problem {} test {}: expected {} parameters, got {}",
                index,
                id,
                block.parameter_names.len(),
                raw.parameters.len()
            )));
        }
        test_cases.push(TestCase {
            id,
            parameters: raw.parameters.into_iter().map(|p| convert(Value::from(p))).collect(),
            expected_output: convert(Value::from(raw.expected)),
        });
    }

    let (analyze_on_success, analysis_model_params) = match block.analysis {
        Some(analysis) => {
            let model = analysis
                .model
                .filter(|m| !m.trim().is_empty())
                .ok_or_else(|| {
                    GradingError::config(format!("problem {}: analysis block has no model", index))
                })?;
            let params = AnalysisModelParams {
                model,
                max_tokens: analysis.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                temperature: analysis.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                top_p: analysis.top_p.unwrap_or(DEFAULT_TOP_P),
            };
            (analysis.analyze_good_submissions, Some(params))
        }
        None => (false, None),
    };

    debug!(
        problem_index = index,
        function = %block.function_name,
        test_cases = test_cases.len(),
        analysis = analysis_model_params.is_some(),
        "Parsed problem"
    );

    Ok(ProblemConfiguration {
        problem_index: index,
        function_name: block.function_name,
        description: block.description,
        parameter_names: block.parameter_names,
        test_cases,
        analysis_enabled: analysis_model_params.is_some(),
        analyze_on_success,
        analysis_model_params,
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn add_block() -> serde_json::Value {
        json!({
            "function_name": "add",
            "description": "Return a + b",
            "parameter_names": ["a", "b"],
            "test_cases": [
                { "parameters": ["2", "3"], "expected": "5" },
                { "parameters": [[1, 2], "[3]"], "expected": "[1, 2, 3]" }
            ]
        })
    }

    #[test]
    fn test_parse_problem_converts_values() {
        let problems = parse(&json!({ "problems": [add_block()] })).unwrap();
        assert_eq!(problems.len(), 1);

        let problem = &problems[0];
        assert_eq!(problem.problem_index, 0);
        assert_eq!(problem.function_name, "add");
        assert!(!problem.analysis_enabled);
        assert!(problem.analysis_model_params.is_none());

        let first = &problem.test_cases[0];
        assert_eq!(first.id, 1);
        assert_eq!(first.parameters, vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(first.expected_output, Value::Int(5));

        let second = &problem.test_cases[1];
        assert_eq!(second.id, 2);
        assert_eq!(second.parameters[1], Value::List(vec![Value::Int(3)]));
        assert_eq!(
            second.expected_output,
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_parse_analysis_block() {
        let mut block = add_block();
        block["analysis"] = json!({
            "analyze_good_submissions": true,
            "model": "gpt-4o-mini",
            "temperature": 0.5
        });

        let problems = parse(&json!({ "problems": [add_block(), block] })).unwrap();
        let problem = &problems[1];
        assert_eq!(problem.problem_index, 1);
        assert!(problem.analysis_enabled);
        assert!(problem.analyze_on_success);

        let params = problem.analysis_model_params.as_ref().unwrap();
        assert_eq!(params.model, "gpt-4o-mini");
        assert_eq!(params.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(params.temperature, 0.5);
        assert_eq!(params.top_p, DEFAULT_TOP_P);
    }

    #[test]
    fn test_empty_problem_list_is_config_error() {
        let err = parse(&json!({ "problems": [] })).unwrap_err();
        assert!(matches!(err, GradingError::Config(_)));

        let err = parse(&json!({})).unwrap_err();
        assert!(matches!(err, GradingError::Config(_)));
    }

    #[test]
    fn test_analysis_without_model_is_config_error() {
        let mut block = add_block();
        block["analysis"] = json!({ "analyze_good_submissions": false });
        let err = parse(&json!({ "problems": [block] })).unwrap_err();
        assert!(err.to_string().contains("no model"));

        let mut block = add_block();
        block["analysis"] = json!({ "model": "  " });
        assert!(parse(&json!({ "problems": [block] })).is_err());
    }

    #[test]
    fn test_rejects_bad_function_names() {
        for name in ["", "1add", "add; import os", "a-b"] {
            let mut block = add_block();
            block["function_name"] = json!(name);
            assert!(parse(&json!({ "problems": [block] })).is_err(), "accepted {:?}", name);
        }
    }

    #[test]
    fn test_rejects_parameter_count_mismatch() {
        let mut block = add_block();
        block["test_cases"] = json!([{ "parameters": ["1"], "expected": "1" }]);
        let err = parse(&json!({ "problems": [block] })).unwrap_err();
        assert!(err.to_string().contains("expected 2 parameters"));
    }

    #[test]
    fn test_rejects_problem_without_tests() {
        let mut block = add_block();
        block["test_cases"] = json!([]);
        assert!(parse(&json!({ "problems": [block] })).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json!({ "problems": [add_block()] })).unwrap();

        let problems = load(file.path()).unwrap();
        assert_eq!(problems[0].test_cases.len(), 2);

        let err = load(Path::new("/nonexistent/deployment.json")).unwrap_err();
        assert!(matches!(err, GradingError::Config(_)));
    }
}
