//! Extraction of the structured report a generated script prints.
//!
//! Scripts must print exactly one JSON object between the sentinel markers:
//!
//! ```text
//! <<<AUTOML_REPORT_BEGIN>>>
//! {"model_type": "random_forest", "metrics": {"r2": 0.91}, "features": ["a", "b"], "target": "y"}
//! <<<AUTOML_REPORT_END>>>
//! ```
//!
//! Extraction is a pure function of the captured stdout. When several blocks
//! are present the last one wins; earlier ones are treated as incidental
//! prints and a warning is logged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Marker printed on the line before the report JSON.
pub const REPORT_BEGIN: &str = "<<<AUTOML_REPORT_BEGIN>>>";

/// Marker printed on the line after the report JSON.
pub const REPORT_END: &str = "<<<AUTOML_REPORT_END>>>";

/// Errors that can occur while extracting a report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("no report block found in output")]
    NotFound,

    #[error("report block is not terminated")]
    Unterminated,

    #[error("malformed report: {0}")]
    Malformed(String),
}

/// The structured result a successful script emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Algorithm tag, e.g. `random_forest`.
    pub model_type: String,
    /// Metric name to value (MSE, R2, accuracy, silhouette, ...).
    pub metrics: BTreeMap<String, f64>,
    /// Feature columns used, in order.
    pub features: Vec<String>,
    /// Label column; absent for unsupervised algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Row records for client-side plotting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization_data: Option<Vec<Value>>,
    /// Path of a persisted model artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    /// Feature to importance score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shap_importance: Option<BTreeMap<String, f64>>,
}

impl ExecutionReport {
    fn check(&self) -> Result<(), ReportError> {
        if self.model_type.trim().is_empty() {
            return Err(ReportError::Malformed("model_type is empty".to_string()));
        }
        if let Some((name, _)) = self.metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ReportError::Malformed(format!(
                "metric '{}' is not a finite number",
                name
            )));
        }
        Ok(())
    }
}

/// Extracts the report from captured stdout.
///
/// The last sentinel block is authoritative. If it is malformed the result
/// is an error even when an earlier block would parse.
pub fn extract_report(stdout: &str) -> Result<ExecutionReport, ReportError> {
    let Some(begin) = stdout.rfind(REPORT_BEGIN) else {
        return Err(ReportError::NotFound);
    };

    let blocks = stdout.matches(REPORT_BEGIN).count();
    if blocks > 1 {
        tracing::warn!(
            blocks = blocks,
            "Multiple report blocks in output, using the last one"
        );
    }

    let body_start = begin + REPORT_BEGIN.len();
    let body = &stdout[body_start..];
    let Some(end) = body.find(REPORT_END) else {
        return Err(ReportError::Unterminated);
    };

    let json = body[..end].trim();
    if json.is_empty() {
        return Err(ReportError::Malformed("empty report block".to_string()));
    }

    let report: ExecutionReport =
        serde_json::from_str(json).map_err(|e| ReportError::Malformed(e.to_string()))?;
    report.check()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(json: &str) -> String {
        format!("{}\n{}\n{}\n", REPORT_BEGIN, json, REPORT_END)
    }

    const VALID: &str = r#"{"model_type": "random_forest", "metrics": {"r2": 0.91, "mse": 1.5}, "features": ["age", "income"], "target": "churn"}"#;

    #[test]
    fn test_extracts_single_block_with_surrounding_noise() {
        let stdout = format!("Loading data...\nTraining\n{}done\n", block(VALID));
        let report = extract_report(&stdout).expect("valid report");
        assert_eq!(report.model_type, "random_forest");
        assert_eq!(report.features, vec!["age", "income"]);
        assert_eq!(report.target.as_deref(), Some("churn"));
        assert!((report.metrics["r2"] - 0.91).abs() < f64::EPSILON);
        assert!(report.visualization_data.is_none());
    }

    #[test]
    fn test_no_block() {
        assert_eq!(extract_report("all good, trust me"), Err(ReportError::NotFound));
        assert_eq!(extract_report(""), Err(ReportError::NotFound));
    }

    #[test]
    fn test_unterminated_block() {
        let stdout = format!("{}\n{}", REPORT_BEGIN, VALID);
        assert_eq!(extract_report(&stdout), Err(ReportError::Unterminated));
    }

    #[test]
    fn test_malformed_json() {
        let stdout = block("{\"model_type\": \"x\", \"metrics\": ");
        assert!(matches!(extract_report(&stdout), Err(ReportError::Malformed(_))));
    }

    #[test]
    fn test_missing_required_key() {
        let stdout = block(r#"{"model_type": "kmeans", "metrics": {}}"#);
        assert!(matches!(extract_report(&stdout), Err(ReportError::Malformed(_))));
    }

    #[test]
    fn test_non_numeric_metric_rejected() {
        let stdout = block(r#"{"model_type": "x", "metrics": {"acc": "high"}, "features": []}"#);
        assert!(matches!(extract_report(&stdout), Err(ReportError::Malformed(_))));
    }

    #[test]
    fn test_unsupervised_without_target() {
        let stdout = block(
            r#"{"model_type": "clustering_kmeans", "metrics": {"silhouette": 0.42}, "features": ["x", "y"], "visualization_data": [{"x": 1, "y": 2, "cluster": 0}]}"#,
        );
        let report = extract_report(&stdout).expect("valid report");
        assert!(report.target.is_none());
        assert_eq!(report.visualization_data.map(|v| v.len()), Some(1));
    }

    #[test]
    fn test_last_block_wins() {
        let first = r#"{"model_type": "first", "metrics": {}, "features": []}"#;
        let last = r#"{"model_type": "last", "metrics": {}, "features": []}"#;
        let stdout = format!("{}noise\n{}", block(first), block(last));
        assert_eq!(extract_report(&stdout).expect("valid").model_type, "last");
    }

    #[test]
    fn test_malformed_last_block_does_not_fall_back() {
        let first = r#"{"model_type": "first", "metrics": {}, "features": []}"#;
        let stdout = format!("{}{}", block(first), block("not json"));
        assert!(matches!(extract_report(&stdout), Err(ReportError::Malformed(_))));
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let stdouts = [
            format!("x\n{}", block(VALID)),
            format!("{}{}", block(VALID), block(VALID)),
            "nothing".to_string(),
            block("garbage"),
        ];
        for stdout in &stdouts {
            assert_eq!(extract_report(stdout), extract_report(stdout));
        }
    }
}
