//! Prompts for script generation, repair and failure analysis.

use crate::classifier::FailureDescriptor;
use crate::report::{REPORT_BEGIN, REPORT_END};
use crate::runner::sandbox::RUN_DIR_ENV;

use super::{InitialContext, RepairContext};

/// Characters of previous code included in an analysis prompt.
const ANALYSIS_CODE_CHARS: usize = 4000;

/// Characters of stderr included in an analysis prompt.
const ANALYSIS_STDERR_CHARS: usize = 3000;

/// System prompt for generating and repairing pipeline scripts.
pub const ADAPTER_SYSTEM_PROMPT: &str = r#"You are a senior machine learning engineer who writes complete, runnable Python 3 scripts.

Rules:
- Output exactly one Python script inside a single ```python fenced block. No other code blocks.
- The script must run unattended: no input(), no plotting windows, no network calls except to the given data source.
- Use pandas, numpy, scikit-learn, sqlalchemy and joblib. Other libraries only when the algorithm guidance names them.
- Handle missing values and encode categorical columns before fitting.
- Convert feature column names to strings (X.columns = X.columns.astype(str)) before passing them to scikit-learn.
- All metric values must be plain floats (no numpy types, no NaN).
- On an unrecoverable error, let the exception propagate so the traceback reaches stderr."#;

/// System prompt for the failure analyst.
pub const ANALYST_SYSTEM_PROMPT: &str = r#"You are a debugging expert for Python machine learning pipelines.
You read a failed script and its error output and answer with a single JSON object, nothing else."#;

/// The output contract every generated script must follow.
pub fn output_contract() -> String {
    format!(
        r#"Output contract (mandatory):
1. Save the trained model (if any) with joblib into the directory given by the environment variable {run_dir} (os.environ["{run_dir}"], default "."), and put that path in "model_path".
2. As the very last thing, print the result exactly like this, on separate lines:
{begin}
{{"model_type": "...", "metrics": {{"name": 0.0}}, "features": ["col", ...], "target": "col or null", "shap_importance": {{"col": 0.0}} or null, "visualization_data": [{{...}}] or null, "model_path": "path or null"}}
{end}
3. "model_type", "metrics" and "features" are required. Print the report block only once, using json.dumps with default=str."#,
        run_dir = RUN_DIR_ENV,
        begin = REPORT_BEGIN,
        end = REPORT_END,
    )
}

fn push_context(prompt: &mut String, context: &InitialContext) {
    prompt.push_str(&format!(
        "## Algorithm\n{} ({})\n{}\n",
        context.algorithm.display_name(),
        context.algorithm.as_str(),
        context.algorithm.guidance()
    ));
    if context.algorithm.is_supervised() {
        prompt.push_str("Pick the most plausible target column from the schema and report it as \"target\".\n");
    } else {
        prompt.push_str("This algorithm has no target column; report \"target\": null.\n");
    }

    if let Some(objective) = context.objective.as_deref().filter(|o| !o.trim().is_empty()) {
        prompt.push_str(&format!("\n## User objective\n{}\n", objective.trim()));
    }

    prompt.push_str(&format!("\n## Database schema\n{}", context.schema.describe()));

    if let Some(source) = context.schema.data_source.as_deref() {
        prompt.push_str(&format!(
            "\n## Data source\nConnect with sqlalchemy.create_engine(\"{}\") and read with pandas.read_sql_query.\n",
            source
        ));
    }

    if let Some(eda) = context.eda_summary.as_deref().filter(|e| !e.trim().is_empty()) {
        prompt.push_str(&format!("\n## Exploratory analysis\n{}\n", eda.trim()));
    }
}

/// Builds the prompt for the first attempt of a run.
pub fn build_initial_prompt(context: &InitialContext) -> String {
    let mut prompt = String::from("Write a complete machine learning pipeline script for this dataset.\n\n");
    push_context(&mut prompt, context);
    prompt.push('\n');
    prompt.push_str(&output_contract());
    prompt.push_str("\n\nReturn the full script.");
    prompt
}

/// Builds the prompt asking for a repaired script.
pub fn build_repair_prompt(context: &RepairContext) -> String {
    let mut prompt = String::from(
        "The following pipeline script failed. Fix it and return the complete corrected script.\n\n",
    );

    prompt.push_str(&format!("## Failure\n{}\n", context.failure.render()));
    if let Some(summary) = context.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\n## Diagnosis\n{}\n", summary.trim()));
    }

    prompt.push_str(&format!(
        "\n## Previous script\n```python\n{}\n```\n\n",
        context.previous_code.trim_end()
    ));

    push_context(&mut prompt, &context.initial);
    prompt.push('\n');
    prompt.push_str(&output_contract());
    prompt.push_str("\n\nKeep what already works. Return the full script, not a diff.");
    prompt
}

/// Builds the prompt asking the analyst to explain a failure.
pub fn build_analysis_prompt(
    code: &str,
    failure: &FailureDescriptor,
    stderr: &str,
    objective: Option<&str>,
) -> String {
    let code = head_chars(code, ANALYSIS_CODE_CHARS);
    let stderr = tail_chars(stderr, ANALYSIS_STDERR_CHARS);
    let objective = objective
        .filter(|o| !o.trim().is_empty())
        .map(|o| format!("User objective: {}\n\n", o.trim()))
        .unwrap_or_default();

    format!(
        r#"{objective}A generated ML pipeline failed.

Failure:
{failure}

Error output (stderr, tail):
{stderr}

Script:
```python
{code}
```

Classify the fix:
- "QUICK_FIX": the only problem is a missing import (e.g. name 'np' is not defined).
- "FULL_REPAIR": anything else.

Answer with JSON only:
{{"summary": "at most two sentences for an end user", "fix_type": "QUICK_FIX" or "FULL_REPAIR", "quick_fix_details": {{"action": "add_import", "library": "numpy", "alias": "np"}} or null}}"#,
        objective = objective,
        failure = failure.render(),
        stderr = if stderr.trim().is_empty() { "(empty)" } else { stderr },
        code = code,
    )
}

fn head_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
