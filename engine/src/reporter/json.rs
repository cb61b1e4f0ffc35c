use serde::Serialize;

use super::{Reporter, ReporterError};
use crate::{
    check::{CheckResult, CheckStatus},
    session::SessionReport,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    type Artifact = String;

    fn emit(&self, report: &SessionReport) -> Result<Self::Artifact, ReporterError> {
        render_json(report)
    }
}

#[derive(Serialize)]
struct Document<'a> {
    passed: bool,
    summary: Summary,
    checks: Vec<Entry<'a>>,
}

#[derive(Serialize)]
struct Summary {
    passed: usize,
    failed: usize,
    errors: usize,
}

#[derive(Serialize)]
struct Entry<'a> {
    status: CheckStatus,
    #[serde(flatten)]
    result: &'a CheckResult,
}

pub fn render_json(report: &SessionReport) -> Result<String, ReporterError> {
    let document = Document {
        passed: report.passed(),
        summary: Summary {
            passed: report.count(CheckStatus::Passed),
            failed: report.count(CheckStatus::Failed),
            errors: report.count(CheckStatus::Error),
        },
        checks: report
            .results
            .iter()
            .map(|result| Entry {
                status: result.status(),
                result,
            })
            .collect(),
    };
    let mut out = serde_json::to_string_pretty(&document)
        .map_err(|e| ReporterError::new(format!("failed to render report: {e}")))?;
    out.push('\n');
    Ok(out)
}
