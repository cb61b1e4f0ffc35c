use std::fmt::Write as _;

use super::{Reporter, ReporterError};
use crate::{
    check::{CheckOutcome, CheckResult, CheckStatus},
    session::SessionReport,
};

/// Console summary: one line per check, failing assertions indented below.
///
/// Mismatches are labelled `FAIL`; checks that could not inspect the cluster
/// are labelled `ERROR`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextReporter {
    /// Also list passing assertions.
    pub verbose: bool,
}

impl Reporter for TextReporter {
    type Artifact = String;

    fn emit(&self, report: &SessionReport) -> Result<Self::Artifact, ReporterError> {
        Ok(render_text(report, self.verbose))
    }
}

pub fn render_text(report: &SessionReport, verbose: bool) -> String {
    let mut out = String::new();
    for result in &report.results {
        render_result(&mut out, result, verbose);
    }
    let _ = writeln!(
        out,
        "\n{} passed, {} failed, {} errors",
        report.count(CheckStatus::Passed),
        report.count(CheckStatus::Failed),
        report.count(CheckStatus::Error),
    );
    out
}

fn render_result(out: &mut String, result: &CheckResult, verbose: bool) {
    let label = match result.status() {
        CheckStatus::Passed => "PASS ",
        CheckStatus::Failed => "FAIL ",
        CheckStatus::Error => "ERROR",
    };
    let _ = writeln!(out, "{label} {} ({})", result.name, result.resource);

    match &result.outcome {
        CheckOutcome::Evaluated { assertions } => {
            for outcome in assertions {
                if !outcome.passed {
                    let _ = writeln!(out, "      - {outcome}");
                } else if verbose {
                    let _ = writeln!(out, "      + {}", outcome.description);
                }
            }
        }
        CheckOutcome::FetchFailed { message, .. } => {
            let _ = writeln!(out, "      {message}");
        }
        CheckOutcome::DependencyUnmet { key } => {
            let _ = writeln!(out, "      dependency `{key}` was never published");
        }
    }
}
