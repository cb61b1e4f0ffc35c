use std::fmt::Write as _;

use super::{Reporter, ReporterError};
use crate::{
    check::{CheckOutcome, CheckStatus},
    session::SessionReport,
};

/// JUnit XML, one `<testcase>` per check. Mismatches become `<failure>`,
/// fetch errors become `<error>`.
#[derive(Clone, Debug)]
pub struct JunitReporter {
    pub suite_name: String,
}

impl Default for JunitReporter {
    fn default() -> Self {
        Self {
            suite_name: "kverify".to_string(),
        }
    }
}

impl Reporter for JunitReporter {
    type Artifact = String;

    fn emit(&self, report: &SessionReport) -> Result<Self::Artifact, ReporterError> {
        Ok(render_junit(report, &self.suite_name))
    }
}

pub fn render_junit(report: &SessionReport, suite_name: &str) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        out,
        "<testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\">",
        escape(suite_name),
        report.results.len(),
        report.count(CheckStatus::Failed),
        report.count(CheckStatus::Error),
    );

    for result in &report.results {
        let _ = write!(
            out,
            "  <testcase name=\"{}\" classname=\"{}\"",
            escape(&result.name),
            escape(&result.resource.to_string()),
        );
        match (&result.outcome, result.status()) {
            (_, CheckStatus::Passed) => out.push_str("/>\n"),
            (CheckOutcome::Evaluated { .. }, _) => {
                out.push_str(">\n");
                let failures: Vec<String> =
                    result.failed_assertions().map(|a| a.to_string()).collect();
                let _ = writeln!(
                    out,
                    "    <failure message=\"{} assertion(s) failed\">{}</failure>",
                    failures.len(),
                    escape(&failures.join("\n")),
                );
                out.push_str("  </testcase>\n");
            }
            (CheckOutcome::FetchFailed { message, .. }, status) => {
                let tag = if status == CheckStatus::Error {
                    "error"
                } else {
                    "failure"
                };
                let _ = writeln!(
                    out,
                    ">\n    <{tag} message=\"{}\"/>\n  </testcase>",
                    escape(message)
                );
            }
            (CheckOutcome::DependencyUnmet { key }, _) => {
                let _ = writeln!(
                    out,
                    ">\n    <failure message=\"dependency `{}` was never published\"/>\n  </testcase>",
                    escape(key.as_str())
                );
            }
        }
    }
    out.push_str("</testsuite>\n");
    out
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
