use miette::Diagnostic;
use thiserror::Error;

use crate::session::SessionReport;

pub mod json;
pub mod junit;
pub mod text;

pub use json::JsonReporter;
pub use junit::JunitReporter;
pub use text::TextReporter;

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ReporterError {
    #[error("reporter error: {0}")]
    #[diagnostic(code(reporter::error))]
    Other(String),
}

impl ReporterError {
    pub fn new(message: impl Into<String>) -> Self {
        ReporterError::Other(message.into())
    }
}

pub trait Reporter {
    type Artifact;

    fn emit(&self, report: &SessionReport) -> Result<Self::Artifact, ReporterError>;
}
