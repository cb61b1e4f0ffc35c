//! The verification core: check units, the session that runs them, the
//! registry that threads verified snapshots between checks, and reporters.

pub mod assertion;
pub mod check;
pub mod registry;
pub mod reporter;
pub mod session;
#[cfg(test)]
mod tests;

pub use assertion::{
    Actual, Assertion, AssertionOutcome, Expectation, Expected, Field, FieldPathError, FieldValue,
    Predicate, Subject, Verdict,
};
pub use check::{CheckOutcome, CheckResult, CheckStatus, CheckUnit};
pub use registry::{RegistryError, RegistryKey, ResultRegistry};
pub use reporter::{JsonReporter, JunitReporter, Reporter, ReporterError, TextReporter};
pub use session::{ConfigurationError, Session, SessionOptions, SessionReport, validate};
