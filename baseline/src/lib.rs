//! Declarative baselines: a JSON5 document listing the checks to run.
//!
//! ```json5
//! {
//!   checks: [
//!     {
//!       name: "frontend deployment creation",
//!       resource: { kind: "Deployment", name: "videos-web", namespace: "frontend" },
//!       publish: "videos-web-deployment",
//!       expect: [
//!         { field: "status.availableReplicas", equals: 1 },
//!         { field: "containers[0].imagePullPolicy", oneOf: ["Always", "IfNotPresent"] },
//!       ],
//!     },
//!   ],
//! }
//! ```

#![allow(unused_assignments)]


use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use kverify_engine::{
    Assertion, CheckUnit, ConfigurationError, Expectation, Field, FieldValue, RegistryKey,
};
use kverify_resources::ResourceRef;
use miette::{Diagnostic, NamedSource, SourceSpan};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum BaselineError {
    #[error("failed to read baseline `{}`", path.display())]
    #[diagnostic(code(baseline::io_error))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json5 parse error: {label}")]
    #[diagnostic(code(baseline::syntax))]
    Syntax {
        label: String,
        #[source_code]
        src: NamedSource<Arc<str>>,
        #[label("{label}")]
        span: SourceSpan,
    },

    #[error("invalid baseline at {path}: {label}")]
    #[diagnostic(code(baseline::schema))]
    Schema {
        path: String,
        label: String,
        #[source_code]
        src: NamedSource<Arc<str>>,
        #[label("{label}")]
        span: SourceSpan,
    },

    #[error("check `{check}` uses an invalid field path `{path}`: {reason}")]
    #[diagnostic(
        code(baseline::invalid_field_path),
        help(
            "supported paths: spec.replicas, status.replicas, status.availableReplicas, \
             status.readyReplicas, status.updatedReplicas, containers[i].image, \
             containers[i].imagePullPolicy, containers[i].ports, ports[i].port, \
             ports[i].targetPort, ports[i].name, selector[\"k\"], podLabels[\"k\"], \
             labels[\"k\"], data[\"k\"]"
        )
    )]
    FieldPath {
        check: String,
        path: String,
        reason: &'static str,
        #[source_code]
        src: NamedSource<Arc<str>>,
        #[label("{reason}")]
        span: SourceSpan,
    },

    #[error("expectation #{index} of check `{check}` {problem}")]
    #[diagnostic(
        code(baseline::invalid_expectation),
        help(
            "an expectation is either `{{ field, equals | atLeast | oneOf, message? }}` or \
             `{{ selectorMatches: <key>, message? }}`"
        )
    )]
    Expectation {
        check: String,
        index: usize,
        problem: &'static str,
        #[source_code]
        src: NamedSource<Arc<str>>,
        #[label("in this check")]
        span: SourceSpan,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// A parsed and validated baseline.
#[derive(Clone, Debug)]
pub struct Baseline {
    checks: Vec<CheckUnit>,
}

impl Baseline {
    pub fn load(path: &Path) -> Result<Self, BaselineError> {
        let source = fs::read_to_string(path).map_err(|source| BaselineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path.display().to_string(), source)
    }

    pub fn parse(name: impl AsRef<str>, source: impl Into<Arc<str>>) -> Result<Self, BaselineError> {
        let source: Arc<str> = source.into();
        let named = || NamedSource::new(name.as_ref(), Arc::clone(&source)).with_language("json5");

        let mut deserializer = json5::Deserializer::from_str(&source);
        let raw: RawBaseline =
            serde_path_to_error::deserialize(&mut deserializer).map_err(|err| {
                let inner = err.inner();
                let span = span_for_json5_error(&source, inner);
                let label = summarize(inner);
                if is_syntax_error(&source, inner, span) {
                    BaselineError::Syntax {
                        label,
                        src: named(),
                        span,
                    }
                } else {
                    BaselineError::Schema {
                        path: err.path().to_string(),
                        label,
                        src: named(),
                        span,
                    }
                }
            })?;

        let mut checks = Vec::with_capacity(raw.checks.len());
        for raw_check in raw.checks {
            let check_span = check_name_span(&source, &raw_check.name);
            let mut assertions = Vec::with_capacity(raw_check.expect.len());
            for (index, expect) in raw_check.expect.into_iter().enumerate() {
                let assertion = expect.into_assertion().map_err(|err| match err {
                    ExpectError::Problem(problem) => BaselineError::Expectation {
                        check: raw_check.name.clone(),
                        index,
                        problem,
                        src: named(),
                        span: check_span,
                    },
                    ExpectError::Path { path, reason } => BaselineError::FieldPath {
                        check: raw_check.name.clone(),
                        span: span_of(&source, &path),
                        path,
                        reason,
                        src: named(),
                    },
                })?;
                assertions.push(assertion);
            }
            checks.push(
                CheckUnit::builder()
                    .name(raw_check.name)
                    .resource(raw_check.resource)
                    .assertions(assertions)
                    .maybe_publish(raw_check.publish)
                    .build(),
            );
        }

        kverify_engine::validate(&checks)?;
        debug!(baseline = name.as_ref(), checks = checks.len(), "parsed baseline");
        Ok(Self { checks })
    }

    pub fn checks(&self) -> &[CheckUnit] {
        &self.checks
    }

    pub fn into_checks(self) -> Vec<CheckUnit> {
        self.checks
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBaseline {
    checks: Vec<RawCheck>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCheck {
    name: String,
    resource: ResourceRef,
    #[serde(default)]
    publish: Option<RegistryKey>,
    #[serde(default)]
    expect: Vec<RawExpect>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawExpect {
    field: Option<String>,
    equals: Option<RawValue>,
    at_least: Option<i64>,
    one_of: Option<Vec<RawValue>>,
    selector_matches: Option<RegistryKey>,
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Int(i64),
    Str(String),
}

impl From<RawValue> for FieldValue {
    fn from(value: RawValue) -> Self {
        match value {
            RawValue::Int(value) => FieldValue::Int(value),
            RawValue::Str(value) => FieldValue::Str(value),
        }
    }
}

enum ExpectError {
    Problem(&'static str),
    Path { path: String, reason: &'static str },
}

impl RawExpect {
    fn into_assertion(self) -> Result<Assertion, ExpectError> {
        let RawExpect {
            field,
            equals,
            at_least,
            one_of,
            selector_matches,
            message,
        } = self;

        let assertion = match (field, selector_matches) {
            (None, Some(source)) => {
                if equals.is_some() || at_least.is_some() || one_of.is_some() {
                    return Err(ExpectError::Problem(
                        "combines `selectorMatches` with a value expectation",
                    ));
                }
                Assertion::selector_matches(source)
            }
            (Some(_), Some(_)) => {
                return Err(ExpectError::Problem(
                    "combines `selectorMatches` with `field`",
                ));
            }
            (None, None) => {
                return Err(ExpectError::Problem(
                    "needs either `field` or `selectorMatches`",
                ));
            }
            (Some(path), None) => {
                let field: Field = path.parse().map_err(|err: kverify_engine::FieldPathError| {
                    ExpectError::Path {
                        path: path.clone(),
                        reason: err.reason,
                    }
                })?;
                let expect = match (equals, at_least, one_of) {
                    (Some(value), None, None) => Expectation::Equals(value.into()),
                    (None, Some(min), None) => Expectation::AtLeast(min),
                    (None, None, Some(options)) if options.is_empty() => {
                        return Err(ExpectError::Problem("has an empty `oneOf` list"));
                    }
                    (None, None, Some(options)) => {
                        Expectation::OneOf(options.into_iter().map(Into::into).collect())
                    }
                    (None, None, None) => {
                        return Err(ExpectError::Problem(
                            "needs one of `equals`, `atLeast` or `oneOf`",
                        ));
                    }
                    _ => {
                        return Err(ExpectError::Problem(
                            "declares more than one of `equals`, `atLeast` and `oneOf`",
                        ));
                    }
                };
                Assertion::field(field, expect)
            }
        };

        Ok(match message {
            Some(message) => assertion.with_description(message),
            None => assertion,
        })
    }
}

/// Lexical errors, plus "expected a value" errors that land on a closing
/// delimiter. The latter share codes with type mismatches (`checks: 5`), so
/// the character under the error decides.
fn is_syntax_error(source: &str, err: &json5::Error, span: SourceSpan) -> bool {
    let Some(code) = err.code() else {
        return false;
    };
    if json5_error_is_parse(code) {
        return true;
    }
    expects_value(code)
        && source
            .get(span.offset()..)
            .is_some_and(|rest| rest.starts_with(['}', ']']))
}

fn expects_value(code: json5::ErrorCode) -> bool {
    use json5::ErrorCode::*;

    matches!(
        code,
        ExpectedOpeningBrace
            | ExpectedOpeningBracket
            | ExpectedBool
            | ExpectedString
            | ExpectedNumber
            | ExpectedNull
    )
}

fn json5_error_is_parse(code: json5::ErrorCode) -> bool {
    use json5::ErrorCode::*;

    matches!(
        code,
        EofParsingArray
            | EofParsingBool
            | EofParsingComment
            | EofParsingEscapeSequence
            | EofParsingIdentifier
            | EofParsingNull
            | EofParsingNumber
            | EofParsingObject
            | EofParsingString
            | EofParsingValue
            | ExpectedClosingBrace
            | ExpectedClosingBracket
            | ExpectedColon
            | ExpectedComma
            | ExpectedComment
            | ExpectedIdentifier
            | ExpectedValue
            | InvalidBytes
            | InvalidEscapeSequence
            | InvalidKey
            | LeadingZero
            | LineTerminatorInString
            | OverflowParsingNumber
            | TrailingCharacters
    )
}

/// The error message without the ` at line N column M` suffix json5 appends.
fn summarize(err: &json5::Error) -> String {
    let message = err.to_string();
    match message.rfind(" at line ") {
        Some(idx) => message[..idx].to_string(),
        None => message,
    }
}

fn span_for_json5_error(source: &str, err: &json5::Error) -> SourceSpan {
    let Some(position) = err.position() else {
        return (source.len(), 0).into();
    };
    let Some(line) = source.split_inclusive('\n').nth(position.line) else {
        return (source.len(), 0).into();
    };
    let line_start = line.as_ptr() as usize - source.as_ptr() as usize;
    let column = line
        .char_indices()
        .nth(position.column)
        .map_or(line.trim_end_matches('\n').len(), |(idx, _)| idx);
    (line_start + column, 1).into()
}

/// Span of the quoted value of a check-level `name` key equal to `name`.
/// Check objects sit at brace depth 2 (root, then check); `resource` blocks
/// sit deeper, so their `name` keys never match.
fn check_name_span(source: &str, name: &str) -> SourceSpan {
    let tokens = tokenize(source);
    for window in tokens.windows(3) {
        let [key, colon, value] = window else {
            continue;
        };
        if key.depth == 2
            && key.is_key(source, "name")
            && colon.kind == TokenKind::Colon
            && value.kind == TokenKind::Str
            && value.inner(source) == name
        {
            return (value.start, value.end - value.start).into();
        }
    }
    span_of(source, name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenKind {
    Str,
    Ident,
    Colon,
}

#[derive(Clone, Copy, Debug)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
    depth: usize,
}

impl Token {
    fn inner<'s>(&self, source: &'s str) -> &'s str {
        match self.kind {
            TokenKind::Str => &source[self.start + 1..self.end - 1],
            _ => &source[self.start..self.end],
        }
    }

    fn is_key(&self, source: &str, key: &str) -> bool {
        matches!(self.kind, TokenKind::Str | TokenKind::Ident) && self.inner(source) == key
    }
}

/// Just enough of a JSON5 lexer to track object depth: strings, identifiers,
/// colons and comments. Anything it cannot make sense of is skipped.
fn tokenize(source: &str) -> Vec<Token> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            b':' => tokens.push(Token {
                kind: TokenKind::Colon,
                start: i,
                end: i + 1,
                depth,
            }),
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = source[i + 2..].find("*/").map_or(bytes.len(), |end| i + 2 + end + 2);
                continue;
            }
            quote @ (b'"' | b'\'') => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i >= bytes.len() {
                    break;
                }
                i += 1;
                tokens.push(Token {
                    kind: TokenKind::Str,
                    start,
                    end: i,
                    depth,
                });
                continue;
            }
            b if b.is_ascii_alphabetic() || b == b'_' || b == b'$' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'$'))
                {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident,
                    start,
                    end: i,
                    depth,
                });
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    tokens
}

/// Span of the first quoted occurrence of `needle`, or the start of the file.
fn span_of(source: &str, needle: &str) -> SourceSpan {
    for quote in ['"', '\''] {
        let quoted = format!("{quote}{needle}{quote}");
        if let Some(offset) = source.find(&quoted) {
            return (offset, quoted.len()).into();
        }
    }
    match source.find(needle) {
        Some(offset) if !needle.is_empty() => (offset, needle.len()).into(),
        _ => (0, 0).into(),
    }
}
