use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Test case identifier.
pub type TestCaseId = String;

/// Prompt card identifier.
pub type PromptCardId = String;

/// One input-variable binding plus the assertions expected of the model
/// output, tied to a prompt card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub id: TestCaseId,
    pub name: String,
    pub prompt_card_id: PromptCardId,
    /// Values substituted into the prompt template's `{{ var }}` placeholders.
    #[serde(default)]
    pub input_variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    pub prompt_template: String,
}

/// A predicate evaluated against model output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assertion {
    /// Output contains `value`.
    Contains {
        value: String,
        #[serde(default = "default_case_sensitive")]
        case_sensitive: bool,
    },
    /// Output does not contain `value`.
    NotContains {
        value: String,
        #[serde(default = "default_case_sensitive")]
        case_sensitive: bool,
    },
    /// Output equals `value` after trimming surrounding whitespace.
    Equals {
        value: String,
        #[serde(default = "default_case_sensitive")]
        case_sensitive: bool,
    },
    /// Output matches the regular expression `pattern`.
    Regex { pattern: String },
    /// Output length in characters compared against `value`.
    Length { op: LengthOp, value: usize },
}

fn default_case_sensitive() -> bool {
    true
}

impl Assertion {
    pub fn contains(value: impl Into<String>) -> Self {
        Assertion::Contains {
            value: value.into(),
            case_sensitive: true,
        }
    }

    pub fn equals(value: impl Into<String>) -> Self {
        Assertion::Equals {
            value: value.into(),
            case_sensitive: true,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Assertion::Regex {
            pattern: pattern.into(),
        }
    }

    pub fn length(op: LengthOp, value: usize) -> Self {
        Assertion::Length { op, value }
    }

    /// Short machine-readable kind, used in logs and result metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Assertion::Contains { .. } => "contains",
            Assertion::NotContains { .. } => "not_contains",
            Assertion::Equals { .. } => "equals",
            Assertion::Regex { .. } => "regex",
            Assertion::Length { .. } => "length",
        }
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assertion::Contains { value, .. } => write!(f, "contains {:?}", value),
            Assertion::NotContains { value, .. } => write!(f, "not contains {:?}", value),
            Assertion::Equals { value, .. } => write!(f, "equals {:?}", value),
            Assertion::Regex { pattern } => write!(f, "matches /{}/", pattern),
            Assertion::Length { op, value } => write!(f, "length {} {}", op, value),
        }
    }
}

/// Comparison operator for [`Assertion::Length`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthOp {
    Lt,
    Lte,
    Eq,
    Gte,
    Gt,
}

impl LengthOp {
    pub fn compare(self, actual: usize, expected: usize) -> bool {
        match self {
            LengthOp::Lt => actual < expected,
            LengthOp::Lte => actual <= expected,
            LengthOp::Eq => actual == expected,
            LengthOp::Gte => actual >= expected,
            LengthOp::Gt => actual > expected,
        }
    }
}

impl fmt::Display for LengthOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LengthOp::Lt => "<",
            LengthOp::Lte => "<=",
            LengthOp::Eq => "==",
            LengthOp::Gte => ">=",
            LengthOp::Gt => ">",
        };
        f.write_str(s)
    }
}

/// Outcome of one assertion against one model output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionResult {
    pub assertion: Assertion,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
