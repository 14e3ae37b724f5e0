//! Assertion evaluation against model output.

use promptbench_core::{Assertion, AssertionResult};
use regex::RegexBuilder;

/// Evaluates a test case's assertions against one model output.
pub trait AssertionValidator: Send + Sync {
    /// One result per assertion, in the same order.
    fn validate(&self, output: &str, assertions: &[Assertion]) -> Vec<AssertionResult>;
}

/// Evaluates the built-in [`Assertion`] kinds.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinValidator;

impl AssertionValidator for BuiltinValidator {
    fn validate(&self, output: &str, assertions: &[Assertion]) -> Vec<AssertionResult> {
        assertions.iter().map(|a| check(output, a)).collect()
    }
}

fn check(output: &str, assertion: &Assertion) -> AssertionResult {
    let outcome = match assertion {
        Assertion::Contains {
            value,
            case_sensitive,
        } => Ok(contains(output, value, *case_sensitive)),
        Assertion::NotContains {
            value,
            case_sensitive,
        } => Ok(!contains(output, value, *case_sensitive)),
        Assertion::Equals {
            value,
            case_sensitive,
        } => {
            let (a, b) = (output.trim(), value.trim());
            Ok(if *case_sensitive {
                a == b
            } else {
                a.to_lowercase() == b.to_lowercase()
            })
        }
        Assertion::Regex { pattern } => RegexBuilder::new(pattern)
            .size_limit(1 << 20)
            .build()
            .map(|re| re.is_match(output))
            .map_err(|e| format!("invalid regex: {}", e)),
        Assertion::Length { op, value } => Ok(op.compare(output.chars().count(), *value)),
    };

    match outcome {
        Ok(passed) => AssertionResult {
            assertion: assertion.clone(),
            passed,
            error: None,
        },
        Err(error) => AssertionResult {
            assertion: assertion.clone(),
            passed: false,
            error: Some(error),
        },
    }
}

fn contains(haystack: &str, needle: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        haystack.contains(needle)
    } else {
        haystack.to_lowercase().contains(&needle.to_lowercase())
    }
}
