//! Prompt rendering with minijinja.
//!
//! Test cases carry their prompt template inline, so a fresh
//! [`minijinja::Environment`] is built per render. Variables missing from a
//! test case's inputs render as empty strings.

use std::collections::BTreeMap;

use crate::error::SchedulerError;

#[derive(Debug, Default)]
pub struct PromptRenderer {
    _private: (),
}

impl PromptRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_filter("json", json_filter);
        env
    }

    /// Render `template` against the test case's input variables.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Validation`] when the template does not
    /// parse or evaluation fails.
    pub fn render(
        &self,
        template: &str,
        variables: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String, SchedulerError> {
        let env = Self::build_env();
        env.render_str(template, variables)
            .map_err(|e| SchedulerError::Validation(format!("prompt template: {}", e)))
    }

    /// Check the template parses without evaluating it.
    pub fn validate(&self, template: &str) -> Result<(), SchedulerError> {
        let env = Self::build_env();
        env.template_from_str(template)
            .map_err(|e| SchedulerError::Validation(format!("prompt template: {}", e)))?;
        Ok(())
    }
}

/// Filter: serialize a value as compact JSON.
fn json_filter(value: minijinja::Value) -> String {
    serde_json::to_string(&value).unwrap_or_default()
}
