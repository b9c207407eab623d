//! Variable interpolation and secret redaction.

use crate::secrets::REDACTED;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("valid interpolation pattern")
});

/// Context for variable interpolation.
///
/// Only non-secret variables are ever placed here; credentials reach a
/// stage exclusively through its process environment.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    pub variables: BTreeMap<String, String>,
}

impl InterpolationContext {
    pub fn new(variables: BTreeMap<String, String>) -> Self {
        Self { variables }
    }

    /// Interpolate variables in a string.
    ///
    /// Supports:
    /// - `${{ VAR }}` - direct variable lookup
    /// - `${{ env.VAR }}` - same lookup; the process environment is never
    ///   consulted, so credential variables cannot leak into command text
    ///
    /// Unknown names expand to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .into_owned()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self.variables.get(var_name).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }
}

/// Replaces known secret values with a fixed placeholder.
#[derive(Clone, Default)]
pub struct Redactor {
    // longest first, so a secret containing another is masked whole
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut redactor = Self::default();
        for secret in secrets {
            redactor.add(secret);
        }
        redactor
    }

    /// Register a secret. Output is redacted line by line, so a multi-line
    /// secret is registered as each of its non-blank lines.
    pub fn add(&mut self, secret: impl Into<String>) {
        let secret = secret.into();
        for fragment in secret.split(['\n', '\r']).map(str::trim) {
            if fragment.is_empty() || self.secrets.iter().any(|s| s == fragment) {
                continue;
            }
            self.secrets.push(fragment.to_string());
        }
        self.secrets.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        for secret in &self.secrets {
            if output.contains(secret.as_str()) {
                output = output.replace(secret.as_str(), REDACTED);
            }
        }
        output
    }
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> InterpolationContext {
        InterpolationContext::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_interpolate_simple_variable() {
        let ctx = ctx(&[("IMAGE", "registry.local/app")]);
        assert_eq!(
            ctx.interpolate("docker build -t ${{ IMAGE }} ."),
            "docker build -t registry.local/app ."
        );
    }

    #[test]
    fn test_interpolate_env_prefix() {
        let ctx = ctx(&[("TAG", "1.4.0")]);
        assert_eq!(ctx.interpolate("tag=${{ env.TAG }}"), "tag=1.4.0");
    }

    #[test]
    fn test_interpolate_whitespace_variations() {
        let ctx = ctx(&[("VAR", "value")]);
        assert_eq!(ctx.interpolate("${{VAR}}"), "value");
        assert_eq!(ctx.interpolate("${{   VAR   }}"), "value");
    }

    #[test]
    fn test_interpolate_missing_variable_returns_empty() {
        let ctx = InterpolationContext::default();
        assert_eq!(ctx.interpolate("a${{ MISSING_KEEL_VAR }}b"), "ab");
    }

    #[test]
    fn test_plain_shell_variables_untouched() {
        let ctx = ctx(&[("IMAGE", "x")]);
        assert_eq!(ctx.interpolate("echo $IMAGE ${IMAGE}"), "echo $IMAGE ${IMAGE}");
    }

    #[test]
    fn test_redact_masks_every_occurrence() {
        let redactor = Redactor::new(["hunter2"]);
        assert_eq!(
            redactor.redact("pass=hunter2 again hunter2"),
            "pass=**** again ****"
        );
    }

    #[test]
    fn test_redact_prefers_longest_secret() {
        let redactor = Redactor::new(["abc", "user:abc"]);
        assert_eq!(redactor.redact("login user:abc"), "login ****");
    }

    #[test]
    fn test_redactor_ignores_empty_values() {
        let redactor = Redactor::new([""]);
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("unchanged"), "unchanged");
    }

    #[test]
    fn test_env_lookup_ignores_process_environment() {
        let ctx = InterpolationContext::default();
        // PATH is set in any test environment
        assert_eq!(ctx.interpolate("p=${{ env.PATH }}"), "p=");
    }

    #[test]
    fn test_redact_secret_with_trailing_newline() {
        let redactor = Redactor::new(["tok-SECRET-123\n"]);
        assert_eq!(redactor.redact("token is tok-SECRET-123"), "token is ****");
    }

    #[test]
    fn test_redact_multiline_secret_per_line() {
        let redactor = Redactor::new(["-----BEGIN KEY-----\r\nAAAASECRETBODY\n-----END KEY-----"]);
        assert_eq!(redactor.redact("AAAASECRETBODY"), "****");
        assert_eq!(redactor.redact("-----BEGIN KEY-----"), "****");
        assert_eq!(redactor.redact("  -----END KEY-----"), "  ****");
    }

    #[test]
    fn test_redactor_debug_hides_values() {
        let redactor = Redactor::new(["topsecret"]);
        assert!(!format!("{:?}", redactor).contains("topsecret"));
    }
}
