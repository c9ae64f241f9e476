//! Startup-command and config-file templating.
//!
//! Two substitutions are applied to a string: `%variable_name%` placeholders
//! resolved against the server's variables, and `%cargo:['<path>']%`
//! references resolved against the cargo manifest.

use crate::error::AppError;
use crate::models::{CargoFile, Variable};

const CARGO_OPEN: &str = "%cargo:['";
const CARGO_CLOSE: &str = "']%";

/// Lowercases and replaces spaces with underscores; the placeholder form of a
/// variable name.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

/// Evaluates a pipe-separated rule string against a value.
///
/// Known tokens: `nullable` (empty value short-circuits to valid), `string`
/// (no constraint), `max:N` (length in characters). Unknown tokens are
/// ignored so panels can introduce rules ahead of the daemon. Evaluation is
/// a conjunction of known rejections: a value fails only when some known
/// token rejects it.
pub fn validate_rules(value: &str, rules: &str) -> bool {
    let tokens: Vec<&str> = rules
        .split('|')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if value.is_empty() && tokens.iter().any(|t| *t == "nullable") {
        return true;
    }

    for token in &tokens {
        if let Some(limit) = token.strip_prefix("max:") {
            if let Ok(limit) = limit.parse::<usize>() {
                if value.chars().count() > limit {
                    return false;
                }
            }
        }
    }
    true
}

/// Substitutes variables and cargo references into `input`.
///
/// Every variable's effective value is validated against its rules up front;
/// a violation aborts before any container work. Placeholders with no
/// matching variable are left intact.
pub fn render(input: &str, variables: &[Variable], cargo: &[CargoFile]) -> Result<String, AppError> {
    for var in variables {
        if !validate_rules(var.effective_value(), &var.rules) {
            return Err(AppError::VariableRuleViolation {
                name: var.name.clone(),
                rules: var.rules.clone(),
            });
        }
    }

    let mut out = input.to_string();
    for var in variables {
        let placeholder = format!("%{}%", normalize_name(&var.name));
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, var.effective_value());
        }
    }

    substitute_cargo(&out, cargo)
}

/// Resolves `%cargo:['<path>']%` references. A known entry substitutes its
/// literal target path; an unknown one fails the render.
fn substitute_cargo(input: &str, cargo: &[CargoFile]) -> Result<String, AppError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find(CARGO_OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + CARGO_OPEN.len()..];
        let Some(end) = after_open.find(CARGO_CLOSE) else {
            // Unterminated reference: not a placeholder, emit verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let path = &after_open[..end];
        let entry = cargo
            .iter()
            .find(|c| c.target_path == path)
            .ok_or_else(|| AppError::UnknownCargo(path.to_string()))?;
        out.push_str(&entry.target_path);
        rest = &after_open[end + CARGO_CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CargoProperties;

    fn var(name: &str, default: &str, current: Option<&str>, rules: &str) -> Variable {
        Variable {
            name: name.to_string(),
            default_value: default.to_string(),
            current_value: current.map(str::to_string),
            rules: rules.to_string(),
        }
    }

    fn cargo_entry(path: &str) -> CargoFile {
        CargoFile {
            url: format!("https://example.com/{path}"),
            target_path: path.to_string(),
            properties: CargoProperties::default(),
        }
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Server Port"), "server_port");
        assert_eq!(normalize_name("MEMORY"), "memory");
    }

    #[test]
    fn test_render_substitutes_every_occurrence() {
        let vars = [var("Server Port", "25565", None, "string")];
        let out = render("-p %server_port% --query %server_port%", &vars, &[]).unwrap();
        assert_eq!(out, "-p 25565 --query 25565");
    }

    #[test]
    fn test_render_prefers_current_value() {
        let vars = [var("Level", "world", Some("lobby"), "string")];
        assert_eq!(render("%level%", &vars, &[]).unwrap(), "lobby");
    }

    #[test]
    fn test_render_leaves_unmatched_placeholders() {
        let vars = [var("Level", "world", None, "string")];
        assert_eq!(
            render("%level% and %unknown%", &vars, &[]).unwrap(),
            "world and %unknown%"
        );
    }

    #[test]
    fn test_render_rejects_rule_violation_before_substitution() {
        let vars = [var("PORT", "999999", None, "string|max:4")];
        let err = render("start %port%", &vars, &[]).unwrap_err();
        match err {
            AppError::VariableRuleViolation { name, rules } => {
                assert_eq!(name, "PORT");
                assert_eq!(rules, "string|max:4");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rule_violation_fires_even_when_placeholder_absent() {
        let vars = [var("PORT", "999999", None, "max:4")];
        assert!(render("no placeholders here", &vars, &[]).is_err());
    }

    #[test]
    fn test_nullable_short_circuits_empty_values() {
        assert!(validate_rules("", "nullable|max:4"));
        // Empty without nullable is not implicitly rejected either: no known
        // token fires.
        assert!(validate_rules("", "string"));
        assert!(validate_rules("", "max:4"));
    }

    #[test]
    fn test_unknown_tokens_never_reject() {
        assert!(validate_rules("value", "string|regex:/^v/|max:100"));
        assert!(validate_rules("value", "totally_unknown"));
        // ...and never flip a rejection back to valid.
        assert!(!validate_rules("toolong", "unknown|max:3"));
    }

    #[test]
    fn test_max_rule_counts_characters() {
        assert!(validate_rules("1234", "max:4"));
        assert!(!validate_rules("12345", "max:4"));
    }

    #[test]
    fn test_cargo_reference_substitutes_target_path() {
        let cargo = [cargo_entry("mods/map.zip")];
        let out = render("unzip %cargo:['mods/map.zip']%", &[], &cargo).unwrap();
        assert_eq!(out, "unzip mods/map.zip");
    }

    #[test]
    fn test_unknown_cargo_reference_fails() {
        let err = render("%cargo:['missing.jar']%", &[], &[]).unwrap_err();
        assert!(matches!(err, AppError::UnknownCargo(ref p) if p == "missing.jar"));
    }

    #[test]
    fn test_unterminated_cargo_reference_left_verbatim() {
        let out = render("echo %cargo:['broken", &[], &[]).unwrap();
        assert_eq!(out, "echo %cargo:['broken");
    }
}
