//! Field Value Validator
//!
//! Every scalar written into a character record passes through a chain of
//! rules. Each rule sees the output of the previous one, so markup is gone
//! before numeric coercion and length capping run.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref MARKUP: Regex = Regex::new(r"<[^>]*>").expect("markup pattern is valid");
    static ref NUMBER: Regex = Regex::new(r"^-?\d+(\.\d+)?$").expect("number pattern is valid");
    static ref FIELD_NAME: Regex = Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("field pattern is valid");
}

/// Fields that only hold numbers; anything else is stored as `"0"`.
pub const NUMERIC_FIELDS: &[&str] = &[
    "level",
    "points",
    "points_earned",
    "total_points",
    "class_level",
    "age",
    "hp",
    "max_hp",
    "gold",
    "rank",
];

/// Fields rendered as names/headings, capped at [`NAME_LIMIT`] characters.
pub const NAME_FIELDS: &[&str] = &[
    "character_name",
    "name",
    "class_name",
    "npc_name",
    "title",
    "role",
];

pub const NAME_LIMIT: usize = 100;
pub const TEXT_LIMIT: usize = 10_000;

/// One link in the validation chain.
pub trait ValidationRule: Send + Sync {
    fn apply(&self, field: &str, value: String) -> String;
}

/// Removes anything that looks like an HTML tag.
#[derive(Debug, Clone, Default)]
pub struct StripMarkupRule;

impl ValidationRule for StripMarkupRule {
    fn apply(&self, _field: &str, value: String) -> String {
        MARKUP.replace_all(&value, "").trim().to_string()
    }
}

/// Coerces numeric fields that are not a plain number to `"0"`.
#[derive(Debug, Clone, Default)]
pub struct NumericRule;

impl ValidationRule for NumericRule {
    fn apply(&self, field: &str, value: String) -> String {
        if !NUMERIC_FIELDS.contains(&field) || NUMBER.is_match(&value) {
            value
        } else {
            "0".to_string()
        }
    }
}

/// Caps name fields at [`NAME_LIMIT`] chars and other text at [`TEXT_LIMIT`].
#[derive(Debug, Clone, Default)]
pub struct LengthRule;

impl ValidationRule for LengthRule {
    fn apply(&self, field: &str, value: String) -> String {
        let limit = if NAME_FIELDS.contains(&field) {
            NAME_LIMIT
        } else {
            TEXT_LIMIT
        };
        if value.chars().count() <= limit {
            value
        } else {
            value.chars().take(limit).collect()
        }
    }
}

pub struct FieldValidator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Default for FieldValidator {
    fn default() -> Self {
        Self::new()
            .with_rule(StripMarkupRule)
            .with_rule(NumericRule)
            .with_rule(LengthRule)
    }
}

impl FieldValidator {
    /// An empty chain; values pass through unchanged apart from string rendering.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn clean(&self, field: &str, value: &Value) -> String {
        self.rules
            .iter()
            .fold(render(value), |acc, rule| rule.apply(field, acc))
    }
}

/// Field names are lowercase identifiers; anything else is rejected outright.
pub fn is_valid_field_name(field: &str) -> bool {
    FIELD_NAME.is_match(field)
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_markup_before_numeric_check() {
        let validator = FieldValidator::default();
        assert_eq!(validator.clean("level", &json!("<b>7</b>")), "7");
        assert_eq!(validator.clean("notes", &json!("<script>x</script> hi ")), "x hi");
    }

    #[test]
    fn numeric_fields_coerce_garbage_to_zero() {
        let validator = FieldValidator::default();
        assert_eq!(validator.clean("points", &json!("twelve")), "0");
        assert_eq!(validator.clean("points", &json!("")), "0");
        assert_eq!(validator.clean("points", &json!("-3")), "-3");
        assert_eq!(validator.clean("gold", &json!(12.5)), "12.5");
        assert_eq!(validator.clean("notes", &json!("twelve")), "twelve");
    }

    #[test]
    fn name_fields_are_capped_by_chars() {
        let validator = FieldValidator::default();
        let long = "é".repeat(150);
        let cleaned = validator.clean("character_name", &json!(long));
        assert_eq!(cleaned.chars().count(), NAME_LIMIT);

        let notes = validator.clean("notes", &json!("a".repeat(150)));
        assert_eq!(notes.len(), 150);
    }

    #[test]
    fn field_names_must_be_identifiers() {
        assert!(is_valid_field_name("character_name"));
        assert!(!is_valid_field_name("../etc"));
        assert!(!is_valid_field_name(""));
        assert!(!is_valid_field_name("Name"));
    }
}
