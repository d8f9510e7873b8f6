//! Search-domain validation.
//!
//! Domains are Polish-prefix filter expressions: condition triplets plus the
//! operators `&`, `|`, `!`, with Odoo's implicit-AND convention for bare
//! condition sequences. Validation happens before dispatch so malformed
//! filters never reach the backend, and rejections explain what to fix.

use serde_json::{Value, json};

use crate::classifier::{ErrorCategory, ErrorResponse};

/// Comparison operators a condition triplet may use.
const COMPARISON_OPERATORS: &[&str] = &[
    "=",
    "!=",
    ">",
    ">=",
    "<",
    "<=",
    "=?",
    "like",
    "not like",
    "ilike",
    "not ilike",
    "=like",
    "=ilike",
    "in",
    "not in",
    "child_of",
    "parent_of",
];

/// Validate a domain expression. `Ok` means the backend will at least parse
/// it; field existence is the registry's concern, not this one's.
pub fn validate_domain(domain: &Value) -> Result<(), Box<ErrorResponse>> {
    let Some(elements) = domain.as_array() else {
        return Err(invalid(
            "A domain must be a list",
            json!({"expected": "list of conditions and prefix operators"}),
        ));
    };
    if elements.is_empty() {
        return Ok(());
    }

    // Prefix arity check with implicit AND between complete expressions.
    let mut needed: i64 = 1;
    for (index, element) in elements.iter().enumerate() {
        if index > 0 && needed == 0 {
            needed = 1;
        }
        match element {
            Value::String(op) if op == "&" || op == "|" => needed += 1,
            Value::String(op) if op == "!" => {}
            Value::String(op) => {
                return Err(invalid(
                    format!("Unknown prefix operator '{}'", op),
                    json!({"index": index, "allowed": ["&", "|", "!"]}),
                ));
            }
            Value::Array(triplet) => {
                validate_condition(index, triplet)?;
                needed -= 1;
            }
            other => {
                return Err(invalid(
                    "Domain elements must be condition triplets or prefix operators",
                    json!({"index": index, "got": other}),
                ));
            }
        }
    }

    if needed != 0 {
        return Err(invalid(
            "The prefix expression is incomplete: an operator is missing operands",
            json!({"missing_operands": needed}),
        ));
    }
    Ok(())
}

fn validate_condition(index: usize, triplet: &[Value]) -> Result<(), Box<ErrorResponse>> {
    if triplet.len() != 3 {
        return Err(invalid(
            format!(
                "Condition at index {} has {} elements; exactly [field, operator, value] required",
                index,
                triplet.len()
            ),
            json!({"index": index}),
        ));
    }

    let Some(field) = triplet[0].as_str().filter(|f| !f.is_empty()) else {
        return Err(invalid(
            format!("Condition at index {} has a non-string field name", index),
            json!({"index": index}),
        ));
    };

    let Some(operator) = triplet[1].as_str() else {
        return Err(invalid(
            format!("Condition at index {} has a non-string operator", index),
            json!({"index": index, "field": field}),
        ));
    };
    if !COMPARISON_OPERATORS.contains(&operator) {
        return Err(invalid(
            format!("Operator '{}' is not valid in a domain condition", operator),
            json!({"index": index, "field": field, "allowed": COMPARISON_OPERATORS}),
        ));
    }

    if matches!(operator, "in" | "not in") && !triplet[2].is_array() {
        return Err(invalid(
            format!(
                "Operator '{}' on '{}' requires a list value",
                operator, field
            ),
            json!({"index": index, "field": field, "operator": operator}),
        ));
    }
    Ok(())
}

fn invalid(message: impl Into<String>, details: Value) -> Box<ErrorResponse> {
    Box::new(
        ErrorResponse::new(
            ErrorCategory::Validation,
            "INVALID_DOMAIN",
            message,
            "Domains are prefix expressions like [[\"name\", \"ilike\", \"acme\"]] or [\"|\", [\"a\", \"=\", 1], [\"b\", \"=\", 2]].",
        )
        .with_details(details),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_domain_matches_all() {
        assert!(validate_domain(&json!([])).is_ok());
    }

    #[test]
    fn simple_condition() {
        assert!(validate_domain(&json!([["name", "ilike", "acme"]])).is_ok());
    }

    #[test]
    fn implicit_and_of_conditions() {
        assert!(validate_domain(&json!([
            ["name", "ilike", "acme"],
            ["customer_rank", ">", 0]
        ]))
        .is_ok());
    }

    #[test]
    fn explicit_prefix_operators() {
        assert!(validate_domain(&json!([
            "|",
            ["name", "ilike", "acme"],
            "!",
            ["active", "=", false]
        ]))
        .is_ok());
    }

    #[test]
    fn dangling_operator_rejected() {
        let err = validate_domain(&json!(["&", ["a", "=", 1]])).unwrap_err();
        assert_eq!(err.code, "INVALID_DOMAIN");
        assert!(err.retry);
    }

    #[test]
    fn unknown_comparison_operator_rejected() {
        assert!(validate_domain(&json!([["name", "contains", "x"]])).is_err());
    }

    #[test]
    fn in_requires_list() {
        assert!(validate_domain(&json!([["id", "in", 5]])).is_err());
        assert!(validate_domain(&json!([["id", "in", [5, 6]]])).is_ok());
    }

    #[test]
    fn wrong_arity_rejected() {
        assert!(validate_domain(&json!([["name", "="]])).is_err());
        assert!(validate_domain(&json!([["name", "=", "x", "y"]])).is_err());
    }

    #[test]
    fn non_list_domain_rejected() {
        assert!(validate_domain(&json!({"name": "acme"})).is_err());
    }
}
