//! Backend fault classification.
//!
//! A linear, ordered pattern list turns raw backend faults into structured
//! [`ErrorResponse`] values the LLM can act on. Patterns are seeded at
//! construction and only ever appended; the first case-insensitive regex
//! match wins, with an optional error-class pre-filter. Tracebacks never
//! leave the server except inside `original_error`, which stays out of the
//! MCP payload.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::rpc::RpcFault;

/// Category of a classified error, driving retry semantics and log severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Access,
    NotFound,
    Constraint,
    State,
    Wizard,
    Connection,
    RateLimit,
    Configuration,
    Unknown,
}

impl ErrorCategory {
    /// Whether the caller may retry after addressing the suggestion.
    pub fn retryable(self) -> bool {
        !matches!(
            self,
            ErrorCategory::Access | ErrorCategory::Configuration | ErrorCategory::Unknown
        )
    }

    /// Default retry delay for categories that carry one.
    pub fn default_retry_after(self) -> Option<u64> {
        match self {
            ErrorCategory::Connection => Some(5),
            ErrorCategory::RateLimit => Some(60),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Access => "access",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Constraint => "constraint",
            ErrorCategory::State => "state",
            ErrorCategory::Wizard => "wizard",
            ErrorCategory::Connection => "connection",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Structured error returned to the MCP client inside an `isError` tool
/// result. `original_error` holds the raw fault (including traceback) for
/// server-side logs only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: bool,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub suggestion: String,
    pub retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip)]
    pub original_error: Option<String>,
}

impl ErrorResponse {
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            error: true,
            category,
            code: code.into(),
            message: message.into(),
            suggestion: suggestion.into(),
            retry: category.retryable(),
            retry_after: category.default_retry_after(),
            details: None,
            original_error: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn with_original(mut self, original: impl Into<String>) -> Self {
        self.original_error = Some(original.into());
        self
    }

    /// The wire shape sent to the client (no traceback).
    pub fn to_client_json(&self) -> Value {
        let mut value = json!({
            "error": true,
            "category": self.category.as_str(),
            "code": self.code,
            "message": self.message,
            "suggestion": self.suggestion,
            "retry": self.retry,
        });
        if let Some(obj) = value.as_object_mut() {
            if let Some(after) = self.retry_after {
                obj.insert("retry_after".to_string(), json!(after));
            }
            if let Some(details) = &self.details {
                obj.insert("details".to_string(), details.clone());
            }
        }
        value
    }
}

/// One classification rule.
struct Pattern {
    id: &'static str,
    regex: Regex,
    /// Substring filter against the fault's error class. When set, the
    /// pattern applies only to faults carrying a matching class.
    error_class: Option<&'static str>,
    category: ErrorCategory,
    code: &'static str,
    message_template: &'static str,
    suggestion_template: &'static str,
}

pub struct ErrorClassifier {
    patterns: Vec<Pattern>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            patterns: default_patterns(),
        }
    }

    /// Classify a fault. Never fails: unmatched faults land in `unknown`.
    pub fn classify(&self, fault: &RpcFault) -> ErrorResponse {
        let haystack = &fault.message;

        for pattern in &self.patterns {
            // Class-scoped patterns only apply when the fault's class matches;
            // their regexes are often catch-alls and must not swallow
            // classless faults.
            if let Some(wanted) = pattern.error_class {
                match &fault.error_class {
                    Some(actual) if actual.contains(wanted) => {}
                    _ => continue,
                }
            }
            let Some(captures) = pattern.regex.captures(haystack) else {
                continue;
            };

            let mut details = serde_json::Map::new();
            for name in pattern.regex.capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    details.insert(name.to_string(), json!(m.as_str()));
                }
            }
            if let Some(model) = &fault.model {
                details.entry("model".to_string()).or_insert(json!(model));
            }

            let message = render(pattern.message_template, &captures, fault);
            let suggestion = render(pattern.suggestion_template, &captures, fault);
            let mut response = ErrorResponse::new(pattern.category, pattern.code, message, suggestion)
                .with_original(fault.to_string());
            if !details.is_empty() {
                response = response.with_details(Value::Object(details));
            }
            tracing::debug!(pattern = pattern.id, category = response.category.as_str(), "fault classified");
            return response;
        }

        ErrorResponse::new(
            ErrorCategory::Unknown,
            "UNKNOWN_ERROR",
            fault.message.clone(),
            "Inspect the message; if it references a model or field, verify it with fields_get before retrying.",
        )
        .with_original(fault.to_string())
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill `{placeholders}` from named capture groups plus the call context.
fn render(template: &str, captures: &regex::Captures<'_>, fault: &RpcFault) -> String {
    let mut out = template.to_string();
    for name in ["field", "value", "column", "table", "constraint_name"] {
        if let Some(m) = captures.name(name) {
            out = out.replace(&format!("{{{name}}}"), m.as_str());
        }
    }
    out = out.replace("{model}", fault.model.as_deref().unwrap_or("the model"));
    out = out.replace("{method}", fault.method.as_deref().unwrap_or("the method"));
    out = out.replace("{message}", &fault.message);
    out
}

fn pattern(
    id: &'static str,
    regex: &str,
    error_class: Option<&'static str>,
    category: ErrorCategory,
    code: &'static str,
    message_template: &'static str,
    suggestion_template: &'static str,
) -> Pattern {
    Pattern {
        id,
        regex: Regex::new(&format!("(?i){regex}"))
            .unwrap_or_else(|e| panic!("invalid classifier regex '{id}': {e}")),
        error_class,
        category,
        code,
        message_template,
        suggestion_template,
    }
}

fn default_patterns() -> Vec<Pattern> {
    vec![
        pattern(
            "missing-required-field",
            r"(?:following fields are (?:invalid|required)|required fields?)\D*\((?P<field>[a-z0-9_.]+)\)",
            None,
            ErrorCategory::Validation,
            "MISSING_REQUIRED_FIELD",
            "Required field '{field}' is missing on {model}",
            "Call fields_get on {model} to see required fields, then retry create with '{field}' set.",
        ),
        pattern(
            "not-null-column",
            r#"null value in column "(?P<field>[a-z0-9_]+)""#,
            None,
            ErrorCategory::Validation,
            "MISSING_REQUIRED_FIELD",
            "Required field '{field}' is missing on {model}",
            "Call fields_get on {model} to see required fields, then retry create with '{field}' set.",
        ),
        pattern(
            "invalid-field",
            r"(?:invalid field|unknown field|field does not exist)\D*['\x22]?(?P<field>[a-z0-9_.]+)",
            None,
            ErrorCategory::Validation,
            "INVALID_FIELD",
            "Field '{field}' does not exist on {model}",
            "Call fields_get on {model} to list valid field names.",
        ),
        pattern(
            "validation-generic",
            r".*",
            Some("ValidationError"),
            ErrorCategory::Validation,
            "VALIDATION_FAILED",
            "{message}",
            "Fix the reported value and retry; fields_get on {model} shows expected types and selections.",
        ),
        pattern(
            "access-denied",
            r"(?:access denied|not allowed to|access rights|permission|forbidden|You are not allowed)",
            None,
            ErrorCategory::Access,
            "ACCESS_DENIED",
            "The backend user may not {method} on {model}",
            "This is a backend permission, not a server setting; use a different model or ask an administrator for rights.",
        ),
        pattern(
            "record-not-found",
            r"(?:does not exist or has been deleted|record does not exist|missing record|no record found)",
            None,
            ErrorCategory::NotFound,
            "RECORD_NOT_FOUND",
            "One or more records on {model} no longer exist",
            "Use search_read on {model} to find current record ids before retrying.",
        ),
        pattern(
            "duplicate-key",
            r"(?:duplicate key|already exists|must be unique)",
            None,
            ErrorCategory::Constraint,
            "DUPLICATE_VALUE",
            "A unique constraint on {model} rejected the value",
            "Search for the existing record with search_read and update it instead of creating a duplicate.",
        ),
        pattern(
            "foreign-key",
            r"(?:foreign key|violates.*constraint|constraint failed|is still referenced)",
            None,
            ErrorCategory::Constraint,
            "CONSTRAINT_VIOLATION",
            "A database constraint rejected the operation on {model}",
            "Check related records first; referenced records cannot be removed while links exist.",
        ),
        pattern(
            "concurrent-update",
            r"could not serialize access",
            None,
            ErrorCategory::Constraint,
            "CONCURRENT_UPDATE",
            "Another transaction touched the same records",
            "Retry the operation; the conflict is transient.",
        ),
        pattern(
            "invalid-state",
            r"(?:cannot\s.*(?:posted|confirmed|locked|done|cancelled|validated)|not in a state|state.*(?:not allowed|invalid))",
            None,
            ErrorCategory::State,
            "INVALID_STATE",
            "The operation is not valid in the record's current state",
            "Read the record's state field, then drive the workflow with execute (e.g. action_confirm, button_draft) before retrying.",
        ),
        pattern(
            "user-error",
            r".*",
            Some("UserError"),
            ErrorCategory::State,
            "BUSINESS_RULE",
            "{message}",
            "The backend enforces a workflow rule here; read the record and follow the suggested action in the message.",
        ),
        pattern(
            "wizard-required",
            r"wizard",
            None,
            ErrorCategory::Wizard,
            "WIZARD_REQUIRED",
            "The operation requires a wizard on {model}",
            "Run the corresponding wizard tool, or drive it manually with default_get, create and execute.",
        ),
        pattern(
            "connection-refused",
            r"(?:connection refused|connection reset|temporarily unavailable|bad gateway|service unavailable|gateway timeout)",
            None,
            ErrorCategory::Connection,
            "BACKEND_UNAVAILABLE",
            "The backend did not accept the connection",
            "Wait and retry; the server reconnects automatically.",
        ),
        pattern(
            "too-many-requests",
            r"(?:too many requests|rate limit)",
            None,
            ErrorCategory::RateLimit,
            "BACKEND_RATE_LIMITED",
            "The backend is throttling requests",
            "Reduce call frequency and retry after the indicated delay.",
        ),
        pattern(
            "bad-database",
            r"(?:database\s+\S+\s+does not exist|invalid database)",
            None,
            ErrorCategory::Configuration,
            "INVALID_DATABASE",
            "The configured database does not exist on the backend",
            "Fix the database name in the server configuration and restart.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(message: &str) -> RpcFault {
        RpcFault::new(message)
    }

    #[test]
    fn missing_field_scenario() {
        let mut f = fault("The following fields are required: Customer (partner_id)");
        f.error_class = Some("odoo.exceptions.ValidationError".to_string());
        f.model = Some("sale.order".to_string());
        let response = ErrorClassifier::new().classify(&f);
        assert_eq!(response.category, ErrorCategory::Validation);
        assert_eq!(response.code, "MISSING_REQUIRED_FIELD");
        assert!(response.retry);
        assert!(response.suggestion.contains("fields_get"));
        assert_eq!(
            response.details.as_ref().and_then(|d| d.get("field")),
            Some(&json!("partner_id"))
        );
    }

    #[test]
    fn error_class_prefilter_skips_mismatched_patterns() {
        // An AccessError whose message also says "required" must not land in
        // the ValidationError catch-all.
        let mut f = fault("Access denied: admin rights required");
        f.error_class = Some("odoo.exceptions.AccessError".to_string());
        let response = ErrorClassifier::new().classify(&f);
        assert_eq!(response.category, ErrorCategory::Access);
        assert!(!response.retry);
    }

    #[test]
    fn unmatched_fault_is_unknown_no_retry() {
        let response = ErrorClassifier::new().classify(&fault("zorp blorp"));
        assert_eq!(response.category, ErrorCategory::Unknown);
        assert_eq!(response.code, "UNKNOWN_ERROR");
        assert!(!response.retry);
    }

    #[test]
    fn state_error_is_retryable() {
        let response =
            ErrorClassifier::new().classify(&fault("You cannot delete a posted journal entry"));
        assert_eq!(response.category, ErrorCategory::State);
        assert!(response.retry);
    }

    #[test]
    fn connection_carries_retry_after() {
        let response = ErrorClassifier::new().classify(&fault("502 bad gateway"));
        assert_eq!(response.category, ErrorCategory::Connection);
        assert_eq!(response.retry_after, Some(5));
    }

    #[test]
    fn traceback_stays_out_of_client_json() {
        let mut f = fault("boom");
        f.traceback = Some("Traceback...\nValueError: boom".to_string());
        let response = ErrorClassifier::new().classify(&f);
        let wire = response.to_client_json();
        assert!(wire.get("original_error").is_none());
        assert!(response.original_error.is_some());
    }

    #[test]
    fn category_retry_matrix() {
        use ErrorCategory::*;
        for (category, retry) in [
            (Validation, true),
            (NotFound, true),
            (Constraint, true),
            (State, true),
            (Wizard, true),
            (Connection, true),
            (RateLimit, true),
            (Access, false),
            (Configuration, false),
            (Unknown, false),
        ] {
            assert_eq!(category.retryable(), retry, "{:?}", category);
        }
    }
}
