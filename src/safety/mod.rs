//! Write-policy enforcement.
//!
//! The gate is a pure decision function over `(mode, operation, model,
//! fields, method)`. Default blocklists protect configuration, automation,
//! security and credential surfaces and are always unioned with whatever the
//! operator configures. Tool visibility is a separate concern handled at
//! registration time; the gate is the runtime backstop.

mod audit;
mod rate_limit;

pub use audit::{AuditConfig, AuditEntry, AuditWriter};
pub use rate_limit::{RateLimitConfig, RateLimiter};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::classifier::{ErrorCategory, ErrorResponse};

/// Enforcement mode for the whole server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyMode {
    /// Read operations only.
    #[default]
    Readonly,
    /// Reads everywhere; writes only on the explicit write allowlist;
    /// deletion never.
    Restricted,
    /// Everything, subject to the blocklists.
    Full,
}

impl std::fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyMode::Readonly => write!(f, "readonly"),
            SafetyMode::Restricted => write!(f, "restricted"),
            SafetyMode::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for SafetyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "readonly" | "read-only" | "read_only" => Ok(SafetyMode::Readonly),
            "restricted" => Ok(SafetyMode::Restricted),
            "full" => Ok(SafetyMode::Full),
            _ => Err(format!("unknown safety mode: {}", s)),
        }
    }
}

/// The operation classes the gate distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Search,
    Count,
    FieldsGet,
    NameGet,
    DefaultGet,
    Create,
    Write,
    Unlink,
    Execute,
}

impl Operation {
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Operation::Read
                | Operation::Search
                | Operation::Count
                | Operation::FieldsGet
                | Operation::NameGet
                | Operation::DefaultGet
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Search => "search",
            Operation::Count => "count",
            Operation::FieldsGet => "fields_get",
            Operation::NameGet => "name_get",
            Operation::DefaultGet => "default_get",
            Operation::Create => "create",
            Operation::Write => "write",
            Operation::Unlink => "unlink",
            Operation::Execute => "execute",
        }
    }
}

/// Models whose records are readable but write-protected by default:
/// configuration, automation, security rules, mail and payment plumbing,
/// and user accounts.
const DEFAULT_MODEL_BLOCKLIST: &[&str] = &[
    "ir.config_parameter",
    "ir.cron",
    "ir.rule",
    "ir.model.access",
    "ir.mail_server",
    "fetchmail.server",
    "payment.provider",
    "res.users",
    "res.groups",
];

/// Field names that never cross the wire in either direction.
pub(crate) const DEFAULT_FIELD_BLOCKLIST: &[&str] = &[
    "password",
    "password_crypt",
    "new_password",
    "oauth_access_token",
    "oauth_refresh_token",
    "api_key",
    "totp_secret",
    "totp_enabled",
    "signature",
];

/// Methods that escalate privileges, rewrite the environment, invalidate
/// caches or manage modules.
const DEFAULT_METHOD_BLOCKLIST: &[&str] = &[
    "sudo",
    "with_user",
    "with_env",
    "with_context",
    "invalidate_cache",
    "invalidate_all",
    "clear_caches",
    "button_immediate_install",
    "button_immediate_uninstall",
    "button_install",
    "button_uninstall",
    "module_install",
    "module_uninstall",
];

/// The enforced policy. Constructed once at startup; immutable between
/// configuration reloads.
#[derive(Clone, Debug)]
pub struct SafetyPolicy {
    pub mode: SafetyMode,
    pub model_allowlist: HashSet<String>,
    pub model_blocklist: HashSet<String>,
    pub write_allowlist: HashSet<String>,
    pub field_blocklist: HashSet<String>,
    pub method_blocklist: HashSet<String>,
}

impl SafetyPolicy {
    pub fn new(mode: SafetyMode) -> Self {
        Self {
            mode,
            model_allowlist: HashSet::new(),
            model_blocklist: DEFAULT_MODEL_BLOCKLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            write_allowlist: HashSet::new(),
            field_blocklist: DEFAULT_FIELD_BLOCKLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            method_blocklist: DEFAULT_METHOD_BLOCKLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Union the operator's lists into the defaults. Defaults are never
    /// removed, only added to; an explicit write allowlist entry overrides
    /// the default model write block.
    pub fn with_user_lists(
        mut self,
        model_allow: impl IntoIterator<Item = String>,
        model_deny: impl IntoIterator<Item = String>,
        write_allow: impl IntoIterator<Item = String>,
        field_deny: impl IntoIterator<Item = String>,
        method_deny: impl IntoIterator<Item = String>,
    ) -> Self {
        self.model_allowlist.extend(model_allow);
        self.model_blocklist.extend(model_deny);
        self.write_allowlist.extend(write_allow);
        self.field_blocklist.extend(field_deny);
        self.method_blocklist.extend(method_deny);
        self
    }

    /// Structural invariants checked once at startup.
    pub fn validate(&self) -> Result<(), String> {
        let user_blocked: HashSet<_> = self
            .model_blocklist
            .iter()
            .filter(|m| !DEFAULT_MODEL_BLOCKLIST.contains(&m.as_str()))
            .collect();
        if !self.model_allowlist.is_empty() && !user_blocked.is_empty() {
            return Err(
                "model allowlist and model blocklist must not both be configured".to_string(),
            );
        }
        if !self.model_allowlist.is_empty() {
            for model in &self.write_allowlist {
                if !self.model_allowlist.contains(model) {
                    return Err(format!(
                        "write allowlist entry '{}' is not in the model allowlist",
                        model
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn is_model_visible(&self, model: &str) -> bool {
        self.model_allowlist.is_empty() || self.model_allowlist.contains(model)
    }

    pub fn is_model_write_blocked(&self, model: &str) -> bool {
        self.model_blocklist.contains(model) && !self.write_allowlist.contains(model)
    }

    /// Blocked by operator configuration rather than by the built-in
    /// defaults. Listings hide these entirely; default-blocked models stay
    /// listed as read-only.
    pub fn is_user_denied(&self, model: &str) -> bool {
        self.model_blocklist.contains(model) && !DEFAULT_MODEL_BLOCKLIST.contains(&model)
    }

    pub fn is_field_blocked(&self, field: &str) -> bool {
        self.field_blocklist.contains(field)
    }

    pub fn is_method_blocked(&self, method: &str) -> bool {
        self.method_blocklist.contains(method)
    }
}

/// Runtime enforcement over a [`SafetyPolicy`].
#[derive(Clone, Debug)]
pub struct SafetyGate {
    policy: SafetyPolicy,
}

impl SafetyGate {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    pub fn mode(&self) -> SafetyMode {
        self.policy.mode
    }

    /// Whether tools performing `operation` should be registered at all for
    /// the current mode. Hidden tools are never in the MCP tool list.
    pub fn operation_visible(&self, operation: Operation) -> bool {
        match self.policy.mode {
            SafetyMode::Readonly => operation.is_read(),
            SafetyMode::Restricted => operation != Operation::Unlink,
            SafetyMode::Full => true,
        }
    }

    /// The runtime decision. Pure: same inputs, same verdict.
    pub fn check(
        &self,
        operation: Operation,
        model: &str,
        fields: Option<&[String]>,
        method: Option<&str>,
    ) -> Result<(), Box<ErrorResponse>> {
        if !self.policy.is_model_visible(model) {
            return Err(Box::new(
                ErrorResponse::new(
                    ErrorCategory::Access,
                    "MODEL_NOT_ALLOWED",
                    format!("Model '{}' is outside the configured allowlist", model),
                    "Use list_models to see which models this server exposes.",
                )
                .with_details(json!({"model": model})),
            ));
        }

        if !operation.is_read() {
            match self.policy.mode {
                SafetyMode::Readonly => {
                    return Err(Box::new(reject_mode(operation, model, "readonly")));
                }
                SafetyMode::Restricted => {
                    if operation == Operation::Unlink {
                        return Err(Box::new(reject_mode(operation, model, "restricted")));
                    }
                    if !self.policy.write_allowlist.contains(model) {
                        return Err(Box::new(
                            ErrorResponse::new(
                                ErrorCategory::Access,
                                "MODEL_NOT_WRITABLE",
                                format!(
                                    "Model '{}' is not on the write allowlist in restricted mode",
                                    model
                                ),
                                "Writes in restricted mode are limited to the configured write allowlist.",
                            )
                            .with_details(json!({"model": model, "operation": operation.as_str()})),
                        ));
                    }
                }
                SafetyMode::Full => {}
            }

            if self.policy.is_model_write_blocked(model) {
                return Err(Box::new(
                    ErrorResponse::new(
                        ErrorCategory::Access,
                        "MODEL_WRITE_BLOCKED",
                        format!("Model '{}' is write-protected", model),
                        "This model is on the protected blocklist; reading is still allowed.",
                    )
                    .with_details(json!({"model": model})),
                ));
            }
        }

        if let Some(fields) = fields {
            if !operation.is_read() {
                for field in fields {
                    if self.policy.is_field_blocked(field) {
                        return Err(Box::new(
                            ErrorResponse::new(
                                ErrorCategory::Access,
                                "FIELD_BLOCKED",
                                format!("Field '{}' may not be written", field),
                                "Remove the protected field from the values and retry.",
                            )
                            .with_details(json!({"model": model, "field": field})),
                        ));
                    }
                }
            }
        }

        if let Some(method) = method {
            if method.starts_with('_') {
                return Err(Box::new(
                    ErrorResponse::new(
                        ErrorCategory::Access,
                        "PRIVATE_METHOD",
                        format!("Method '{}' is private", method),
                        "Only public model methods can be called; use the documented action methods.",
                    )
                    .with_details(json!({"model": model, "method": method})),
                ));
            }
            if self.policy.is_method_blocked(method) {
                return Err(Box::new(
                    ErrorResponse::new(
                        ErrorCategory::Access,
                        "METHOD_BLOCKED",
                        format!("Method '{}' is blocked by policy", method),
                        "Privilege, environment and module-management methods are not callable through this server.",
                    )
                    .with_details(json!({"model": model, "method": method})),
                ));
            }
        }

        Ok(())
    }

    /// Strip blocklisted names from a field list (used by read paths, which
    /// filter rather than reject).
    pub fn filter_fields<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        fields
            .into_iter()
            .filter(|f| !self.policy.is_field_blocked(f))
            .map(str::to_string)
            .collect()
    }
}

fn reject_mode(operation: Operation, model: &str, mode: &str) -> ErrorResponse {
    ErrorResponse::new(
        ErrorCategory::Access,
        "MODE_FORBIDS_OPERATION",
        format!(
            "Operation '{}' on '{}' is not permitted in {} mode",
            operation.as_str(),
            model,
            mode
        ),
        "The server is running with a restricted write policy; read tools remain available.",
    )
    .with_details(json!({"operation": operation.as_str(), "model": model, "mode": mode}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(mode: SafetyMode) -> SafetyGate {
        SafetyGate::new(SafetyPolicy::new(mode))
    }

    const ALL_OPS: [Operation; 10] = [
        Operation::Read,
        Operation::Search,
        Operation::Count,
        Operation::FieldsGet,
        Operation::NameGet,
        Operation::DefaultGet,
        Operation::Create,
        Operation::Write,
        Operation::Unlink,
        Operation::Execute,
    ];

    #[test]
    fn readonly_permits_only_reads() {
        let gate = gate(SafetyMode::Readonly);
        for op in ALL_OPS {
            let verdict = gate.check(op, "res.partner", None, None);
            assert_eq!(verdict.is_ok(), op.is_read(), "{:?}", op);
        }
    }

    #[test]
    fn restricted_requires_write_allowlist_and_never_unlinks() {
        let policy = SafetyPolicy::new(SafetyMode::Restricted).with_user_lists(
            [],
            [],
            ["sale.order".to_string()],
            [],
            [],
        );
        let gate = SafetyGate::new(policy);

        assert!(gate.check(Operation::Create, "sale.order", None, None).is_ok());
        assert!(gate.check(Operation::Create, "res.partner", None, None).is_err());
        assert!(gate.check(Operation::Unlink, "sale.order", None, None).is_err());
        assert!(gate.check(Operation::Read, "res.partner", None, None).is_ok());
    }

    #[test]
    fn gate_is_monotone_across_modes() {
        let readonly = gate(SafetyMode::Readonly);
        let restricted = SafetyGate::new(SafetyPolicy::new(SafetyMode::Restricted).with_user_lists(
            [],
            [],
            ["crm.lead".to_string()],
            [],
            [],
        ));
        let full = gate(SafetyMode::Full);

        for op in ALL_OPS {
            for model in ["crm.lead", "res.partner"] {
                if readonly.check(op, model, None, None).is_ok() {
                    assert!(restricted.check(op, model, None, None).is_ok(), "{:?} {}", op, model);
                }
                if restricted.check(op, model, None, None).is_ok() {
                    assert!(full.check(op, model, None, None).is_ok(), "{:?} {}", op, model);
                }
            }
        }
    }

    #[test]
    fn default_blocklists_protect_users_and_secrets() {
        let gate = gate(SafetyMode::Full);
        // Reads on protected models stay open.
        assert!(gate.check(Operation::Read, "res.users", None, None).is_ok());
        // Writes are blocked by default.
        assert!(gate.check(Operation::Write, "res.users", None, None).is_err());
        // Secret fields are never writable.
        let verdict = gate.check(
            Operation::Write,
            "res.partner",
            Some(&["name".to_string(), "password".to_string()]),
            None,
        );
        assert!(verdict.is_err());
    }

    #[test]
    fn write_allowlist_overrides_default_model_block() {
        let policy = SafetyPolicy::new(SafetyMode::Full).with_user_lists(
            [],
            [],
            ["res.users".to_string()],
            [],
            [],
        );
        let gate = SafetyGate::new(policy);
        assert!(gate.check(Operation::Write, "res.users", None, None).is_ok());
    }

    #[test]
    fn private_and_blocked_methods_rejected() {
        let gate = gate(SafetyMode::Full);
        assert!(gate
            .check(Operation::Execute, "res.partner", None, Some("_compute_x"))
            .is_err());
        assert!(gate
            .check(Operation::Execute, "res.partner", None, Some("sudo"))
            .is_err());
        assert!(gate
            .check(Operation::Execute, "sale.order", None, Some("action_confirm"))
            .is_ok());
    }

    #[test]
    fn allow_and_deny_lists_cannot_coexist() {
        let policy = SafetyPolicy::new(SafetyMode::Full).with_user_lists(
            ["sale.order".to_string()],
            ["crm.lead".to_string()],
            [],
            [],
            [],
        );
        assert!(policy.validate().is_err());
    }

    #[test]
    fn filter_fields_strips_secrets() {
        let gate = gate(SafetyMode::Full);
        let filtered = gate.filter_fields(["name", "totp_secret", "email"]);
        assert_eq!(filtered, vec!["name".to_string(), "email".to_string()]);
    }
}
