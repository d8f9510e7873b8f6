//! Environment-variable overlay.
//!
//! Every recognized option has an `ODOO_MCP_*` variable. Only variables that
//! are actually set overlay the current value; parse failures are startup
//! errors.

use crate::error::Result;

use super::{Settings, parse_bool, parse_list};

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

pub fn apply_env(settings: &mut Settings) -> Result<()> {
    // Connection
    if let Some(v) = var("ODOO_MCP_URL") {
        settings.connection.url = v;
    }
    if let Some(v) = var("ODOO_MCP_DATABASE") {
        settings.connection.database = v;
    }
    if let Some(v) = var("ODOO_MCP_USERNAME") {
        settings.connection.username = v;
    }
    if let Some(v) = var("ODOO_MCP_PASSWORD") {
        settings.connection.password = Some(v);
    }
    if let Some(v) = var("ODOO_MCP_API_KEY") {
        settings.connection.api_key = Some(v);
    }
    if let Some(v) = var("ODOO_MCP_PROTOCOL") {
        settings.connection.protocol = v;
    }
    if let Some(v) = var("ODOO_MCP_TIMEOUT") {
        settings.connection.timeout_secs = v
            .parse()
            .map_err(|_| crate::Error::Config(format!("ODOO_MCP_TIMEOUT: not a number: {v}")))?;
    }
    if let Some(v) = var("ODOO_MCP_VERIFY_SSL") {
        settings.connection.verify_ssl = parse_bool(&v)?;
    }
    if let Some(v) = var("ODOO_MCP_CA_CERT") {
        settings.connection.ca_cert = Some(v.into());
    }

    // Transport
    if let Some(v) = var("ODOO_MCP_TRANSPORT") {
        settings.transport.kind = v;
    }
    if let Some(v) = var("ODOO_MCP_HOST") {
        settings.transport.host = v;
    }
    if let Some(v) = var("ODOO_MCP_PORT") {
        settings.transport.port = v
            .parse()
            .map_err(|_| crate::Error::Config(format!("ODOO_MCP_PORT: not a port: {v}")))?;
    }
    if let Some(v) = var("ODOO_MCP_HTTP_PATH") {
        settings.transport.path = v;
    }

    // Safety
    if let Some(v) = var("ODOO_MCP_MODE") {
        settings.safety.mode = v;
    }
    if let Some(v) = var("ODOO_MCP_MODEL_ALLOW") {
        settings.safety.model_allow = parse_list(&v);
    }
    if let Some(v) = var("ODOO_MCP_MODEL_DENY") {
        settings.safety.model_deny = parse_list(&v);
    }
    if let Some(v) = var("ODOO_MCP_WRITE_ALLOW") {
        settings.safety.write_allow = parse_list(&v);
    }
    if let Some(v) = var("ODOO_MCP_FIELD_DENY") {
        settings.safety.field_deny = parse_list(&v);
    }
    if let Some(v) = var("ODOO_MCP_METHOD_DENY") {
        settings.safety.method_deny = parse_list(&v);
    }

    // Toolsets
    if let Some(v) = var("ODOO_MCP_TOOLSETS_ENABLED") {
        settings.toolsets.enabled = parse_list(&v);
    }
    if let Some(v) = var("ODOO_MCP_TOOLSETS_DISABLED") {
        settings.toolsets.disabled = parse_list(&v);
    }

    // Registry
    if let Some(v) = var("ODOO_MCP_REGISTRY_PATH") {
        settings.registry.static_path = Some(v.into());
    }
    if let Some(v) = var("ODOO_MCP_INTROSPECT") {
        settings.registry.introspect_on_startup = parse_bool(&v)?;
    }
    if let Some(v) = var("ODOO_MCP_INTROSPECT_MODELS") {
        settings.registry.introspect_models = parse_list(&v);
    }

    // Rate limits
    if let Some(v) = var("ODOO_MCP_RATE_LIMIT") {
        settings.rate_limit.enabled = parse_bool(&v)?;
    }
    if let Some(v) = var("ODOO_MCP_RPM") {
        settings.rate_limit.rpm = v
            .parse()
            .map_err(|_| crate::Error::Config(format!("ODOO_MCP_RPM: not a number: {v}")))?;
    }
    if let Some(v) = var("ODOO_MCP_RPH") {
        settings.rate_limit.rph = v
            .parse()
            .map_err(|_| crate::Error::Config(format!("ODOO_MCP_RPH: not a number: {v}")))?;
    }
    if let Some(v) = var("ODOO_MCP_READ_RPM") {
        settings.rate_limit.read_rpm = v
            .parse()
            .map_err(|_| crate::Error::Config(format!("ODOO_MCP_READ_RPM: not a number: {v}")))?;
    }
    if let Some(v) = var("ODOO_MCP_WRITE_RPM") {
        settings.rate_limit.write_rpm = v
            .parse()
            .map_err(|_| crate::Error::Config(format!("ODOO_MCP_WRITE_RPM: not a number: {v}")))?;
    }
    if let Some(v) = var("ODOO_MCP_RATE_BURST") {
        settings.rate_limit.burst = v
            .parse()
            .map_err(|_| crate::Error::Config(format!("ODOO_MCP_RATE_BURST: not a number: {v}")))?;
    }

    // Audit
    if let Some(v) = var("ODOO_MCP_AUDIT") {
        settings.audit.enabled = parse_bool(&v)?;
    }
    if let Some(v) = var("ODOO_MCP_AUDIT_FILE") {
        settings.audit.file = v.into();
    }
    if let Some(v) = var("ODOO_MCP_AUDIT_READS") {
        settings.audit.log_reads = parse_bool(&v)?;
    }

    // Backend context
    if let Some(v) = var("ODOO_MCP_LANG") {
        settings.context.lang = Some(v);
    }
    if let Some(v) = var("ODOO_MCP_TZ") {
        settings.context.tz = Some(v);
    }
    if let Some(v) = var("ODOO_MCP_COMPANY_IDS") {
        settings.context.company_ids = parse_list(&v)
            .into_iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| crate::Error::Config(format!("ODOO_MCP_COMPANY_IDS: not an id: {s}")))
            })
            .collect::<Result<Vec<i64>>>()?;
    }

    // Display and logging
    if let Some(v) = var("ODOO_MCP_STRIP_HTML") {
        settings.display.strip_html = parse_bool(&v)?;
    }
    if let Some(v) = var("ODOO_MCP_LOG_LEVEL") {
        settings.logging.level = v;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env tests mutate process state; keep them in one test to avoid
    // interleaving with parallel test threads.
    #[test]
    fn overlays_only_set_variables() {
        let vars = [
            ("ODOO_MCP_DATABASE", "envdb"),
            ("ODOO_MCP_MODE", "restricted"),
            ("ODOO_MCP_WRITE_ALLOW", "sale.order, crm.lead"),
            ("ODOO_MCP_VERIFY_SSL", "no"),
        ];
        for (key, value) in vars {
            unsafe { std::env::set_var(key, value) };
        }

        let mut settings = Settings::default();
        apply_env(&mut settings).unwrap();

        for (key, _) in vars {
            unsafe { std::env::remove_var(key) };
        }

        assert_eq!(settings.connection.database, "envdb");
        assert_eq!(settings.safety.mode, "restricted");
        assert_eq!(settings.safety.write_allow, vec!["sale.order", "crm.lead"]);
        assert!(!settings.connection.verify_ssl);
        // Untouched values keep defaults.
        assert_eq!(settings.connection.url, "http://localhost:8069");
    }
}
