//! Static prompt catalog.
//!
//! A small set of embedded workflow prompts served through `prompts/list`
//! and `prompts/get`. No backend calls; argument placeholders are filled
//! with simple `{name}` substitution.

use std::collections::HashMap;

pub struct PromptDef {
    pub name: &'static str,
    pub description: &'static str,
    pub arguments: &'static [(&'static str, &'static str, bool)],
    template: &'static str,
}

pub fn catalog() -> &'static [PromptDef] {
    &[
        PromptDef {
            name: "find_record",
            description: "Locate a record by free text, escalating through the deep-search levels",
            arguments: &[
                ("query", "Free-text query, e.g. a customer name", true),
                ("model", "Target model; omit to search the default set", false),
            ],
            template: "Find records matching \"{query}\" using odoo_search_deep\
                {model_clause}. If nothing matches, inspect the search_log, pick the \
                most promising model and retry with exhaustive=true. Report the ids, \
                display names and the strategy that found them.",
        },
        PromptDef {
            name: "safe_write_checklist",
            description: "Pre-flight checks before modifying a record",
            arguments: &[
                ("model", "Technical model name", true),
                ("id", "Record id to modify", true),
            ],
            template: "Before writing to {model} id {id}: 1) call \
                odoo_records_fields_get to learn required and readonly fields, 2) read \
                the current record with odoo_records_read, 3) check the state field and \
                whether the operation needs a wizard (odoo_wizard_list), 4) only then \
                call odoo_records_write with the minimal changed fields.",
        },
        PromptDef {
            name: "explore_model",
            description: "Understand an unfamiliar model before working with it",
            arguments: &[("model", "Technical model name", true)],
            template: "Explore {model}: read odoo://model/{model}/fields and \
                odoo://model/{model}/states, then sample a few records with \
                odoo_records_search_read (limit 5) to see real values. Summarize the \
                key fields, relations and the state machine if present.",
        },
    ]
}

pub fn get(name: &str) -> Option<&'static PromptDef> {
    catalog().iter().find(|p| p.name == name)
}

impl PromptDef {
    /// Fill `{placeholders}` from the provided arguments.
    pub fn render(&self, args: &HashMap<String, String>) -> String {
        let mut text = self.template.to_string();
        for (key, value) in args {
            text = text.replace(&format!("{{{key}}}"), value);
        }
        // find_record formats the optional model clause itself.
        let model_clause = match args.get("model") {
            Some(model) if !model.is_empty() => format!(" on model {}", model),
            _ => String::new(),
        };
        text = text.replace("{model_clause}", &model_clause);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup() {
        assert!(get("find_record").is_some());
        assert!(get("missing").is_none());
    }

    #[test]
    fn render_substitutes_arguments() {
        let prompt = get("safe_write_checklist").unwrap();
        let args: HashMap<String, String> = [
            ("model".to_string(), "sale.order".to_string()),
            ("id".to_string(), "7".to_string()),
        ]
        .into();
        let text = prompt.render(&args);
        assert!(text.contains("sale.order id 7"));
        assert!(text.contains("odoo_records_write"));
        assert!(!text.contains("{model}"));
    }

    #[test]
    fn optional_model_clause() {
        let prompt = get("find_record").unwrap();
        let mut args: HashMap<String, String> = [("query".to_string(), "acme".to_string())].into();
        assert!(!prompt.render(&args).contains("{model_clause}"));
        args.insert("model".to_string(), "crm.lead".to_string());
        assert!(prompt.render(&args).contains("on model crm.lead"));
    }
}
