//! Static/dynamic registry merging.
//!
//! Precedence: dynamic wins for fields and states (it reflects the running
//! backend), static wins for methods (source parsing sees decorators and
//! docstrings introspection cannot). Models present in only one source are
//! carried over whole. Every decision is visible at debug level.

use std::collections::BTreeMap;

use tracing::debug;

use super::{BuildMode, ModelInfo, Registry};

/// Merge a dynamic overlay onto a static base.
pub fn merge(static_base: Registry, dynamic: Registry) -> Registry {
    let mut models: BTreeMap<String, ModelInfo> = static_base.models;

    for (name, dyn_model) in dynamic.models {
        match models.remove(&name) {
            None => {
                debug!(model = %name, "merge: model from dynamic only");
                models.insert(name, dyn_model);
            }
            Some(static_model) => {
                let merged = merge_model(static_model, dyn_model);
                models.insert(name, merged);
            }
        }
    }

    let mut registry = Registry::from_models(models, BuildMode::Merged);
    registry.version = dynamic.version.or(static_base.version);
    registry
}

fn merge_model(static_model: ModelInfo, dyn_model: ModelInfo) -> ModelInfo {
    let model_name = static_model.model.clone();
    let mut merged = static_model;

    // Fields: dynamic value overrides on conflict; dynamic-only fields are
    // added; static-only fields are retained.
    for (field_name, dyn_field) in dyn_model.fields {
        match merged.fields.insert(field_name.clone(), dyn_field) {
            Some(_) => debug!(model = %model_name, field = %field_name, "merge: field overridden by dynamic"),
            None => debug!(model = %model_name, field = %field_name, "merge: field added from dynamic"),
        }
    }

    // Methods: static wins; dynamic only adds newly discovered names.
    for (method_name, dyn_method) in dyn_model.methods {
        if !merged.methods.contains_key(&method_name) {
            debug!(model = %model_name, method = %method_name, "merge: method added from dynamic");
            merged.methods.insert(method_name, dyn_method);
        } else {
            debug!(model = %model_name, method = %method_name, "merge: method kept from static");
        }
    }

    // States: dynamic reflects the current backend.
    if dyn_model.states.is_some() {
        debug!(model = %model_name, "merge: states taken from dynamic");
        merged.states = dyn_model.states;
    }

    if dyn_model.has_chatter {
        merged.has_chatter = true;
    }
    if !dyn_model.parent_models.is_empty() {
        merged.parent_models = dyn_model.parent_models;
    }
    merged.transient = dyn_model.transient;
    merged
}

#[cfg(test)]
mod tests {
    use super::super::tests::{field, model};
    use super::super::{FieldType, MethodInfo, Registry};
    use super::*;

    fn registry(models: Vec<ModelInfo>, mode: BuildMode) -> Registry {
        Registry::from_models(
            models.into_iter().map(|m| (m.model.clone(), m)).collect(),
            mode,
        )
    }

    #[test]
    fn disjoint_models_union_without_loss() {
        let static_base = registry(
            vec![model("sale.order", vec![field("name", FieldType::Char)])],
            BuildMode::Static,
        );
        let dynamic = registry(
            vec![model("res.partner", vec![field("email", FieldType::Char)])],
            BuildMode::Dynamic,
        );
        let merged = merge(static_base, dynamic);
        assert_eq!(merged.model_count, 2);
        assert!(merged.get_field("sale.order", "name").is_some());
        assert!(merged.get_field("res.partner", "email").is_some());
        assert_eq!(merged.build_mode, BuildMode::Merged);
    }

    #[test]
    fn conflicting_fields_take_dynamic() {
        let mut static_field = field("amount_total", FieldType::Float);
        static_field.readonly = false;
        let mut dyn_field = field("amount_total", FieldType::Monetary);
        dyn_field.readonly = true;

        let static_base = registry(
            vec![model("sale.order", vec![static_field, field("name", FieldType::Char)])],
            BuildMode::Static,
        );
        let dynamic = registry(
            vec![model("sale.order", vec![dyn_field])],
            BuildMode::Dynamic,
        );

        let merged = merge(static_base, dynamic);
        let amount = merged.get_field("sale.order", "amount_total").unwrap();
        assert_eq!(amount.field_type, FieldType::Monetary);
        assert!(amount.readonly);
        // Static-only field retained.
        assert!(merged.get_field("sale.order", "name").is_some());
    }

    #[test]
    fn conflicting_methods_take_static() {
        let mut static_model = model("sale.order", vec![]);
        static_model.methods.insert(
            "action_confirm".to_string(),
            MethodInfo {
                name: "action_confirm".to_string(),
                description: "Confirm the quotation".to_string(),
                accepts_kwargs: false,
                decorator: None,
            },
        );
        let mut dyn_model = model("sale.order", vec![]);
        dyn_model.methods.insert(
            "action_confirm".to_string(),
            MethodInfo {
                name: "action_confirm".to_string(),
                description: String::new(),
                accepts_kwargs: true,
                decorator: None,
            },
        );
        dyn_model.methods.insert(
            "action_quotation_send".to_string(),
            MethodInfo {
                name: "action_quotation_send".to_string(),
                description: String::new(),
                accepts_kwargs: true,
                decorator: None,
            },
        );

        let merged = merge(
            registry(vec![static_model], BuildMode::Static),
            registry(vec![dyn_model], BuildMode::Dynamic),
        );
        let confirm = merged.get_method("sale.order", "action_confirm").unwrap();
        assert_eq!(confirm.description, "Confirm the quotation");
        // Newly discovered method added.
        assert!(merged.get_method("sale.order", "action_quotation_send").is_some());
    }

    #[test]
    fn conflicting_states_take_dynamic() {
        let mut static_model = model("sale.order", vec![]);
        static_model.states = Some(vec![("draft".into(), "Draft".into())]);
        let mut dyn_model = model("sale.order", vec![]);
        dyn_model.states = Some(vec![
            ("draft".into(), "Quotation".into()),
            ("sale".into(), "Sales Order".into()),
        ]);

        let merged = merge(
            registry(vec![static_model], BuildMode::Static),
            registry(vec![dyn_model], BuildMode::Dynamic),
        );
        let states = merged.get_model("sale.order").unwrap().states.as_ref().unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].1, "Quotation");
    }
}
