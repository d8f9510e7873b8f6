//! Toolset contract and registration pipeline.
//!
//! Toolsets declare metadata (backend module requirements, version bounds,
//! dependencies) and publish tools through a shared registry. Registration
//! is a single explicit pass: topological order by dependency, prerequisite
//! checks that skip with a recorded reason, and fatal errors for cycles and
//! duplicate tool names. The resulting report is exposed to clients as a
//! resource.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::safety::SafetyGate;
use crate::state::AppState;

use super::ToolRegistry;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsetMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    /// Backend modules that must be installed.
    #[serde(default)]
    pub required_modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_backend_major: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backend_major: Option<u32>,
    /// Names of toolsets that must register before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ToolsetMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            required_modules: Vec::new(),
            min_backend_major: None,
            max_backend_major: None,
            depends_on: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_modules(mut self, modules: &[&str]) -> Self {
        self.required_modules = modules.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// The two-operation toolset contract: describe yourself, then publish.
pub trait Toolset: Send + Sync {
    fn metadata(&self) -> ToolsetMetadata;

    /// Register this toolset's tools, returning the published names. The
    /// gate decides which tools are visible at all in the current mode.
    fn register(
        &self,
        registry: &mut ToolRegistry,
        gate: &SafetyGate,
        app: &Arc<AppState>,
    ) -> Result<Vec<String>>;
}

/// Environment the prerequisite checks run against.
#[derive(Clone, Debug, Default)]
pub struct ToolsetEnv {
    pub installed_modules: HashSet<String>,
    pub backend_major: u32,
    /// Config filters; empty `enabled` means "everything not disabled".
    pub enabled: HashSet<String>,
    pub disabled: HashSet<String>,
}

impl ToolsetEnv {
    fn allows(&self, name: &str) -> bool {
        if self.disabled.contains(name) {
            return false;
        }
        self.enabled.is_empty() || self.enabled.contains(name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisteredToolset {
    pub name: String,
    pub version: String,
    pub tools: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkippedToolset {
    pub name: String,
    pub reason: String,
}

/// Outcome of the registration pass, exposed via `odoo://system/toolsets`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistrationReport {
    pub registered: Vec<RegisteredToolset>,
    pub skipped: Vec<SkippedToolset>,
}

/// Run the full registration pipeline over the declared toolset list.
pub fn register_toolsets(
    toolsets: Vec<Box<dyn Toolset>>,
    env: &ToolsetEnv,
    registry: &mut ToolRegistry,
    gate: &SafetyGate,
    app: &Arc<AppState>,
) -> Result<RegistrationReport> {
    let ordered = topo_sort(&toolsets)?;
    let mut report = RegistrationReport::default();
    let mut registered_names: HashSet<String> = HashSet::new();

    for index in ordered {
        let toolset = &toolsets[index];
        let meta = toolset.metadata();

        if let Some(reason) = prerequisite_failure(&meta, env, &registered_names) {
            tracing::info!(toolset = %meta.name, %reason, "toolset skipped");
            report.skipped.push(SkippedToolset {
                name: meta.name,
                reason,
            });
            continue;
        }

        let tools = toolset.register(registry, gate, app)?;
        tracing::info!(toolset = %meta.name, tools = tools.len(), "toolset registered");
        registered_names.insert(meta.name.clone());
        report.registered.push(RegisteredToolset {
            name: meta.name,
            version: meta.version,
            tools,
        });
    }

    Ok(report)
}

fn prerequisite_failure(
    meta: &ToolsetMetadata,
    env: &ToolsetEnv,
    registered: &HashSet<String>,
) -> Option<String> {
    if !env.allows(&meta.name) {
        return Some("disabled by configuration".to_string());
    }
    for module in &meta.required_modules {
        if !env.installed_modules.contains(module) {
            return Some(format!("backend module '{}' is not installed", module));
        }
    }
    if let Some(min) = meta.min_backend_major {
        if env.backend_major < min {
            return Some(format!(
                "requires backend {} or newer (connected: {})",
                min, env.backend_major
            ));
        }
    }
    if let Some(max) = meta.max_backend_major {
        if env.backend_major > max {
            return Some(format!(
                "requires backend {} or older (connected: {})",
                max, env.backend_major
            ));
        }
    }
    for dependency in &meta.depends_on {
        if !registered.contains(dependency) {
            return Some(format!("dependency '{}' was not registered", dependency));
        }
    }
    None
}

/// Order toolsets so dependencies come first; a cycle is a fatal startup
/// error naming its members.
fn topo_sort(toolsets: &[Box<dyn Toolset>]) -> Result<Vec<usize>> {
    let metas: Vec<ToolsetMetadata> = toolsets.iter().map(|t| t.metadata()).collect();
    let by_name: HashMap<&str, usize> = metas
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name.as_str(), i))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        index: usize,
        metas: &[ToolsetMetadata],
        by_name: &HashMap<&str, usize>,
        marks: &mut [Mark],
        order: &mut Vec<usize>,
        trail: &mut Vec<String>,
    ) -> Result<()> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                trail.push(metas[index].name.clone());
                return Err(Error::Toolset(format!(
                    "toolset dependency cycle: {}",
                    trail.join(" -> ")
                )));
            }
            Mark::Unvisited => {}
        }
        marks[index] = Mark::InProgress;
        trail.push(metas[index].name.clone());
        for dependency in &metas[index].depends_on {
            // Unknown dependencies are handled by the prerequisite check;
            // ordering only cares about declared members.
            if let Some(&dep_index) = by_name.get(dependency.as_str()) {
                visit(dep_index, metas, by_name, marks, order, trail)?;
            }
        }
        trail.pop();
        marks[index] = Mark::Done;
        order.push(index);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; metas.len()];
    let mut order = Vec::with_capacity(metas.len());
    for index in 0..metas.len() {
        let mut trail = Vec::new();
        visit(index, &metas, &by_name, &mut marks, &mut order, &mut trail)?;
    }
    Ok(order)
}

/// Meta-tool exposing the registration report to clients that prefer a tool
/// call over the `odoo://system/toolsets` resource.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListToolsetsInput {}

pub struct ListToolsetsTool;

#[async_trait::async_trait]
impl super::SchemaTool for ListToolsetsTool {
    type Input = ListToolsetsInput;
    const NAME: &'static str = "odoo_toolsets_list";
    const DESCRIPTION: &'static str =
        "List registered and skipped toolsets with the reasons prerequisites failed.";
    const OPERATION: crate::safety::Operation = crate::safety::Operation::Read;

    async fn handle(
        &self,
        _input: Self::Input,
        context: &super::ToolContext,
    ) -> super::ToolOutcome {
        let report = context.app.toolset_report.get();
        super::ToolOutcome::success(match report {
            Some(report) => serde_json::json!(report),
            None => serde_json::json!({"registered": [], "skipped": []}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        meta: ToolsetMetadata,
    }

    impl Fake {
        fn new(name: &str, deps: &[&str]) -> Box<dyn Toolset> {
            Box::new(Self {
                meta: ToolsetMetadata::new(name, "fake").depends_on(deps),
            })
        }
    }

    impl Toolset for Fake {
        fn metadata(&self) -> ToolsetMetadata {
            self.meta.clone()
        }

        fn register(
            &self,
            _registry: &mut ToolRegistry,
            _gate: &SafetyGate,
            _app: &Arc<AppState>,
        ) -> Result<Vec<String>> {
            Ok(vec![format!("odoo_{}_noop", self.meta.name)])
        }
    }

    fn sorted_names(toolsets: Vec<Box<dyn Toolset>>) -> Vec<String> {
        let order = topo_sort(&toolsets).unwrap();
        order
            .into_iter()
            .map(|i| toolsets[i].metadata().name)
            .collect()
    }

    #[test]
    fn dependencies_sort_first() {
        let names = sorted_names(vec![
            Fake::new("sales", &["records"]),
            Fake::new("records", &[]),
            Fake::new("billing", &["sales"]),
        ]);
        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("records") < pos("sales"));
        assert!(pos("sales") < pos("billing"));
    }

    #[test]
    fn cycle_is_fatal_and_names_members() {
        let toolsets = vec![Fake::new("a", &["b"]), Fake::new("b", &["a"])];
        let err = topo_sort(&toolsets).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"));
        assert!(message.contains('a') && message.contains('b'));
    }

    #[test]
    fn missing_module_skips_with_reason() {
        let meta = ToolsetMetadata::new("sales", "s").with_modules(&["sale"]);
        let env = ToolsetEnv::default();
        let reason = prerequisite_failure(&meta, &env, &HashSet::new()).unwrap();
        assert!(reason.contains("sale"));
    }

    #[test]
    fn version_bounds_enforced() {
        let mut meta = ToolsetMetadata::new("modern", "m");
        meta.min_backend_major = Some(17);
        let env = ToolsetEnv {
            backend_major: 16,
            ..Default::default()
        };
        assert!(prerequisite_failure(&meta, &env, &HashSet::new()).is_some());

        let env = ToolsetEnv {
            backend_major: 18,
            ..Default::default()
        };
        assert!(prerequisite_failure(&meta, &env, &HashSet::new()).is_none());
    }

    #[test]
    fn disabled_filter_wins_over_enabled() {
        let meta = ToolsetMetadata::new("records", "r");
        let env = ToolsetEnv {
            enabled: ["records".to_string()].into(),
            disabled: ["records".to_string()].into(),
            ..Default::default()
        };
        assert!(prerequisite_failure(&meta, &env, &HashSet::new()).is_some());
    }

    #[test]
    fn unmet_dependency_skips() {
        let meta = ToolsetMetadata::new("sales", "s").depends_on(&["records"]);
        let env = ToolsetEnv::default();
        let reason = prerequisite_failure(&meta, &env, &HashSet::new()).unwrap();
        assert!(reason.contains("records"));
    }
}
