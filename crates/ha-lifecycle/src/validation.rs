//! Schema and semantic checks for requested configuration changes

use ha_core::{AutomationVersion, Configuration, LifecycleResult, RuleViolation};
use ha_dependencies::DependencyGraph;
use serde_json::Value;

/// Configuration key naming the automations this one depends on
pub const DEPENDS_ON_KEY: &str = "depends_on";

fn non_empty(config: &Value, keys: &[&str]) -> bool {
    keys.iter().any(|key| match config.get(*key) {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    })
}

/// Automation ids listed under `depends_on` (a string or a list of strings)
pub fn depends_on_targets(config: &Configuration) -> Vec<String> {
    match config.get(DEPENDS_ON_KEY) {
        Some(Value::String(id)) => vec![id.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Structural rules that need nothing but the document itself
pub fn check_document(automation_id: &str, config: &Configuration) -> Vec<RuleViolation> {
    if !config.is_object() {
        return vec![RuleViolation::new(
            "configuration_not_object",
            "configuration must be a mapping",
        )];
    }

    let mut violations = Vec::new();
    if !non_empty(config, &["triggers", "trigger"]) {
        violations.push(
            RuleViolation::new("trigger_required", "at least one trigger is required")
                .at("triggers"),
        );
    }
    if !non_empty(config, &["actions", "action"]) {
        violations.push(
            RuleViolation::new("action_required", "at least one action is required")
                .at("actions"),
        );
    }
    if depends_on_targets(config).iter().any(|id| id == automation_id) {
        violations.push(
            RuleViolation::new(
                "self_dependency",
                format!("automation {} cannot depend on itself", automation_id),
            )
            .at(DEPENDS_ON_KEY),
        );
    }
    violations
}

/// Rules relating the change to the current version and the dependency graph
///
/// Fails with `Timeout` when the dependency walk exceeds its budget.
pub fn check_change(
    automation_id: &str,
    connection_id: &str,
    config: &Configuration,
    current: Option<&AutomationVersion>,
    graph: &DependencyGraph,
    allow_unchanged: bool,
) -> LifecycleResult<Vec<RuleViolation>> {
    let mut violations = Vec::new();

    if let Some(current) = current {
        if current.tombstone {
            violations.push(RuleViolation::new(
                "automation_retired",
                format!(
                    "automation {} is retired; restore a backup to recover it",
                    automation_id
                ),
            ));
        } else if !allow_unchanged && current.configuration == *config {
            violations.push(RuleViolation::new(
                "configuration_unchanged",
                "requested configuration equals the current version",
            ));
        }
    }

    let targets = depends_on_targets(config);
    if !targets.is_empty() {
        let dependents = graph.build(automation_id, connection_id)?;
        for target in targets {
            if dependents.automation_ids.contains(&target) {
                violations.push(
                    RuleViolation::new(
                        "dependency_cycle",
                        format!(
                            "{} already depends on {}, directly or transitively",
                            target, automation_id
                        ),
                    )
                    .at(DEPENDS_ON_KEY),
                );
            }
        }
    }

    Ok(violations)
}
