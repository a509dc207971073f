//! JSON5 design files with named resources.
//!
//! Design files refer to resources by name instead of guid; names are
//! resolved to guids in declaration order. Delays use duration strings
//! ("500ms", "5s", "0.5s").
//!
//! ```json5
//! {
//!   exp_id: "ping",
//!   resources: [
//!     { name: "node", type: "dummy::Node", attributes: { hostname: "node1" } },
//!     { name: "app", type: "dummy::Application", attributes: { duration: "1s" } },
//!   ],
//!   connections: [["app", "node"]],
//!   conditions: [],
//!   wait_for: ["app"],
//! }
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::design::{ExperimentDesign, ResourceDesign};
use crate::errors::{DesignError, DesignResult};
use crate::time_spec::parse_duration;
use crate::{AttrValue, Condition, Guid, ResourceAction, ResourceState};

/// Intermediate struct for JSON5 deserialization of a design file
#[derive(Debug, Deserialize)]
struct DesignFile {
    #[serde(default)]
    exp_id: Option<String>,
    #[serde(default)]
    resources: Vec<ResourceEntry>,
    #[serde(default)]
    connections: Vec<(String, String)>,
    #[serde(default)]
    conditions: Vec<ConditionEntry>,
    #[serde(default)]
    wait_for: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceEntry {
    name: String,
    #[serde(rename = "type")]
    rtype: String,
    #[serde(default)]
    attributes: BTreeMap<String, AttrValue>,
    #[serde(default)]
    traces: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConditionEntry {
    subjects: Vec<String>,
    action: ResourceAction,
    targets: Vec<String>,
    state: ResourceState,
    #[serde(default)]
    delay: Option<String>,
}

/// A parsed design together with its resource names
#[derive(Debug, Clone, PartialEq)]
pub struct NamedDesign {
    pub design: ExperimentDesign,
    pub names: BTreeMap<String, Guid>,
    /// Resources a run waits on before it is considered finished
    pub wait_for: Vec<Guid>,
}

impl NamedDesign {
    pub fn guid(&self, name: &str) -> Option<Guid> {
        self.names.get(name).copied()
    }
}

fn resolve(names: &BTreeMap<String, Guid>, name: &str) -> DesignResult<Guid> {
    names
        .get(name)
        .copied()
        .ok_or_else(|| DesignError::UnknownName {
            name: name.to_string(),
        })
}

fn resolve_all(names: &BTreeMap<String, Guid>, list: &[String]) -> DesignResult<Vec<Guid>> {
    list.iter().map(|n| resolve(names, n)).collect()
}

/// Parse a design from JSON5 content
pub fn parse_design(content: &str) -> DesignResult<NamedDesign> {
    let file: DesignFile =
        json5::from_str(content).map_err(|e| DesignError::Json5(e.to_string()))?;

    let mut names = BTreeMap::new();
    let mut design = ExperimentDesign {
        exp_id: file.exp_id,
        ..ExperimentDesign::default()
    };

    for (index, entry) in file.resources.into_iter().enumerate() {
        let guid = ExperimentDesign::guid_at(index);
        if names.insert(entry.name.clone(), guid).is_some() {
            return Err(DesignError::DuplicateName { name: entry.name });
        }
        design.resources.push(ResourceDesign {
            rtype: entry.rtype,
            attributes: entry.attributes,
            traces: entry.traces,
        });
    }

    for (a, b) in &file.connections {
        design.connect(resolve(&names, a)?, resolve(&names, b)?)?;
    }

    for entry in &file.conditions {
        let delay = entry
            .delay
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map_err(|e| DesignError::InvalidCondition {
                reason: e.to_string(),
            })?;
        let mut condition = Condition::new(
            resolve_all(&names, &entry.subjects)?,
            entry.action,
            resolve_all(&names, &entry.targets)?,
            entry.state,
        );
        condition.delay = delay;
        design.conditions.push(condition);
    }

    design.validate()?;
    let wait_for = resolve_all(&names, &file.wait_for)?;

    Ok(NamedDesign {
        design,
        names,
        wait_for,
    })
}

/// Parse a design from a file path
pub fn parse_design_file(path: &Path) -> DesignResult<NamedDesign> {
    let content = std::fs::read_to_string(path)?;
    parse_design(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const PING: &str = r#"{
        // two applications on one node
        exp_id: "ping",
        resources: [
            { name: "node", type: "dummy::Node", attributes: { hostname: "node1" } },
            { name: "app1", type: "dummy::Application" },
            { name: "app2", type: "dummy::Application", traces: ["stdout"] },
        ],
        connections: [["app1", "node"], ["app2", "node"]],
        conditions: [
            { subjects: ["app2"], action: "start", targets: ["app1"], state: "started", delay: "0.5s" },
        ],
        wait_for: ["app1", "app2"],
    }"#;

    #[test]
    fn test_parse_named_design() {
        let named = parse_design(PING).unwrap();
        assert_eq!(named.guid("node"), Some(Guid(1)));
        assert_eq!(named.guid("app2"), Some(Guid(3)));
        assert_eq!(named.wait_for, vec![Guid(2), Guid(3)]);

        let design = &named.design;
        assert_eq!(design.exp_id.as_deref(), Some("ping"));
        assert_eq!(design.connections, vec![(Guid(2), Guid(1)), (Guid(3), Guid(1))]);
        assert_eq!(design.resources[2].traces, vec!["stdout".to_string()]);
        assert_eq!(design.conditions[0].delay, Some(Duration::from_millis(500)));
        assert_eq!(design.conditions[0].action, ResourceAction::Start);
    }

    #[test]
    fn test_unknown_name_rejected() {
        let content = r#"{ resources: [{ name: "a", type: "t" }], connections: [["a", "b"]] }"#;
        assert!(matches!(
            parse_design(content),
            Err(DesignError::UnknownName { .. })
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let content = r#"{ resources: [{ name: "a", type: "t" }, { name: "a", type: "t" }] }"#;
        assert!(matches!(
            parse_design(content),
            Err(DesignError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_invalid_json5() {
        assert!(matches!(parse_design("{ resources: ["), Err(DesignError::Json5(_))));
    }
}
