//! Serializable experiment design.
//!
//! A design is the declarative half of an experiment: which resources exist,
//! their attribute values, how they are connected and which conditions order
//! their actions. Replaying a design into a fresh controller assigns the same
//! guids, because guids are handed out in resource order starting at 1.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::{DesignError, DesignResult};
use crate::{AttrValue, Condition, Guid, ResourceAction, ResourceState};

/// One resource of a design
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDesign {
    /// Registered type tag
    pub rtype: String,
    /// Attribute values applied through `set`
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    /// Traces to enable before deployment
    #[serde(default)]
    pub traces: Vec<String>,
}

/// Complete experiment design
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDesign {
    /// Experiment identifier; a fresh one is generated when absent
    #[serde(default)]
    pub exp_id: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceDesign>,
    #[serde(default)]
    pub connections: Vec<(Guid, Guid)>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ExperimentDesign {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exp_id(mut self, exp_id: impl Into<String>) -> Self {
        self.exp_id = Some(exp_id.into());
        self
    }

    /// Guid the resource at `index` receives when the design is replayed
    pub fn guid_at(index: usize) -> Guid {
        Guid(index as u64 + 1)
    }

    /// Add a resource and return the guid it will be registered under
    pub fn add_resource(&mut self, rtype: impl Into<String>) -> Guid {
        self.resources.push(ResourceDesign {
            rtype: rtype.into(),
            attributes: BTreeMap::new(),
            traces: Vec::new(),
        });
        Self::guid_at(self.resources.len() - 1)
    }

    fn resource_mut(&mut self, guid: Guid) -> DesignResult<&mut ResourceDesign> {
        let index = (guid.0 as usize)
            .checked_sub(1)
            .ok_or(DesignError::UnknownGuid { guid })?;
        self.resources
            .get_mut(index)
            .ok_or(DesignError::UnknownGuid { guid })
    }

    pub fn set(
        &mut self,
        guid: Guid,
        name: impl Into<String>,
        value: impl Into<AttrValue>,
    ) -> DesignResult<()> {
        self.resource_mut(guid)?
            .attributes
            .insert(name.into(), value.into());
        Ok(())
    }

    pub fn enable_trace(&mut self, guid: Guid, name: impl Into<String>) -> DesignResult<()> {
        let name = name.into();
        let resource = self.resource_mut(guid)?;
        if !resource.traces.contains(&name) {
            resource.traces.push(name);
        }
        Ok(())
    }

    pub fn connect(&mut self, a: Guid, b: Guid) -> DesignResult<()> {
        self.resource_mut(a)?;
        self.resource_mut(b)?;
        if a == b {
            return Err(DesignError::SelfConnection { guid: a });
        }
        self.connections.push((a, b));
        Ok(())
    }

    pub fn add_condition(
        &mut self,
        subjects: &[Guid],
        action: ResourceAction,
        targets: &[Guid],
        state: ResourceState,
        delay: Option<Duration>,
    ) -> DesignResult<()> {
        let mut condition = Condition::new(
            subjects.iter().copied(),
            action,
            targets.iter().copied(),
            state,
        );
        condition.delay = delay;
        self.conditions.push(condition);
        if let Err(e) = self.validate() {
            self.conditions.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Check that every reference points at a resource of the design
    pub fn validate(&self) -> DesignResult<()> {
        let known = |guid: &Guid| guid.0 >= 1 && (guid.0 as usize) <= self.resources.len();

        for (a, b) in &self.connections {
            for guid in [a, b] {
                if !known(guid) {
                    return Err(DesignError::UnknownGuid { guid: *guid });
                }
            }
            if a == b {
                return Err(DesignError::SelfConnection { guid: *a });
            }
        }

        for condition in &self.conditions {
            if condition.subjects.is_empty() || condition.targets.is_empty() {
                return Err(DesignError::InvalidCondition {
                    reason: "conditions need at least one subject and one target".to_string(),
                });
            }
            if let Some(guid) = condition
                .subjects
                .iter()
                .chain(condition.targets.iter())
                .find(|g| !known(g))
            {
                return Err(DesignError::UnknownGuid { guid: *guid });
            }
        }

        Ok(())
    }

    pub fn to_json(&self) -> DesignResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> DesignResult<Self> {
        let design: ExperimentDesign = serde_json::from_str(json)?;
        design.validate()?;
        Ok(design)
    }

    pub fn save(&self, path: &Path) -> DesignResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> DesignResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}
