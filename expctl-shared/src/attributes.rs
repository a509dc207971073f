//! Attribute schema and values.
//!
//! Every resource type declares a schema of [`AttributeSpec`]s. Each resource
//! instance holds one [`Attribute`] per spec; writes go through
//! [`Attribute::check_write`], which enforces the flags against the current
//! lifecycle state and the path the value arrived through.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::errors::ValidationError;
use crate::time_spec::parse_duration;
use crate::{Guid, ResourceState};

/// Attribute flag set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Only modifiable while the resource is NEW
    pub const DESIGN: Flags = Flags(1 << 0);
    /// Secret value; never logged, rejected through untrusted paths
    pub const CREDENTIAL: Flags = Flags(1 << 1);
    /// Consumed while provisioning; modifiable until PROVISIONED
    pub const CONSTRUCT: Flags = Flags(1 << 2);
    /// Written by the driver only
    pub const NO_WRITE: Flags = Flags(1 << 3);
    /// Internal to the engine/driver; hidden from public listings
    pub const RESERVED: Flags = Flags(1 << 4);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Declared value type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    #[default]
    String,
    Integer,
    Double,
    Bool,
    /// String restricted to the spec's allowed values
    Enumerate,
    /// Duration string such as "5s"
    Time,
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrType::String => "string",
            AttrType::Integer => "integer",
            AttrType::Double => "double",
            AttrType::Bool => "bool",
            AttrType::Enumerate => "enumerate",
            AttrType::Time => "time",
        };
        f.write_str(name)
    }
}

/// Attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Double(d) => Some(*d),
            AttrValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Integer(i) => write!(f, "{}", i),
            AttrValue::Double(d) => write!(f, "{}", d),
            AttrValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Integer(i)
    }
}

impl From<f64> for AttrValue {
    fn from(d: f64) -> Self {
        AttrValue::Double(d)
    }
}

/// Path through which a value reaches an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Per-resource `set` from the experiment client
    Client,
    /// Class-wide default applied through `set_global`
    Global,
    /// Value published by the resource's own driver
    Driver,
}

impl fmt::Display for WriteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOrigin::Client => f.write_str("set"),
            WriteOrigin::Global => f.write_str("set_global"),
            WriteOrigin::Driver => f.write_str("driver update"),
        }
    }
}

/// Schema entry for one attribute of a resource type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    pub help: String,
    #[serde(default)]
    pub attr_type: AttrType,
    #[serde(default)]
    pub default: Option<AttrValue>,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub allowed: Vec<String>,
}

impl AttributeSpec {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            attr_type: AttrType::String,
            default: None,
            flags: Flags::NONE,
            allowed: Vec::new(),
        }
    }

    pub fn with_type(mut self, attr_type: AttrType) -> Self {
        self.attr_type = attr_type;
        self
    }

    pub fn with_default(mut self, default: impl Into<AttrValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_allowed<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attr_type = AttrType::Enumerate;
        self.allowed = allowed.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    /// Check a value against the declared type, coercing where lossless
    pub fn coerce(&self, value: AttrValue) -> Result<AttrValue, ValidationError> {
        let invalid = |value: &AttrValue| ValidationError::InvalidValue {
            name: self.name.clone(),
            expected: self.attr_type.to_string(),
            value: value.to_string(),
        };

        match self.attr_type {
            AttrType::String => match value {
                AttrValue::String(_) => Ok(value),
                other => Ok(AttrValue::String(other.to_string())),
            },
            AttrType::Integer => match value {
                AttrValue::Integer(_) => Ok(value),
                AttrValue::String(ref s) => s
                    .trim()
                    .parse::<i64>()
                    .map(AttrValue::Integer)
                    .map_err(|_| invalid(&value)),
                ref other => Err(invalid(other)),
            },
            AttrType::Double => match value {
                AttrValue::Double(_) => Ok(value),
                AttrValue::Integer(i) => Ok(AttrValue::Double(i as f64)),
                AttrValue::String(ref s) => s
                    .trim()
                    .parse::<f64>()
                    .map(AttrValue::Double)
                    .map_err(|_| invalid(&value)),
                ref other => Err(invalid(other)),
            },
            AttrType::Bool => match value {
                AttrValue::Bool(_) => Ok(value),
                AttrValue::String(ref s) => match s.trim().to_lowercase().as_str() {
                    "true" => Ok(AttrValue::Bool(true)),
                    "false" => Ok(AttrValue::Bool(false)),
                    _ => Err(invalid(&value)),
                },
                ref other => Err(invalid(other)),
            },
            AttrType::Enumerate => {
                let rendered = value.to_string();
                if self.allowed.iter().any(|a| *a == rendered) {
                    Ok(AttrValue::String(rendered))
                } else {
                    Err(ValidationError::NotAllowed {
                        name: self.name.clone(),
                        value: rendered,
                        allowed: self.allowed.join(", "),
                    })
                }
            }
            AttrType::Time => {
                let rendered = value.to_string();
                parse_duration(&rendered).map_err(|_| invalid(&value))?;
                Ok(AttrValue::String(rendered))
            }
        }
    }
}

/// One attribute of a resource instance
#[derive(Clone, PartialEq)]
pub struct Attribute {
    spec: Arc<AttributeSpec>,
    value: Option<AttrValue>,
}

impl Attribute {
    pub fn new(spec: Arc<AttributeSpec>) -> Self {
        let value = spec.default.clone();
        Self { spec, value }
    }

    pub fn spec(&self) -> &AttributeSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn value(&self) -> Option<&AttrValue> {
        self.value.as_ref()
    }

    pub fn has_flag(&self, flag: Flags) -> bool {
        self.spec.has_flag(flag)
    }

    /// Verify that a write through `origin` is legal while the owning
    /// resource `guid` is in `state`.
    pub fn check_write(
        &self,
        guid: Guid,
        state: ResourceState,
        origin: WriteOrigin,
    ) -> Result<(), ValidationError> {
        let name = self.spec.name.clone();

        if state.is_terminal() {
            return Err(ValidationError::TerminalState { guid, state });
        }

        if self.has_flag(Flags::CREDENTIAL) && origin == WriteOrigin::Global {
            return Err(ValidationError::UntrustedCredential {
                name,
                origin: origin.to_string(),
            });
        }

        if origin == WriteOrigin::Driver {
            return Ok(());
        }

        if self.has_flag(Flags::RESERVED) {
            return Err(ValidationError::Reserved { name });
        }
        if self.has_flag(Flags::NO_WRITE) {
            return Err(ValidationError::ReadOnly { name });
        }
        if self.has_flag(Flags::DESIGN) && state != ResourceState::New {
            return Err(ValidationError::DesignOnly { name, state });
        }
        if self.has_flag(Flags::CONSTRUCT) && state.satisfies(ResourceState::Provisioned) {
            return Err(ValidationError::ConstructOnly { name, state });
        }
        Ok(())
    }

    /// Validate and store a value
    pub fn set(
        &mut self,
        guid: Guid,
        state: ResourceState,
        origin: WriteOrigin,
        value: AttrValue,
    ) -> Result<(), ValidationError> {
        self.check_write(guid, state, origin)?;
        self.value = Some(self.spec.coerce(value)?);
        Ok(())
    }

    /// Value suitable for logs; credentials are masked
    pub fn display_value(&self) -> String {
        match (&self.value, self.has_flag(Flags::CREDENTIAL)) {
            (Some(_), true) => "***".to_string(),
            (Some(v), false) => v.to_string(),
            (None, _) => "<unset>".to_string(),
        }
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.spec.name)
            .field("value", &self.display_value())
            .finish()
    }
}
