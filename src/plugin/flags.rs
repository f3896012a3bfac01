//! Per-plugin flag registry
//!
//! Each plugin declares its configurable options once, from `Flags`. The host
//! exposes every flag as `<plugin>-<flag>` and hands the resolved values back
//! to that plugin only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LifecyclerError, Result};

/// Resolved flag values, keyed by bare flag name
pub type FlagValues = BTreeMap<String, Value>;

/// Descriptor for one configurable plugin option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginFlag {
    /// Lowercased flag name, unique within its registry
    pub name: String,

    /// Whether the flag may also be set from the configuration file
    pub has_config: bool,

    /// Value used when nothing else sets the flag
    pub default_value: Value,

    /// One-line help text
    pub usage: String,
}

impl PluginFlag {
    pub fn new(
        name: impl Into<String>,
        has_config: bool,
        default_value: impl Into<Value>,
        usage: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into().to_lowercase(),
            has_config,
            default_value: default_value.into(),
            usage: usage.into(),
        }
    }

    /// Name under which the host exposes this flag for `plugin`
    pub fn namespaced(&self, plugin: &str) -> String {
        namespaced_flag(plugin, &self.name)
    }
}

/// `<plugin>-<flag>`, lowercased
pub fn namespaced_flag(plugin: &str, flag: &str) -> String {
    format!("{}-{}", plugin, flag).to_lowercase()
}

/// The flags one plugin declares
///
/// Travels over the wire as a plain list and is rebuilt through
/// [`PluginFlags::add_flag`], so a plugin cannot smuggle in duplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<PluginFlag>", try_from = "Vec<PluginFlag>")]
pub struct PluginFlags {
    flags: BTreeMap<String, PluginFlag>,
}

impl PluginFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a flag; an existing flag with the same (case-insensitive) name is
    /// left untouched and `FlagCollision` is returned.
    pub fn add_flag(
        &mut self,
        name: &str,
        has_config: bool,
        default_value: impl Into<Value>,
        usage: &str,
    ) -> Result<()> {
        self.insert(PluginFlag::new(name, has_config, default_value, usage))
    }

    fn insert(&mut self, flag: PluginFlag) -> Result<()> {
        let name = flag.name.to_lowercase();
        if self.flags.contains_key(&name) {
            return Err(LifecyclerError::FlagCollision { flag: name });
        }

        self.flags.insert(name.clone(), PluginFlag { name, ..flag });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PluginFlag> {
        self.flags.get(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginFlag> {
        self.flags.values()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Every flag at its declared default
    pub fn defaults(&self) -> FlagValues {
        self.flags
            .values()
            .map(|f| (f.name.clone(), f.default_value.clone()))
            .collect()
    }
}

impl TryFrom<Vec<PluginFlag>> for PluginFlags {
    type Error = LifecyclerError;

    fn try_from(list: Vec<PluginFlag>) -> Result<Self> {
        let mut flags = PluginFlags::new();
        for flag in list {
            flags.insert(flag)?;
        }
        Ok(flags)
    }
}

impl From<PluginFlags> for Vec<PluginFlag> {
    fn from(flags: PluginFlags) -> Self {
        flags.flags.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn add_flag_lowercases_name() {
        let mut flags = PluginFlags::new();
        flags.add_flag("Port", true, 8080, "Web port").unwrap();

        let flag = flags.get("PORT").unwrap();
        assert_eq!(flag.name, "port");
        assert_eq!(flag.default_value, json!(8080));
        assert!(flag.has_config);
    }

    #[test]
    fn duplicate_flag_is_rejected_and_original_kept() {
        let mut flags = PluginFlags::new();
        flags.add_flag("timeout", false, 30, "first").unwrap();

        let err = flags.add_flag("TimeOut", true, 60, "second").unwrap_err();
        assert!(matches!(err, LifecyclerError::FlagCollision { ref flag } if flag == "timeout"));

        let kept = flags.get("timeout").unwrap();
        assert_eq!(kept.default_value, json!(30));
        assert_eq!(kept.usage, "first");
        assert_eq!(flags.len(), 1);
    }

    #[test]
    fn defaults_cover_every_flag() {
        let mut flags = PluginFlags::new();
        flags.add_flag("a", false, "x", "").unwrap();
        flags.add_flag("b", false, true, "").unwrap();

        let defaults = flags.defaults();
        assert_eq!(defaults.get("a"), Some(&json!("x")));
        assert_eq!(defaults.get("b"), Some(&json!(true)));
    }

    #[test]
    fn wire_form_is_a_list() {
        let mut flags = PluginFlags::new();
        flags.add_flag("port", true, 80, "Port").unwrap();

        let value = serde_json::to_value(&flags).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["name"], "port");
    }

    #[test]
    fn duplicate_in_wire_list_is_rejected() {
        let wire = json!([
            {"name": "port", "has_config": true, "default_value": 1, "usage": ""},
            {"name": "PORT", "has_config": true, "default_value": 2, "usage": ""},
        ]);

        let list: Vec<PluginFlag> = serde_json::from_value(wire).unwrap();
        let err = PluginFlags::try_from(list).unwrap_err();
        assert!(matches!(err, LifecyclerError::FlagCollision { .. }));
    }

    #[test]
    fn namespacing() {
        let flag = PluginFlag::new("Timeout", false, 5, "");
        assert_eq!(flag.namespaced("CSP"), "csp-timeout");
    }

    proptest! {
        #[test]
        fn case_variants_always_collide(name in "[a-zA-Z][a-zA-Z0-9_]{0,12}") {
            let mut flags = PluginFlags::new();
            flags.add_flag(&name.to_lowercase(), false, 1, "lower").unwrap();

            let result = flags.add_flag(&name.to_uppercase(), false, 2, "upper");
            let is_collision = matches!(result, Err(LifecyclerError::FlagCollision { .. }));
            prop_assert!(is_collision);
            prop_assert_eq!(flags.len(), 1);
            prop_assert_eq!(&flags.get(&name).unwrap().usage, "lower");
        }
    }
}
