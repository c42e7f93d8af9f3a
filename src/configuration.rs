//! Declarative backend options and the values a driver supplies for them.
//!
//! A backend describes what it needs in a [`ConfigurationModel`]; the driver
//! walks [`ConfigurationModel::options`] (or the serializable
//! [`ConfigurationModel::describe`]) and sets values by name. Every value is
//! validated against the model before it reaches the [`Configuration`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DisassemblyError;

/// A configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Enum(u32),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Enum(v) => write!(f, "{}", v),
        }
    }
}

/// Current values, addressed by option name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    values: BTreeMap<String, ConfigValue>,
}

impl Configuration {
    pub fn get(&self, name: &str) -> Option<ConfigValue> {
        self.values.get(name).copied()
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ConfigValue::Bool(b) => Some(b),
            ConfigValue::Enum(_) => None,
        }
    }

    pub fn get_enum(&self, name: &str) -> Option<u32> {
        match self.get(name)? {
            ConfigValue::Enum(v) => Some(v),
            ConfigValue::Bool(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ConfigValue)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn insert(&mut self, name: &str, value: ConfigValue) {
        self.values.insert(name.to_string(), value);
    }
}

/// A boolean option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedBool {
    name: String,
    default: bool,
}

impl NamedBool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> bool {
        self.default
    }
}

/// An option choosing one of a fixed, ordered list of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedEnum {
    name: String,
    choices: Vec<(String, u32)>,
    default: u32,
}

impl NamedEnum {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `(label, value)` pairs in declaration order.
    pub fn choices(&self) -> &[(String, u32)] {
        &self.choices
    }

    pub fn default_value(&self) -> u32 {
        self.default
    }

    pub fn accepts(&self, value: u32) -> bool {
        self.choices.iter().any(|(_, v)| *v == value)
    }

    /// Value of the choice labelled `label` (case-insensitive).
    pub fn value_of(&self, label: &str) -> Option<u32> {
        self.choices
            .iter()
            .find(|(l, _)| l.eq_ignore_ascii_case(label))
            .map(|(_, v)| *v)
    }

    pub fn label_of(&self, value: u32) -> Option<&str> {
        self.choices.iter().find(|(_, v)| *v == value).map(|(l, _)| l.as_str())
    }
}

/// One declared option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamedOption {
    Bool(NamedBool),
    Enum(NamedEnum),
}

impl NamedOption {
    pub fn name(&self) -> &str {
        match self {
            NamedOption::Bool(b) => b.name(),
            NamedOption::Enum(e) => e.name(),
        }
    }
}

/// Kind tag of the wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionKind {
    Bool,
    Enum,
}

/// One choice of an enum option, as exposed to drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    pub value: u32,
}

/// Serializable description of one option with its current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDescriptor {
    pub kind: OptionKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Choice>>,
    pub current: ConfigValue,
}

/// Ordered set of options plus the configuration holding their values.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationModel {
    options: Vec<NamedOption>,
    configuration: Configuration,
}

impl ConfigurationModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_unique(&self, name: &str) -> Result<(), DisassemblyError> {
        if name.is_empty() {
            return Err(DisassemblyError::InvalidConfiguration("option name is empty".into()));
        }
        if self.option(name).is_some() {
            return Err(DisassemblyError::InvalidConfiguration(format!(
                "option '{}' is declared twice",
                name
            )));
        }
        Ok(())
    }

    /// Declare a boolean option.
    pub fn insert_bool(&mut self, name: &str, default: bool) -> Result<(), DisassemblyError> {
        self.check_unique(name)?;
        self.options.push(NamedOption::Bool(NamedBool { name: name.to_string(), default }));
        self.configuration.insert(name, ConfigValue::Bool(default));
        Ok(())
    }

    /// Declare an enum option; `default` must be one of `choices`.
    pub fn insert_enum<S: Into<String>>(
        &mut self,
        name: &str,
        choices: impl IntoIterator<Item = (S, u32)>,
        default: u32,
    ) -> Result<(), DisassemblyError> {
        self.check_unique(name)?;
        let option = NamedEnum {
            name: name.to_string(),
            choices: choices.into_iter().map(|(l, v)| (l.into(), v)).collect(),
            default,
        };
        if !option.accepts(default) {
            return Err(DisassemblyError::InvalidConfiguration(format!(
                "default {} of '{}' is not one of its choices",
                default, name
            )));
        }
        self.options.push(NamedOption::Enum(option));
        self.configuration.insert(name, ConfigValue::Enum(default));
        Ok(())
    }

    pub fn option(&self, name: &str) -> Option<&NamedOption> {
        self.options.iter().find(|o| o.name() == name)
    }

    /// Declared options, in declaration order.
    pub fn options(&self) -> impl Iterator<Item = &NamedOption> + '_ {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Validate and apply one value. On error nothing changes.
    pub fn set(&mut self, name: &str, value: ConfigValue) -> Result<(), DisassemblyError> {
        match (self.option(name), value) {
            (None, _) => Err(DisassemblyError::InvalidConfiguration(format!("unknown option '{}'", name))),
            (Some(NamedOption::Bool(_)), ConfigValue::Bool(_)) => {
                self.configuration.insert(name, value);
                Ok(())
            }
            (Some(NamedOption::Enum(e)), ConfigValue::Enum(v)) => {
                if !e.accepts(v) {
                    return Err(DisassemblyError::InvalidConfiguration(format!(
                        "{} is not a valid choice for '{}'",
                        v, name
                    )));
                }
                self.configuration.insert(name, value);
                Ok(())
            }
            (Some(_), _) => Err(DisassemblyError::InvalidConfiguration(format!(
                "'{}' does not take a {} value",
                name,
                match value {
                    ConfigValue::Bool(_) => "boolean",
                    ConfigValue::Enum(_) => "enumerated",
                }
            ))),
        }
    }

    /// Parse `text` according to the option kind, then [`set`](Self::set) it.
    ///
    /// Booleans accept `true`, `false`, `1` and `0`; enums accept a choice
    /// label or its numeric value.
    pub fn set_from_str(&mut self, name: &str, text: &str) -> Result<(), DisassemblyError> {
        let text = text.trim();
        let value = match self.option(name) {
            None => return Err(DisassemblyError::InvalidConfiguration(format!("unknown option '{}'", name))),
            Some(NamedOption::Bool(_)) => match text.to_ascii_lowercase().as_str() {
                "true" | "1" => ConfigValue::Bool(true),
                "false" | "0" => ConfigValue::Bool(false),
                _ => {
                    return Err(DisassemblyError::InvalidConfiguration(format!(
                        "'{}' expects true/false, got '{}'",
                        name, text
                    )))
                }
            },
            Some(NamedOption::Enum(e)) => match e.value_of(text).or_else(|| text.parse().ok()) {
                Some(v) => ConfigValue::Enum(v),
                None => {
                    return Err(DisassemblyError::InvalidConfiguration(format!(
                        "'{}' is not a choice of '{}'",
                        text, name
                    )))
                }
            },
        };
        self.set(name, value)
    }

    /// Apply a `name=value` assignment.
    pub fn apply_assignment(&mut self, assignment: &str) -> Result<(), DisassemblyError> {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            DisassemblyError::InvalidConfiguration(format!("expected name=value, got '{}'", assignment))
        })?;
        self.set_from_str(name.trim(), value)
    }

    /// Wire shape of every option with its current value.
    pub fn describe(&self) -> Vec<OptionDescriptor> {
        self.options
            .iter()
            .map(|option| match option {
                NamedOption::Bool(b) => OptionDescriptor {
                    kind: OptionKind::Bool,
                    name: b.name.clone(),
                    choices: None,
                    current: self.configuration.get(&b.name).unwrap_or(ConfigValue::Bool(b.default)),
                },
                NamedOption::Enum(e) => OptionDescriptor {
                    kind: OptionKind::Enum,
                    name: e.name.clone(),
                    choices: Some(
                        e.choices
                            .iter()
                            .map(|(label, value)| Choice { label: label.clone(), value: *value })
                            .collect(),
                    ),
                    current: self.configuration.get(&e.name).unwrap_or(ConfigValue::Enum(e.default)),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn model() -> ConfigurationModel {
        let mut model = ConfigurationModel::new();
        model
            .insert_enum("mode", [("16-bit", 16), ("32-bit", 32), ("64-bit", 64)], 32)
            .unwrap();
        model.insert_bool("big_endian", false).unwrap();
        model
    }

    #[test]
    fn test_defaults_populate_configuration() {
        let model = model();
        assert_eq!(model.configuration().get_enum("mode"), Some(32));
        assert_eq!(model.configuration().get_bool("big_endian"), Some(false));
        let names: Vec<_> = model.options().map(NamedOption::name).collect();
        assert_eq!(names, vec!["mode", "big_endian"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut model = model();
        assert!(matches!(
            model.insert_bool("mode", true),
            Err(DisassemblyError::InvalidConfiguration(_))
        ));
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn test_enum_default_must_be_a_choice() {
        let mut model = ConfigurationModel::new();
        assert!(model.insert_enum("abi", [("sysv", 0)], 1).is_err());
        assert!(model.is_empty());
    }

    #[test]
    fn test_enum_rejection_leaves_value() {
        let mut model = model();
        let err = model.set("mode", ConfigValue::Enum(8)).unwrap_err();
        assert!(matches!(err, DisassemblyError::InvalidConfiguration(_)));
        assert_eq!(model.configuration().get_enum("mode"), Some(32));
        model.set("mode", ConfigValue::Enum(64)).unwrap();
        assert_eq!(model.configuration().get_enum("mode"), Some(64));
    }

    #[rstest]
    #[case("unknown", ConfigValue::Bool(true))]
    #[case("mode", ConfigValue::Bool(true))]
    #[case("big_endian", ConfigValue::Enum(1))]
    fn test_set_rejections(#[case] name: &str, #[case] value: ConfigValue) {
        let mut model = model();
        let before = model.configuration().clone();
        assert!(model.set(name, value).is_err());
        assert_eq!(model.configuration(), &before);
    }

    #[rstest]
    #[case("mode", "64-bit", ConfigValue::Enum(64))]
    #[case("mode", "16", ConfigValue::Enum(16))]
    #[case("mode", "32-BIT", ConfigValue::Enum(32))]
    #[case("big_endian", "true", ConfigValue::Bool(true))]
    #[case("big_endian", "0", ConfigValue::Bool(false))]
    fn test_set_from_str(#[case] name: &str, #[case] text: &str, #[case] expected: ConfigValue) {
        let mut model = model();
        model.set_from_str(name, text).unwrap();
        assert_eq!(model.configuration().get(name), Some(expected));
    }

    #[test]
    fn test_assignment() {
        let mut model = model();
        model.apply_assignment("big_endian=1").unwrap();
        assert_eq!(model.configuration().get_bool("big_endian"), Some(true));
        assert!(model.apply_assignment("mode").is_err());
        assert!(model.apply_assignment("mode=128-bit").is_err());
    }

    #[test]
    fn test_describe_wire_shape() {
        let model = model();
        let json = serde_json::to_value(model.describe()).unwrap();
        assert_eq!(json[0]["kind"], "Enum");
        assert_eq!(json[0]["name"], "mode");
        assert_eq!(json[0]["choices"][2]["label"], "64-bit");
        assert_eq!(json[0]["current"], 32);
        assert_eq!(json[1]["kind"], "Bool");
        assert!(json[1].get("choices").is_none());
        assert_eq!(json[1]["current"], false);
    }
}
