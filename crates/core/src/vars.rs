//! Named runtime variables.
//!
//! [`VarRegistry`] is an explicit registry of tunable values (integers, floats and
//! strings) that components register by name at startup. It is created once,
//! optionally overridden from the `[vars]` table of a [`Config`](crate::Config),
//! and then passed by reference to whoever needs it.
//!
//! # Example
//!
//! ```
//! use renderer_core::{VarFlags, VarRegistry};
//!
//! let mut vars = VarRegistry::new();
//! let sort = vars
//!     .create_int_ranged(
//!         "render.sort_objects",
//!         "Sort draws by pipeline and mesh",
//!         1,
//!         0,
//!         1,
//!         VarFlags::empty(),
//!     )
//!     .unwrap();
//! assert_eq!(sort, 1);
//!
//! vars.set_int("render.sort_objects", 7).unwrap(); // clamped to the range
//! assert_eq!(vars.get_int("render.sort_objects"), Some(1));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Behavior flags attached to a variable.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct VarFlags: u32 {
        /// Hidden from editors and listings.
        const NO_EDIT = 1 << 1;
        /// Visible but cannot be changed after creation.
        const READ_ONLY = 1 << 2;
        /// Only shown in advanced listings.
        const ADVANCED = 1 << 3;
    }
}

/// The current value of a variable.
#[derive(Clone, Debug, PartialEq)]
pub enum VarValue {
    Int(i32),
    Float(f64),
    Str(String),
}

impl VarValue {
    fn kind(&self) -> &'static str {
        match self {
            VarValue::Int(_) => "int",
            VarValue::Float(_) => "float",
            VarValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Int(v) => write!(f, "{v}"),
            VarValue::Float(v) => write!(f, "{v}"),
            VarValue::Str(v) => write!(f, "\"{v}\""),
        }
    }
}

#[derive(Clone, Debug)]
struct VarEntry {
    description: String,
    flags: VarFlags,
    default: VarValue,
    value: VarValue,
    range: Option<(f64, f64)>,
}

impl VarEntry {
    fn clamp_int(&self, value: i32) -> i32 {
        match self.range {
            Some((min, max)) => value.clamp(min as i32, max as i32),
            None => value,
        }
    }

    fn clamp_float(&self, value: f64) -> f64 {
        match self.range {
            Some((min, max)) => value.clamp(min, max),
            None => value,
        }
    }
}

/// Registry of named variables with get-or-create semantics.
#[derive(Debug, Default)]
pub struct VarRegistry {
    vars: BTreeMap<String, VarEntry>,
}

impl VarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an integer variable, or returns the current value if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable with the same name but a different type exists.
    pub fn create_int(
        &mut self,
        name: &str,
        description: &str,
        default: i32,
        flags: VarFlags,
    ) -> Result<i32> {
        match self.get_or_create(name, description, VarValue::Int(default), None, flags)? {
            VarValue::Int(v) => Ok(*v),
            other => Err(type_mismatch(name, "int", other)),
        }
    }

    /// Creates an integer variable clamped to `[min, max]`.
    pub fn create_int_ranged(
        &mut self,
        name: &str,
        description: &str,
        default: i32,
        min: i32,
        max: i32,
        flags: VarFlags,
    ) -> Result<i32> {
        let range = Some((f64::from(min), f64::from(max)));
        let default = VarValue::Int(default.clamp(min, max));
        match self.get_or_create(name, description, default, range, flags)? {
            VarValue::Int(v) => Ok(*v),
            other => Err(type_mismatch(name, "int", other)),
        }
    }

    /// Creates a float variable, or returns the current value if it already exists.
    pub fn create_float(
        &mut self,
        name: &str,
        description: &str,
        default: f64,
        flags: VarFlags,
    ) -> Result<f64> {
        match self.get_or_create(name, description, VarValue::Float(default), None, flags)? {
            VarValue::Float(v) => Ok(*v),
            other => Err(type_mismatch(name, "float", other)),
        }
    }

    /// Creates a float variable clamped to `[min, max]`.
    pub fn create_float_ranged(
        &mut self,
        name: &str,
        description: &str,
        default: f64,
        min: f64,
        max: f64,
        flags: VarFlags,
    ) -> Result<f64> {
        let default = VarValue::Float(default.clamp(min, max));
        match self.get_or_create(name, description, default, Some((min, max)), flags)? {
            VarValue::Float(v) => Ok(*v),
            other => Err(type_mismatch(name, "float", other)),
        }
    }

    /// Creates a string variable, or returns the current value if it already exists.
    pub fn create_string(
        &mut self,
        name: &str,
        description: &str,
        default: &str,
        flags: VarFlags,
    ) -> Result<String> {
        let default = VarValue::Str(default.to_owned());
        match self.get_or_create(name, description, default, None, flags)? {
            VarValue::Str(v) => Ok(v.clone()),
            other => Err(type_mismatch(name, "string", other)),
        }
    }

    fn get_or_create(
        &mut self,
        name: &str,
        description: &str,
        default: VarValue,
        range: Option<(f64, f64)>,
        flags: VarFlags,
    ) -> Result<&VarValue> {
        let entry = self.vars.entry(name.to_owned()).or_insert_with(|| {
            debug!("Registered variable {} = {}", name, default);
            VarEntry {
                description: description.to_owned(),
                flags,
                default: default.clone(),
                value: default.clone(),
                range,
            }
        });

        if std::mem::discriminant(&entry.value) != std::mem::discriminant(&default) {
            return Err(type_mismatch(name, default.kind(), &entry.value));
        }
        Ok(&entry.value)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.vars.get(name).map(|e| &e.value)
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            VarValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            VarValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            VarValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Returns the description a variable was registered with.
    pub fn description(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|e| e.description.as_str())
    }

    /// Sets an integer variable, clamping to its range. Returns the stored value.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unknown, not an integer, or read-only.
    pub fn set_int(&mut self, name: &str, value: i32) -> Result<i32> {
        let entry = self.writable(name)?;
        let clamped = entry.clamp_int(value);
        match &mut entry.value {
            VarValue::Int(v) => {
                *v = clamped;
                Ok(clamped)
            }
            other => Err(type_mismatch(name, "int", other)),
        }
    }

    /// Sets a float variable, clamping to its range. Returns the stored value.
    pub fn set_float(&mut self, name: &str, value: f64) -> Result<f64> {
        let entry = self.writable(name)?;
        let clamped = entry.clamp_float(value);
        match &mut entry.value {
            VarValue::Float(v) => {
                *v = clamped;
                Ok(clamped)
            }
            other => Err(type_mismatch(name, "float", other)),
        }
    }

    pub fn set_string(&mut self, name: &str, value: &str) -> Result<()> {
        let entry = self.writable(name)?;
        match &mut entry.value {
            VarValue::Str(v) => {
                value.clone_into(v);
                Ok(())
            }
            other => Err(type_mismatch(name, "string", other)),
        }
    }

    /// Flips an integer variable between zero and one.
    pub fn toggle(&mut self, name: &str) -> Result<i32> {
        let current = self.get_int(name).ok_or_else(|| Error::Var {
            name: name.to_owned(),
            message: "not an integer variable".to_owned(),
        })?;
        self.set_int(name, if current == 0 { 1 } else { 0 })
    }

    /// Restores a variable to its registered default.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let entry = self.writable(name)?;
        entry.value = entry.default.clone();
        Ok(())
    }

    /// Applies a `[vars]` table. Returns how many variables were changed.
    ///
    /// Booleans are accepted for integer variables. Unknown names are skipped with a warning
    /// because the component that registers them may not be loaded.
    pub fn apply_overrides(&mut self, table: &toml::Table) -> Result<usize> {
        let mut applied = 0;
        for (name, value) in table {
            let Some(current) = self.get(name).cloned() else {
                warn!("Ignoring override for unknown variable '{}'", name);
                continue;
            };

            match (&current, value) {
                (VarValue::Int(_), toml::Value::Integer(v)) => {
                    let v = i32::try_from(*v).map_err(|_| Error::Var {
                        name: name.clone(),
                        message: format!("{v} does not fit in an int variable"),
                    })?;
                    self.set_int(name, v)?;
                }
                (VarValue::Int(_), toml::Value::Boolean(v)) => {
                    self.set_int(name, i32::from(*v))?;
                }
                (VarValue::Float(_), toml::Value::Float(v)) => {
                    self.set_float(name, *v)?;
                }
                (VarValue::Float(_), toml::Value::Integer(v)) => {
                    self.set_float(name, *v as f64)?;
                }
                (VarValue::Str(_), toml::Value::String(v)) => {
                    self.set_string(name, v)?;
                }
                (current, value) => {
                    return Err(Error::Var {
                        name: name.clone(),
                        message: format!(
                            "cannot assign {} to a {} variable",
                            value.type_str(),
                            current.kind()
                        ),
                    });
                }
            }
            debug!("Variable {} overridden from config", name);
            applied += 1;
        }
        Ok(applied)
    }

    /// Iterates over editable variables (everything not flagged `NO_EDIT`).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VarValue, VarFlags)> {
        self.vars
            .iter()
            .filter(|(_, e)| !e.flags.contains(VarFlags::NO_EDIT))
            .map(|(name, e)| (name.as_str(), &e.value, e.flags))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn writable(&mut self, name: &str) -> Result<&mut VarEntry> {
        let entry = self.vars.get_mut(name).ok_or_else(|| Error::Var {
            name: name.to_owned(),
            message: "unknown variable".to_owned(),
        })?;
        if entry.flags.contains(VarFlags::READ_ONLY) {
            return Err(Error::Var {
                name: name.to_owned(),
                message: "variable is read-only".to_owned(),
            });
        }
        Ok(entry)
    }
}

fn type_mismatch(name: &str, expected: &str, found: &VarValue) -> Error {
    Error::Var {
        name: name.to_owned(),
        message: format!("expected {expected} variable, found {}", found.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_keeps_existing_value() {
        let mut vars = VarRegistry::new();
        assert_eq!(vars.create_int("a", "first", 3, VarFlags::empty()).unwrap(), 3);
        vars.set_int("a", 9).unwrap();
        assert_eq!(vars.create_int("a", "second", 3, VarFlags::empty()).unwrap(), 9);
        assert_eq!(vars.description("a"), Some("first"));
    }

    #[test]
    fn test_type_conflict_is_an_error() {
        let mut vars = VarRegistry::new();
        vars.create_int("a", "", 1, VarFlags::empty()).unwrap();
        assert!(vars.create_float("a", "", 1.0, VarFlags::empty()).is_err());
        assert!(vars.set_string("a", "x").is_err());
    }

    #[test]
    fn test_ranges_clamp() {
        let mut vars = VarRegistry::new();
        vars.create_float_ranged("look", "", 5.0, 0.5, 10.0, VarFlags::empty())
            .unwrap();
        assert_eq!(vars.set_float("look", 20.0).unwrap(), 10.0);
        assert_eq!(vars.set_float("look", 0.0).unwrap(), 0.5);
        assert_eq!(
            vars.create_int_ranged("n", "", 50, 0, 10, VarFlags::empty()).unwrap(),
            10
        );
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut vars = VarRegistry::new();
        vars.create_string("build", "", "debug", VarFlags::READ_ONLY)
            .unwrap();
        assert!(vars.set_string("build", "release").is_err());
        assert_eq!(vars.get_string("build"), Some("debug"));
    }

    #[test]
    fn test_combined_flags() {
        let mut vars = VarRegistry::new();
        let flags = VarFlags::READ_ONLY | VarFlags::ADVANCED;
        vars.create_int("limit", "", 4, flags).unwrap();
        assert!(vars.set_int("limit", 8).is_err());
        assert!(flags.contains(VarFlags::ADVANCED));
        assert!(!flags.contains(VarFlags::NO_EDIT));
        assert!(VarFlags::empty().is_empty());
    }

    #[test]
    fn test_toggle_and_reset() {
        let mut vars = VarRegistry::new();
        vars.create_int("flag", "", 1, VarFlags::empty()).unwrap();
        assert_eq!(vars.toggle("flag").unwrap(), 0);
        assert_eq!(vars.toggle("flag").unwrap(), 1);
        vars.set_int("flag", 0).unwrap();
        vars.reset("flag").unwrap();
        assert_eq!(vars.get_int("flag"), Some(1));
    }

    #[test]
    fn test_apply_overrides() {
        let mut vars = VarRegistry::new();
        vars.create_int("i", "", 0, VarFlags::empty()).unwrap();
        vars.create_float("f", "", 0.0, VarFlags::empty()).unwrap();
        vars.create_string("s", "", "", VarFlags::empty()).unwrap();

        let table: toml::Table = toml::from_str(
            r#"
            i = true
            f = 2
            s = "hello"
            unknown = 1
            "#,
        )
        .unwrap();

        assert_eq!(vars.apply_overrides(&table).unwrap(), 3);
        assert_eq!(vars.get_int("i"), Some(1));
        assert_eq!(vars.get_float("f"), Some(2.0));
        assert_eq!(vars.get_string("s"), Some("hello"));
    }

    #[test]
    fn test_apply_overrides_type_error() {
        let mut vars = VarRegistry::new();
        vars.create_int("i", "", 0, VarFlags::empty()).unwrap();
        let table: toml::Table = toml::from_str("i = \"text\"").unwrap();
        assert!(vars.apply_overrides(&table).is_err());
    }

    #[test]
    fn test_iter_hides_no_edit() {
        let mut vars = VarRegistry::new();
        vars.create_int("visible", "", 0, VarFlags::ADVANCED).unwrap();
        vars.create_int("hidden", "", 0, VarFlags::NO_EDIT).unwrap();
        let names: Vec<_> = vars.iter().map(|(n, _, _)| n).collect();
        assert_eq!(names, vec!["visible"]);
        assert_eq!(vars.len(), 2);
    }
}
