//! Free-form name=value options attached to a flow for emission.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Separator between appended values of the same option.
pub const OPTION_SEPARATOR: &str = ";";

/// Ordered scratch map of options printed at the end of the flow log line.
#[derive(Debug, Default, Clone)]
pub struct OptionsContainer {
    options: BTreeMap<String, String>,
}

impl OptionsContainer {
    /// Sets or appends an option value. With `append`, the value is added to
    /// the existing one separated by `separator`; unless `append_same` is
    /// set, a value already contained in the option is not added again.
    pub fn register(
        &mut self,
        name: &str,
        value: &str,
        append: bool,
        append_same: bool,
        separator: &str,
    ) {
        let slot = self.options.entry(name.to_string()).or_default();
        if append {
            if slot.is_empty() {
                slot.push_str(value);
            } else if append_same || !slot.contains(value) {
                slot.push_str(separator);
                slot.push_str(value);
            }
        } else {
            slot.clear();
            slot.push_str(value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// `|name=value` pairs for the flow log tail.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.options {
            let _ = write!(out, "|{}={}", name, value);
        }
        out
    }
}
