//! `${NAME}` expansion in stage commands, directories and patterns
//!
//! Only references to known variables are replaced. Anything else is left
//! verbatim for the shell, which receives the same variables in its
//! environment.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static VAR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable reference pattern is valid")
});

/// Replaces every `${NAME}` whose name is present in `vars`
pub fn expand(template: &str, vars: &BTreeMap<String, String>) -> String {
    VAR_REF
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Expands each value against `base`, then layers the result on top of it
///
/// Values may refer to variables already in `base` but not to siblings.
pub fn overlay(
    base: &BTreeMap<String, String>,
    entries: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    for (key, value) in entries {
        merged.insert(key.clone(), expand(value, base));
    }
    merged
}
