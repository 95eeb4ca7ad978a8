//! Port template rewriting.
//!
//! A definition names its ports in order (`["console", "ssh", ...]`).
//! Allocated ports are matched to names by position, and the resulting
//! map is substituted into the artifact wherever `${port:<name>}` appears.

use std::collections::BTreeMap;

use regex::{Captures, Regex};

use crate::error::{CapacityError, CapacityResult};

/// Pair each logical port name with the port at the same position.
pub fn rewrite_template(names: &[String], ports: &[u16]) -> CapacityResult<BTreeMap<String, u16>> {
    if names.len() != ports.len() {
        return Err(CapacityError::TemplateMismatch {
            names: names.len(),
            ports: ports.len(),
        });
    }
    Ok(names.iter().cloned().zip(ports.iter().copied()).collect())
}

/// Substitute `${port:<name>}` placeholders in artifact content.
///
/// A placeholder whose name is not in `mapping` fails the rewrite.
pub fn rewrite_artifact(content: &str, mapping: &BTreeMap<String, u16>) -> CapacityResult<String> {
    let placeholder = Regex::new(r"\$\{port:([A-Za-z0-9_.-]+)\}")?;

    if let Some(unknown) = placeholder
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .find(|name| !mapping.contains_key(name))
    {
        return Err(CapacityError::UnknownPlaceholder(unknown));
    }

    let rewritten = placeholder.replace_all(content, |caps: &Captures<'_>| {
        mapping
            .get(&caps[1])
            .map(|port| port.to_string())
            .unwrap_or_default()
    });
    Ok(rewritten.into_owned())
}
