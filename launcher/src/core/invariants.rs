//! Semantic manifest invariants not expressible via JSON Schema.

use std::collections::BTreeMap;

use crate::core::manifest::{ChannelId, ManifestSpec};

/// Check manifest invariants:
/// - Program is non-empty
/// - Every binding forms a coherent plan (kind, channel, source, direction)
/// - No channel is bound twice
/// - Positional argument bindings are contiguous from 0
pub fn validate_manifest(spec: &ManifestSpec) -> Vec<String> {
    let mut errors = Vec::new();

    if spec.program.as_os_str().is_empty() {
        errors.push("program must not be empty".to_string());
    }

    let mut seen: BTreeMap<&ChannelId, usize> = BTreeMap::new();
    let mut positions = Vec::new();
    for (index, binding) in spec.bindings.iter().enumerate() {
        let label = format!("bindings[{index}] ({})", binding.channel);
        if let Some(first) = seen.insert(&binding.channel, index) {
            errors.push(format!(
                "{label}: duplicate channel, first bound at bindings[{first}]"
            ));
            seen.insert(&binding.channel, first);
        }
        if let Err(reason) = binding.plan() {
            errors.push(format!("{label}: {reason}"));
        }
        if let ChannelId::Arg(position) = binding.channel {
            positions.push(position);
        }
    }

    positions.sort_unstable();
    positions.dedup();
    if let Some(gap) = positions
        .iter()
        .enumerate()
        .find_map(|(expected, &actual)| (expected != actual).then_some(expected))
    {
        errors.push(format!(
            "positional argument bindings must be contiguous from 0 (missing arg[{gap}])"
        ));
    }

    errors
}
