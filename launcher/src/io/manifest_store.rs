//! Launch manifests stored as JSON files.
//!
//! Loading checks the document against the embedded schema, deserializes it,
//! and then applies the semantic invariants in [`crate::core::invariants`].

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::manifest::{LaunchManifest, ManifestSpec};

pub const V1_SCHEMA: &str = include_str!("../../schemas/manifest/v1.schema.json");

/// Load and validate a manifest file.
///
/// Relative binding paths and the working directory are resolved against the
/// directory containing the manifest.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_manifest(path: &Path) -> Result<LaunchManifest> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut spec = parse_manifest(&raw).with_context(|| format!("load {}", path.display()))?;
    let base = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().context("resolve current directory")?,
    };
    spec.rebase(&base);
    debug!(bindings = spec.bindings.len(), "manifest loaded");
    spec.build()
        .with_context(|| format!("validate {}", path.display()))
}

/// Parse a manifest document and check it against the v1 schema.
pub fn parse_manifest(raw: &str) -> Result<ManifestSpec> {
    let instance: Value = serde_json::from_str(raw).context("parse manifest json")?;
    let schema: Value = serde_json::from_str(V1_SCHEMA).context("parse manifest schema")?;
    validate_schema(&instance, &schema)?;
    let spec: ManifestSpec =
        serde_json::from_value(instance).context("parse manifest as v1 struct")?;
    Ok(spec)
}

/// Write `spec` as pretty-printed JSON with a trailing newline.
pub fn write_manifest(path: &Path, spec: &ManifestSpec) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(spec).context("serialize manifest json")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::{BindingSource, ChannelBinding, ChannelId, Direction};
    use std::path::PathBuf;

    const PREFIX_MANIFEST: &str = r#"{
        "program": "/usr/bin/env",
        "args": ["sh", "prefix.sh"],
        "bindings": [
            {"channel": {"fd": 0}, "kind": "file", "source": {"path": "in.txt"}},
            {"channel": {"fd": 1}, "kind": "file", "source": {"path": "out.txt"}},
            {"channel": {"env": "PREFIX"}, "kind": "env_var", "source": {"literal": "X:"}}
        ]
    }"#;

    #[test]
    fn parses_documented_shape() {
        let spec = parse_manifest(PREFIX_MANIFEST).expect("parse");
        assert_eq!(spec.program, PathBuf::from("/usr/bin/env"));
        assert_eq!(spec.bindings.len(), 3);
        assert_eq!(spec.bindings[2].channel, ChannelId::Env("PREFIX".to_string()));
        assert!(spec.build().is_ok());
    }

    #[test]
    fn schema_rejects_unknown_kind() {
        let raw = r#"{"program": "cat", "bindings": [
            {"channel": {"fd": 0}, "kind": "socket", "source": {"path": "x"}}
        ]}"#;
        let err = parse_manifest(raw).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn schema_rejects_descriptor_out_of_range() {
        let raw = r#"{"program": "cat", "bindings": [
            {"channel": {"fd": 4096}, "kind": "pipe", "direction": "write"}
        ]}"#;
        assert!(parse_manifest(raw).is_err());
    }

    #[test]
    fn load_rebases_relative_paths_on_manifest_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("launch.json");
        fs::write(&path, PREFIX_MANIFEST).expect("write manifest");

        let manifest = load_manifest(&path).expect("load");
        assert_eq!(
            manifest.bindings()[0].source,
            Some(BindingSource::Path(temp.path().join("in.txt")))
        );
    }

    #[test]
    fn load_reports_invariant_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("launch.json");
        let raw = r#"{"program": "cat", "bindings": [
            {"channel": {"arg": 1}, "kind": "cli_arg", "source": {"literal": "!"}}
        ]}"#;
        fs::write(&path, raw).expect("write manifest");

        let err = load_manifest(&path).unwrap_err();
        assert!(format!("{err:#}").contains("missing arg[0]"), "{err:#}");
    }

    #[test]
    fn written_manifest_loads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("launch.json");
        let spec = ManifestSpec::new("cat")
            .bind(ChannelBinding::file(3, "side.txt", Direction::Write))
            .bind(ChannelBinding::arg(0, "-n"));
        write_manifest(&path, &spec).expect("write");

        let manifest = load_manifest(&path).expect("load");
        assert_eq!(manifest.args(), &[] as &[String]);
        assert_eq!(manifest.bindings().len(), 2);
    }
}
