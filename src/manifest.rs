//! The manifest and image config JSON staged into the build directory by
//! the image pull.

use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use camino::Utf8Path;
use oci_spec::image::{ImageConfiguration, ImageManifest};

pub(crate) const MANIFEST_JSON: &str = "manifest.json";
pub(crate) const CONFIG_FILE: &str = "content";

pub(crate) fn read_manifest(build: &Utf8Path) -> Result<ImageManifest> {
    let path = build.join(MANIFEST_JSON);
    let f = File::open(&path)
        .map(BufReader::new)
        .with_context(|| format!("Opening {path}"))?;
    serde_json::from_reader(f).with_context(|| format!("Parsing {path}"))
}

pub(crate) fn read_config(build: &Utf8Path) -> Result<ImageConfiguration> {
    let path = build.join(CONFIG_FILE);
    let f = File::open(&path)
        .map(BufReader::new)
        .with_context(|| format!("Opening {path}"))?;
    serde_json::from_reader(f).with_context(|| format!("Parsing {path}"))
}

/// Digests in checkout order (layers oldest first, the config last), as
/// bare hex tokens without the algorithm prefix.
pub(crate) fn digest_tokens(manifest: &ImageManifest) -> Vec<String> {
    manifest
        .layers()
        .iter()
        .chain(std::iter::once(manifest.config()))
        .map(|descriptor| descriptor.digest().digest().to_string())
        .collect()
}

/// `NAME=VALUE` pairs from the image config, split on the first `=`.
pub(crate) fn environment(config: &ImageConfiguration) -> Vec<(String, String)> {
    config
        .config()
        .as_ref()
        .and_then(|c| c.env().as_ref())
        .map(|env| {
            env.iter()
                .map(|entry| match entry.split_once('=') {
                    Some((name, value)) => (name.to_string(), value.to_string()),
                    None => (entry.clone(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn command(config: &ImageConfiguration) -> Option<&[String]> {
    config
        .config()
        .as_ref()
        .and_then(|c| c.cmd().as_ref())
        .map(|cmd| cmd.as_slice())
        .filter(|cmd| !cmd.is_empty())
}
