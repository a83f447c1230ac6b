//! Materialize a container image into the repository by forking skopeo.

use std::fmt;
use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::image::ImageReference;

/// The pull tool failed; the process exits with the tool's status.
#[derive(Debug)]
pub(crate) struct PullFailed {
    pub code: i32,
}

impl fmt::Display for PullFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image pull failed with status {}", self.code)
    }
}

impl std::error::Error for PullFailed {}

/// `skopeo copy` deposits the manifest and image config under the image's
/// `ociimage/` ref plus one commit per layer digest.
pub(crate) fn pull(image: &ImageReference, repo: &Utf8Path) -> Result<()> {
    tracing::debug!("Pulling {image} into {repo}");
    let status = Command::new("skopeo")
        .arg("copy")
        .arg(format!("docker://{image}"))
        .arg(format!("ostree:{image}@{repo}"))
        .status()
        .context("Running skopeo")?;
    if !status.success() {
        return Err(PullFailed {
            code: status.code().unwrap_or(1),
        }
        .into());
    }
    Ok(())
}
