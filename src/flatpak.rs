//! The flatpak side: remote registration, installation, and the installed
//! set the janitor subtracts from.

use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use fn_error_context::context;

use crate::cmdutils::CommandRunExt;
use crate::image::RuntimeInfo;

pub(crate) const REMOTE_NAME: &str = "flatpod-origin";

fn flatpak() -> Command {
    let mut cmd = Command::new("flatpak");
    cmd.arg("--user");
    cmd
}

/// Point `flatpod-origin` at the repository, without GPG verification.
#[context("Registering remote {REMOTE_NAME}")]
pub(crate) fn register_remote(url: &str) -> Result<()> {
    flatpak()
        .args([
            "remote-add",
            "--if-not-exists",
            "--no-gpg-verify",
            REMOTE_NAME,
            url,
        ])
        .run()?;
    flatpak()
        .args(["remote-modify", "--no-gpg-verify", REMOTE_NAME])
        .arg(format!("--url={url}"))
        .run()
}

/// Install the runtime, falling through to an update when it is already
/// present.
#[context("Installing {}", runtime.full_name())]
pub(crate) fn install_or_update(runtime: &RuntimeInfo) -> Result<()> {
    let target = runtime.ostree_ref();
    let output = flatpak()
        .args(["install", "--noninteractive", REMOTE_NAME, &target])
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .output()
        .context("Running flatpak install")?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.contains("already installed") {
        bail!("flatpak install failed: {}", stderr.trim());
    }
    tracing::debug!("{target} already installed, updating");
    flatpak().args(["update", "--noninteractive", &target]).run()
}

/// Installed runtime refs originating from our remote, in the full
/// `runtime/<id>/<arch>/<branch>` form.
pub(crate) fn installed_runtimes() -> Result<Vec<String>> {
    let out = flatpak()
        .args(["list", "--runtime", "--columns=origin,ref"])
        .run_get_output()?;
    Ok(out
        .lines()
        .filter_map(|line| {
            let (origin, refspec) = line.split_once('\t')?;
            if origin.trim() != REMOTE_NAME {
                return None;
            }
            // The ref column is not guaranteed to carry the kind prefix.
            let refspec = refspec.trim();
            Some(match refspec.strip_prefix("runtime/") {
                Some(_) => refspec.to_string(),
                None => format!("runtime/{refspec}"),
            })
        })
        .collect())
}
