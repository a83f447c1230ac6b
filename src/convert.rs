//! The image-to-runtime conversion pipeline.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use oci_spec::image::ImageConfiguration;
use ostree::{gio, glib};

use crate::Dirs;
use crate::cmdutils::CommandRunExt;
use crate::image::{self, ImageReference, RuntimeInfo};
use crate::manifest;
use crate::progress::Progress;
use crate::repo::Store;
use crate::treeops::{self, MergeOptions};
use crate::{flatpak, pull};

/// Session initialization sourced by every shell in the sandbox. Runs each
/// drop-in once per sandbox instance, and recomputes `PS1` once per shell
/// session when the metadata wrapper did not already do it.
const OCI_INIT: &str = r#"#!/bin/sh
if [ ! -e /var/run/.oci-init ] && [ -d /etc/oci-init.d ]; then
  . /etc/oci-init.d/*.sh
  touch /var/run/.oci-init
fi
if [ -z "$__OCI_INIT_PS1" ]; then
  unset PS1
  PS1="$($SHELL -c 'echo $PS1') "
  if [ -n "$BASH_VERSION" ]; then
    [ -z "$__OCI_INIT_BASH_ENV" ] || source "$__OCI_INIT_BASH_ENV"
  else
    [ -z "$__OCI_INIT_ENV" ] || source "$__OCI_INIT_ENV"
  fi
fi
"#;

/// Fallback prompt when the image sets none: re-derive it from the shell.
const DEFAULT_PS1: &str = "$($SHELL -c 'echo $PS1') ";

const LINK_OPT: &str = "[ -e /opt ] || ln -s /usr/opt /opt\n";

pub(crate) struct ConvertOpts {
    pub image: String,
    pub runtime_id: Option<String>,
    pub runtime_branch: Option<String>,
    pub keep_build_dir: bool,
}

pub(crate) fn run(opts: &ConvertOpts, dirs: &Dirs) -> Result<()> {
    let image: ImageReference = opts.image.parse()?;
    let store = Store::open(&dirs.repo)?;
    pull::pull(&image, store.path())?;

    let build = tempfile::Builder::new()
        .prefix(&format!("{}.", image.escaped()))
        .tempdir_in(&dirs.builds)
        .context("Creating build directory")?;
    let build_path: Utf8PathBuf = build
        .path()
        .to_path_buf()
        .try_into()
        .context("Non-UTF-8 build directory")?;

    let runtime = match convert_in(&store, &image, opts, &build_path) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!(
                "\x1b[1;31m[ERROR]\x1b[0m Conversion failed, partial tree kept at {build_path}"
            );
            let _ = build.keep();
            return Err(e);
        }
    };

    if opts.keep_build_dir {
        println!("Build directory kept at {build_path}");
        let _ = build.keep();
    } else {
        treeops::make_deletable(&build_path)?;
        build.close().context("Removing build directory")?;
    }
    println!("Installed {}", runtime.full_name());
    Ok(())
}

#[context("Converting {image}")]
fn convert_in(
    store: &Store,
    image: &ImageReference,
    opts: &ConvertOpts,
    build: &Utf8Path,
) -> Result<RuntimeInfo> {
    let progress = Progress::new();
    let build_dir = Dir::open_ambient_dir(build, cap_std::ambient_authority())
        .with_context(|| format!("Opening {build}"))?;

    progress.task("Unpacking image");
    store.checkout(&image.ostree_ref(), &build_dir)?;
    let manifest = manifest::read_manifest(build)?;
    let config = manifest::read_config(build)?;
    let tokens = manifest::digest_tokens(&manifest);
    let total = tokens.len();
    for (i, token) in tokens.iter().enumerate() {
        progress.task(format!("Unpacking layer {}/{total}", i + 1));
        store.checkout(&format!("ociimage/{token}"), &build_dir)?;
    }

    let arch = image::flatpak_arch(&config.architecture().to_string())?;
    let runtime = RuntimeInfo::new(
        image,
        opts.runtime_id.clone(),
        opts.runtime_branch.clone(),
        arch.to_string(),
    );
    tracing::debug!("Building runtime {}", runtime.full_name());

    progress.task("Preparing tree");
    treeops::clean_garbage(build)?;
    treeops::merge_usr(build)?;
    let files = build.join("files");
    fs::create_dir(&files).context("Creating files/")?;
    treeops::merge_to(
        build,
        &files,
        &MergeOptions {
            root: build,
            keep_root: true,
        },
    )?;

    progress.task("Writing runtime files");
    write_metadata(&build_dir, &runtime, &config)?;
    write_appdata(&build_dir, build, &runtime)?;
    write_scripts(&build_dir, &config)?;
    write_image_info(&build_dir, image)?;

    progress.task("Committing");
    commit_runtime(store, &build_dir, &runtime)?;
    progress.finish();

    flatpak::register_remote(&store.url())?;
    flatpak::install_or_update(&runtime)?;
    Ok(runtime)
}

/// The flatpak `metadata` file naming the runtime and carrying the image
/// environment into the sandbox.
fn write_metadata(
    build_dir: &Dir,
    runtime: &RuntimeInfo,
    config: &ImageConfiguration,
) -> Result<()> {
    let full_name = runtime.full_name();
    let kf = glib::KeyFile::new();
    kf.set_string("Runtime", "name", &runtime.id);
    kf.set_string("Runtime", "runtime", &full_name);
    kf.set_string("Runtime", "sdk", &full_name);

    let mut image_ps1 = None;
    let mut image_env = String::new();
    let mut image_bash_env = String::new();
    for (name, value) in manifest::environment(config) {
        match name.as_str() {
            "PS1" => image_ps1 = Some(value.clone()),
            "ENV" => image_env = value.clone(),
            "BASH_ENV" => image_bash_env = value.clone(),
            _ => {}
        }
        kf.set_string("Environment", &name, &value);
    }
    // The wrapper sources oci-init once, then hands the prompt back to
    // whatever the image wanted it to be.
    kf.set_string(
        "Environment",
        "PS1",
        &format!(
            "$(__OCI_INIT_PS1=1 . /usr/bin/oci-init){}",
            image_ps1.as_deref().unwrap_or(DEFAULT_PS1)
        ),
    );
    kf.set_string("Environment", "__OCI_INIT_ENV", &image_env);
    kf.set_string("Environment", "__OCI_INIT_BASH_ENV", &image_bash_env);
    kf.set_string("Environment", "ENV", "/usr/bin/oci-init");
    kf.set_string("Environment", "BASH_ENV", "/usr/bin/oci-init");

    build_dir
        .atomic_write("metadata", kf.to_data().as_bytes())
        .context("Writing metadata")?;
    Ok(())
}

/// Minimal appstream component, compiled by the external compose tool.
#[context("Writing appdata for {}", runtime.id)]
fn write_appdata(build_dir: &Dir, build: &Utf8Path, runtime: &RuntimeInfo) -> Result<()> {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<component type="runtime">
  <id>{id}</id>
  <name>{name}</name>
  <metadata_license>CC0-1.0</metadata_license>
  <summary>Flatpod-generated runtime</summary>
</component>
"#,
        id = runtime.id,
        name = runtime.full_name(),
    );
    build_dir
        .create_dir_all("files/share/appdata")
        .context("Creating appdata directory")?;
    build_dir.atomic_write(
        format!("files/share/appdata/{}.appdata.xml", runtime.id),
        xml.as_bytes(),
    )?;
    Command::new("appstream-compose")
        .arg(format!("--prefix={build}/files"))
        .arg(format!("--basename={}", runtime.id))
        .arg("--origin=flatpak")
        .arg(&runtime.id)
        .stdout(Stdio::null())
        .run()
        .context("Compiling appstream data")
}

fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn write_executable(build_dir: &Dir, path: &str, content: &str) -> Result<()> {
    let perms = cap_std::fs::Permissions::from_std(fs::Permissions::from_mode(0o755));
    build_dir
        .atomic_write_with_perms(path, content.as_bytes(), perms)
        .with_context(|| format!("Writing {path}"))
}

/// The launch and init scripts under `files/bin`, plus the `/opt` drop-in
/// when the image ships one.
fn write_scripts(build_dir: &Dir, config: &ImageConfiguration) -> Result<()> {
    build_dir
        .create_dir_all("files/bin")
        .context("Creating files/bin")?;
    if let Some(cmd) = manifest::command(config) {
        let words: Vec<String> = cmd.iter().map(|w| shell_quote(w)).collect();
        let script = format!("#!/bin/sh\nexec {} \"$@\"", words.join(" "));
        write_executable(build_dir, "files/bin/oci-run", &script)?;
    }
    write_executable(build_dir, "files/bin/oci-init", OCI_INIT)?;
    if build_dir.symlink_metadata("files/opt").is_ok() {
        build_dir
            .create_dir_all("files/etc/oci-init.d")
            .context("Creating oci-init.d")?;
        build_dir.atomic_write("files/etc/oci-init.d/link-opt.sh", LINK_OPT.as_bytes())?;
    }
    Ok(())
}

/// Provenance stamp the janitor uses to map an installed runtime back to
/// the image refs it still needs.
fn write_image_info(build_dir: &Dir, image: &ImageReference) -> Result<()> {
    let kf = glib::KeyFile::new();
    kf.set_string("Image", "name", &image.to_string());
    build_dir
        .atomic_write("files/.flatpod-info", kf.to_data().as_bytes())
        .context("Writing .flatpod-info")
}

/// Publish the build directory as the new tip of the runtime branch. The
/// ref moves atomically with the transaction.
#[context("Committing runtime")]
fn commit_runtime(store: &Store, build_dir: &Dir, runtime: &RuntimeInfo) -> Result<()> {
    let cancellable = gio::Cancellable::NONE;
    let target = runtime.ostree_ref();
    let tx = store.repo().auto_transaction(cancellable)?;
    let parent = store.resolve(&target)?;
    let subject = format!(
        "flatpod update on {}",
        chrono::Utc::now()
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let commit = store.commit(build_dir, parent.as_deref(), &subject)?;
    store.set_ref(&target, Some(&commit));
    tx.commit(cancellable)?;
    store.regenerate_summary()?;
    tracing::debug!("{target} => {commit}");
    Ok(())
}
