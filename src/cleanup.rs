//! The repository janitor: stale build directories, unused branches, and
//! unreferenced objects.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use clap::ValueEnum;
use fn_error_context::context;
use ostree::{gio, glib};

use crate::Dirs;
use crate::image::ImageReference;
use crate::progress::Progress;
use crate::repo::{Store, UNCOMPRESSED_CACHE_DIR};
use crate::{flatpak, manifest, treeops};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum CleanupMode {
    /// Only delete build directories and prune unreferenced objects.
    Prune,
    /// Also delete every OCI image branch.
    Oci,
    /// Also delete branches no installed runtime uses.
    Unused,
    /// Everything above, plus the uncompressed-object cache.
    All,
}

pub(crate) fn run(mode: CleanupMode, dirs: &Dirs) -> Result<()> {
    let progress = Progress::new();
    let mut bytes = 0u64;

    progress.task("Deleting stale build directories");
    treeops::make_deletable(&dirs.builds)?;
    for entry in dirs
        .builds
        .read_dir_utf8()
        .with_context(|| format!("Reading {}", dirs.builds))?
    {
        bytes += treeops::delete_recursively(entry?.path(), Some(&progress))?;
    }

    if mode == CleanupMode::All {
        let cache = dirs.repo.join(UNCOMPRESSED_CACHE_DIR);
        if cache.symlink_metadata().is_ok() {
            progress.task("Purging uncompressed object cache");
            treeops::make_deletable(&cache)?;
            bytes += treeops::delete_recursively(&cache, Some(&progress))?;
        }
    }

    let store = Store::open(&dirs.repo)?;
    if mode != CleanupMode::Prune {
        let tx = store.repo().auto_transaction(gio::Cancellable::NONE)?;
        let mut unused = BTreeSet::new();
        if matches!(mode, CleanupMode::Unused | CleanupMode::All) {
            unused = unused_refs(&store, mode == CleanupMode::All)?;
        }
        if matches!(mode, CleanupMode::Oci | CleanupMode::All) {
            unused.extend(
                store
                    .list_refs(Some("ociimage"))?
                    .into_keys()
                    .map(|r| format!("ociimage/{r}")),
            );
        }
        for refspec in &unused {
            tracing::debug!("Deleting unused ref {refspec}");
            store.set_ref(refspec, None);
        }
        tx.commit(gio::Cancellable::NONE)?;
    }

    progress.task("Pruning repository");
    let (_, deleted, pruned_bytes) = store.prune()?;
    tracing::debug!("Pruned {deleted} objects");
    bytes += pruned_bytes;
    progress.finish();

    println!("{:.2}mb deleted", bytes as f64 / (1024.0 * 1024.0));
    Ok(())
}

/// Subtract everything an installed runtime still needs from the
/// candidate set, rather than materializing a reverse reference graph.
#[context("Computing unused refs")]
fn unused_refs(store: &Store, include_oci_branches: bool) -> Result<BTreeSet<String>> {
    unused_refs_impl(store, &flatpak::installed_runtimes()?, include_oci_branches)
}

fn unused_refs_impl(
    store: &Store,
    installed: &[String],
    include_oci_branches: bool,
) -> Result<BTreeSet<String>> {
    let mut candidates: BTreeSet<String> = if include_oci_branches {
        store.list_refs(None)?.into_keys().collect()
    } else {
        store
            .list_refs(Some("runtime"))?
            .into_keys()
            .map(|r| format!("runtime/{r}"))
            .collect()
    };
    // Installed refs already carry the runtime/ prefix.
    for refspec in installed {
        candidates.remove(refspec);
        if !include_oci_branches {
            continue;
        }
        let Some(commit) = store.resolve(refspec)? else {
            continue;
        };
        let image = originating_image(store, &commit)?;
        candidates.remove(&image.ostree_ref());
        // The image branch may be gone already; then its layers are either
        // shared with a still-live image or unreferenced anyway.
        let Some(image_commit) = store.resolve(&image.ostree_ref())? else {
            continue;
        };
        for token in image_digest_tokens(store, &image_commit)? {
            candidates.remove(&format!("ociimage/{token}"));
        }
    }
    Ok(candidates)
}

/// The image reference recorded in a runtime commit's provenance stamp.
fn originating_image(store: &Store, commit: &str) -> Result<ImageReference> {
    let data = store.read_commit_file(commit, "files/.flatpod-info")?;
    let kf = glib::KeyFile::new();
    kf.load_from_data(&data, glib::KeyFileFlags::NONE)
        .context("Parsing .flatpod-info")?;
    kf.string("Image", "name")?.parse()
}

fn image_digest_tokens(store: &Store, commit: &str) -> Result<Vec<String>> {
    let data = store.read_commit_file(commit, manifest::MANIFEST_JSON)?;
    let parsed: oci_spec::image::ImageManifest =
        serde_json::from_str(&data).context("Parsing image manifest")?;
    Ok(manifest::digest_tokens(&parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use cap_std::fs::Dir;

    fn manifest_json(layers: &[&str], config: &str) -> String {
        let layers = layers
            .iter()
            .map(|digest| {
                format!(
                    r#"{{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                         "digest": "sha256:{digest}", "size": 2}}"#
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"{{"schemaVersion": 2,
                 "config": {{"mediaType": "application/vnd.oci.image.config.v1+json",
                             "digest": "sha256:{config}", "size": 2}},
                 "layers": [{layers}]}}"#
        )
    }

    fn commit_at(store: &Store, refspec: &str, files: &[(&str, &str)]) {
        let td = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = td.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        let dir = Dir::open_ambient_dir(td.path(), cap_std::ambient_authority()).unwrap();
        let cancellable = gio::Cancellable::NONE;
        let tx = store.repo().auto_transaction(cancellable).unwrap();
        let commit = store.commit(&dir, None, "test commit").unwrap();
        store.set_ref(refspec, Some(&commit));
        tx.commit(cancellable).unwrap();
    }

    fn stage_image(store: &Store, image: &ImageReference, layers: &[&str], config: &str) {
        commit_at(
            store,
            &image.ostree_ref(),
            &[
                ("manifest.json", manifest_json(layers, config).as_str()),
                ("content", "{}"),
            ],
        );
        for digest in layers.iter().copied().chain(std::iter::once(config)) {
            commit_at(store, &format!("ociimage/{digest}"), &[("blob", "x")]);
        }
    }

    fn stage_runtime(store: &Store, refspec: &str, image: &ImageReference) {
        let info = format!("[Image]\nname={image}\n");
        commit_at(store, refspec, &[("files/.flatpod-info", info.as_str())]);
    }

    fn test_store(td: &tempfile::TempDir) -> Store {
        let repo_path = Utf8Path::from_path(td.path()).unwrap().join("repo");
        std::fs::create_dir_all(&repo_path).unwrap();
        Store::open(&repo_path).unwrap()
    }

    #[test]
    fn test_unused_refs_keeps_live_set() {
        let td = tempfile::tempdir().unwrap();
        let store = test_store(&td);

        let layer_a = "a".repeat(64);
        let layer_b = "b".repeat(64);
        let shared = "d".repeat(64);
        let config_a = "c".repeat(64);
        let config_b = "e".repeat(64);

        let alpine: ImageReference = "alpine:latest".parse().unwrap();
        let busybox: ImageReference = "busybox:latest".parse().unwrap();
        stage_image(&store, &alpine, &[layer_a.as_str(), shared.as_str()], &config_a);
        stage_image(&store, &busybox, &[layer_b.as_str(), shared.as_str()], &config_b);

        let installed = "runtime/io.docker.alpine/x86_64/master".to_string();
        let uninstalled = "runtime/io.docker.busybox/x86_64/master";
        stage_runtime(&store, &installed, &alpine);
        stage_runtime(&store, uninstalled, &busybox);

        let unused = unused_refs_impl(&store, &[installed.clone()], true).unwrap();

        // Everything the installed runtime depends on stays live.
        assert!(!unused.contains(&installed));
        assert!(!unused.contains(&alpine.ostree_ref()));
        assert!(!unused.contains(&format!("ociimage/{layer_a}")));
        assert!(!unused.contains(&format!("ociimage/{shared}")));
        assert!(!unused.contains(&format!("ociimage/{config_a}")));

        // The uninstalled runtime goes, along with what only it references.
        assert!(unused.contains(uninstalled));
        assert!(unused.contains(&busybox.ostree_ref()));
        assert!(unused.contains(&format!("ociimage/{layer_b}")));
        assert!(unused.contains(&format!("ociimage/{config_b}")));
    }

    #[test]
    fn test_unused_refs_runtime_branches_only() {
        let td = tempfile::tempdir().unwrap();
        let store = test_store(&td);

        let alpine: ImageReference = "alpine:latest".parse().unwrap();
        let busybox: ImageReference = "busybox:latest".parse().unwrap();
        stage_image(&store, &alpine, &["a".repeat(64).as_str()], &"c".repeat(64));

        let installed = "runtime/io.docker.alpine/x86_64/master".to_string();
        let uninstalled = "runtime/io.docker.busybox/x86_64/master";
        stage_runtime(&store, &installed, &alpine);
        stage_runtime(&store, uninstalled, &busybox);

        let unused = unused_refs_impl(&store, &[installed.clone()], false).unwrap();

        assert!(!unused.contains(&installed));
        assert!(unused.contains(uninstalled));
        // Image branches are out of scope for this mode.
        assert!(unused.iter().all(|r| r.starts_with("runtime/")));
    }
}
