//! Filesystem surgery on the per-run build directory.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::progress::Progress;

/// Entries that never belong in a runtime image, removed together with the
/// staging files left behind by the image pull.
const GARBAGE_ENTRIES: &[&str] = &[
    "dev",
    "home",
    "media",
    "mnt",
    "proc",
    "root",
    "run",
    "sys",
    "tmp",
    "var/cache",
    "var/mail",
    "var/tmp",
    "var/run",
    "content",
    "manifest.json",
];

/// Delete a subtree without following symlinks, children before their
/// directories. Returns the bytes the entries accounted for.
pub(crate) fn delete_recursively(path: &Utf8Path, progress: Option<&Progress>) -> Result<u64> {
    let meta = path
        .symlink_metadata()
        .with_context(|| format!("Inspecting {path}"))?;
    let mut bytes = meta.len();
    if meta.is_dir() {
        for entry in path
            .read_dir_utf8()
            .with_context(|| format!("Reading {path}"))?
        {
            bytes += delete_recursively(entry?.path(), progress)?;
        }
        fs::remove_dir(path).with_context(|| format!("Removing directory {path}"))?;
    } else {
        fs::remove_file(path).with_context(|| format!("Removing {path}"))?;
    }
    if let Some(progress) = progress {
        progress.advance();
    }
    Ok(bytes)
}

/// Checked-out image trees carry read-only directories which block
/// deletion; give every directory back `u+rwx` first.
pub(crate) fn make_deletable(path: &Utf8Path) -> Result<()> {
    let meta = path
        .symlink_metadata()
        .with_context(|| format!("Inspecting {path}"))?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        rustix::fs::chmod(
            path.as_std_path(),
            rustix::fs::Mode::from_bits_truncate(mode | 0o700),
        )
        .with_context(|| format!("Fixing permissions of {path}"))?;
    }
    for entry in path
        .read_dir_utf8()
        .with_context(|| format!("Reading {path}"))?
    {
        make_deletable(entry?.path())?;
    }
    Ok(())
}

pub(crate) struct MergeOptions<'a> {
    /// Absolute symlink targets resolve against this directory.
    pub root: &'a Utf8Path,
    /// Leave `src` itself in place after its contents have moved.
    pub keep_root: bool,
}

/// Lexical normalization; `..` never escapes past the leading root.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_str()),
        }
    }
    out
}

/// Where `link` points, relative to its parent directory or to `root` for
/// absolute targets. `None` when `link` is not a symlink.
fn resolve_link(link: &Utf8Path, root: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    let meta = link
        .symlink_metadata()
        .with_context(|| format!("Inspecting {link}"))?;
    if !meta.is_symlink() {
        return Ok(None);
    }
    let target = link
        .read_link_utf8()
        .with_context(|| format!("Reading link {link}"))?;
    let resolved = if target.is_absolute() {
        root.join(target.strip_prefix("/").unwrap_or(&target))
    } else {
        link.parent().unwrap_or(root).join(&target)
    };
    Ok(Some(normalize(&resolved)))
}

/// Merge the contents of `src` into `dst`, then remove `src` itself unless
/// `keep_root` is set.
///
/// When one side of a name collision is a symlink resolving to the other
/// side, the symlink is the copy that dies; both directions must be
/// checked before recursing or moving, otherwise `/usr/local`-style trees
/// lose data. Moves are plain renames and fail loudly across filesystems.
#[context("Merging {src} into {dst}")]
pub(crate) fn merge_to(src: &Utf8Path, dst: &Utf8Path, options: &MergeOptions) -> Result<()> {
    // Snapshot the entries up front; the loop renames them away under the
    // running directory iterator otherwise.
    let entries = src
        .read_dir_utf8()
        .with_context(|| format!("Reading {src}"))?
        .collect::<std::io::Result<Vec<_>>>()?;
    for entry in entries {
        let src_child = entry.path();
        if src_child == dst {
            // Merging a directory into one of its own children.
            continue;
        }
        let dst_child = dst.join(entry.file_name());
        if dst_child.symlink_metadata().is_ok() {
            if resolve_link(src_child, options.root)?.as_deref() == Some(dst_child.as_path()) {
                fs::remove_file(src_child).with_context(|| format!("Removing alias {src_child}"))?;
                continue;
            }
            if resolve_link(&dst_child, options.root)?.as_deref() == Some(src_child) {
                fs::remove_file(&dst_child)
                    .with_context(|| format!("Removing alias {dst_child}"))?;
            }
        }
        if entry.file_type()?.is_dir() {
            merge_to(
                src_child,
                &dst_child,
                &MergeOptions {
                    root: options.root,
                    keep_root: false,
                },
            )?;
        } else {
            if dst.symlink_metadata().is_err() {
                fs::create_dir_all(dst).with_context(|| format!("Creating {dst}"))?;
            }
            fs::rename(src_child, &dst_child)
                .with_context(|| format!("Moving {src_child} to {dst_child}"))?;
        }
    }
    if !options.keep_root {
        fs::remove_dir(src).with_context(|| format!("Removing {src}"))?;
    }
    Ok(())
}

/// Flatten `/usr` into the root. `/usr/local` goes first so its entries
/// land in their `/usr` counterparts before those move up themselves.
#[context("Merging /usr in {root}")]
pub(crate) fn merge_usr(root: &Utf8Path) -> Result<()> {
    let usr = root.join("usr");
    anyhow::ensure!(usr.is_dir(), "No /usr directory in {root}");
    let local = usr.join("local");
    if local.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
        merge_to(
            &local,
            root,
            &MergeOptions {
                root,
                keep_root: false,
            },
        )?;
    }
    merge_to(
        &usr,
        root,
        &MergeOptions {
            root,
            keep_root: false,
        },
    )
}

/// Drop the entries a runtime image must not carry.
#[context("Cleaning garbage entries in {root}")]
pub(crate) fn clean_garbage(root: &Utf8Path) -> Result<()> {
    for name in GARBAGE_ENTRIES {
        let path = root.join(name);
        let Ok(meta) = path.symlink_metadata() else {
            continue;
        };
        if meta.is_dir() {
            match fs::remove_dir(&path) {
                Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
                    delete_recursively(&path, None)?;
                }
                r => r.with_context(|| format!("Removing {path}"))?,
            }
        } else {
            fs::remove_file(&path).with_context(|| format!("Removing {path}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::fs::symlink;

    fn testdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().to_owned();
        (td, path)
    }

    fn touch(path: &Utf8Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_merge_drops_src_symlink_alias() {
        let (_td, root) = testdir();
        let a = root.join("a");
        let b = root.join("b");
        touch(&b.join("x"), "real");
        fs::create_dir_all(&a).unwrap();
        symlink("../b/x", a.join("x")).unwrap();
        let ino = b.join("x").metadata().unwrap().ino();

        merge_to(
            &a,
            &b,
            &MergeOptions {
                root: &root,
                keep_root: false,
            },
        )
        .unwrap();

        assert!(a.symlink_metadata().is_err());
        let meta = b.join("x").symlink_metadata().unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.ino(), ino);
        assert_eq!(fs::read_to_string(b.join("x")).unwrap(), "real");
    }

    #[test]
    fn test_merge_replaces_dst_symlink_alias() {
        let (_td, root) = testdir();
        let a = root.join("a");
        let b = root.join("b");
        touch(&a.join("x"), "real");
        fs::create_dir_all(&b).unwrap();
        // Absolute targets resolve against the merge root.
        symlink("/a/x", b.join("x")).unwrap();

        merge_to(
            &a,
            &b,
            &MergeOptions {
                root: &root,
                keep_root: false,
            },
        )
        .unwrap();

        assert!(a.symlink_metadata().is_err());
        let meta = b.join("x").symlink_metadata().unwrap();
        assert!(meta.is_file());
        assert_eq!(fs::read_to_string(b.join("x")).unwrap(), "real");
    }

    #[test]
    fn test_merge_into_own_child() {
        let (_td, root) = testdir();
        touch(&root.join("etc/passwd"), "root:x:0:0");
        touch(&root.join("usr/bin/sh"), "#!");
        let files = root.join("files");
        fs::create_dir(&files).unwrap();

        merge_to(
            &root,
            &files,
            &MergeOptions {
                root: &root,
                keep_root: true,
            },
        )
        .unwrap();

        assert!(root.is_dir());
        assert!(files.join("etc/passwd").is_file());
        assert!(files.join("usr/bin/sh").is_file());
        assert!(root.join("etc").symlink_metadata().is_err());
        assert!(root.join("usr").symlink_metadata().is_err());
    }

    #[test]
    fn test_usr_merge_ordering() {
        let (_td, root) = testdir();
        touch(&root.join("usr/local/bin/foo"), "foo");
        touch(&root.join("usr/bin/bar"), "bar");

        merge_usr(&root).unwrap();

        assert!(root.join("bin/foo").is_file());
        assert!(root.join("bin/bar").is_file());
        assert!(root.join("usr").symlink_metadata().is_err());
    }

    #[test]
    fn test_usr_merge_through_merged_root_links() {
        // A usrmerge-style root: /bin is a symlink to usr/bin.
        let (_td, root) = testdir();
        touch(&root.join("usr/bin/sh"), "sh");
        touch(&root.join("usr/local/bin/tool"), "tool");
        symlink("usr/bin", root.join("bin")).unwrap();

        merge_usr(&root).unwrap();

        assert!(root.join("bin").symlink_metadata().unwrap().is_dir());
        assert!(root.join("bin/sh").is_file());
        assert!(root.join("bin/tool").is_file());
        assert!(root.join("usr").symlink_metadata().is_err());
    }

    #[test]
    fn test_clean_garbage_idempotent() {
        let (_td, root) = testdir();
        touch(&root.join("var/cache/apk/index"), "x");
        touch(&root.join("manifest.json"), "{}");
        touch(&root.join("content"), "{}");
        fs::create_dir_all(root.join("proc")).unwrap();
        touch(&root.join("usr/bin/sh"), "sh");

        clean_garbage(&root).unwrap();
        assert!(root.join("var/cache").symlink_metadata().is_err());
        assert!(root.join("manifest.json").symlink_metadata().is_err());
        assert!(root.join("content").symlink_metadata().is_err());
        assert!(root.join("proc").symlink_metadata().is_err());
        assert!(root.join("usr/bin/sh").is_file());

        clean_garbage(&root).unwrap();
        assert!(root.join("usr/bin/sh").is_file());
    }

    #[test]
    fn test_delete_recursively_counts() {
        let (_td, root) = testdir();
        let target = root.join("sub");
        touch(&target.join("a"), "aaaa");
        touch(&target.join("d/b"), "bb");

        let bytes = delete_recursively(&target, None).unwrap();
        assert!(bytes >= 6);
        assert!(target.symlink_metadata().is_err());
    }

    #[test]
    fn test_make_deletable() {
        let (_td, root) = testdir();
        let target = root.join("sub");
        touch(&target.join("d/f"), "x");
        fs::set_permissions(target.join("d"), fs::Permissions::from_mode(0o500)).unwrap();

        make_deletable(&target).unwrap();
        delete_recursively(&target, None).unwrap();
        assert!(target.symlink_metadata().is_err());
    }
}
