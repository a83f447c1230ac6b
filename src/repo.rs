//! Adapter over the content-addressed ostree repository.

use std::collections::BTreeMap;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::ptr;

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use fn_error_context::context;
use ostree::prelude::*;
use ostree::{gio, glib};

/// Subdirectory libostree keeps uncompressed object copies in. There is no
/// API to purge it, so the janitor reaches in by name.
pub(crate) const UNCOMPRESSED_CACHE_DIR: &str = "uncompressed-objects-cache";

pub(crate) struct Store {
    repo: ostree::Repo,
    path: Utf8PathBuf,
}

impl Store {
    /// Open the repository at `path`, initializing it in bare-user mode on
    /// first use.
    #[context("Opening repository at {path}")]
    pub(crate) fn open(path: &Utf8Path) -> Result<Self> {
        let repo = ostree::Repo::create_at(
            libc::AT_FDCWD,
            path.as_str(),
            ostree::RepoMode::BareUser,
            None,
            gio::Cancellable::NONE,
        )?;
        Ok(Store {
            repo,
            path: path.to_owned(),
        })
    }

    pub(crate) fn repo(&self) -> &ostree::Repo {
        &self.repo
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub(crate) fn url(&self) -> String {
        format!("file://{}", self.path)
    }

    /// Resolve a ref to its commit, mapping "no such ref" to `None`.
    pub(crate) fn resolve(&self, refspec: &str) -> Result<Option<String>> {
        let commit = self.repo.resolve_rev(refspec, true)?;
        Ok(commit.map(|c| c.into()))
    }

    /// Enumerate refs; when a prefix is given the names come back without
    /// it.
    pub(crate) fn list_refs(&self, prefix: Option<&str>) -> Result<BTreeMap<String, String>> {
        let refs = self.repo.list_refs(prefix, gio::Cancellable::NONE)?;
        Ok(refs
            .into_iter()
            .map(|(r, commit)| (r.into(), commit.into()))
            .collect())
    }

    /// Stage a ref update in the currently open transaction; `None`
    /// deletes the ref.
    pub(crate) fn set_ref(&self, refspec: &str, commit: Option<&str>) {
        self.repo.transaction_set_ref(None, refspec, commit);
    }

    /// Overlay the tree of `refspec` onto `dir`, unioning file content
    /// with whatever earlier checkouts put there.
    #[context("Checking out {refspec}")]
    pub(crate) fn checkout(&self, refspec: &str, dir: &Dir) -> Result<()> {
        let commit = self
            .resolve(refspec)?
            .ok_or_else(|| anyhow!("No such ref {refspec}"))?;
        let options = ostree::RepoCheckoutAtOptions {
            mode: ostree::RepoCheckoutMode::User,
            overwrite_mode: ostree::RepoCheckoutOverwriteMode::UnionFiles,
            process_whiteouts: true,
            ..Default::default()
        };
        self.repo.checkout_at(
            Some(&options),
            dir.as_raw_fd(),
            ".",
            &commit,
            gio::Cancellable::NONE,
        )?;
        Ok(())
    }

    /// Read one file out of a commit's tree.
    #[context("Reading {path} from {rev}")]
    pub(crate) fn read_commit_file(&self, rev: &str, path: &str) -> Result<String> {
        let (root, _) = self.repo.read_commit(rev, gio::Cancellable::NONE)?;
        let file = root.resolve_relative_path(path);
        let file = file.downcast_ref::<ostree::RepoFile>().unwrap();
        repo_file_read_to_string(file)
    }

    /// Write `dir` as a commit with canonicalized permissions, so
    /// identical inputs hash identically regardless of the build
    /// directory's modes.
    #[context("Committing build directory")]
    pub(crate) fn commit(&self, dir: &Dir, parent: Option<&str>, subject: &str) -> Result<String> {
        let cancellable = gio::Cancellable::NONE;
        self.repo.scan_hardlinks(cancellable)?;
        let modifier = ostree::RepoCommitModifier::new(
            ostree::RepoCommitModifierFlags::CANONICAL_PERMISSIONS,
            None,
        );
        let mtree = ostree::MutableTree::new();
        self.repo
            .write_dfd_to_mtree(dir.as_raw_fd(), ".", &mtree, Some(&modifier), cancellable)
            .context("Writing tree")?;
        let root = self.repo.write_mtree(&mtree, cancellable)?;
        let root = root.downcast_ref::<ostree::RepoFile>().unwrap();
        let commit = self
            .repo
            .write_commit(parent, Some(subject), None, None, root, cancellable)
            .context("Writing commit")?;
        Ok(commit.into())
    }

    pub(crate) fn regenerate_summary(&self) -> Result<()> {
        self.repo
            .regenerate_summary(None, gio::Cancellable::NONE)?;
        Ok(())
    }

    /// Delete objects unreachable from any ref; returns (objects seen,
    /// objects deleted, bytes reclaimed).
    pub(crate) fn prune(&self) -> Result<(i32, i32, u64)> {
        Ok(self
            .repo
            .prune(ostree::RepoPruneFlags::REFS_ONLY, 0, gio::Cancellable::NONE)?)
    }
}

/// Equivalent of `g_file_read()` for [`ostree::RepoFile`], which does not
/// implement the `GFile` read vtable entry through the bindings
/// (https://github.com/ostreedev/ostree/issues/2703).
fn repo_file_read(f: &ostree::RepoFile) -> Result<gio::InputStream, glib::Error> {
    use glib::translate::*;
    let stream = unsafe {
        let f = f.upcast_ref::<gio::File>();
        let mut error = ptr::null_mut();
        let stream = gio::ffi::g_file_read(f.to_glib_none().0, ptr::null_mut(), &mut error);
        if !error.is_null() {
            return Err(from_glib_full(error));
        }
        from_glib_full(stream as *mut gio::ffi::GInputStream)
    };
    Ok(stream)
}

fn repo_file_read_to_string(f: &ostree::RepoFile) -> Result<String> {
    let mut contents = String::new();
    let mut stream = repo_file_read(f)?.into_read();
    stream.read_to_string(&mut contents)?;
    Ok(contents)
}
