mod cleanup;
mod cmdutils;
mod convert;
mod flatpak;
mod image;
mod manifest;
mod progress;
mod pull;
mod repo;
mod treeops;

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::cleanup::CleanupMode;

#[derive(Debug, Parser)]
#[command(version, about = "Convert container images into flatpak runtimes")]
struct CliArgs {
    /// Image reference, `[server/]name[:tag]`.
    image: Option<String>,

    /// Enable debug logging.
    #[clap(long)]
    verbose: bool,

    /// Keep the temporary build directory on success.
    #[clap(long)]
    keep_build_dir: bool,

    /// Override the derived runtime id.
    #[clap(long, short = 'i')]
    runtime_id: Option<String>,

    /// Override the derived runtime branch.
    #[clap(long, short = 'b')]
    runtime_branch: Option<String>,

    /// Clean the repository instead of converting an image.
    #[clap(long, value_enum)]
    cleanup: Option<CleanupMode>,
}

/// Everything under the user data directory, created on demand.
pub(crate) struct Dirs {
    pub repo: Utf8PathBuf,
    pub builds: Utf8PathBuf,
}

impl Dirs {
    fn new() -> Result<Self> {
        let data: Utf8PathBuf = ostree::glib::user_data_dir()
            .try_into()
            .context("Non-UTF-8 user data directory")?;
        let data = data.join("flatpod");
        let dirs = Dirs {
            repo: data.join("repo"),
            builds: data.join("builds"),
        };
        std::fs::create_dir_all(&dirs.repo).with_context(|| format!("Creating {}", dirs.repo))?;
        std::fs::create_dir_all(&dirs.builds)
            .with_context(|| format!("Creating {}", dirs.builds))?;
        Ok(dirs)
    }
}

fn run(args: CliArgs, dirs: &Dirs) -> Result<()> {
    if let Some(mode) = args.cleanup {
        return cleanup::run(mode, dirs);
    }
    let Some(image) = args.image else {
        bail!("An image reference is required unless --cleanup is given");
    };
    convert::run(
        &convert::ConvertOpts {
            image,
            runtime_id: args.runtime_id,
            runtime_branch: args.runtime_branch,
            keep_build_dir: args.keep_build_dir,
        },
        dirs,
    )
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .init();
    let dirs = Dirs::new()?;
    // The pull tool stages layer blobs under TMPDIR; keep those on the
    // same filesystem as the repository.
    // SAFETY: no other threads exist yet.
    unsafe { std::env::set_var("TMPDIR", &dirs.builds) };
    if let Err(e) = run(args, &dirs) {
        if let Some(pull_failure) = e.downcast_ref::<pull::PullFailed>() {
            eprintln!("error: {e:#}");
            std::process::exit(pull_failure.code);
        }
        return Err(e);
    }
    Ok(())
}
