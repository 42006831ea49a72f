use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

/// Create a compact binary delta between two SquashFS 4.0 images.
///
/// Both images are expanded into temporary files under $TMPDIR and handed
/// to `xdelta3`, which must be on the PATH.
#[derive(Debug, Parser)]
#[command(name = "sqdelta", version)]
struct Opt {
    /// Source image
    source: PathBuf,
    /// Target image
    target: PathBuf,
    /// Patch file to write
    patch: PathBuf,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    squashdelta::diff(&opt.source, &opt.target, &opt.patch).with_context(|| {
        format!(
            "failed to create a delta from {} to {}",
            opt.source.display(),
            opt.target.display()
        )
    })
}
