use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

/// Reconstruct a SquashFS image by applying a squashdelta patch.
///
/// The source image is re-expanded under $TMPDIR, the embedded delta is
/// decoded through `xdelta3 -d`, and every recorded block is recompressed
/// back into place.
#[derive(Debug, Parser)]
#[command(name = "sqmerge", version)]
struct Opt {
    /// Source image the patch was created against
    source: PathBuf,
    /// Patch file
    patch: PathBuf,
    /// Target image to write
    target: PathBuf,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    squashdelta::apply(&opt.source, &opt.patch, &opt.target).with_context(|| {
        format!(
            "failed to apply {} to {}",
            opt.patch.display(),
            opt.source.display()
        )
    })
}
