//! The diff and apply drivers.
//!
//! `diff` turns two images into temp expanded files, hands them to `xdelta3`
//! and assembles the patch; `apply` rebuilds the expanded source from the
//! patch envelope, pipes the delta through `xdelta3 -d`, and recompresses
//! the recovered expanded target back into the original image bytes.

use std::env;
use std::fs::File;
use std::io::SeekFrom;
use std::path::Path;
use std::process::{Command, Stdio};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::codec::Codec;
use crate::expand::{rebuild_expanded, recompress, write_expanded, Envelope, SparseWriter};
use crate::extent::{collect_extents, drop_matched, Extent};
use crate::image::Image;
use crate::types::{SuperBlock, SUPERBLOCK_SIZE};
use crate::{Error, Result};

/// An opened image with its superblock and codec.
pub struct LoadedImage {
    pub image: Image,
    pub superblock: SuperBlock,
    pub codec: Codec,
}

/// Open an image, validate the superblock, and set the codec up from the
/// compression-options blob when the image carries one.
pub fn load_image(path: &Path) -> Result<LoadedImage> {
    let image = Image::open(path)?;
    let superblock = SuperBlock::read_from(image.slice(0, SUPERBLOCK_SIZE)?)?;

    let options = if superblock.has_compressor_options() {
        let mut cursor = image.cursor();
        cursor.seek(SeekFrom::Start(SUPERBLOCK_SIZE as u64))?;
        // a plain 16-bit length followed by that many raw bytes
        let length = cursor.read_u16()? as usize;
        Some(cursor.read_slice(length)?.to_vec())
    } else {
        None
    };

    let codec = Codec::for_superblock(&superblock, options.as_deref())?;
    Ok(LoadedImage {
        image,
        superblock,
        codec,
    })
}

/// Produce `patch` such that applying it to `source` reconstructs `target`.
pub fn diff(source: &Path, target: &Path, patch: &Path) -> Result<()> {
    let mut src = load_image(source)?;
    let mut tgt = load_image(target)?;

    let mut src_extents = collect_extents(&src.image, &src.superblock, &mut src.codec)?;
    let mut tgt_extents = collect_extents(&tgt.image, &tgt.superblock, &mut tgt.codec)?;
    info!(
        source_extents = src_extents.len(),
        target_extents = tgt_extents.len(),
        "images walked"
    );
    drop_matched(&mut src_extents, &mut tgt_extents);
    info!(
        source_residual = src_extents.len(),
        target_residual = tgt_extents.len(),
        "shared blocks matched"
    );

    let src_expanded = expand_to_temp(
        &src.image,
        &mut src_extents,
        &mut src.codec,
        src.superblock.block_size,
    )?;
    let tgt_expanded = expand_to_temp(
        &tgt.image,
        &mut tgt_extents,
        &mut tgt.codec,
        tgt.superblock.block_size,
    )?;

    let source_tag = src.codec.tag();
    let target_tag = tgt.codec.tag();
    if source_tag != target_tag {
        return Err(Error::CodecMismatch {
            src_codec: source_tag,
            target: target_tag,
        });
    }

    let mut patch_file = File::create(patch)?;
    Envelope {
        compression_tag: source_tag,
        extents: src_extents,
    }
    .write_leading(&mut patch_file)?;

    run_differ(src_expanded.path(), tgt_expanded.path(), patch_file)
}

/// Apply `patch` to `source`, writing the reconstructed target image.
pub fn apply(source: &Path, patch: &Path, target: &Path) -> Result<()> {
    let mut patch_file = File::open(patch)?;
    let envelope = Envelope::read_leading(&mut patch_file)?;
    let mut codec = Codec::from_tag(envelope.compression_tag)?;
    info!(
        extents = envelope.extents.len(),
        tag = envelope.compression_tag,
        "patch envelope read"
    );

    let image = Image::open(source)?;
    let src_expanded = NamedTempFile::new_in(env::temp_dir())?;
    let mut writer = SparseWriter::new(src_expanded.reopen()?);
    rebuild_expanded(&image, &envelope, &mut codec, &mut writer)?;

    // the patch file handle now sits right after the envelope, at the delta
    let tgt_expanded = NamedTempFile::new_in(env::temp_dir())?;
    run_patcher(src_expanded.path(), patch_file, tgt_expanded.reopen()?)?;

    let expanded = Image::open(tgt_expanded.path())?;
    let mut out = File::create(target)?;
    recompress(&expanded, &mut out)
}

fn expand_to_temp(
    image: &Image,
    extents: &mut Vec<Extent>,
    codec: &mut Codec,
    block_size: u32,
) -> Result<NamedTempFile> {
    let tmp = NamedTempFile::new_in(env::temp_dir())?;
    let mut writer = SparseWriter::new(tmp.reopen()?);
    write_expanded(image, extents, codec, block_size, &mut writer)?;
    Ok(tmp)
}

fn run_differ(source: &Path, target: &Path, patch: File) -> Result<()> {
    let mut command = Command::new("xdelta3");
    command
        .args(["-v", "-9", "-S", "djw", "-s"])
        .arg(source)
        .arg(target)
        .stdout(Stdio::from(patch));
    debug!(?command, "invoking differ");
    let status = command.status()?;
    check_status("xdelta3", status)
}

fn run_patcher(source: &Path, patch: File, output: File) -> Result<()> {
    let mut command = Command::new("xdelta3");
    command
        .args(["-v", "-d", "-s"])
        .arg(source)
        .stdin(Stdio::from(patch))
        .stdout(Stdio::from(output));
    debug!(?command, "invoking patcher");
    let status = command.status()?;
    check_status("xdelta3", status)
}

fn check_status(command: &str, status: std::process::ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::ChildFailed {
            command: command.into(),
            status: status.to_string(),
        })
    }
}
