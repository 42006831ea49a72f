//! Compact binary deltas between SquashFS 4.0 images.
//!
//! Two builds of mostly-identical content produce wildly different image
//! bytes, because every block is compressed independently and recompression
//! scrambles them. This crate expands each image in place (every compressed
//! extent replaced by a sparse hole, its decompressed payload appended after
//! the tail) so that unchanged content becomes byte-identical again and an
//! external `xdelta3` yields a small patch. The inverse walk recompresses
//! every recorded extent bit-for-bit.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! squashdelta::diff(
//!     Path::new("old.squashfs"),
//!     Path::new("new.squashfs"),
//!     Path::new("update.sqdelta"),
//! )?;
//! # Ok::<(), squashdelta::Error>(())
//! ```

pub mod codec;
pub mod delta;
mod error;
pub mod expand;
pub mod extent;
pub mod fragment;
pub mod image;
pub mod inode;
pub mod metadata;
pub mod read;
pub mod types;

pub use codec::Codec;
pub use delta::{apply, diff, load_image, LoadedImage};
pub use error::{Error, Result};
pub use extent::{collect_extents, drop_matched, Extent};
pub use image::Image;
pub use types::SuperBlock;
