use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all squashdelta operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of file")]
    Eof,

    #[error("not a SquashFS image (bad magic)")]
    NotSquashfs,

    #[error("SquashFS version {major}.{minor} found while only 4.0 is supported")]
    WrongVersion { major: u16, minor: u16 },

    #[error("unsupported compression algorithm (id {0})")]
    UnsupportedCompression(u16),

    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("corrupt inode (type {0})")]
    CorruptInode(u16),

    #[error("metadata ended mid-block, file likely corrupted")]
    TruncatedMetadata,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("compressed data matches neither re-compressed optimized nor non-optimized output")]
    CodecIdentityMismatch,

    #[error("source and target use different compressors (0x{src_codec:08x} vs 0x{target:08x})")]
    CodecMismatch { src_codec: u32, target: u32 },

    #[error("not a squashdelta patch: {0}")]
    BadPatch(String),

    #[error("{command} exited with {status}")]
    ChildFailed { command: String, status: String },
}
