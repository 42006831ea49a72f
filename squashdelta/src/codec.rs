//! Decompression and identity-preserving recompression for the two
//! supported SquashFS compressors.
//!
//! A 32-bit tag encodes everything the patch applier needs to reproduce the
//! original compressed bytes: the compressor id in bits 24..32 and
//! variant-specific flags below. For LZO the tag also records whether the
//! image was produced with the `lzo1x_optimize` post-pass, which the codec
//! detects by re-compressing decompressed output and comparing streams.

use tracing::warn;

use crate::read::ReadCursor;
use crate::types::{compression_id, SuperBlock};
use crate::{Error, Result};

const TAG_ID_LZO: u32 = 0x01 << 24;
const TAG_ID_LZ4: u32 = 0x02 << 24;
const TAG_ID_MASK: u32 = 0xff << 24;

const LZO_TAG_LEVEL_MASK: u32 = 0x0f;
const LZO_TAG_OPTIMIZED: u32 = 0x10;

const LZ4_TAG_HC: u32 = 0x01;

/// LZO options-blob `algorithm` value for lzo1x_999, the only one supported.
const LZO_ALGORITHM_999: u32 = 4;
const LZO_DEFAULT_LEVEL: u32 = 8;

/// LZ4 options-blob `version` value for the legacy stream format.
const LZ4_VERSION_LEGACY: u32 = 1;
const LZ4_FLAG_HC: u32 = 1;
const LZ4_FLAGS_MASK: u32 = LZ4_FLAG_HC;

pub enum Codec {
    Lzo(LzoCodec),
    Lz4(Lz4Codec),
}

impl Codec {
    /// Build the codec for an image from its superblock and the raw
    /// compression-options blob, if the image carries one.
    pub fn for_superblock(sb: &SuperBlock, options: Option<&[u8]>) -> Result<Self> {
        match sb.compression {
            compression_id::LZO => Ok(Self::Lzo(LzoCodec::new(options)?)),
            compression_id::LZ4 => Ok(Self::Lz4(Lz4Codec::new(options)?)),
            other => Err(Error::UnsupportedCompression(other)),
        }
    }

    /// Rebuild a codec from a patch-envelope tag, with the LZO variant
    /// already latched so recompression needs no detection pass.
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag & TAG_ID_MASK {
            TAG_ID_LZO => {
                let level = tag & LZO_TAG_LEVEL_MASK;
                if !(1..=9).contains(&level) {
                    return Err(Error::BadPatch(format!(
                        "bad lzo compression level in tag 0x{tag:08x}"
                    )));
                }
                let mut codec = LzoCodec::with_level(level)?;
                codec.state = if tag & LZO_TAG_OPTIMIZED != 0 {
                    OptimizeState::Optimized
                } else {
                    OptimizeState::Plain
                };
                Ok(Self::Lzo(codec))
            }
            TAG_ID_LZ4 => Ok(Self::Lz4(Lz4Codec {
                hc: tag & LZ4_TAG_HC != 0,
            })),
            _ => Err(Error::BadPatch(format!(
                "unknown compression tag 0x{tag:08x}"
            ))),
        }
    }

    /// Restart variant detection; the next decompressed block is probed anew.
    pub fn reset(&mut self) {
        if let Self::Lzo(lzo) = self {
            lzo.state = OptimizeState::Unknown;
        }
    }

    /// Decompress one block, producing at most `max_len` bytes.
    pub fn decompress(&mut self, src: &[u8], max_len: usize) -> Result<Vec<u8>> {
        match self {
            Self::Lzo(lzo) => lzo.decompress(src, max_len),
            Self::Lz4(lz4) => lz4.decompress(src, max_len),
        }
    }

    /// Recompress a block the way the original image's compressor did.
    pub fn compress(&mut self, src: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Lzo(lzo) => lzo.compress(src),
            Self::Lz4(lz4) => lz4.compress(src),
        }
    }

    /// Resolve an undecided LZO variant after the last block of a walk.
    pub fn finish_detection(&mut self) {
        if let Self::Lzo(lzo) = self {
            if lzo.state == OptimizeState::Unknown {
                warn!("no block discriminated lzo1x_optimize, assuming plain output");
                lzo.state = OptimizeState::Plain;
            }
        }
    }

    pub fn tag(&self) -> u32 {
        match self {
            Self::Lzo(lzo) => {
                let mut tag = TAG_ID_LZO | lzo.level;
                if lzo.state == OptimizeState::Optimized {
                    tag |= LZO_TAG_OPTIMIZED;
                }
                tag
            }
            Self::Lz4(lz4) => {
                let mut tag = TAG_ID_LZ4;
                if lz4.hc {
                    tag |= LZ4_TAG_HC;
                }
                tag
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptimizeState {
    Unknown,
    Plain,
    Optimized,
}

/// What a recompression probe concluded about one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Both candidate streams are identical; the block cannot discriminate.
    Undecided,
    Plain,
    Optimized,
    Mismatch,
}

/// Compare an on-disk stream against the plain and optimized re-compression
/// candidates. A block where the optimize pass changes nothing is
/// non-discriminating and leaves detection undecided.
fn classify(input: &[u8], plain: &[u8], optimized: &[u8]) -> Verdict {
    if optimized == plain {
        if input == plain {
            Verdict::Undecided
        } else {
            Verdict::Mismatch
        }
    } else if input == plain {
        Verdict::Plain
    } else if input == optimized {
        Verdict::Optimized
    } else {
        Verdict::Mismatch
    }
}

pub struct LzoCodec {
    level: u32,
    state: OptimizeState,
    lzo: minilzo_rs::LZO,
}

impl LzoCodec {
    fn new(options: Option<&[u8]>) -> Result<Self> {
        let level = match options {
            None => LZO_DEFAULT_LEVEL,
            Some(blob) => {
                let mut cursor = ReadCursor::new(blob);
                let algorithm = cursor
                    .read_u32_le()
                    .map_err(|_| Error::Codec("lzo compression options too short".into()))?;
                let level = cursor
                    .read_u32_le()
                    .map_err(|_| Error::Codec("lzo compression options too short".into()))?;
                if algorithm != LZO_ALGORITHM_999 {
                    return Err(Error::Codec(format!(
                        "only the lzo1x_999 algorithm is supported, image uses {algorithm}"
                    )));
                }
                if !(1..=9).contains(&level) {
                    return Err(Error::Codec(format!("invalid lzo compression level {level}")));
                }
                level
            }
        };
        Self::with_level(level)
    }

    fn with_level(level: u32) -> Result<Self> {
        let lzo = minilzo_rs::LZO::init().map_err(|err| Error::Codec(format!("lzo init: {err:?}")))?;
        Ok(Self {
            level,
            state: OptimizeState::Unknown,
            lzo,
        })
    }

    fn decompress(&mut self, src: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let out = self
            .lzo
            .decompress_safe(src, max_len)
            .map_err(|err| Error::Codec(format!("lzo decompression failed: {err:?}")))?;
        if self.state == OptimizeState::Unknown {
            self.probe(src, &out)?;
        }
        Ok(out)
    }

    /// Decide, from one block, whether the image was produced with the
    /// `lzo1x_optimize` post-pass. The verdict is latched until the next
    /// reset; a non-discriminating block leaves the state undecided so a
    /// later block may settle it.
    fn probe(&mut self, src: &[u8], decompressed: &[u8]) -> Result<()> {
        let plain = self.compress_plain(decompressed)?;
        if plain.len() != src.len() {
            return Err(Error::CodecIdentityMismatch);
        }
        let optimized = optimize(&plain)?;
        self.latch(classify(src, &plain, &optimized))
    }

    fn latch(&mut self, verdict: Verdict) -> Result<()> {
        match verdict {
            Verdict::Undecided => {}
            Verdict::Plain => self.state = OptimizeState::Plain,
            Verdict::Optimized => self.state = OptimizeState::Optimized,
            Verdict::Mismatch => return Err(Error::CodecIdentityMismatch),
        }
        Ok(())
    }

    fn compress(&mut self, src: &[u8]) -> Result<Vec<u8>> {
        let plain = self.compress_plain(src)?;
        if self.state == OptimizeState::Optimized {
            return optimize(&plain);
        }
        Ok(plain)
    }

    fn compress_plain(&mut self, src: &[u8]) -> Result<Vec<u8>> {
        self.lzo
            .compress(src)
            .map_err(|err| Error::Codec(format!("lzo compression failed: {err:?}")))
    }
}

/// Rewrite an LZO1X stream the way the `lzo1x_optimize` post-pass does.
///
/// A 2-byte match instruction costs exactly the two bytes it reproduces, so
/// it can be folded into the surrounding literals without changing the
/// stream length or the decoded output: either the previous match's
/// trailing-literal slots take the two bytes, or they merge with a literal
/// run that follows. Literal copies decode faster than match copies, which
/// is the point of the pass. Streams without foldable matches (lzo1x_1
/// never emits 2-byte matches) come back unchanged.
fn optimize(stream: &[u8]) -> Result<Vec<u8>> {
    fn malformed() -> Error {
        Error::Codec("malformed lzo1x stream".into())
    }
    fn get(s: &[u8], i: usize) -> Result<u8> {
        s.get(i).copied().ok_or_else(malformed)
    }
    // length field with the zero-marks-extended encoding
    fn length(s: &[u8], i: usize, bits: usize, mask: usize, base: usize) -> Result<(usize, usize)> {
        if bits != 0 {
            return Ok((base + bits, i + 1));
        }
        let mut len = base + mask;
        let mut j = i + 1;
        while get(s, j)? == 0 {
            len += 255;
            j += 1;
        }
        Ok((len + get(s, j)? as usize, j + 1))
    }

    let mut s = stream.to_vec();
    let mut out: Vec<u8> = Vec::new();
    let mut i = 0usize;
    // 0 after a match without trailing literals, 1..=3 after one with,
    // 4 after a literal run; decides how an opcode below 16 is read
    let mut state = 0usize;
    // where the previous match keeps its 2-bit trailing-literal count
    let mut count_pos: Option<usize> = None;

    let first = get(&s, 0)?;
    if first > 17 {
        let n = (first - 17) as usize;
        out.extend_from_slice(s.get(1..1 + n).ok_or_else(malformed)?);
        i = 1 + n;
        state = if n < 4 { n } else { 4 };
    }

    loop {
        let t = get(&s, i)? as usize;

        if t < 16 && state == 0 {
            let (run, lit_start) = length(&s, i, t, 15, 3)?;
            out.extend_from_slice(s.get(lit_start..lit_start + run).ok_or_else(malformed)?);
            i = lit_start + run;
            state = 4;
            count_pos = None;
            continue;
        }

        let i0 = i;
        let (len, dist, nl, my_count_pos, next_i);
        if t < 16 {
            let b = get(&s, i + 1)? as usize;
            if state == 4 {
                len = 3;
                dist = (t >> 2) + (b << 2) + 2049;
            } else {
                len = 2;
                dist = (t >> 2) + (b << 2) + 1;
            }
            nl = t & 3;
            my_count_pos = i;
            next_i = i + 2;
        } else if t >= 64 {
            let b = get(&s, i + 1)? as usize;
            len = (t >> 5) + 1;
            dist = ((t >> 2) & 7) + (b << 3) + 1;
            nl = t & 3;
            my_count_pos = i;
            next_i = i + 2;
        } else if t >= 32 {
            let (l, j) = length(&s, i, t & 31, 31, 2)?;
            let word = get(&s, j)? as usize | (get(&s, j + 1)? as usize) << 8;
            len = l;
            dist = (word >> 2) + 1;
            nl = word & 3;
            my_count_pos = j;
            next_i = j + 2;
        } else {
            let (l, j) = length(&s, i, t & 7, 7, 2)?;
            let word = get(&s, j)? as usize | (get(&s, j + 1)? as usize) << 8;
            dist = 16384 + ((t & 8) << 11) + (word >> 2);
            if dist == 16384 {
                return Ok(s); // end-of-stream marker
            }
            len = l;
            nl = word & 3;
            my_count_pos = j;
            next_i = j + 2;
        }

        if dist > out.len() {
            return Err(malformed());
        }
        for _ in 0..len {
            let byte = out[out.len() - dist];
            out.push(byte);
        }

        // fold a 2-byte match; the previous instruction was a match whose
        // trailing literals start at count_pos + 2
        if len == 2 && nl == 0 {
            if let Some(p) = count_pos {
                let b0 = out[out.len() - 2];
                let b1 = out[out.len() - 1];
                let follow = get(&s, next_i)? as usize;
                if state == 1 && follow >= 16 {
                    // room in the previous match's trailing-literal slots
                    s[p] |= 3;
                    s[i0] = b0;
                    s[i0 + 1] = b1;
                } else if (1..16).contains(&follow) && state + 2 + follow < 16 {
                    // merge the trailing literals, the match bytes, and the
                    // following run into one literal run
                    let lit = state;
                    s[p] &= !3;
                    for k in (0..lit).rev() {
                        s[p + 3 + k] = s[p + 2 + k];
                    }
                    s[p + 2] = (lit + follow + 2) as u8;
                    s[i0 + 1] = b0;
                    s[i0 + 2] = b1;
                    // replay the swallowed run from the saved opcode; its
                    // literal bytes were not moved
                    let lit_start = next_i + 1;
                    let run = follow + 3;
                    out.extend_from_slice(
                        s.get(lit_start..lit_start + run).ok_or_else(malformed)?,
                    );
                    i = lit_start + run;
                    state = 4;
                    count_pos = None;
                    continue;
                }
            }
        }

        out.extend_from_slice(s.get(next_i..next_i + nl).ok_or_else(malformed)?);
        i = next_i + nl;
        state = nl;
        count_pos = Some(my_count_pos);
    }
}

pub struct Lz4Codec {
    hc: bool,
}

impl Lz4Codec {
    fn new(options: Option<&[u8]>) -> Result<Self> {
        let blob = options.ok_or_else(|| Error::Codec("no compression options for lz4".into()))?;
        let mut cursor = ReadCursor::new(blob);
        let version = cursor
            .read_u32_le()
            .map_err(|_| Error::Codec("lz4 compression options too short".into()))?;
        let flags = cursor
            .read_u32_le()
            .map_err(|_| Error::Codec("lz4 compression options too short".into()))?;
        if version != LZ4_VERSION_LEGACY {
            return Err(Error::Codec(format!("unsupported lz4 stream version {version}")));
        }
        if flags & !LZ4_FLAGS_MASK != 0 {
            return Err(Error::Codec(format!("unknown lz4 flags 0x{flags:x}")));
        }
        Ok(Self {
            hc: flags & LZ4_FLAG_HC != 0,
        })
    }

    fn decompress(&mut self, src: &[u8], max_len: usize) -> Result<Vec<u8>> {
        lz4::block::decompress(src, Some(max_len as i32))
            .map_err(|err| Error::Codec(format!("lz4 decompression failed: {err}")))
    }

    fn compress(&mut self, src: &[u8]) -> Result<Vec<u8>> {
        let mode = if self.hc {
            lz4::block::CompressionMode::HIGHCOMPRESSION(9)
        } else {
            lz4::block::CompressionMode::DEFAULT
        };
        lz4::block::compress(src, Some(mode), false)
            .map_err(|err| Error::Codec(format!("lz4 compression failed: {err}")))
    }
}
