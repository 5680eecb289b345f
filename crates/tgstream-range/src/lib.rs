//! HTTP `Range` parsing and the block-aligned fetch plan.
//!
//! The upstream file API serves blocks at 4096-aligned offsets with
//! 4096-multiple limits, so an arbitrary HTTP byte range has to be widened to
//! aligned block fetches and trimmed back down when the blocks arrive. This
//! crate owns both halves: [`parse_range_header`]/[`resolve`] turn the header
//! into a validated `[start, end]` interval, and [`BlockPlan`] turns that
//! interval into the sequence of aligned fetches plus the cut points that
//! recover the exact requested bytes.

use std::fmt;

/// Upstream offsets and limits must be multiples of this.
pub const BLOCK_ALIGN: u64 = 4096;

/// Fixed fetch size: the largest 4096-multiple the upstream accepts per call.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Cap on the number of range specs a single header may carry.
pub const MAX_RANGE_SPECS: usize = 64;

/// One `bytes=`-unit range spec, before resolution against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRangeSpec {
    /// `start-end`, both inclusive.
    FromTo { start: u64, end: u64 },
    /// `start-`, open ended.
    From { start: u64 },
    /// `-len`, the final `len` bytes.
    Suffix { len: u64 },
}

/// Failure to parse a `Range` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeParseError {
    /// The header does not use the `bytes` unit.
    NotBytes,
    /// No specs between/after the separators.
    Empty,
    /// A spec is not one of the three recognised shapes.
    InvalidSpec,
    /// A bound is not a valid `u64` (overflow included).
    InvalidNumber,
    /// More than [`MAX_RANGE_SPECS`] specs.
    TooManyRanges { limit: usize },
}

impl fmt::Display for RangeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeParseError::NotBytes => write!(f, "range unit is not 'bytes'"),
            RangeParseError::Empty => write!(f, "range header carries no specs"),
            RangeParseError::InvalidSpec => write!(f, "malformed range spec"),
            RangeParseError::InvalidNumber => write!(f, "range bound is not a valid u64"),
            RangeParseError::TooManyRanges { limit } => {
                write!(f, "more than {limit} range specs")
            }
        }
    }
}

impl std::error::Error for RangeParseError {}

/// A spec could not be satisfied against the actual file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeUnsatisfiable;

impl fmt::Display for RangeUnsatisfiable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "requested range not satisfiable")
    }
}

impl std::error::Error for RangeUnsatisfiable {}

/// An inclusive `[start, end]` interval known to lie inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

impl ResolvedRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Inclusive intervals cover at least one byte by construction.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parses a `Range` header value into its specs.
///
/// Tolerates optional whitespace around every token and leading zeros on
/// numbers; rejects non-`bytes` units, empty spec lists, anything that is
/// not `start-end`, `start-` or `-len`, and numbers that do not fit `u64`.
pub fn parse_range_header(value: &str) -> Result<Vec<ByteRangeSpec>, RangeParseError> {
    let value = value.trim();
    let rest = match value.strip_prefix("bytes") {
        Some(rest) => rest.trim_start(),
        None => return Err(RangeParseError::NotBytes),
    };
    let rest = match rest.strip_prefix('=') {
        Some(rest) => rest,
        None => return Err(RangeParseError::NotBytes),
    };

    let mut specs = Vec::new();
    for part in rest.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(RangeParseError::InvalidSpec);
        }
        if specs.len() == MAX_RANGE_SPECS {
            return Err(RangeParseError::TooManyRanges {
                limit: MAX_RANGE_SPECS,
            });
        }

        let (lhs, rhs) = match part.split_once('-') {
            Some(split) => split,
            None => return Err(RangeParseError::InvalidSpec),
        };
        let lhs = lhs.trim();
        let rhs = rhs.trim();

        let spec = match (lhs.is_empty(), rhs.is_empty()) {
            (true, true) => return Err(RangeParseError::InvalidSpec),
            (true, false) => ByteRangeSpec::Suffix {
                len: parse_bound(rhs)?,
            },
            (false, true) => ByteRangeSpec::From {
                start: parse_bound(lhs)?,
            },
            (false, false) => ByteRangeSpec::FromTo {
                start: parse_bound(lhs)?,
                end: parse_bound(rhs)?,
            },
        };
        specs.push(spec);
    }

    if specs.is_empty() {
        return Err(RangeParseError::Empty);
    }
    Ok(specs)
}

/// Parses one numeric bound. Leading zeros are fine; a value that does not
/// fit `u64` is not, no matter how it is padded.
fn parse_bound(digits: &str) -> Result<u64, RangeParseError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeParseError::InvalidNumber);
    }
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        return Ok(0);
    }
    // u64::MAX has 20 digits; anything longer cannot fit.
    if trimmed.len() > 20 {
        return Err(RangeParseError::InvalidNumber);
    }
    trimmed
        .parse::<u64>()
        .map_err(|_| RangeParseError::InvalidNumber)
}

/// Resolves a single spec against the file size.
///
/// Bounds are strict: an explicit `end` at or past the file size is
/// unsatisfiable rather than clamped. The open-ended and suffix forms clamp
/// to the final byte before the check, since they name no explicit end.
pub fn resolve(spec: ByteRangeSpec, size: u64) -> Result<ResolvedRange, RangeUnsatisfiable> {
    if size == 0 {
        return Err(RangeUnsatisfiable);
    }
    let range = match spec {
        ByteRangeSpec::FromTo { start, end } => {
            if start >= size || end >= size || end < start {
                return Err(RangeUnsatisfiable);
            }
            ResolvedRange { start, end }
        }
        ByteRangeSpec::From { start } => {
            if start >= size {
                return Err(RangeUnsatisfiable);
            }
            ResolvedRange {
                start,
                end: size - 1,
            }
        }
        ByteRangeSpec::Suffix { len } => {
            if len == 0 {
                return Err(RangeUnsatisfiable);
            }
            ResolvedRange {
                start: size.saturating_sub(len),
                end: size - 1,
            }
        }
    };
    Ok(range)
}

/// The aligned fetch schedule for one resolved range.
///
/// Parts are numbered `1..=part_count`; part `i` is fetched at
/// `aligned_offset + (i-1) * chunk_size` with limit `chunk_size`, and the
/// cut points trim the first and last parts back to the requested interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    /// First fetch offset; always a multiple of [`BLOCK_ALIGN`].
    pub aligned_offset: u64,
    /// Bytes to drop from the front of the first part.
    pub first_cut: usize,
    /// Bytes to keep from the front of the last part.
    pub last_cut: usize,
    /// Number of fetches.
    pub part_count: u32,
    /// Fetch limit per part.
    pub chunk_size: u64,
    /// `end - start + 1`.
    pub requested_len: u64,
}

impl BlockPlan {
    /// Builds the plan for `[start, end]` within a file of `size` bytes.
    ///
    /// Re-validates the interval so plan construction alone guarantees the
    /// alignment and accounting invariants.
    pub fn for_range(start: u64, end: u64, size: u64) -> Result<BlockPlan, RangeUnsatisfiable> {
        if start >= size || end >= size || end < start {
            return Err(RangeUnsatisfiable);
        }

        let chunk_size = CHUNK_SIZE;
        let aligned_offset = start - (start % chunk_size);
        let first_cut = (start - aligned_offset) as usize;
        let last_cut = ((end % chunk_size) + 1) as usize;
        let part_count = ((end / chunk_size) - (aligned_offset / chunk_size) + 1) as u32;

        debug_assert_eq!(aligned_offset % BLOCK_ALIGN, 0);
        debug_assert_eq!(chunk_size % BLOCK_ALIGN, 0);

        Ok(BlockPlan {
            aligned_offset,
            first_cut,
            last_cut,
            part_count,
            chunk_size,
            requested_len: end - start + 1,
        })
    }

    /// Convenience for a whole-file fetch.
    pub fn for_whole_file(size: u64) -> Result<BlockPlan, RangeUnsatisfiable> {
        if size == 0 {
            return Err(RangeUnsatisfiable);
        }
        BlockPlan::for_range(0, size - 1, size)
    }

    /// Fetch offset of 1-based part `part`.
    pub fn offset_of_part(&self, part: u32) -> u64 {
        debug_assert!(part >= 1 && part <= self.part_count);
        self.aligned_offset + u64::from(part - 1) * self.chunk_size
    }

    /// The `[start, end)` window to keep from part `part` of `chunk_len`
    /// fetched bytes.
    ///
    /// Cut points are clamped to the actual chunk length, so a short final
    /// part (upstream EOF) never produces an out-of-bounds window.
    pub fn trim_bounds(&self, part: u32, chunk_len: usize) -> (usize, usize) {
        debug_assert!(part >= 1 && part <= self.part_count);
        let first = self.first_cut.min(chunk_len);
        let last = self.last_cut.min(chunk_len);
        if self.part_count == 1 {
            (first, last.max(first))
        } else if part == 1 {
            (first, chunk_len)
        } else if part == self.part_count {
            (0, last)
        } else {
            (0, chunk_len)
        }
    }

    /// Trims a fetched part down to the requested interval.
    pub fn trim<'a>(&self, part: u32, chunk: &'a [u8]) -> &'a [u8] {
        let (start, end) = self.trim_bounds(part, chunk.len());
        &chunk[start..end]
    }
}
