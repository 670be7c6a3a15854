//! Chunk layout and range math
//!
//! Chunked entries split the body into fixed-size chunks; range reads
//! compute the intersecting chunks and slice endpoints so only the needed
//! chunks are ever fetched.

/// Half-open byte range `[start, end)` within a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Outcome of parsing a `Range` header against a known total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No range or an unparseable header: serve the full body.
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Parse `bytes=a-b`, `bytes=a-`, and `bytes=-n` forms. Multi-range headers
/// degrade to the full body. The end bound is clamped to the total size; a
/// start at or beyond the total is unsatisfiable.
pub fn parse_range_header(header: &str, total: u64) -> RangeOutcome {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };

    if start_str.is_empty() {
        // Suffix form: last n bytes.
        let Ok(suffix) = end_str.parse::<u64>() else {
            return RangeOutcome::Full;
        };
        if suffix == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let start = total.saturating_sub(suffix);
        return RangeOutcome::Partial(ByteRange { start, end: total });
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    if start >= total {
        return RangeOutcome::Unsatisfiable;
    }

    let end = if end_str.is_empty() {
        total
    } else {
        match end_str.parse::<u64>() {
            // Inclusive on the wire, half-open here.
            Ok(end_inclusive) => end_inclusive.saturating_add(1).min(total),
            Err(_) => return RangeOutcome::Full,
        }
    };
    if end <= start {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial(ByteRange { start, end })
}

/// Number of chunks needed for a body of `total` bytes.
pub fn chunk_count(total: u64, chunk_size: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    total.div_ceil(chunk_size) as u32
}

/// One chunk's contribution to a range read: the chunk index and the slice
/// of that chunk to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlice {
    pub index: u32,
    pub start: usize,
    pub end: usize,
}

/// Chunks intersecting a byte range, in ascending index order.
pub fn chunk_span(range: ByteRange, chunk_size: u64) -> Vec<ChunkSlice> {
    if range.is_empty() {
        return Vec::new();
    }
    let first = (range.start / chunk_size) as u32;
    let last = ((range.end - 1) / chunk_size) as u32;

    (first..=last)
        .map(|index| {
            let chunk_start = index as u64 * chunk_size;
            let start = range.start.saturating_sub(chunk_start).min(chunk_size) as usize;
            let end = (range.end - chunk_start).min(chunk_size) as usize;
            ChunkSlice { index, start, end }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MIB: u64 = 1024 * 1024;

    #[rstest]
    #[case("bytes=0-0", 0, 1)]
    #[case("bytes=10-19", 10, 20)]
    #[case("bytes=90-", 90, 100)]
    #[case("bytes=-10", 90, 100)]
    // Suffix longer than the body clamps to the whole body.
    #[case("bytes=-500", 0, 100)]
    // The end bound clamps to the total size.
    #[case("bytes=50-1000", 50, 100)]
    fn test_partial_range_forms(#[case] header: &str, #[case] start: u64, #[case] end: u64) {
        assert_eq!(
            parse_range_header(header, 100),
            RangeOutcome::Partial(ByteRange { start, end })
        );
    }

    #[rstest]
    #[case("bytes=100-")]
    #[case("bytes=500-600")]
    #[case("bytes=-0")]
    fn test_unsatisfiable_ranges(#[case] header: &str) {
        assert_eq!(parse_range_header(header, 100), RangeOutcome::Unsatisfiable);
    }

    #[rstest]
    #[case("bytes=a-b")]
    #[case("items=0-1")]
    #[case("bytes=0-1,5-6")]
    fn test_garbage_ranges_fall_back_to_full(#[case] header: &str) {
        assert_eq!(parse_range_header(header, 100), RangeOutcome::Full);
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 10 * MIB), 0);
        assert_eq!(chunk_count(10 * MIB, 10 * MIB), 1);
        assert_eq!(chunk_count(10 * MIB + 1, 10 * MIB), 2);
        assert_eq!(chunk_count(50 * MIB, 10 * MIB), 5);
    }

    #[test]
    fn test_span_within_single_chunk() {
        let slices = chunk_span(ByteRange { start: 5, end: 10 }, 100);
        assert_eq!(slices, vec![ChunkSlice { index: 0, start: 5, end: 10 }]);
    }

    #[test]
    fn test_span_across_chunk_boundary() {
        // 2 MiB spanning chunks 1 and 2 of a 10 MiB chunk layout.
        let range = ByteRange {
            start: 12 * MIB,
            end: 14 * MIB,
        };
        let slices = chunk_span(range, 10 * MIB);
        assert_eq!(
            slices,
            vec![
                ChunkSlice {
                    index: 1,
                    start: (2 * MIB) as usize,
                    end: (10 * MIB) as usize
                },
                ChunkSlice {
                    index: 2,
                    start: 0,
                    end: (4 * MIB) as usize
                },
            ]
        );
        let total: usize = slices.iter().map(|s| s.end - s.start).sum();
        assert_eq!(total as u64, range.len());
    }

    #[test]
    fn test_span_exact_boundary_touches_one_chunk() {
        let slices = chunk_span(ByteRange { start: 0, end: 100 }, 100);
        assert_eq!(slices, vec![ChunkSlice { index: 0, start: 0, end: 100 }]);

        let slices = chunk_span(ByteRange { start: 100, end: 200 }, 100);
        assert_eq!(slices, vec![ChunkSlice { index: 1, start: 0, end: 100 }]);
    }

    #[test]
    fn test_span_never_reads_unneeded_chunks() {
        // S6 shape: 50 MiB body, range bytes=12582912-14680063.
        let range = ByteRange {
            start: 12_582_912,
            end: 14_680_064,
        };
        let slices = chunk_span(range, 10 * MIB);
        let indexes: Vec<u32> = slices.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![1, 2], "chunks 3..5 are never touched");
    }
}
