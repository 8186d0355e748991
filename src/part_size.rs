//! S3 multipart limits and the optimal-part-size calculator.
//!
//! Every part except the last must be at least 5 MiB, a multipart upload can
//! hold at most 10 000 parts, and the preferred part size is a tradeoff
//! between request count and memory/disk footprint per chunk.

/// Minimum size of a multipart part (all but the last). 5 MiB.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Upper bound accepted for the configured preferred part size. 500 MiB.
pub const MAX_PART_SIZE: u64 = 500 * 1024 * 1024;

/// Preferred part size when none is configured. 8 MiB.
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum number of parts in one multipart upload.
pub const MAX_MULTIPART_PARTS: u64 = 10_000;

/// Pick a part size for an upload of `size` total bytes.
///
/// In order: an upload that fits in a single preferred-size part is uploaded
/// as one part of exactly `size` bytes; an upload that fits in 10 000
/// preferred-size parts uses the preferred size; anything larger gets the
/// smallest part size that still fits the part cap.
///
/// Callers must not invoke this with an unknown (deferred) length; the store
/// rejects writes until the length is declared.
pub fn calc_optimal_part_size(size: u64, preferred_part_size: u64) -> u64 {
    if size <= preferred_part_size {
        size
    } else if size <= preferred_part_size * MAX_MULTIPART_PARTS {
        preferred_part_size
    } else {
        size.div_ceil(MAX_MULTIPART_PARTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_upload_becomes_a_single_part() {
        assert_eq!(calc_optimal_part_size(1024, DEFAULT_PART_SIZE), 1024);
        assert_eq!(
            calc_optimal_part_size(DEFAULT_PART_SIZE, DEFAULT_PART_SIZE),
            DEFAULT_PART_SIZE
        );
    }

    #[test]
    fn medium_upload_uses_the_preferred_size() {
        let size = 100 * DEFAULT_PART_SIZE + 1;
        assert_eq!(calc_optimal_part_size(size, DEFAULT_PART_SIZE), DEFAULT_PART_SIZE);

        let size = DEFAULT_PART_SIZE * MAX_MULTIPART_PARTS;
        assert_eq!(calc_optimal_part_size(size, DEFAULT_PART_SIZE), DEFAULT_PART_SIZE);
    }

    #[test]
    fn huge_upload_grows_parts_to_fit_the_cap() {
        let size = DEFAULT_PART_SIZE * MAX_MULTIPART_PARTS + 1;
        let part_size = calc_optimal_part_size(size, DEFAULT_PART_SIZE);

        assert!(part_size > DEFAULT_PART_SIZE);
        assert!(size.div_ceil(part_size) <= MAX_MULTIPART_PARTS);
    }

    #[test]
    fn part_count_never_exceeds_the_cap() {
        for size in [
            5 * 1024u64 * 1024 * 1024,
            500 * 1024 * 1024 * 1024,
            5 * 1024 * 1024 * 1024 * 1024,
        ] {
            let part_size = calc_optimal_part_size(size, DEFAULT_PART_SIZE);
            assert!(
                size.div_ceil(part_size) <= MAX_MULTIPART_PARTS,
                "{} byte upload produced too many parts",
                size
            );
        }
    }

    #[test]
    fn multipart_parts_never_fall_below_the_minimum() {
        // For uploads larger than the preferred size, the calculator can only
        // return the preferred size or something bigger, and the preferred
        // size itself is validated to be >= MIN_PART_SIZE by the config.
        let part_size = calc_optimal_part_size(10 * MIN_PART_SIZE, MIN_PART_SIZE);
        assert_eq!(part_size, MIN_PART_SIZE);

        let part_size =
            calc_optimal_part_size(MIN_PART_SIZE * MAX_MULTIPART_PARTS * 3, MIN_PART_SIZE);
        assert!(part_size >= MIN_PART_SIZE);
    }
}
