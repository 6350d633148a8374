//! Helper functions shared by the rest of the allocator. These don't belong
//! to any concrete module of the program.

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. This is used to round chunk sizes up
/// to page/granule multiples and bump cursors up to the requested code
/// alignment.
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_code_alignment() {
        let alignments = vec![(1..16, 16), (17..32, 32), (33..48, 48)];

        for (values, expected) in alignments {
            for value in values {
                assert_eq!(expected, align_up(value, 16));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let alignments = vec![(1..4096, 4096), (4097..8192, 8192)];

        for (values, expected) in alignments {
            for value in values {
                assert_eq!(expected, align_up(value, 4096));
            }
        }
    }

    #[test]
    fn aligned_value_is_unchanged() {
        assert_eq!(0, align_up(0, 16));
        assert_eq!(4096, align_up(4096, 4096));
        assert_eq!(64, align_up(64, 16));
    }
}
