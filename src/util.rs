const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Converting float to int has undefined behaviour for huge floats: https://stackoverflow.com/a/41139453.
/// To avoid this, refuse to convert floats with magnitude greater than 2**53 - 1, after which 64-bit floats no longer
/// retain integer precision.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}

/// Translates the 1-based line/column pair reported by serde_json into a byte offset within
/// `input`. Columns count bytes, so the result can point into the middle of a multi-byte
/// character; it is clamped to the input length.
pub(crate) fn byte_offset(input: &str, line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let line_start: usize = input
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(input.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("abc", 1, 1, 0)]
    #[test_case("abc", 1, 3, 2)]
    #[test_case("ab\ncd", 2, 1, 3)]
    #[test_case("ab\ncd\nef", 3, 2, 7)]
    #[test_case("ab", 1, 10, 2; "clamped to input")]
    #[test_case("ab", 0, 0, 0; "eof on empty input")]
    fn byte_offset_from_line_and_column(input: &str, line: usize, column: usize, expected: usize) {
        assert_eq!(byte_offset(input, line, column), expected);
    }
}
