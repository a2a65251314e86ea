//! Line filter.

use regex::bytes::Regex;

/// A set of skip patterns. A record matching any of them is dropped.
///
/// Patterns are matched against raw record bytes, so records do not have to be valid UTF-8.
/// An empty filter matches nothing.
#[derive(Clone, Debug, Default)]
pub struct LineFilter {
    patterns: Vec<Regex>,
}

impl LineFilter {
    /// Creates a filter from pre-compiled patterns.
    pub fn new(patterns: Vec<Regex>) -> Self {
        LineFilter { patterns }
    }

    /// Compiles a filter from pattern sources. Fails on the first invalid pattern.
    pub fn compile<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Result<Vec<Regex>, regex::Error> =
            patterns.into_iter().map(|pattern| Regex::new(pattern.as_ref())).collect();

        return Ok(LineFilter::new(patterns?));
    }

    /// Checks if the record matches any of the skip patterns.
    pub fn is_match(&self, record: &[u8]) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(record))
    }

    /// Returns the number of skip patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::LineFilter;

    #[rstest]
    #[case(vec![], b"anything".as_slice(), false)]
    #[case(vec!["^abc"], b"abcdef".as_slice(), true)]
    #[case(vec!["^abc"], b"xabc".as_slice(), false)]
    #[case(vec!["^abc", "xyz$"], b"__xyz".as_slice(), true)]
    #[case(vec!["[0-9]+"], b"\xff\xfe1".as_slice(), true)]
    fn test_line_filter(#[case] patterns: Vec<&str>, #[case] record: &[u8], #[case] expected: bool) {
        let filter = LineFilter::compile(patterns).unwrap();
        assert_eq!(filter.is_match(record), expected);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(LineFilter::compile(["ok", "(unclosed"]).is_err());
    }
}
