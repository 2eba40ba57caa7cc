//! Local screen for outgoing message text.

use regex::Regex;

/// Blocked unless the caller replaces the list.
pub const DEFAULT_BLOCKED_WORDS: &[&str] = &[
    "욕설", "비속어", "광고", "스팸", "홍보", "판매", "구매", "팔로우백", "맞팔", "소통", "선팔",
    "도박", "베팅", "카지노", "슬롯", "성인", "19금", "음란", "야동", "사기", "피싱", "해킹",
    "불법", "casino", "gambling", "betting", "porn", "scam", "phishing", "f4f", "follow4follow",
];

/// Whole-word, case-insensitive match against a word list.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    pattern: Option<Regex>,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_WORDS.iter().copied())
    }
}

impl ContentFilter {
    pub fn new<'a>(words: impl IntoIterator<Item = &'a str>) -> Self {
        let alternatives: Vec<String> = words
            .into_iter()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Self { pattern: None };
        }
        let source = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
        match Regex::new(&source) {
            Ok(pattern) => Self { pattern: Some(pattern) },
            Err(e) => {
                tracing::error!(error = %e, words = alternatives.len(), "Content filter disabled");
                Self { pattern: None }
            }
        }
    }

    /// Built-in list plus `extra`.
    pub fn with_extra(extra: &[String]) -> Self {
        Self::new(DEFAULT_BLOCKED_WORDS.iter().copied().chain(extra.iter().map(String::as_str)))
    }

    /// The blocked words `text` contains, lowercased and in order of first use.
    pub fn blocked_words(&self, text: &str) -> Vec<String> {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };
        let mut found: Vec<String> = Vec::new();
        for m in pattern.find_iter(text) {
            let word = m.as_str().to_lowercase();
            if !found.contains(&word) {
                found.push(word);
            }
        }
        found
    }

    pub fn check(&self, text: &str) -> Result<(), Vec<String>> {
        let found = self.blocked_words(text);
        if found.is_empty() {
            Ok(())
        } else {
            Err(found)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_whole_words_in_either_language() {
        let filter = ContentFilter::default();
        assert_eq!(
            filter.check("Join our CASINO night, 맞팔 환영!").unwrap_err(),
            vec!["casino".to_string(), "맞팔".to_string()]
        );
        assert!(filter.check("Loved your ceramics, want to collab?").is_ok());
        // Substrings of longer words are left alone.
        assert!(filter.check("A scampi recipe for you").is_ok());
        assert!(filter.check("").is_ok());
    }

    #[test]
    fn extra_words_extend_the_list() {
        let filter = ContentFilter::with_extra(&["giveaway".to_string(), "  ".to_string()]);
        assert_eq!(filter.check("Huge Giveaway today").unwrap_err(), vec!["giveaway".to_string()]);
        assert!(filter.check("광고 문의").is_err());

        let empty = ContentFilter::new([]);
        assert!(empty.check("casino").is_ok());
    }
}
