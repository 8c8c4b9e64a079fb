//! Text canonicalization and content validation.
//!
//! [`normalize`] produces the key used for echo detection; [`validate`]
//! decides whether a submission may enter the library at all. Both are pure.

use thiserror::Error;

/// Longest accepted message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

/// Runs of identical characters longer than this look like spam.
const MAX_REPEATED_CHARS: usize = 5;

/// Digit runs this long look like phone or card numbers.
const MIN_SUSPICIOUS_DIGITS: usize = 10;

/// Share of uppercase letters above which text counts as shouting.
const MAX_UPPERCASE_RATIO: f64 = 0.7;

/// Shouting is only judged past this many letters.
const MIN_LETTERS_FOR_CASE_CHECK: usize = 10;

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("message is empty")]
    Empty,

    #[error("message is {length} characters, the limit is {max}")]
    TooLong { length: usize, max: usize },

    #[error("message must be a single line")]
    MultiLine,

    #[error("links and contact details are not allowed")]
    Link,

    #[error("message repeats the same character too often")]
    Repetition,

    #[error("message is mostly uppercase")]
    Shouting,

    #[error("message has no words")]
    NoWords,
}

/// Canonical form used to detect echoes.
///
/// Lowercases, drops everything that is not a letter, digit or whitespace,
/// collapses whitespace runs and trims.
pub fn normalize(text: &str) -> String {
    let kept: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The form that gets stored: the original text, trimmed.
pub fn clean(text: &str) -> &str {
    text.trim()
}

/// Accept or reject a raw submission.
pub fn validate(text: &str) -> Result<(), Rejection> {
    let text = clean(text);
    if text.is_empty() {
        return Err(Rejection::Empty);
    }

    let length = text.chars().count();
    if length > MAX_MESSAGE_CHARS {
        return Err(Rejection::TooLong {
            length,
            max: MAX_MESSAGE_CHARS,
        });
    }

    if text.contains(['\n', '\r']) {
        return Err(Rejection::MultiLine);
    }

    check_content(text)
}

/// Spam-content heuristics.
fn check_content(text: &str) -> Result<(), Rejection> {
    let lower = text.to_lowercase();
    if has_link(&lower) || has_long_number(&lower) || has_email(&lower) {
        return Err(Rejection::Link);
    }

    if longest_run(&lower) > MAX_REPEATED_CHARS {
        return Err(Rejection::Repetition);
    }

    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    if letters > MIN_LETTERS_FOR_CASE_CHECK {
        let upper = text.chars().filter(|c| c.is_uppercase()).count();
        if upper as f64 / letters as f64 > MAX_UPPERCASE_RATIO {
            return Err(Rejection::Shouting);
        }
    }

    if !text.split_whitespace().any(|word| word.chars().count() > 1) {
        return Err(Rejection::NoWords);
    }

    Ok(())
}

fn has_link(lower: &str) -> bool {
    ["http://", "https://", "www."]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// A whole word made of 10+ digits.
fn has_long_number(lower: &str) -> bool {
    lower
        .split(|c: char| !is_word_char(c))
        .any(|word| word.len() >= MIN_SUSPICIOUS_DIGITS && word.chars().all(|c| c.is_ascii_digit()))
}

/// `@word.com`, `@word.net` or `@word.org`.
fn has_email(lower: &str) -> bool {
    lower.match_indices('@').any(|(at, _)| {
        let rest = &lower[at + 1..];
        let word_len: usize = rest
            .chars()
            .take_while(|c| is_word_char(*c))
            .map(char::len_utf8)
            .sum();
        if word_len == 0 {
            return false;
        }
        let tail = &rest[word_len..];
        [".com", ".net", ".org"].iter().any(|tld| tail.starts_with(tld))
    })
}

fn longest_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;
    for c in text.chars() {
        if Some(c) == previous {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        longest = longest.max(current);
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_case_punctuation_and_spacing() {
        assert_eq!(normalize("  Hello,   World!! "), "hello world");
        assert_eq!(normalize("hello world"), "hello world");
        assert_eq!(normalize("HELLO\tworld?"), "hello world");
        assert_eq!(normalize("Çok güzel!"), "çok güzel");
        assert_eq!(normalize("!!!"), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        for text in ["A b  C", "¿Qué pasa?", "so... tired", "x-y_z"] {
            let once = normalize(text);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn accepts_ordinary_text() {
        assert_eq!(validate("I miss the sound of rain"), Ok(()));
        assert_eq!(validate("  trimmed first  "), Ok(()));
        assert_eq!(validate("My number is 12345"), Ok(()));
    }

    #[test]
    fn rejects_empty_and_long() {
        assert_eq!(validate("   "), Err(Rejection::Empty));
        let long = "ab ".repeat(200);
        assert!(matches!(validate(&long), Err(Rejection::TooLong { max: 500, .. })));
        // exactly at the limit is fine
        let at_limit = format!("{}{}", "ab ".repeat(166), "ab");
        assert_eq!(at_limit.chars().count(), 500);
        assert_eq!(validate(&at_limit), Ok(()));
    }

    #[test]
    fn rejects_line_breaks() {
        assert_eq!(validate("one\ntwo"), Err(Rejection::MultiLine));
        assert_eq!(validate("one\rtwo"), Err(Rejection::MultiLine));
    }

    #[test]
    fn rejects_links_numbers_and_emails() {
        assert_eq!(validate("see https://example.com"), Err(Rejection::Link));
        assert_eq!(validate("visit WWW.example"), Err(Rejection::Link));
        assert_eq!(validate("call 05551234567 now"), Err(Rejection::Link));
        assert_eq!(validate("mail me at me@host.org"), Err(Rejection::Link));
        // digits glued to letters are not a standalone number
        assert_eq!(validate("serial ab1234567890"), Ok(()));
        assert_eq!(validate("meet @ home.com"), Ok(()));
    }

    #[test]
    fn rejects_repetition_and_shouting() {
        assert_eq!(validate("nooooooo way"), Err(Rejection::Repetition));
        assert_eq!(validate("nooooo way"), Ok(()));
        assert_eq!(validate("THIS IS VERY LOUD TEXT"), Err(Rejection::Shouting));
        // short shouting is tolerated
        assert_eq!(validate("NO WAY"), Ok(()));
    }

    #[test]
    fn rejects_text_without_words() {
        assert_eq!(validate("a b c"), Err(Rejection::NoWords));
        assert_eq!(validate("?"), Err(Rejection::NoWords));
    }
}
