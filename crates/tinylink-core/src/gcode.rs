//! Minimal G-code line model
//!
//! Splits a line into letter/value words with comments removed. This is
//! just enough structure for the sender to classify lines (motion vs.
//! settings, planner cost); it does not track modal state.

use crate::error::GcodeParseError;
use std::fmt;

/// One word of a G-code line, e.g. `G1` or `X10.5`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcodeWord {
    /// Uppercase word letter
    pub letter: char,
    /// Numeric value
    pub value: f64,
}

impl fmt::Display for GcodeWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.letter, self.value)
    }
}

/// A parsed G-code line
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GcodeLine {
    words: Vec<GcodeWord>,
}

impl GcodeLine {
    /// Build a line from words
    pub fn from_words(words: Vec<GcodeWord>) -> Self {
        Self { words }
    }

    /// Parse a line of text. Comments in `( )` and after `;` are dropped.
    pub fn parse(text: &str) -> Result<Self, GcodeParseError> {
        let mut words = Vec::new();
        let mut chars = text.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                ';' => break,
                '(' => {
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == ')' {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(GcodeParseError::new(pos, "unterminated comment"));
                    }
                }
                c if c.is_whitespace() => {}
                '%' if words.is_empty() => {}
                c if c.is_ascii_alphabetic() => {
                    let mut number = String::new();
                    while let Some(&(_, d)) = chars.peek() {
                        if d.is_ascii_digit() || d == '.' || d == '-' || d == '+' {
                            number.push(d);
                            chars.next();
                        } else if d == ' ' && number.is_empty() {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let value = number.parse::<f64>().map_err(|_| {
                        GcodeParseError::new(pos, format!("bad value for word {}", c))
                    })?;
                    words.push(GcodeWord {
                        letter: c.to_ascii_uppercase(),
                        value,
                    });
                }
                other => {
                    return Err(GcodeParseError::new(
                        pos,
                        format!("unexpected character '{}'", other),
                    ))
                }
            }
        }

        Ok(Self { words })
    }

    /// All words in order
    pub fn words(&self) -> &[GcodeWord] {
        &self.words
    }

    /// True if the line carries no words (blank or comment-only)
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// True if the line contains the given word, e.g. `has_word('G', 38.2)`
    pub fn has_word(&self, letter: char, value: f64) -> bool {
        self.words
            .iter()
            .any(|w| w.letter == letter && (w.value - value).abs() < 1e-6)
    }

    /// Value of the first word with this letter
    pub fn get(&self, letter: char) -> Option<f64> {
        self.words
            .iter()
            .find(|w| w.letter == letter)
            .map(|w| w.value)
    }

    /// All values of the given letter, in order
    pub fn codes(&self, letter: char) -> impl Iterator<Item = f64> + '_ {
        self.words
            .iter()
            .filter(move |w| w.letter == letter)
            .map(|w| w.value)
    }
}

impl fmt::Display for GcodeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for word in &self.words {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", word)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_words_and_comments() {
        let line = GcodeLine::parse("G1 X10.5 y-2 (move) F300 ; trailing").unwrap();
        assert_eq!(line.words().len(), 4);
        assert!(line.has_word('G', 1.0));
        assert_eq!(line.get('Y'), Some(-2.0));
        assert_eq!(line.get('F'), Some(300.0));
        assert_eq!(line.to_string(), "G1 X10.5 Y-2 F300");
    }

    #[test]
    fn test_parse_compact_and_decimal_codes() {
        let line = GcodeLine::parse("G38.2Z-5F25").unwrap();
        assert!(line.has_word('G', 38.2));
        assert_eq!(line.get('Z'), Some(-5.0));
    }

    #[test]
    fn test_comment_only_line_is_empty() {
        assert!(GcodeLine::parse("(just a comment)").unwrap().is_empty());
        assert!(GcodeLine::parse("   ").unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_comment_is_rejected() {
        assert!(GcodeLine::parse("G0 (oops").is_err());
        assert!(GcodeLine::parse("G0 X").is_err());
    }
}
