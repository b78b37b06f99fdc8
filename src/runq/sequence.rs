//! Sequence tokens: minting and ordering run ids
//!
//! A run id is `<benchShortName>.<seqInt><seqChar>`. The token behind the
//! suffix is a pair `(int >= 1, char)` where the char cycles
//! `A..Z` then `a..z`; stepping past `z` resets the char to `A` and
//! increments the int. The token file holds the *next* token to mint, one
//! line, serialized `<int>:<char>`. A missing or corrupt file resets the
//! sequence to `1:A`.

use std::path::Path;

use tracing::warn;

/// Position of a char in the `A..Z a..z` cycle
fn letter_index(c: char) -> Option<u8> {
    match c {
        'A'..='Z' => Some(c as u8 - b'A'),
        'a'..='z' => Some(c as u8 - b'a' + 26),
        _ => None,
    }
}

fn index_letter(i: u8) -> char {
    if i < 26 {
        (b'A' + i) as char
    } else {
        (b'a' + i - 26) as char
    }
}

/// One mintable `(int, char)` sequence value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceToken {
    pub number: u32,
    pub letter: char,
}

impl SequenceToken {
    /// Where a fresh (or reset) sequence starts
    pub const FIRST: SequenceToken = SequenceToken {
        number: 1,
        letter: 'A',
    };

    /// The run-id suffix this token mints, e.g. `17c`
    pub fn suffix(&self) -> String {
        format!("{}{}", self.number, self.letter)
    }

    /// `A→B→…→Z→a→…→z`, then wrap the char and increment the int
    pub fn successor(self) -> Self {
        let i = letter_index(self.letter).expect("token letter is always valid");
        if i == 51 {
            Self {
                number: self.number + 1,
                letter: 'A',
            }
        } else {
            Self {
                number: self.number,
                letter: index_letter(i + 1),
            }
        }
    }

    /// Exact inverse of [`successor`](Self::successor); `1:A` has none
    pub fn predecessor(self) -> Option<Self> {
        if self == Self::FIRST {
            return None;
        }
        let i = letter_index(self.letter).expect("token letter is always valid");
        if i == 0 {
            Some(Self {
                number: self.number - 1,
                letter: 'z',
            })
        } else {
            Some(Self {
                number: self.number,
                letter: index_letter(i - 1),
            })
        }
    }

    /// Ordering key: int ascending, then char in `A<…<Z<a<…<z` order
    pub fn sort_key(&self) -> (u32, u8) {
        (
            self.number,
            letter_index(self.letter).expect("token letter is always valid"),
        )
    }

    fn parse(content: &str) -> Option<Self> {
        let (num, letter) = content.trim().split_once(':')?;
        let number: u32 = num.parse().ok()?;
        let mut chars = letter.chars();
        let letter = chars.next()?;
        if chars.next().is_some() || number == 0 {
            return None;
        }
        letter_index(letter)?;
        Some(Self { number, letter })
    }
}

impl std::fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.number, self.letter)
    }
}

/// Read the token file, resetting to `1:A` when it is missing or corrupt
pub fn load(path: &Path) -> SequenceToken {
    match std::fs::read_to_string(path) {
        Ok(content) => match SequenceToken::parse(&content) {
            Some(token) => token,
            None => {
                warn!(
                    "sequence file {} is corrupt ({:?}); resetting to 1:A",
                    path.display(),
                    content.trim()
                );
                let _ = std::fs::remove_file(path);
                SequenceToken::FIRST
            }
        },
        Err(_) => SequenceToken::FIRST,
    }
}

/// Rewrite the token file
pub fn store(path: &Path, token: SequenceToken) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", token))
}

/// Split `<bench>.<int><char>` into its parts. Returns `None` unless the id
/// matches `^[A-Za-z0-9_-]+\.\d+[A-Za-z]$` with a positive int.
pub fn split_run_id(run_id: &str) -> Option<(&str, SequenceToken)> {
    let (bench, suffix) = run_id.rsplit_once('.')?;
    if !crate::config::valid_short_name(bench) {
        return None;
    }
    let letter = suffix.chars().last()?;
    letter_index(letter)?;
    let digits = &suffix[..suffix.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: u32 = digits.parse().ok()?;
    if number == 0 {
        return None;
    }
    Some((bench, SequenceToken { number, letter }))
}
