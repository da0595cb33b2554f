use std::fmt;

use serde::Deserialize;

use crate::error::PatternError;

/// Musical note duration represented as a rational fraction of a whole note.
/// All operations preserve exact ratios, so step grids never drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Duration {
    /// Numerator: how many parts
    pub numerator: u32,
    /// Denominator: of what size (4 = quarter, 8 = eighth, etc.)
    pub denominator: u32,
}

impl Duration {
    // Standard note values
    pub const WHOLE: Duration = Duration {
        numerator: 1,
        denominator: 1,
    };
    pub const HALF: Duration = Duration {
        numerator: 1,
        denominator: 2,
    };
    pub const QUARTER: Duration = Duration {
        numerator: 1,
        denominator: 4,
    };
    pub const EIGHTH: Duration = Duration {
        numerator: 1,
        denominator: 8,
    };
    pub const SIXTEENTH: Duration = Duration {
        numerator: 1,
        denominator: 16,
    };

    pub const DOTTED_QUARTER: Duration = Duration::QUARTER.dotted();
    pub const QUARTER_TRIPLET: Duration = Duration::QUARTER.triplet();

    /// Apply a dot: multiply duration by 3/2
    pub const fn dotted(self) -> Self {
        Duration {
            numerator: self.numerator * 3,
            denominator: self.denominator * 2,
        }
    }

    /// Three notes in the time of two
    pub const fn triplet(self) -> Self {
        self.tuplet(2, 3)
    }

    /// `played` notes in the time of `in_time_of` notes
    pub const fn tuplet(self, in_time_of: u32, played: u32) -> Self {
        Duration {
            numerator: self.numerator * in_time_of,
            denominator: self.denominator * played,
        }
    }

    /// Reduce the fraction to lowest terms using GCD
    pub const fn reduce(self) -> Self {
        let gcd = const_gcd(self.numerator, self.denominator);
        if gcd == 0 {
            return self;
        }
        Duration {
            numerator: self.numerator / gcd,
            denominator: self.denominator / gcd,
        }
    }

    /// Length in beats, where a beat is a quarter note.
    pub fn beats(&self) -> f64 {
        self.numerator as f64 * 4.0 / self.denominator as f64
    }

    /// Length in seconds at `bpm` quarter notes per minute.
    pub fn seconds(&self, bpm: f64) -> f64 {
        self.beats() * 60.0 / bpm
    }

    /// Parse `"1/8"`, `"3/16"`, `"1/4."` (dotted) or `"1/4t"` (triplet).
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let invalid = || PatternError::Duration(text.to_string());
        let text_trimmed = text.trim();

        let (body, modifier) = match text_trimmed.strip_suffix('.') {
            Some(body) => (body, Some('.')),
            None => match text_trimmed.strip_suffix('t') {
                Some(body) => (body, Some('t')),
                None => (text_trimmed, None),
            },
        };

        let (num, den) = body.split_once('/').ok_or_else(invalid)?;
        let numerator: u32 = num.trim().parse().map_err(|_| invalid())?;
        let denominator: u32 = den.trim().parse().map_err(|_| invalid())?;
        if numerator == 0 || denominator == 0 {
            return Err(invalid());
        }

        let duration = Duration {
            numerator,
            denominator,
        };
        Ok(match modifier {
            Some('.') => duration.dotted().reduce(),
            Some(_) => duration.triplet().reduce(),
            None => duration.reduce(),
        })
    }
}

impl Default for Duration {
    fn default() -> Self {
        Duration::QUARTER
    }
}

impl TryFrom<String> for Duration {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Duration::parse(&value)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Compute greatest common divisor (Euclidean algorithm)
const fn const_gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let temp = b;
        b = a % b;
        a = temp;
    }
    a
}
