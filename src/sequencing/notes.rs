/*
Note Names
==========

Patterns in mood files are written with note names, which are turned into
MIDI note numbers here. Middle C (C4) = MIDI note 60.

  note_number = 12 * (octave + 1) + semitone
  semitone: C=0, C#=1, D=2, D#=3, E=4, F=5, F#=6, G=7, G#=8, A=9, A#=10, B=11

Sharps are written `#` or `s` (C#4, Cs4), flats `b` (Db4). Octaves run from
-1 to 9, clamped to the MIDI range 0..=127.
*/

pub const C4: u8 = 60;
pub const A4: u8 = 69; // A440 tuning reference

const NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// Parse a note name such as `C4`, `F#3`, `Bb2` or `Cs5`.
pub fn parse_note(name: &str) -> Option<u8> {
    let mut chars = name.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let base: i32 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };

    let rest = chars.as_str();
    let (accidental, octave) = match rest.chars().next() {
        Some('#') | Some('s') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest),
    };

    let octave: i32 = octave.parse().ok()?;
    let number = 12 * (octave + 1) + base + accidental;
    u8::try_from(number).ok().filter(|n| *n <= 127)
}

/// Name of a MIDI note, using sharps.
pub fn note_name(note: u8) -> String {
    let octave = note as i32 / 12 - 1;
    format!("{}{}", NAMES[note as usize % 12], octave)
}

/// Shift a note by `semitones`, clamped to the MIDI range.
pub fn transpose(note: u8, semitones: i32) -> u8 {
    (note as i32 + semitones).clamp(0, 127) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middle_c_is_60() {
        assert_eq!(parse_note("C4"), Some(C4));
    }

    #[test]
    fn a440_is_69() {
        assert_eq!(parse_note("A4"), Some(A4));
    }

    #[test]
    fn octaves_are_12_apart() {
        assert_eq!(parse_note("C5").unwrap() - parse_note("C4").unwrap(), 12);
        assert_eq!(parse_note("A3").unwrap() + 12, A4);
    }

    #[test]
    fn sharps_and_flats_are_equal() {
        assert_eq!(parse_note("C#4"), parse_note("Db4"));
        assert_eq!(parse_note("Fs4"), parse_note("Gb4"));
        assert_eq!(parse_note("As4"), parse_note("Bb4"));
    }

    #[test]
    fn rejects_non_notes() {
        assert_eq!(parse_note("H4"), None);
        assert_eq!(parse_note("C"), None);
        assert_eq!(parse_note("A9"), None);
        assert_eq!(parse_note(""), None);
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(70), "A#4");
    }
}
