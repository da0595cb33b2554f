/*
Pattern API
===========

A pattern is one loop of steps. Each step has a length in beats, a velocity,
and either a pitch, an unpitched hit, or nothing (a rest). The scheduler walks
the steps in order and wraps back to the first one forever.

Mood files write patterns as text where every top-level slot gets the same
length (the module's `step` duration) and brackets split a slot further:

    "C4 E4 G4 C5"        four slots, one note each
    "C4 [E4 G4] _ _"     a slot, two half slots, two rests
    "[C4 E4 G4] _ _ _"   a triplet in the first slot
    "x _ x:0.4 _"        unpitched hits (percussion), second one quieter
    "[C4@2 E4] _"        weights: C4 takes 2/3 of the slot

Slot syntax: `NOTE[:velocity][@weight]`, where NOTE is a note name or `x`,
velocity is 0..=1 (default 1) and weight is a positive integer (default 1).
`_` is a rest.
*/

use crate::error::PatternError;
use crate::sequencing::duration::Duration;
use crate::sequencing::notes::parse_note;

/// A slot in a written pattern - a note, a rest, or a subdivision
#[derive(Debug, Clone, PartialEq)]
pub enum PatternSlot {
    Note(NoteSlot),
    /// Silence for this slot
    Rest,
    /// Subdivide this slot into smaller parts
    Subdivision(Vec<PatternSlot>),
}

/// A note with optional weight for uneven subdivisions
#[derive(Debug, Clone, PartialEq)]
pub struct NoteSlot {
    /// MIDI note number; `None` for an unpitched hit
    pub note: Option<u8>,
    pub velocity: f32,
    /// In a subdivision like [C4@2 E4], C4 gets 2/3 of the time
    pub weight: u8,
}

impl NoteSlot {
    pub fn new(note: Option<u8>) -> Self {
        Self {
            note,
            velocity: 1.0,
            weight: 1,
        }
    }

    pub fn with_velocity(mut self, velocity: f32) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_weight(mut self, weight: u8) -> Self {
        self.weight = weight;
        self
    }
}

impl From<u8> for PatternSlot {
    fn from(note: u8) -> Self {
        PatternSlot::Note(NoteSlot::new(Some(note)))
    }
}

/// One step of a pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub is_rest: bool,
    /// Length in beats (quarter notes); always > 0 in a valid pattern
    pub beats: f64,
    /// 0..=1
    pub velocity: f32,
    /// MIDI note, or `None` for unpitched hits and rests
    pub note: Option<u8>,
}

impl Step {
    pub fn note(note: u8, beats: f64) -> Self {
        Self {
            is_rest: false,
            beats,
            velocity: 1.0,
            note: Some(note),
        }
    }

    pub fn hit(beats: f64) -> Self {
        Self {
            is_rest: false,
            beats,
            velocity: 1.0,
            note: None,
        }
    }

    pub fn rest(beats: f64) -> Self {
        Self {
            is_rest: true,
            beats,
            velocity: 0.0,
            note: None,
        }
    }

    pub fn with_velocity(mut self, velocity: f32) -> Self {
        self.velocity = velocity;
        self
    }
}

/// A validated loop of steps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pattern {
    steps: Vec<Step>,
}

impl Pattern {
    /// Validate and wrap `steps`. An empty pattern is valid; a scheduler given
    /// one stops itself.
    pub fn new(steps: Vec<Step>) -> Result<Self, PatternError> {
        for (index, step) in steps.iter().enumerate() {
            if !(step.beats > 0.0 && step.beats.is_finite()) {
                return Err(PatternError::NonPositiveDuration {
                    index,
                    beats: step.beats,
                });
            }
            if !(0.0..=1.0).contains(&step.velocity) {
                return Err(PatternError::VelocityOutOfRange {
                    index,
                    velocity: step.velocity,
                });
            }
        }
        Ok(Self { steps })
    }

    /// Expand written slots, giving every top-level slot the length `slot`.
    pub fn from_slots(slots: &[PatternSlot], slot: Duration) -> Result<Self, PatternError> {
        let mut steps = Vec::new();
        for s in slots {
            Self::expand_slot(s, slot.beats(), &mut steps)?;
        }
        Self::new(steps)
    }

    /// Parse the text form described at the top of this module.
    pub fn parse(text: &str, slot: Duration) -> Result<Self, PatternError> {
        let spaced = text.replace('[', " [ ").replace(']', " ] ");
        let mut tokens = spaced.split_whitespace();
        let slots = parse_slots(&mut tokens, 0)?;
        Self::from_slots(&slots, slot)
    }

    /// Recursively expand a slot into steps
    fn expand_slot(slot: &PatternSlot, beats: f64, steps: &mut Vec<Step>) -> Result<(), PatternError> {
        match slot {
            PatternSlot::Note(n) => {
                steps.push(Step {
                    is_rest: false,
                    beats,
                    velocity: n.velocity,
                    note: n.note,
                });
            }
            PatternSlot::Rest => steps.push(Step::rest(beats)),
            PatternSlot::Subdivision(sub_slots) => {
                if sub_slots.is_empty() {
                    return Err(PatternError::EmptySubdivision);
                }
                let weight = |s: &PatternSlot| match s {
                    PatternSlot::Note(n) => n.weight.max(1) as f64,
                    _ => 1.0,
                };
                let total_weight: f64 = sub_slots.iter().map(weight).sum();
                for sub_slot in sub_slots {
                    Self::expand_slot(sub_slot, beats * weight(sub_slot) / total_weight, steps)?;
                }
            }
        }
        Ok(())
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn total_beats(&self) -> f64 {
        self.steps.iter().map(|s| s.beats).sum()
    }

    /// Index of the loudest sounding step; on ties the earliest one wins.
    pub fn anchor_index(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (index, step) in self.steps.iter().enumerate().filter(|(_, s)| !s.is_rest) {
            match best {
                Some((_, velocity)) if step.velocity <= velocity => {}
                _ => best = Some((index, step.velocity)),
            }
        }
        best.map(|(index, _)| index)
    }
}

fn parse_slots<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    depth: usize,
) -> Result<Vec<PatternSlot>, PatternError> {
    let mut slots = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            "[" => {
                let inner = parse_slots(tokens, depth + 1)?;
                if inner.is_empty() {
                    return Err(PatternError::EmptySubdivision);
                }
                slots.push(PatternSlot::Subdivision(inner));
            }
            "]" if depth == 0 => return Err(PatternError::UnbalancedBrackets),
            "]" => return Ok(slots),
            _ => slots.push(parse_token(token)?),
        }
    }
    if depth > 0 {
        return Err(PatternError::UnbalancedBrackets);
    }
    Ok(slots)
}

fn parse_token(token: &str) -> Result<PatternSlot, PatternError> {
    let fail = |reason| PatternError::Token {
        token: token.to_string(),
        reason,
    };

    if token == "_" {
        return Ok(PatternSlot::Rest);
    }

    let (body, weight) = match token.split_once('@') {
        Some((body, weight)) => {
            let weight: u8 = weight.parse().map_err(|_| fail("weight is not a positive integer"))?;
            if weight == 0 {
                return Err(fail("weight is not a positive integer"));
            }
            (body, weight)
        }
        None => (token, 1),
    };

    let (name, velocity) = match body.split_once(':') {
        Some((name, velocity)) => (
            name,
            velocity.parse::<f32>().map_err(|_| fail("velocity is not a number"))?,
        ),
        None => (body, 1.0),
    };

    let note = match name {
        "x" | "X" => None,
        _ => Some(parse_note(name).ok_or_else(|| fail("unknown note name"))?),
    };

    Ok(PatternSlot::Note(
        NoteSlot::new(note).with_velocity(velocity).with_weight(weight),
    ))
}

/// Helper functions for building pattern slots
pub mod slot {
    use super::*;

    pub fn note(midi_note: u8) -> PatternSlot {
        PatternSlot::Note(NoteSlot::new(Some(midi_note)))
    }

    pub fn note_vel(midi_note: u8, velocity: f32) -> PatternSlot {
        PatternSlot::Note(NoteSlot::new(Some(midi_note)).with_velocity(velocity))
    }

    pub fn note_weight(midi_note: u8, weight: u8) -> PatternSlot {
        PatternSlot::Note(NoteSlot::new(Some(midi_note)).with_weight(weight))
    }

    pub fn rest() -> PatternSlot {
        PatternSlot::Rest
    }

    pub fn sub(slots: Vec<PatternSlot>) -> PatternSlot {
        PatternSlot::Subdivision(slots)
    }
}
