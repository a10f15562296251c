//! # Note Frequency Module
//!
//! Maps the 88 piano keys onto musical notes using 12-tone equal temperament.
//! Key 27 is the reference `C0` (octave 0, semitone 0), so the lowest key is
//! `A-3` at 27.5 Hz and `A1` (octave 1, semitone 9) is the 440 Hz anchor.
//!
//! The axis label table used by spectrum renderers is computed once and shared.

use once_cell::sync::Lazy;

use crate::error::{Result, SpectrumError};

/// Number of keys on a standard piano.
pub const KEY_COUNT: u8 = 88;

/// Key index of the reference note (octave 0, semitone 0).
const REFERENCE_KEY: i32 = 27;

/// Note names indexed by semitone. `H` is the German name for B.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "H",
];

/// Semitones that get an axis label: C, E and A.
const LABELLED_SEMITONES: [i32; 3] = [0, 4, 9];

/// A piano key index in `[0, 87]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PianoKey(u8);

impl PianoKey {
    pub fn new(key: i32) -> Result<Self> {
        if (0..i32::from(KEY_COUNT)).contains(&key) {
            Ok(PianoKey(key as u8))
        } else {
            Err(SpectrumError::ContractViolation(format!(
                "piano key {} outside [0, {}]",
                key,
                KEY_COUNT - 1
            )))
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// Octave and semitone of this key.
    pub fn note(self) -> (i32, i32) {
        let offset = i32::from(self.0) - REFERENCE_KEY;
        (offset.div_euclid(12), offset.rem_euclid(12))
    }

    pub fn frequency(self) -> f64 {
        let (octave, semitone) = self.note();
        note_to_frequency(octave, semitone)
    }

    pub fn label(self) -> String {
        let (octave, semitone) = self.note();
        // note() always yields a semitone in [0, 11]
        format!("{}{}", NOTE_NAMES[semitone as usize], octave)
    }

    /// Iterates over all 88 keys from lowest to highest.
    pub fn all() -> impl Iterator<Item = PianoKey> {
        (0..KEY_COUNT).map(PianoKey)
    }
}

/// Converts a key index into `(octave, semitone)` using floor division.
pub fn key_to_note(key: i32) -> Result<(i32, i32)> {
    PianoKey::new(key).map(PianoKey::note)
}

/// Equal-temperament frequency in Hz, anchored at octave 1 semitone 9 = 440 Hz.
pub fn note_to_frequency(octave: i32, semitone: i32) -> f64 {
    440.0 * 2f64.powf(f64::from(semitone - 9) / 12.0) * 2f64.powi(octave - 1)
}

/// Display name such as `C#2` or `A-1`.
///
/// # Errors
/// * `ContractViolation` - `semitone` is outside `[0, 11]`
pub fn note_to_label(octave: i32, semitone: i32) -> Result<String> {
    let name = usize::try_from(semitone)
        .ok()
        .and_then(|index| NOTE_NAMES.get(index))
        .ok_or_else(|| {
            SpectrumError::ContractViolation(format!("semitone {} outside [0, 11]", semitone))
        })?;
    Ok(format!("{}{}", name, octave))
}

/// Finds the piano key whose frequency is closest (in log distance) to `freq`.
///
/// Returns `None` for non-positive or non-finite input.
pub fn nearest_key(freq: f64) -> Option<PianoKey> {
    if !(freq.is_finite() && freq > 0.0) {
        return None;
    }
    let target = freq.log2();
    PianoKey::all().min_by(|a, b| {
        let diff_a = (a.frequency().log2() - target).abs();
        let diff_b = (b.frequency().log2() - target).abs();
        diff_a.total_cmp(&diff_b)
    })
}

/// `(log10(frequency), label)` for every C, E and A on the keyboard, ordered by frequency.
static NOTE_LABELS: Lazy<Vec<(f64, String)>> = Lazy::new(|| {
    PianoKey::all()
        .filter(|key| LABELLED_SEMITONES.contains(&key.note().1))
        .map(|key| (key.frequency().log10(), key.label()))
        .collect()
});

/// Axis annotation table for a log-frequency spectrum plot.
pub fn note_label_table() -> &'static [(f64, String)] {
    &NOTE_LABELS
}
