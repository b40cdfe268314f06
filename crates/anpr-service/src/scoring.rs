//! Plate text quality scoring.
//!
//! Scores favour strings that look like a number plate: a plausible length,
//! mostly alphanumeric characters and a mix of digits and letters. The score
//! only ranks OCR reads of the same plate against each other; it says nothing
//! about whether the text is a valid registration.

/// Maps recognized text to a quality score
pub trait PlateScorer: Send + Sync {
    fn score(&self, text: &str) -> u32;
}

/// Length / character-class heuristic used for live plate reads
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl PlateScorer for HeuristicScorer {
    fn score(&self, text: &str) -> u32 {
        score_plate_text(text)
    }
}

/// Score a plate read. Spaces and dashes do not count towards the length.
pub fn score_plate_text(text: &str) -> u32 {
    let len = text.chars().filter(|c| *c != ' ' && *c != '-').count();
    if len == 0 {
        return 0;
    }

    let mut score = match len {
        5..=9 => 30,
        3..=4 => 15,
        l if l > 9 => 10,
        _ => 0,
    };

    let alnum = text.chars().filter(|c| c.is_alphanumeric()).count();
    let alnum_ratio = alnum as f32 / len as f32;
    if alnum_ratio > 0.8 {
        score += 25;
    } else if alnum_ratio > 0.6 {
        score += 10;
    }

    let digits = text.chars().filter(|c| c.is_numeric()).count();
    if digits >= 2 {
        score += 15;
    }
    if digits >= 4 {
        score += 10;
    }

    if text.chars().any(char::is_alphabetic) {
        score += 10;
    }

    score
}
