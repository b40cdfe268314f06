//! Candidate boxes drawn on the live preview frame

use common::plates::{CandidatePhase, CandidateStatus};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

const ARMED: Rgb<u8> = Rgb([0, 255, 0]);
const UNARMED: Rgb<u8> = Rgb([255, 165, 0]);
const SAVED: Rgb<u8> = Rgb([0, 0, 255]);

const BORDER: u32 = 2;

pub fn phase_color(phase: CandidatePhase) -> Rgb<u8> {
    match phase {
        CandidatePhase::Armed => ARMED,
        CandidatePhase::Unarmed => UNARMED,
        CandidatePhase::Saved => SAVED,
    }
}

/// Copy of `frame` with a rectangle around every candidate
pub fn annotate(frame: &RgbImage, candidates: &[CandidateStatus]) -> RgbImage {
    let mut canvas = frame.clone();
    for candidate in candidates {
        let Some(bbox) = candidate.bbox.clamp_to(frame.width(), frame.height()) else {
            continue;
        };
        let color = phase_color(candidate.phase);
        for inset in 0..BORDER {
            if bbox.width <= 2 * inset || bbox.height <= 2 * inset {
                break;
            }
            let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32)
                .of_size(bbox.width - 2 * inset, bbox.height - 2 * inset);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }
    canvas
}
