//! Visual guide drawn over frames: corner brackets around cascade hits, or an oval
//! target in heuristic mode.

use crate::core::detector::{DetectorMode, FaceBox, PresenceSignal};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_ellipse_mut, draw_line_segment_mut};
use std::f32::consts::TAU;

const BRACKET_GREEN: Rgb<u8> = Rgb([16, 185, 129]);
const AMBER: Rgb<u8> = Rgb([245, 158, 11]);
const SCAN_BLUE: Rgb<u8> = Rgb([59, 130, 246]);
const DASH_SEGMENTS: u32 = 48;

pub fn annotate(frame: &DynamicImage, signal: &PresenceSignal) -> RgbImage {
    let mut canvas = frame.to_rgb8();
    match signal.mode {
        DetectorMode::Cascade => {
            for face in &signal.boxes {
                draw_brackets(&mut canvas, face, BRACKET_GREEN);
            }
        }
        DetectorMode::Heuristic => draw_oval_guide(&mut canvas, signal.present),
    }
    canvas
}

/// Four L-shaped corners, each a fifth of the box side.
pub fn draw_brackets(canvas: &mut RgbImage, face: &FaceBox, color: Rgb<u8>) {
    let lx = face.width() * 0.2;
    let ly = face.height() * 0.2;
    let (x1, y1, x2, y2) = (face.x1, face.y1, face.x2, face.y2);

    let corners = [
        ((x1, y1), (x1 + lx, y1), (x1, y1 + ly)),
        ((x2, y1), (x2 - lx, y1), (x2, y1 + ly)),
        ((x1, y2), (x1 + lx, y2), (x1, y2 - ly)),
        ((x2, y2), (x2 - lx, y2), (x2, y2 - ly)),
    ];
    for (corner, horizontal, vertical) in corners {
        draw_line_segment_mut(canvas, corner, horizontal, color);
        draw_line_segment_mut(canvas, corner, vertical, color);
    }
}

/// Centered face-shaped oval: solid amber once something is in frame, dashed blue while scanning.
pub fn draw_oval_guide(canvas: &mut RgbImage, detected: bool) {
    let (w, h) = canvas.dimensions();
    let center = ((w / 2) as i32, (h / 2) as i32);
    let rx = (w as f32 * 0.22) as i32;
    let ry = (h as f32 * 0.38) as i32;

    if detected {
        draw_hollow_ellipse_mut(canvas, center, rx, ry, AMBER);
        return;
    }

    let point = |i: u32| {
        let t = TAU * i as f32 / DASH_SEGMENTS as f32;
        (center.0 as f32 + rx as f32 * t.cos(), center.1 as f32 + ry as f32 * t.sin())
    };
    for i in (0..DASH_SEGMENTS).step_by(2) {
        draw_line_segment_mut(canvas, point(i), point(i + 1), SCAN_BLUE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(mode: DetectorMode, present: bool, boxes: Vec<FaceBox>) -> PresenceSignal {
        PresenceSignal { present, detected_now: present, mode, boxes, mean: None }
    }

    fn count(img: &RgbImage, color: Rgb<u8>) -> usize {
        img.pixels().filter(|p| **p == color).count()
    }

    #[test]
    fn brackets_mark_box_corners() {
        let frame = DynamicImage::new_rgb8(100, 100);
        let face = FaceBox { x1: 20.0, y1: 20.0, x2: 70.0, y2: 80.0 };
        let out = annotate(&frame, &signal(DetectorMode::Cascade, true, vec![face]));

        assert_eq!(*out.get_pixel(20, 20), BRACKET_GREEN);
        assert_eq!(*out.get_pixel(70, 80), BRACKET_GREEN);
        // Middle of the top edge is left open.
        assert_eq!(*out.get_pixel(45, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn oval_is_dashed_while_scanning_and_solid_when_detected() {
        let frame = DynamicImage::new_rgb8(200, 200);
        let scanning = annotate(&frame, &signal(DetectorMode::Heuristic, false, vec![]));
        let detected = annotate(&frame, &signal(DetectorMode::Heuristic, true, vec![]));

        assert!(count(&scanning, SCAN_BLUE) > 0);
        assert_eq!(count(&scanning, AMBER), 0);
        assert!(count(&detected, AMBER) > count(&scanning, SCAN_BLUE));
    }
}
