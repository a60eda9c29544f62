use crate::core::detector::{DetectorMode, FaceBox, PresenceSignal};
use crossterm::{
    cursor,
    event::{self, Event, KeyEvent, KeyEventKind},
    terminal::{self, ClearType},
};
use image::DynamicImage;
use std::io::{self, Write};
use std::time::Duration;

const ASCII_RAMP: &str = " .·:;+=xX#@";
const DEFAULT_WIDTH: usize = 80;
const DEFAULT_HEIGHT: usize = 30;

pub struct AsciiRenderer {
    width: usize,
    height: usize,
}

impl AsciiRenderer {
    pub fn new(width: Option<usize>, height: Option<usize>) -> Self {
        let (term_width, term_height) = terminal::size()
            .map(|(w, h)| (w as usize, h as usize))
            .unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));

        // Half resolution keeps redraws cheap at the 33ms tick.
        Self {
            width: width.unwrap_or((term_width / 2).min(DEFAULT_WIDTH / 2)).max(8),
            height: height.unwrap_or((term_height.saturating_sub(5) / 2).min(DEFAULT_HEIGHT / 2)).max(4),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Frame as ASCII art with the detection guide drawn in and `status` on the last row.
    pub fn render(&self, image: &DynamicImage, signal: &PresenceSignal, status: &str) -> String {
        let mut grid = self.image_to_ascii(image);
        let (img_width, img_height) = (image.width() as f32, image.height() as f32);

        match signal.mode {
            DetectorMode::Cascade => {
                for face in &signal.boxes {
                    self.draw_face_box(&mut grid, face, img_width, img_height);
                }
            }
            DetectorMode::Heuristic => self.draw_oval(&mut grid, signal.present),
        }

        let bottom = self.height - 1;
        self.overlay_text(&mut grid, status, self.width / 2, bottom);
        self.grid_to_string(&grid)
    }

    fn image_to_ascii(&self, image: &DynamicImage) -> Vec<Vec<char>> {
        let mut grid = vec![vec![' '; self.width]; self.height];
        let ramp: Vec<char> = ASCII_RAMP.chars().collect();

        let gray = image.to_luma8();
        let (img_width, img_height) = gray.dimensions();

        for term_y in 0..self.height {
            for term_x in 0..self.width {
                let img_x = (term_x as f32 / self.width as f32 * img_width as f32) as u32;
                let img_y = (term_y as f32 / self.height as f32 * img_height as f32) as u32;

                if img_x < img_width && img_y < img_height {
                    let brightness = gray.get_pixel(img_x, img_y)[0] as usize;
                    grid[term_y][term_x] = ramp[brightness * (ramp.len() - 1) / 255];
                }
            }
        }

        grid
    }

    fn overlay_text(&self, grid: &mut [Vec<char>], text: &str, center_x: usize, y: usize) {
        if y >= self.height {
            return;
        }

        let text_len = text.chars().count();
        let start_x = center_x.saturating_sub(text_len / 2);

        for (i, ch) in text.chars().enumerate() {
            let x = start_x + i;
            if x < self.width {
                grid[y][x] = ch;
            }
        }
    }

    fn draw_face_box(&self, grid: &mut [Vec<char>], face: &FaceBox, img_width: f32, img_height: f32) {
        let scale_x = |x: f32| (((x / img_width) * self.width as f32) as usize).min(self.width - 1);
        let scale_y = |y: f32| (((y / img_height) * self.height as f32) as usize).min(self.height - 1);
        let (x1, x2) = (scale_x(face.x1), scale_x(face.x2));
        let (y1, y2) = (scale_y(face.y1), scale_y(face.y2));
        if x2 <= x1 || y2 <= y1 {
            return;
        }

        // Corner brackets only; the middle of each edge stays open.
        let arm_x = ((x2 - x1) / 5).max(1);
        let arm_y = ((y2 - y1) / 5).max(1);

        for x in x1..=(x1 + arm_x) {
            grid[y1][x] = '─';
            grid[y2][x] = '─';
        }
        for x in (x2 - arm_x)..=x2 {
            grid[y1][x] = '─';
            grid[y2][x] = '─';
        }
        for y in y1..=(y1 + arm_y) {
            grid[y][x1] = '│';
            grid[y][x2] = '│';
        }
        for y in (y2 - arm_y)..=y2 {
            grid[y][x1] = '│';
            grid[y][x2] = '│';
        }

        grid[y1][x1] = '┌';
        grid[y1][x2] = '┐';
        grid[y2][x1] = '└';
        grid[y2][x2] = '┘';
    }

    /// Same proportions as the image overlay; dotted while scanning.
    fn draw_oval(&self, grid: &mut [Vec<char>], detected: bool) {
        let (cx, cy) = (self.width as f32 / 2.0, self.height as f32 / 2.0);
        let (rx, ry) = (self.width as f32 * 0.22, self.height as f32 * 0.38);
        let steps = 64;

        for i in 0..steps {
            if !detected && i % 2 == 1 {
                continue;
            }
            let t = std::f32::consts::TAU * i as f32 / steps as f32;
            let x = (cx + rx * t.cos()).round() as usize;
            let y = (cy + ry * t.sin()).round() as usize;
            if x < self.width && y < self.height {
                grid[y][x] = if detected { 'o' } else { '.' };
            }
        }
    }

    fn grid_to_string(&self, grid: &[Vec<char>]) -> String {
        grid.iter()
            .map(|row| row.iter().take(self.width).collect::<String>())
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

pub fn clear_screen() -> io::Result<()> {
    crossterm::execute!(
        io::stdout(),
        terminal::Clear(ClearType::All),
        cursor::MoveTo(0, 0)
    )?;
    io::stdout().flush()
}

/// Next key press, waiting at most `timeout`.
pub fn poll_key(timeout: Duration) -> io::Result<Option<KeyEvent>> {
    if event::poll(timeout)? {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Press {
                return Ok(Some(key));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(mode: DetectorMode, present: bool, boxes: Vec<FaceBox>) -> PresenceSignal {
        PresenceSignal { present, detected_now: present, mode, boxes, mean: None }
    }

    #[test]
    fn face_box_corners_land_on_scaled_cells() {
        let renderer = AsciiRenderer::new(Some(20), Some(10));
        let frame = DynamicImage::new_rgb8(200, 100);
        let face = FaceBox { x1: 50.0, y1: 20.0, x2: 150.0, y2: 80.0 };
        let out = renderer.render(&frame, &signal(DetectorMode::Cascade, true, vec![face]), "");

        let rows: Vec<Vec<char>> = out.split("\r\n").map(|r| r.chars().collect()).collect();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[2][5], '┌');
        assert_eq!(rows[2][15], '┐');
        assert_eq!(rows[8][5], '└');
        assert_eq!(rows[8][15], '┘');
        assert_eq!(rows[2][10], ' ');
    }

    #[test]
    fn status_is_centered_on_last_row() {
        let renderer = AsciiRenderer::new(Some(20), Some(6));
        let frame = DynamicImage::new_rgb8(40, 40);
        let out = renderer.render(&frame, &signal(DetectorMode::Heuristic, false, vec![]), "READY");

        let last = out.split("\r\n").last().unwrap();
        assert_eq!(last.chars().count(), 20);
        assert!(last.contains("READY"));
    }

    #[test]
    fn oval_guide_is_solid_only_when_detected() {
        let renderer = AsciiRenderer::new(Some(30), Some(15));
        let frame = DynamicImage::new_rgb8(60, 60);
        let scanning = renderer.render(&frame, &signal(DetectorMode::Heuristic, false, vec![]), "");
        let detected = renderer.render(&frame, &signal(DetectorMode::Heuristic, true, vec![]), "");

        assert!(scanning.contains('.') && !scanning.contains('o'));
        assert!(detected.contains('o'));
    }
}
