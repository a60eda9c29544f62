use crate::camera::{CameraConstraints, CameraProvider, FrameSource};
use crate::common::{AttendanceError, Result};
use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};

const FRAME_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

enum Frame {
    File(PathBuf),
    Decoded(DynamicImage),
}

/// Plays still images in a loop, standing in for a live stream.
pub struct ReplaySource {
    frames: Vec<Frame>,
    position: usize,
    label: String,
}

impl ReplaySource {
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir)
            .map_err(|e| AttendanceError::Camera(format!("Cannot open frame directory {}: {}", dir.display(), e)))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(AttendanceError::Camera(format!("No image frames found in {}", dir.display())));
        }

        tracing::info!("Replaying {} frames from {}", paths.len(), dir.display());
        Ok(Self {
            frames: paths.into_iter().map(Frame::File).collect(),
            position: 0,
            label: format!("replay:{}", dir.display()),
        })
    }

    pub fn from_images(images: Vec<DynamicImage>) -> Self {
        Self {
            frames: images.into_iter().map(Frame::Decoded).collect(),
            position: 0,
            label: "replay:memory".to_string(),
        }
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<DynamicImage> {
        if self.frames.is_empty() {
            return Err(AttendanceError::Camera("Replay source has no frames".into()));
        }

        let frame = &self.frames[self.position % self.frames.len()];
        self.position = self.position.wrapping_add(1);
        match frame {
            Frame::File(path) => Ok(image::open(path)?),
            Frame::Decoded(image) => Ok(image.clone()),
        }
    }

    fn stop_tracks(&mut self) {
        self.frames.clear();
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

pub struct ReplayProvider {
    dir: PathBuf,
}

impl ReplayProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl CameraProvider for ReplayProvider {
    fn acquire(&self, _constraints: &CameraConstraints) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(ReplaySource::from_dir(&self.dir)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn replays_directory_frames_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(8, 8, Luma([200])).save(dir.path().join("b.png")).unwrap();
        GrayImage::from_pixel(8, 8, Luma([20])).save(dir.path().join("a.png")).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ReplaySource::from_dir(dir.path()).unwrap();
        let first = source.next_frame().unwrap().to_luma8();
        let second = source.next_frame().unwrap().to_luma8();
        let third = source.next_frame().unwrap().to_luma8();
        assert_eq!(first.get_pixel(0, 0)[0], 20);
        assert_eq!(second.get_pixel(0, 0)[0], 200);
        assert_eq!(third.get_pixel(0, 0)[0], 20);
    }

    #[test]
    fn missing_or_empty_directory_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ReplayProvider::new(dir.path());
        assert!(provider.acquire(&CameraConstraints::default()).is_err());
        assert!(ReplayProvider::new(dir.path().join("absent")).acquire(&CameraConstraints::default()).is_err());
    }
}
