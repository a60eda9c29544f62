use crate::camera::{CameraConstraints, FrameSource};
use crate::common::{AttendanceError, Result};
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb};
use std::fs;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub formats: Vec<String>,
    pub can_capture: bool,
}

/// List all /dev/video* devices with the pixel formats they advertise.
pub fn list_cameras() -> Result<Vec<CameraInfo>> {
    let mut cameras = Vec::new();

    for entry in fs::read_dir("/dev")? {
        let path = entry?.path();
        let filename = path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");

        let Some(index) = filename.strip_prefix("video").and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(device) = Device::new(index as usize) else {
            continue;
        };
        let Ok(caps) = device.query_caps() else {
            continue;
        };

        let formats = device.enum_formats()
            .unwrap_or_default()
            .iter()
            .map(|fmt| fmt.fourcc.str().unwrap_or("UNKNOWN").to_string())
            .collect();

        cameras.push(CameraInfo {
            index,
            name: caps.card.clone(),
            formats,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
        });
    }

    cameras.sort_by_key(|c| c.index);
    Ok(cameras)
}

pub struct V4l2Source {
    index: u32,
    stream: Option<Stream<'static>>,
    format: v4l::Format,
    _device: Device,
}

impl V4l2Source {
    pub fn open(index: u32, constraints: &CameraConstraints, warmup_frames: u32) -> Result<Self> {
        tracing::info!("Opening camera device {}", index);

        let device = Device::new(index as usize)
            .map_err(|e| AttendanceError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device.query_caps()
            .map_err(|e| AttendanceError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(AttendanceError::Camera(format!(
                "Device {} ({}) does not support video capture", index, caps.card
            )));
        }

        let mut fmt = device.format()
            .map_err(|e| AttendanceError::Camera(format!("Failed to get format: {}", e)))?;
        fmt.width = constraints.ideal_width;
        fmt.height = constraints.ideal_height;
        fmt.fourcc = FourCC::new(b"MJPG");

        // Ideal, not exact: keep whatever the driver settles on.
        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set {}x{} MJPG: {}. Using device defaults.", fmt.width, fmt.height, e);
        }

        let format = device.format()
            .map_err(|e| AttendanceError::Camera(format!("Failed to get final format: {}", e)))?;
        tracing::info!(
            "Camera {} streaming {}x{} {}",
            index, format.width, format.height, format.fourcc.str().unwrap_or("????")
        );

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, 4)
            .map_err(|e| AttendanceError::Camera(format!("Failed to create stream: {}", e)))?;

        for i in 0..warmup_frames {
            stream.next()
                .map_err(|e| AttendanceError::Camera(format!("Failed to capture warmup frame {}: {}", i, e)))?;
        }

        Ok(Self { index, stream: Some(stream), format, _device: device })
    }

    fn decode(&self, data: &[u8]) -> Result<DynamicImage> {
        let (width, height) = (self.format.width, self.format.height);
        match &self.format.fourcc.repr {
            b"MJPG" => Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?),
            b"GREY" => {
                let buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data.to_vec())
                    .ok_or_else(|| AttendanceError::Camera("Failed to create grayscale image buffer".into()))?;
                Ok(DynamicImage::ImageLuma8(buffer))
            }
            b"YUYV" => yuyv_to_rgb(data, width, height),
            other => Err(AttendanceError::Camera(format!(
                "Unsupported pixel format {}", String::from_utf8_lossy(other)
            ))),
        }
    }
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0] as f32, chunk[1] as f32 - 128.0, chunk[2] as f32, chunk[3] as f32 - 128.0);
        for y in [y0, y1] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }

    let buffer = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, rgb)
        .ok_or_else(|| AttendanceError::Camera("Truncated YUYV frame".into()))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

impl FrameSource for V4l2Source {
    fn next_frame(&mut self) -> Result<DynamicImage> {
        let stream = self.stream.as_mut()
            .ok_or_else(|| AttendanceError::Camera("Camera stream stopped".into()))?;
        let (buf, _meta) = stream.next()
            .map_err(|e| AttendanceError::Camera(format!("Failed to capture: {}", e)))?;
        let data = buf.to_vec();
        self.decode(&data)
    }

    fn stop_tracks(&mut self) {
        // Dropping the mmap stream issues VIDIOC_STREAMOFF.
        self.stream = None;
    }

    fn describe(&self) -> String {
        format!("/dev/video{}", self.index)
    }
}
