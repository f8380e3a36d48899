//! Frame decoding and the clip preprocessing transform.

use std::fs::File;
use std::path::Path;

use gif::DisposalMethod;
use image::{imageops::FilterType, RgbImage, RgbaImage};
use tch::{Kind, Tensor};

use crate::config::{FRAME_SIZE, MIN_TIME_STEPS};
use crate::error::{Error, Result};

/// Decodes a video file into RGB frames.
pub trait VideoReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<RgbImage>>;

    fn frame_count(&self, path: &Path) -> Result<usize> {
        Ok(self.read(path)?.len())
    }
}

/// Reads animated GIFs, compositing each frame rectangle onto a full canvas.
#[derive(Debug, Clone, Copy, Default)]
pub struct GifReader;

impl GifReader {
    fn decoder(path: &Path) -> Result<gif::Decoder<File>> {
        let mut options = gif::DecodeOptions::new();
        options.set_color_output(gif::ColorOutput::RGBA);
        Ok(options.read_info(File::open(path)?)?)
    }
}

impl VideoReader for GifReader {
    fn read(&self, path: &Path) -> Result<Vec<RgbImage>> {
        let mut decoder = Self::decoder(path)?;
        let (width, height) = (decoder.width() as u32, decoder.height() as u32);
        let mut canvas = RgbaImage::new(width, height);
        let mut frames = vec![];
        let mut pending: Option<Disposal> = None;

        while let Some(frame) = decoder.read_next_frame()? {
            if let Some(disposal) = pending.take() {
                disposal.apply(&mut canvas);
            }
            let patch = RgbaImage::from_raw(frame.width as u32, frame.height as u32, frame.buffer.to_vec())
                .ok_or_else(|| Error::Dataset(format!("{}: truncated gif frame", path.display())))?;
            let (left, top) = (frame.left as i64, frame.top as i64);
            pending = match frame.dispose {
                DisposalMethod::Background => Some(Disposal::Clear {
                    left,
                    top,
                    width: patch.width(),
                    height: patch.height(),
                }),
                DisposalMethod::Previous => Some(Disposal::Restore(canvas.clone())),
                DisposalMethod::Any | DisposalMethod::Keep => None,
            };
            image::imageops::overlay(&mut canvas, &patch, left, top);
            frames.push(image::DynamicImage::ImageRgba8(canvas.clone()).into_rgb8());
        }
        Ok(frames)
    }

    fn frame_count(&self, path: &Path) -> Result<usize> {
        let mut decoder = Self::decoder(path)?;
        let mut count = 0;
        while decoder.read_next_frame()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

/// What happens to the canvas before the next GIF frame is drawn.
enum Disposal {
    /// Reset the previous frame's rectangle to transparent.
    Clear { left: i64, top: i64, width: u32, height: u32 },
    /// Go back to the canvas as it was before the previous frame.
    Restore(RgbaImage),
}

impl Disposal {
    fn apply(self, canvas: &mut RgbaImage) {
        match self {
            Disposal::Clear { left, top, width, height } => {
                image::imageops::replace(canvas, &RgbaImage::new(width, height), left, top);
            }
            Disposal::Restore(previous) => *canvas = previous,
        }
    }
}

/// Turns decoded frames into a clip tensor `[3, frames, size, size]` with
/// values in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipTransform {
    pub frames: usize,
    pub size: u32,
}

impl Default for ClipTransform {
    fn default() -> Self {
        Self { frames: MIN_TIME_STEPS as usize, size: FRAME_SIZE as u32 }
    }
}

impl ClipTransform {
    /// Indices of the frames kept from a video of `available` frames: evenly
    /// spaced when there are enough, the last frame repeated otherwise.
    pub fn sample_indices(&self, available: usize) -> Vec<usize> {
        if available == 0 {
            vec![]
        } else if available >= self.frames {
            (0..self.frames).map(|i| i * available / self.frames).collect()
        } else {
            (0..self.frames).map(|i| i.min(available - 1)).collect()
        }
    }

    pub fn apply(&self, frames: &[RgbImage]) -> Result<Tensor> {
        if frames.is_empty() {
            return Err(Error::Dataset("video has no frames".into()));
        }
        let size = self.size;
        let sampled = self
            .sample_indices(frames.len())
            .into_iter()
            .map(|index| {
                let frame = &frames[index];
                if frame.dimensions() == (size, size) {
                    frame.clone()
                } else {
                    image::imageops::resize(frame, size, size, FilterType::Triangle)
                }
            })
            .collect::<Vec<_>>();
        frames_to_clip(&sampled)
    }
}

/// Stacks equally sized frames into `[3, frames, height, width]`, scaled to
/// `[-1, 1]`.
pub fn frames_to_clip(frames: &[RgbImage]) -> Result<Tensor> {
    let (width, height) = match frames.first() {
        Some(frame) => frame.dimensions(),
        None => return Err(Error::Dataset("video has no frames".into())),
    };
    let mut data = Vec::with_capacity(frames.len() * (width * height * 3) as usize);
    for frame in frames {
        if frame.dimensions() != (width, height) {
            return Err(Error::Dataset(format!(
                "frame size {:?} differs from first frame {:?}",
                frame.dimensions(),
                (width, height)
            )));
        }
        data.extend_from_slice(frame.as_raw());
    }

    let clip = Tensor::from_slice(&data)
        .view([frames.len() as i64, height as i64, width as i64, 3])
        .permute([3, 0, 1, 2])
        .to_kind(Kind::Float)
        / 127.5
        - 1.0;
    Ok(clip.contiguous())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn sample_indices_spread_or_repeat() {
        let transform = ClipTransform { frames: 4, size: 8 };
        assert_eq!(transform.sample_indices(8), vec![0, 2, 4, 6]);
        assert_eq!(transform.sample_indices(4), vec![0, 1, 2, 3]);
        assert_eq!(transform.sample_indices(2), vec![0, 1, 1, 1]);
    }

    #[test]
    fn transform_layout_and_range() {
        let transform = ClipTransform { frames: 4, size: 8 };
        let frames = (0..3u8)
            .map(|i| RgbImage::from_pixel(16, 12, Rgb([255, i * 100, 0])))
            .collect::<Vec<_>>();
        let clip = transform.apply(&frames).unwrap();
        assert_eq!(clip.size(), [3, 4, 8, 8]);
        assert!((clip.double_value(&[0, 0, 0, 0]) - 1.0).abs() < 1e-6);
        assert!((clip.double_value(&[2, 3, 7, 7]) + 1.0).abs() < 1e-6);
        assert!(clip.min().double_value(&[]) >= -1.0);
        assert!(clip.max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn raw_frames_keep_their_size() {
        let frames = vec![RgbImage::new(10, 6); 5];
        let clip = frames_to_clip(&frames).unwrap();
        assert_eq!(clip.size(), [3, 5, 6, 10]);

        let mixed = vec![RgbImage::new(10, 6), RgbImage::new(6, 6)];
        assert!(matches!(frames_to_clip(&mixed), Err(Error::Dataset(_))));
    }

    fn write_disposal_gif(path: &Path, dispose: DisposalMethod) {
        let mut file = File::create(path).unwrap();
        let mut encoder = gif::Encoder::new(&mut file, 4, 4, &[]).unwrap();

        let red = [255u8, 0, 0].repeat(16);
        let mut first = gif::Frame::from_rgb(4, 4, &red);
        first.dispose = dispose;
        encoder.write_frame(&first).unwrap();

        let green = [0u8, 255, 0].repeat(4);
        let mut second = gif::Frame::from_rgb(2, 2, &green);
        second.left = 0;
        second.top = 0;
        encoder.write_frame(&second).unwrap();
    }

    #[test]
    fn gif_frames_honour_disposal() {
        let dir = tempfile::tempdir().unwrap();

        let kept = dir.path().join("kept.gif");
        write_disposal_gif(&kept, DisposalMethod::Keep);
        let frames = GifReader.read(&kept).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].get_pixel(0, 0)[1] > 128);
        assert!(frames[1].get_pixel(3, 3)[0] > 128);

        let cleared = dir.path().join("cleared.gif");
        write_disposal_gif(&cleared, DisposalMethod::Background);
        let frames = GifReader.read(&cleared).unwrap();
        assert!(frames[0].get_pixel(3, 3)[0] > 128);
        assert!(frames[1].get_pixel(0, 0)[1] > 128);
        assert!(frames[1].get_pixel(3, 3)[0] < 128);
    }

    #[test]
    fn empty_video_is_rejected() {
        let transform = ClipTransform::default();
        assert!(matches!(transform.apply(&[]), Err(Error::Dataset(_))));
    }
}
