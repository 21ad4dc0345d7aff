//! Grayscale camera frames with an owner-supplied release hook.

use std::sync::Arc;

use super::{SensorSample, Timestamp};

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// An 8-bit grayscale frame.
///
/// The pixel buffer belongs to the capture layer. `release` is invoked
/// exactly once, when the frame is dropped: after processing, after being
/// evicted from a full queue, after a late drop, or on queue reset.
pub struct ImageFrame {
    pub timestamp: Timestamp,
    /// Exposure duration in microseconds.
    pub exposure_us: u64,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub data: Arc<[u8]>,
    release: Option<ReleaseFn>,
}

impl ImageFrame {
    pub fn new(
        timestamp: Timestamp,
        width: usize,
        height: usize,
        stride: usize,
        data: Arc<[u8]>,
    ) -> Self {
        Self {
            timestamp,
            exposure_us: 0,
            width,
            height,
            stride,
            data,
            release: None,
        }
    }

    pub fn with_exposure(mut self, exposure_us: u64) -> Self {
        self.exposure_us = exposure_us;
        self
    }

    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    /// True when the buffer holds at least `stride * height` bytes.
    pub fn is_well_formed(&self) -> bool {
        self.stride >= self.width
            && self
                .stride
                .checked_mul(self.height)
                .is_some_and(|required| self.data.len() >= required)
    }

    pub fn view(&self) -> ImageView<'_> {
        ImageView {
            width: self.width,
            height: self.height,
            stride: self.stride,
            data: &self.data,
        }
    }
}

impl Drop for ImageFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl SensorSample for ImageFrame {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl std::fmt::Debug for ImageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFrame")
            .field("timestamp", &self.timestamp)
            .field("exposure_us", &self.exposure_us)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// Borrowed pixel access.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub data: &'a [u8],
}

impl<'a> ImageView<'a> {
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.stride + x]
    }

    #[inline]
    pub fn contains(&self, x: i64, y: i64, border: i64) -> bool {
        x >= border && y >= border && x < self.width as i64 - border && y < self.height as i64 - border
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_release_runs_once_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let frame = ImageFrame::new(Timestamp(10), 4, 2, 4, Arc::from(vec![0u8; 8]))
            .with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        assert!(frame.is_well_formed());
        drop(frame);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_dimensions_are_malformed() {
        let frame = ImageFrame::new(Timestamp(1), usize::MAX / 2, 3, usize::MAX / 2, Arc::from(vec![0u8; 16]));
        assert!(!frame.is_well_formed());
        let short = ImageFrame::new(Timestamp(1), 4, 4, 4, Arc::from(vec![0u8; 15]));
        assert!(!short.is_well_formed());
    }

    #[test]
    fn test_view_indexing_uses_stride() {
        let data: Vec<u8> = (0..12).collect();
        let frame = ImageFrame::new(Timestamp(1), 3, 2, 6, Arc::from(data));
        let view = frame.view();
        assert_eq!(view.at(0, 1), 6);
        assert_eq!(view.at(2, 1), 8);
        assert!(view.contains(1, 0, 0));
        assert!(!view.contains(3, 0, 0));
    }
}
