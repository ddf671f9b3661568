use std::sync::Arc;

use parking_lot::Mutex;

use crate::capture::frame::Image;

#[derive(Default)]
struct Slot {
    image: Option<Arc<Image>>,
    fresh: bool,
}

/// Single-slot "latest frame" register.
///
/// The image and its freshness flag sit behind one lock and always change
/// together, so a reader that sees the flag set also sees that image or a
/// newer one.
#[derive(Default)]
pub(crate) struct LatestFrame {
    slot: Mutex<Slot>,
}

impl LatestFrame {
    /// Writer side, called from the driver thread.
    pub(crate) fn publish(&self, image: Arc<Image>) {
        let previous = {
            let mut slot = self.slot.lock();
            slot.fresh = true;
            slot.image.replace(image)
        };
        // Release the old frame outside the critical section.
        drop(previous);
    }

    pub(crate) fn current(&self) -> Option<Arc<Image>> {
        self.slot.lock().image.clone()
    }

    pub(crate) fn poll_new(&self) -> bool {
        std::mem::take(&mut self.slot.lock().fresh)
    }

    pub(crate) fn take_new(&self) -> Option<Arc<Image>> {
        let mut slot = self.slot.lock();
        if std::mem::take(&mut slot.fresh) {
            slot.image.clone()
        } else {
            None
        }
    }
}

/// Cloneable read handle to a controller's latest frame, usable from any thread
#[derive(Clone)]
pub struct FrameReader {
    cache: Arc<LatestFrame>,
}

impl FrameReader {
    pub(crate) fn new(cache: Arc<LatestFrame>) -> Self {
        Self { cache }
    }

    /// Most recent image, if any frame was ever delivered. Leaves the flag alone.
    pub fn current_frame(&self) -> Option<Arc<Image>> {
        self.cache.current()
    }

    /// Tests and clears the "new frame" flag, returning its prior value.
    pub fn poll_new_frame(&self) -> bool {
        self.cache.poll_new()
    }

    /// The current image if it has not been consumed yet, clearing the flag.
    pub fn take_new_frame(&self) -> Option<Arc<Image>> {
        self.cache.take_new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use image::{DynamicImage, GrayImage};

    use super::*;
    use crate::capture::frame::{FrameFormat, PixelFormat};

    fn image(frame_id: u64) -> Arc<Image> {
        Arc::new(Image::new(
            DynamicImage::ImageLuma8(GrayImage::new(1, 1)),
            frame_id,
            SystemTime::now(),
            FrameFormat::new(1, 1, PixelFormat::Mono8),
        ))
    }

    #[test]
    fn empty_cache_has_nothing_new() {
        let cache = LatestFrame::default();
        assert!(cache.current().is_none());
        assert!(!cache.poll_new());
        assert!(cache.take_new().is_none());
    }

    #[test]
    fn poll_clears_flag_but_keeps_image() {
        let cache = LatestFrame::default();
        cache.publish(image(1));

        assert!(cache.poll_new());
        assert!(!cache.poll_new());
        assert_eq!(cache.current().map(|i| i.frame_id()), Some(1));
    }

    #[test]
    fn newer_frame_replaces_older() {
        let reader = FrameReader::new(Arc::new(LatestFrame::default()));
        reader.cache.publish(image(1));
        reader.cache.publish(image(2));

        assert_eq!(reader.take_new_frame().map(|i| i.frame_id()), Some(2));
        assert!(reader.take_new_frame().is_none());
        assert_eq!(reader.current_frame().map(|i| i.frame_id()), Some(2));
    }
}
