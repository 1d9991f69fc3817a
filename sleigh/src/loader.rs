use std::any::Any;

/// A source of instruction bytes addressed by offset into the default
/// space.
pub trait LoadImage {
    /// Fills `buf` with the bytes at `address`, zero-filling anything the
    /// image does not cover. Returns the number of leading bytes of `buf`
    /// that are backed by the image.
    fn load_fill(&mut self, buf: &mut [u8], address: u64) -> usize;

    /// Shifts the image's base address by `adjust`.
    fn adjust_vma(&mut self, _adjust: i64) {}

    /// Total number of bytes the image holds.
    fn buf_size(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An in-memory image of `buf` mapped at `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainLoadImage {
    buf: Vec<u8>,
    start: u64,
}

impl PlainLoadImage {
    pub fn from_buf(buf: impl AsRef<[u8]>, start: u64) -> Self {
        Self {
            buf: buf.as_ref().to_vec(),
            start,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl LoadImage for PlainLoadImage {
    fn load_fill(&mut self, buf: &mut [u8], address: u64) -> usize {
        buf.iter_mut().for_each(|b| *b = 0);

        let Some(offset) = address.checked_sub(self.start) else {
            return 0
        };
        let Some(rest) = usize::try_from(offset).ok().and_then(|offset| self.buf.get(offset..)) else {
            return 0
        };

        let length = rest.len().min(buf.len());
        buf[..length].copy_from_slice(&rest[..length]);
        length
    }

    fn adjust_vma(&mut self, adjust: i64) {
        self.start = self.start.wrapping_add(adjust as u64);
    }

    fn buf_size(&self) -> usize {
        self.buf.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fill_within_and_around_the_image() {
        let mut image = PlainLoadImage::from_buf([0xdeu8, 0xad, 0xbe, 0xef], 0x1000);
        let mut buf = [0xff; 6];

        assert_eq!(image.load_fill(&mut buf, 0x1002), 2);
        assert_eq!(buf, [0xbe, 0xef, 0, 0, 0, 0]);

        assert_eq!(image.load_fill(&mut buf, 0x0fff), 0);
        assert_eq!(buf, [0; 6]);

        assert_eq!(image.load_fill(&mut buf, 0x1004), 0);
        assert_eq!(image.buf_size(), 4);
    }

    #[test]
    fn adjusting_the_base() {
        let mut image = PlainLoadImage::from_buf([1u8, 2, 3], 0x100);
        image.adjust_vma(-0x100);
        assert_eq!(image.start(), 0);

        let mut buf = [0; 2];
        assert_eq!(image.load_fill(&mut buf, 1), 2);
        assert_eq!(buf, [2, 3]);

        image.adjust_vma(0x40);
        assert_eq!(image.load_fill(&mut buf, 0x41), 2);
    }
}
