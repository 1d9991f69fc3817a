use byteorder::ByteOrder;

use crate::{BE, LE};
use crate::endian::Endian;

/// Byte orders usable for reading instruction tokens.
pub trait Order: ByteOrder + Send + Sync + 'static {
    const ENDIAN: Endian;
    const NATIVE: bool;

    /// Reads a variable width unsigned field; empty buffers read as zero and
    /// buffers wider than eight bytes are truncated to their first eight.
    fn read_field(buf: &[u8]) -> u64 {
        let size = buf.len().min(8);
        if size == 0 {
            0
        } else {
            Self::read_uint(&buf[..size], size)
        }
    }

    /// Writes the low `buf.len()` bytes of `n`; widths above eight are ignored.
    fn write_field(buf: &mut [u8], n: u64) {
        let size = buf.len();
        if size == 0 || size > 8 {
            return
        }

        let n = if size == 8 { n } else { n & ((1u64 << (size * 8)) - 1) };
        Self::write_uint(buf, n, size)
    }

    /// Reads one 32-bit word of a (possibly short) byte window, big-endian
    /// packed, zero filling past the end of `buf`.
    fn read_word(buf: &[u8]) -> u32 {
        let mut word = [0u8; 4];
        let n = buf.len().min(4);
        word[..n].copy_from_slice(&buf[..n]);
        BE::read_u32(&word)
    }
}

impl Order for BE {
    const ENDIAN: Endian = Endian::Big;
    const NATIVE: bool = cfg!(target_endian = "big");
}

impl Order for LE {
    const ENDIAN: Endian = Endian::Little;
    const NATIVE: bool = cfg!(target_endian = "little");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fields() {
        let mut buf = [0u8; 3];
        LE::write_field(&mut buf, 0xaabbcc);
        assert_eq!(buf, [0xcc, 0xbb, 0xaa]);
        assert_eq!(LE::read_field(&buf), 0xaabbcc);
        assert_eq!(BE::read_field(&buf), 0xccbbaa);

        BE::write_field(&mut buf, 0x1_000001);
        assert_eq!(buf, [0, 0, 1]);
    }

    #[test]
    fn short_words() {
        assert_eq!(LE::read_word(&[0x12, 0x34]), 0x1234_0000);
        assert_eq!(BE::read_word(&[0x12, 0x34, 0x56, 0x78, 0x9a]), 0x1234_5678);
    }
}
