//! Bit-level packing and unpacking over 32-bit little-endian words.
//!
//! [`BitWriter`] packs values of 1..=32 bits into a caller-supplied byte
//! buffer, buffering up to 64 bits of scratch and flushing whole 32-bit words
//! little-endian. [`BitReader`] mirrors it exactly, so a reader over a
//! writer's output yields the written values in order regardless of host
//! endianness. These two types are the substrate the [`crate::stream`] layer
//! builds its unified serialize functions on.

use thiserror::Error;

/// Failure while packing or unpacking bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BitsError {
    /// A write would run past the end of the output buffer.
    #[error("write past end of buffer")]
    WriteOverflow,
    /// A read would run past the end of the input buffer.
    #[error("read past end of buffer")]
    ReadOverflow,
    /// Alignment padding bits were not zero.
    #[error("nonzero padding at byte alignment")]
    BadAlign,
}

/// Packs integer values bit-by-bit into a byte buffer.
///
/// The buffer length must be a multiple of 4 so whole words can always be
/// flushed. [`BitWriter::flush`] must be called before the buffer contents
/// are used.
#[derive(Debug)]
pub struct BitWriter<'a> {
    data: &'a mut [u8],
    scratch: u64,
    scratch_bits: u32,
    word_index: usize,
    num_bits: usize,
    bits_written: usize,
}

impl<'a> BitWriter<'a> {
    /// Creates a writer over `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` is not a multiple of 4.
    #[must_use]
    pub fn new(data: &'a mut [u8]) -> Self {
        assert!(data.len() % 4 == 0);
        let num_bits = data.len() * 8;
        Self {
            data,
            scratch: 0,
            scratch_bits: 0,
            word_index: 0,
            num_bits,
            bits_written: 0,
        }
    }

    /// Number of bits written so far.
    #[must_use]
    pub const fn bits_written(&self) -> usize {
        self.bits_written
    }

    /// Number of bits still available in the buffer.
    #[must_use]
    pub const fn bits_available(&self) -> usize {
        self.num_bits - self.bits_written
    }

    /// Number of buffer bytes covered by the bits written so far.
    #[must_use]
    pub const fn bytes_flushed(&self) -> usize {
        (self.bits_written + 7) / 8
    }

    /// Whether the write head sits on a byte boundary.
    #[must_use]
    pub const fn is_aligned(&self) -> bool {
        self.bits_written % 8 == 0
    }

    fn flush_word(&mut self) {
        let word = (self.scratch & 0xFFFF_FFFF) as u32;
        self.data[self.word_index * 4..self.word_index * 4 + 4]
            .copy_from_slice(&word.to_le_bytes());
        self.scratch >>= 32;
        self.scratch_bits -= 32;
        self.word_index += 1;
    }

    /// Writes the low `bits` bits of `value`, LSB-first.
    ///
    /// `bits` must be in 1..=32. Bits of `value` above `bits` are ignored.
    ///
    /// # Errors
    ///
    /// Errors if the write does not fit in the buffer.
    pub fn write_bits(&mut self, value: u32, bits: u32) -> Result<(), BitsError> {
        debug_assert!(bits >= 1 && bits <= 32);
        if self.bits_written + bits as usize > self.num_bits {
            return Err(BitsError::WriteOverflow);
        }
        let masked = u64::from(value) & (u64::MAX >> (64 - bits));
        self.scratch |= masked << self.scratch_bits;
        self.scratch_bits += bits;
        self.bits_written += bits as usize;
        if self.scratch_bits >= 32 {
            self.flush_word();
        }
        Ok(())
    }

    /// Writes zero bits up to the next byte boundary.
    ///
    /// # Errors
    ///
    /// Errors if the padding does not fit in the buffer.
    pub fn write_align(&mut self) -> Result<(), BitsError> {
        let remainder = (self.bits_written % 8) as u32;
        if remainder != 0 {
            self.write_bits(0, 8 - remainder)?;
        }
        Ok(())
    }

    /// Writes a run of bytes, aligning to a byte boundary first.
    ///
    /// Head bytes go through the bit path until the write head reaches a word
    /// boundary, whole words are copied directly, and the tail goes through
    /// the bit path again.
    ///
    /// # Errors
    ///
    /// Errors if the bytes do not fit in the buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BitsError> {
        self.write_align()?;
        if self.bits_written + bytes.len() * 8 > self.num_bits {
            return Err(BitsError::WriteOverflow);
        }

        let mut i = 0;
        while i < bytes.len() && self.bits_written % 32 != 0 {
            self.write_bits(u32::from(bytes[i]), 8)?;
            i += 1;
        }
        if i == bytes.len() {
            return Ok(());
        }

        debug_assert!(self.scratch_bits == 0);
        let num_words = (bytes.len() - i) / 4;
        let start = self.word_index * 4;
        self.data[start..start + num_words * 4].copy_from_slice(&bytes[i..i + num_words * 4]);
        self.word_index += num_words;
        self.bits_written += num_words * 32;
        i += num_words * 4;

        while i < bytes.len() {
            self.write_bits(u32::from(bytes[i]), 8)?;
            i += 1;
        }
        Ok(())
    }

    /// Flushes any remaining scratch bits to the buffer as a final word.
    ///
    /// Must be called before the buffer contents are consumed.
    pub fn flush(&mut self) {
        if self.scratch_bits != 0 {
            let word = (self.scratch & 0xFFFF_FFFF) as u32;
            self.data[self.word_index * 4..self.word_index * 4 + 4]
                .copy_from_slice(&word.to_le_bytes());
            self.scratch = 0;
            self.scratch_bits = 0;
            self.word_index += 1;
        }
    }
}

/// Unpacks integer values written by a [`BitWriter`].
///
/// The input buffer may have any length; word fetches past the end are
/// zero-padded, and reads past the advertised bit count fail cleanly.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    scratch: u64,
    scratch_bits: u32,
    word_index: usize,
    num_bits: usize,
    bits_read: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a reader over `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            scratch: 0,
            scratch_bits: 0,
            word_index: 0,
            num_bits: data.len() * 8,
            bits_read: 0,
        }
    }

    /// Number of bits read so far.
    #[must_use]
    pub const fn bits_read(&self) -> usize {
        self.bits_read
    }

    /// Number of bits left to read.
    #[must_use]
    pub const fn bits_remaining(&self) -> usize {
        self.num_bits - self.bits_read
    }

    /// Whether the read head sits on a byte boundary.
    #[must_use]
    pub const fn is_aligned(&self) -> bool {
        self.bits_read % 8 == 0
    }

    fn load_word(&mut self) {
        let start = self.word_index * 4;
        let mut word = [0u8; 4];
        let end = self.data.len().min(start + 4);
        if start < end {
            word[..end - start].copy_from_slice(&self.data[start..end]);
        }
        self.scratch |= u64::from(u32::from_le_bytes(word)) << self.scratch_bits;
        self.scratch_bits += 32;
        self.word_index += 1;
    }

    /// Reads `bits` bits, LSB-first. `bits` must be in 1..=32.
    ///
    /// # Errors
    ///
    /// Errors if fewer than `bits` bits remain.
    pub fn read_bits(&mut self, bits: u32) -> Result<u32, BitsError> {
        debug_assert!(bits >= 1 && bits <= 32);
        if self.bits_read + bits as usize > self.num_bits {
            return Err(BitsError::ReadOverflow);
        }
        if self.scratch_bits < bits {
            self.load_word();
        }
        let value = (self.scratch & (u64::MAX >> (64 - bits))) as u32;
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        self.bits_read += bits as usize;
        Ok(value)
    }

    /// Reads up to the next byte boundary, requiring the padding to be zero.
    ///
    /// # Errors
    ///
    /// Errors if the padding bits are missing or nonzero. Nonzero padding
    /// means the data was not produced by a matching writer and the whole
    /// packet must be rejected.
    pub fn read_align(&mut self) -> Result<(), BitsError> {
        let remainder = (self.bits_read % 8) as u32;
        if remainder != 0 {
            let value = self.read_bits(8 - remainder)?;
            if value != 0 {
                return Err(BitsError::BadAlign);
            }
        }
        Ok(())
    }

    /// Reads a run of bytes, aligning to a byte boundary first.
    ///
    /// # Errors
    ///
    /// Errors if the alignment padding is nonzero or not enough bytes remain.
    pub fn read_bytes(&mut self, dest: &mut [u8]) -> Result<(), BitsError> {
        self.read_align()?;
        if self.bits_read + dest.len() * 8 > self.num_bits {
            return Err(BitsError::ReadOverflow);
        }

        let mut i = 0;
        while i < dest.len() && self.bits_read % 32 != 0 {
            dest[i] = self.read_bits(8)? as u8;
            i += 1;
        }
        if i == dest.len() {
            return Ok(());
        }

        debug_assert!(self.scratch_bits == 0);
        let num_words = (dest.len() - i) / 4;
        let start = self.word_index * 4;
        dest[i..i + num_words * 4].copy_from_slice(&self.data[start..start + num_words * 4]);
        self.word_index += num_words;
        self.bits_read += num_words * 32;
        i += num_words * 4;

        while i < dest.len() {
            dest[i] = self.read_bits(8)? as u8;
            i += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_mixed_widths() {
        let mut buf = [0u8; 32];
        let values: &[(u32, u32)] = &[
            (1, 1),
            (10, 4),
            (255, 8),
            (1000, 10),
            (0, 3),
            (0xFFFF_FFFF, 32),
            (0x12345, 17),
            (1, 2),
        ];

        let mut writer = BitWriter::new(&mut buf);
        for &(value, bits) in values {
            writer.write_bits(value, bits).unwrap();
        }
        writer.flush();
        let bytes = writer.bytes_flushed();

        let mut reader = BitReader::new(&buf[..bytes]);
        for &(value, bits) in values {
            assert_eq!(value, reader.read_bits(bits).unwrap());
        }
    }

    #[test]
    fn words_are_little_endian() {
        let mut buf = [0u8; 4];
        let mut writer = BitWriter::new(&mut buf);
        writer.write_bits(0x1234_5678, 32).unwrap();
        writer.flush();
        assert_eq!([0x78, 0x56, 0x34, 0x12], buf);
    }

    #[test]
    fn value_masked_to_width() {
        let mut buf = [0u8; 4];
        let mut writer = BitWriter::new(&mut buf);
        writer.write_bits(0xFF, 4).unwrap();
        writer.write_bits(0, 28).unwrap();
        writer.flush();
        let mut reader = BitReader::new(&buf);
        assert_eq!(0xF, reader.read_bits(4).unwrap());
        assert_eq!(0, reader.read_bits(28).unwrap());
    }

    #[test]
    fn align_pads_with_zeroes() {
        let mut buf = [0u8; 8];
        let mut writer = BitWriter::new(&mut buf);
        writer.write_bits(0b101, 3).unwrap();
        writer.write_align().unwrap();
        assert!(writer.is_aligned());
        writer.write_bits(0xAB, 8).unwrap();
        writer.flush();

        let mut reader = BitReader::new(&buf);
        assert_eq!(0b101, reader.read_bits(3).unwrap());
        reader.read_align().unwrap();
        assert_eq!(0xAB, reader.read_bits(8).unwrap());
    }

    #[test]
    fn read_align_rejects_nonzero_padding() {
        let mut buf = [0u8; 4];
        let mut writer = BitWriter::new(&mut buf);
        writer.write_bits(0xFF, 8).unwrap();
        writer.flush();

        let mut reader = BitReader::new(&buf);
        assert_eq!(0b111, reader.read_bits(3).unwrap());
        assert_eq!(Err(BitsError::BadAlign), reader.read_align());
    }

    #[test]
    fn bytes_round_trip_unaligned_start() {
        let payload: Vec<u8> = (0..=41).collect();
        let mut buf = [0u8; 64];
        let mut writer = BitWriter::new(&mut buf);
        writer.write_bits(0b11, 2).unwrap();
        writer.write_bytes(&payload).unwrap();
        writer.write_bits(7, 3).unwrap();
        writer.flush();
        let bytes = writer.bytes_flushed();

        let mut reader = BitReader::new(&buf[..bytes]);
        assert_eq!(0b11, reader.read_bits(2).unwrap());
        let mut out = vec![0u8; payload.len()];
        reader.read_bytes(&mut out).unwrap();
        assert_eq!(payload, out);
        assert_eq!(7, reader.read_bits(3).unwrap());
    }

    #[test]
    fn write_past_end_fails() {
        let mut buf = [0u8; 4];
        let mut writer = BitWriter::new(&mut buf);
        writer.write_bits(0, 32).unwrap();
        assert_eq!(Err(BitsError::WriteOverflow), writer.write_bits(0, 1));
    }

    #[test]
    fn read_past_end_fails() {
        let buf = [0u8; 2];
        let mut reader = BitReader::new(&buf);
        assert_eq!(0, reader.read_bits(16).unwrap());
        assert_eq!(Err(BitsError::ReadOverflow), reader.read_bits(1));
    }

    #[test]
    fn randomized_round_trip() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xB175);
        for _ in 0..100 {
            let ops: Vec<(u32, u32)> = (0..rng.gen_range(1..60))
                .map(|_| {
                    let bits = rng.gen_range(1..=32u32);
                    let value = rng.gen::<u32>() & (u32::MAX >> (32 - bits));
                    (value, bits)
                })
                .collect();

            let mut buf = [0u8; 256];
            let mut writer = BitWriter::new(&mut buf);
            for &(value, bits) in &ops {
                writer.write_bits(value, bits).unwrap();
            }
            writer.flush();
            let len = writer.bytes_flushed();

            let mut reader = BitReader::new(&buf[..len]);
            for &(value, bits) in &ops {
                assert_eq!(value, reader.read_bits(bits).unwrap());
            }
        }
    }

    #[test]
    fn reader_handles_non_word_sized_input() {
        let mut buf = [0u8; 8];
        let mut writer = BitWriter::new(&mut buf);
        writer.write_bits(0xABCDE, 20).unwrap();
        writer.write_bits(0x3F, 6).unwrap();
        writer.flush();
        let bytes = writer.bytes_flushed();
        assert_eq!(4, bytes);

        // feed the reader a 4-byte slice, then a deliberately short one
        let mut reader = BitReader::new(&buf[..bytes]);
        assert_eq!(0xABCDE, reader.read_bits(20).unwrap());
        assert_eq!(0x3F, reader.read_bits(6).unwrap());

        let mut reader = BitReader::new(&buf[..3]);
        assert_eq!(0xABCDE, reader.read_bits(20).unwrap());
        assert_eq!(Err(BitsError::ReadOverflow), reader.read_bits(6));
    }
}
