//! Bit-level codec.
//!
//! A [`BitStream`] is a single cursor over a bit buffer that either reads or
//! writes, depending on how it was constructed. Every wire type implements
//! [`Streamable`] exactly once; the same `stream` walk is used to encode and
//! decode, so the two directions cannot drift apart.
//!
//! Wire rules:
//! - Bits are packed LSB-first, so byte-aligned integers land little-endian.
//! - Byte strings carry a `u32` length prefix, capped at [`MAX_BYTES_LEN`].
//! - A read past the end poisons the stream. Every later read yields zero and
//!   the frame must be discarded by the caller.

use bytes::{Bytes, BytesMut};

/// Upper bound for a length-prefixed byte string.
pub const MAX_BYTES_LEN: usize = 1 << 24;

/// Direction a stream walks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Bidirectional bit cursor.
#[derive(Debug)]
pub struct BitStream {
    buf: BytesMut,
    bit_pos: usize,
    dir: Direction,
    poisoned: bool,
}

impl BitStream {
    /// Creates an empty stream in write mode.
    pub fn writer() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
            bit_pos: 0,
            dir: Direction::Write,
            poisoned: false,
        }
    }

    /// Creates a read-mode stream over a copy of `data`.
    pub fn reader(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
            bit_pos: 0,
            dir: Direction::Read,
            poisoned: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn is_reading(&self) -> bool {
        self.dir == Direction::Read
    }

    /// True once a read ran out of bounds (or a write exceeded a length cap).
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Bits left to read. Always zero for writers.
    pub fn bits_remaining(&self) -> usize {
        match self.dir {
            Direction::Read => (self.buf.len() * 8).saturating_sub(self.bit_pos),
            Direction::Write => 0,
        }
    }

    /// Bits consumed (reader) or produced (writer) so far.
    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    /// Finishes a writer and returns the packed bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// Marks the frame as unusable. Walks call this for out-of-range values.
    pub fn poison(&mut self) {
        if !self.poisoned {
            tracing::trace!(bit_pos = self.bit_pos, dir = ?self.dir, "bitstream poisoned");
        }
        self.poisoned = true;
    }

    fn write_bits(&mut self, value: u64, n: u32) {
        if self.bit_pos % 8 == 0 && n % 8 == 0 {
            let bytes = value.to_le_bytes();
            self.buf.extend_from_slice(&bytes[..(n / 8) as usize]);
            self.bit_pos += n as usize;
            return;
        }
        for i in 0..n {
            let byte_idx = self.bit_pos / 8;
            if byte_idx == self.buf.len() {
                self.buf.extend_from_slice(&[0]);
            }
            if (value >> i) & 1 == 1 {
                self.buf[byte_idx] |= 1 << (self.bit_pos % 8);
            }
            self.bit_pos += 1;
        }
    }

    fn read_bits(&mut self, n: u32) -> u64 {
        if self.poisoned {
            return 0;
        }
        if self.bits_remaining() < n as usize {
            self.poison();
            return 0;
        }
        if self.bit_pos % 8 == 0 && n % 8 == 0 {
            let start = self.bit_pos / 8;
            let len = (n / 8) as usize;
            let mut bytes = [0u8; 8];
            bytes[..len].copy_from_slice(&self.buf[start..start + len]);
            self.bit_pos += n as usize;
            return u64::from_le_bytes(bytes);
        }
        let mut value = 0u64;
        for i in 0..n {
            let byte = self.buf[self.bit_pos / 8];
            if (byte >> (self.bit_pos % 8)) & 1 == 1 {
                value |= 1 << i;
            }
            self.bit_pos += 1;
        }
        value
    }

    /// Reads or writes the low `n` bits of `value` (`n <= 64`).
    pub fn serialize_bits(&mut self, value: &mut u64, n: u32) {
        debug_assert!(n <= 64);
        match self.dir {
            Direction::Write => {
                let masked = if n == 64 { *value } else { *value & ((1u64 << n) - 1) };
                self.write_bits(masked, n);
            }
            Direction::Read => *value = self.read_bits(n),
        }
    }

    pub fn serialize_bool(&mut self, value: &mut bool) {
        let mut raw = u64::from(*value);
        self.serialize_bits(&mut raw, 1);
        *value = raw == 1;
    }

    pub fn serialize_u8(&mut self, value: &mut u8) {
        let mut raw = u64::from(*value);
        self.serialize_bits(&mut raw, 8);
        *value = raw as u8;
    }

    pub fn serialize_u16(&mut self, value: &mut u16) {
        let mut raw = u64::from(*value);
        self.serialize_bits(&mut raw, 16);
        *value = raw as u16;
    }

    pub fn serialize_u32(&mut self, value: &mut u32) {
        let mut raw = u64::from(*value);
        self.serialize_bits(&mut raw, 32);
        *value = raw as u32;
    }

    pub fn serialize_u64(&mut self, value: &mut u64) {
        self.serialize_bits(value, 64);
    }

    pub fn serialize_f32(&mut self, value: &mut f32) {
        let mut raw = value.to_bits();
        self.serialize_u32(&mut raw);
        *value = f32::from_bits(raw);
    }

    pub fn serialize_f64(&mut self, value: &mut f64) {
        let mut raw = value.to_bits();
        self.serialize_u64(&mut raw);
        *value = f64::from_bits(raw);
    }

    /// Length-prefixed byte string.
    pub fn serialize_bytes(&mut self, value: &mut Vec<u8>) {
        match self.dir {
            Direction::Write => {
                if value.len() > MAX_BYTES_LEN {
                    self.poison();
                    return;
                }
                let mut len = value.len() as u32;
                self.serialize_u32(&mut len);
                for byte in value.iter() {
                    self.write_bits(u64::from(*byte), 8);
                }
            }
            Direction::Read => {
                value.clear();
                let mut len = 0u32;
                self.serialize_u32(&mut len);
                let len = len as usize;
                if self.poisoned || len > MAX_BYTES_LEN || len * 8 > self.bits_remaining() {
                    self.poison();
                    return;
                }
                value.reserve(len);
                for _ in 0..len {
                    value.push(self.read_bits(8) as u8);
                }
            }
        }
    }

    /// Length-prefixed UTF-8 string. Invalid UTF-8 poisons a reader.
    pub fn serialize_string(&mut self, value: &mut String) {
        match self.dir {
            Direction::Write => {
                let mut bytes = std::mem::take(value).into_bytes();
                self.serialize_bytes(&mut bytes);
                // Writers never alter the value.
                *value = String::from_utf8(bytes).unwrap_or_default();
            }
            Direction::Read => {
                let mut bytes = Vec::new();
                self.serialize_bytes(&mut bytes);
                match String::from_utf8(bytes) {
                    Ok(s) if !self.poisoned => *value = s,
                    _ => {
                        value.clear();
                        self.poison();
                    }
                }
            }
        }
    }

    /// Walks any [`Streamable`] value.
    pub fn serialize<T: Streamable + ?Sized>(&mut self, value: &mut T) {
        value.stream(self);
    }
}

/// A type with one bidirectional wire walk.
pub trait Streamable {
    fn stream(&mut self, s: &mut BitStream);
}

macro_rules! impl_streamable {
    ($($ty:ty => $method:ident),* $(,)?) => {
        $(
            impl Streamable for $ty {
                fn stream(&mut self, s: &mut BitStream) {
                    s.$method(self);
                }
            }
        )*
    };
}

impl_streamable! {
    bool => serialize_bool,
    u8 => serialize_u8,
    u16 => serialize_u16,
    u32 => serialize_u32,
    u64 => serialize_u64,
    f32 => serialize_f32,
    f64 => serialize_f64,
    String => serialize_string,
    Vec<u8> => serialize_bytes,
}

impl<T: Streamable, const N: usize> Streamable for [T; N] {
    fn stream(&mut self, s: &mut BitStream) {
        for item in self.iter_mut() {
            item.stream(s);
        }
    }
}
