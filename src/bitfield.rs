//! Remote piece availability.
//!
//! ```text
//! Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]   (MSB first)
//! Byte 1: [piece 8, 9, ...]
//! ```

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    /// Wrap the raw payload of a BITFIELD message.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Bitfield { bytes }
    }

    /// A bitfield with the first `count` pieces set.
    pub fn full(count: u32) -> Self {
        let mut bitfield = Bitfield::default();
        for index in 0..count {
            bitfield.set_piece(index);
        }
        bitfield
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `true` if the piece is advertised; out of range indices are `false`.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.bytes.get(byte_index) {
            Some(byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Mark a piece as available, growing the bitmap when a HAVE names a
    /// piece beyond the current length.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.bytes.len() {
            self.bytes.resize(byte_index + 1, 0);
        }
        self.bytes[byte_index] |= 1 << (7 - offset);
    }
}
