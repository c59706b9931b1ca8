/// Piece availability, most significant bit of the first byte is piece 0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    pub fn new(bytes: Vec<u8>) -> Bitfield {
        Bitfield { bytes }
    }

    /// An all-zero bitfield wide enough for `pieces` pieces.
    pub fn with_pieces(pieces: usize) -> Bitfield {
        Bitfield {
            bytes: vec![0u8; pieces.div_ceil(8)],
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        let byte_index = index / 8;
        let offset = index % 8;
        if byte_index >= self.bytes.len() {
            return false;
        }
        (self.bytes[byte_index] >> (7 - offset)) & 1 != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        let byte_index = index / 8;
        let offset = index % 8;
        if byte_index >= self.bytes.len() {
            return;
        }
        self.bytes[byte_index] |= 1 << (7 - offset);
    }

    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|&x| x == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_piece_test() {
        let bitfield = Bitfield::new(vec![0b01010100, 0b01010100]);
        let outputs = [
            false, true, false, true, false, true, false, false, false, true, false, true, false,
            true, false, false, false, false, false, false,
        ];
        for (index, expected) in outputs.iter().enumerate() {
            assert_eq!(bitfield.has_piece(index), *expected);
        }
    }

    #[test]
    fn set_piece_test() {
        let tests = [
            (
                // Set
                vec![0b01010100, 0b01010100],
                vec![0b01011100, 0b01010100],
                4,
            ),
            (
                // Already set
                vec![0b01010100, 0b01010100],
                vec![0b01010100, 0b01010100],
                9,
            ),
            (
                // Set
                vec![0b01010100, 0b01010100],
                vec![0b01010100, 0b01010101],
                15,
            ),
            (
                // Out of range
                vec![0b01010100, 0b01010100],
                vec![0b01010100, 0b01010100],
                19,
            ),
        ];

        for (actual, expected, index) in tests.iter() {
            let mut bitfield = Bitfield::new(actual.clone());
            bitfield.set_piece(*index);
            assert_eq!(bitfield.bytes, *expected);
        }
    }

    #[test]
    fn with_pieces_rounds_up() {
        let mut bitfield = Bitfield::with_pieces(9);
        assert_eq!(bitfield.as_bytes().len(), 2);
        assert!(bitfield.is_empty());
        bitfield.set_piece(8);
        bitfield.set_piece(0);
        assert_eq!(bitfield.count(), 2);
        assert!(bitfield.has_piece(8));
    }
}
