//! UTF-8 boundary handling for raw PTY reads.

/// Length of the longest prefix of `bytes` that does not end inside a multi-byte
/// character. Invalid bytes in the middle are left alone; only an incomplete sequence
/// at the very end is excluded.
pub fn find_utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => match e.error_len() {
            // Invalid byte somewhere: keep scanning after it.
            Some(bad) => {
                let resume = e.valid_up_to() + bad;
                resume + find_utf8_boundary(&bytes[resume..])
            }
            // Unexpected end of input: cut before the incomplete tail.
            None => e.valid_up_to(),
        },
    }
}

/// Holds back an incomplete trailing character between reads.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read and return the bytes that end on a character boundary.
    /// Returns an empty vec while still accumulating a split character.
    pub fn push(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);
        let cut = find_utf8_boundary(&self.pending);
        if cut == 0 {
            return Vec::new();
        }
        let rest = self.pending.split_off(cut);
        std::mem::replace(&mut self.pending, rest)
    }

    /// Drain whatever is left, complete or not. Used at EOF.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
