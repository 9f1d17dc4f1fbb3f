/// Turns shell output bytes into text across read boundaries.
///
/// Fixed-size reads can split a multi-byte character; the incomplete tail is
/// held back and completed by the next read instead of becoming two U+FFFD.
pub struct OutputDecoder {
    carry: Vec<u8>,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self { carry: Vec::new() }
    }

    pub fn decode(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(data);

        let keep = incomplete_tail_len(&bytes);
        let split = bytes.len() - keep;
        self.carry = bytes[split..].to_vec();
        String::from_utf8_lossy(&bytes[..split]).into_owned()
    }

    /// Flushes whatever is still held back, lossily.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

impl Default for OutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of a truncated-but-valid multi-byte sequence at the end of `bytes`.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let window = bytes.len().min(3);
    for back in 1..=window {
        let lead = bytes[bytes.len() - back];
        if lead & 0xC0 == 0x80 {
            continue;
        }
        let expected = match lead {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if back < expected { back } else { 0 };
    }
    0
}
