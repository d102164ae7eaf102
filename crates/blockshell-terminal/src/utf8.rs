/// Buffers the tail of a byte stream that ends inside a UTF-8 sequence, so a
/// multi-byte character split across two reads reaches the consumer whole.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Returns the bytes that are ready to hand out, keeping back at most three
    /// bytes of an incomplete trailing sequence.
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);
        let split = complete_prefix_len(&self.pending);
        let rest = self.pending.split_off(split);
        std::mem::replace(&mut self.pending, rest)
    }

    /// Flushes whatever is left, complete or not.
    pub(crate) fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Length of the prefix that can be released now. Invalid bytes are skipped
/// over, so only an incomplete sequence at the very end is held back.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            Err(e) => match e.error_len() {
                Some(invalid) => start += e.valid_up_to() + invalid,
                // None only when the input ends mid-sequence.
                None => return start + e.valid_up_to(),
            },
        }
    }
}
