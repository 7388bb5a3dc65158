//! Incremental UTF-8 decoding for process output
//!
//! Output arrives in arbitrary chunks, so a multi-byte character can be split
//! across two reads. The decoder holds back an incomplete trailing sequence
//! until the next chunk arrives and replaces genuinely invalid bytes with
//! U+FFFD.

/// Longest UTF-8 sequence
const MAX_SEQUENCE: usize = 4;

/// Stateful UTF-8 decoder for one byte stream
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, returning all text that is complete so far
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more bytes
                            debug_assert!(after.len() < MAX_SEQUENCE);
                            self.pending.extend_from_slice(after);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is held back at end of stream
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }

    /// Check if bytes are held back
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
