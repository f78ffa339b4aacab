use std::str;

const REPLACEMENT: char = '\u{FFFD}';

/// Incremental UTF-8 decoder for a chunked body.
///
/// Bytes of a character split across chunk boundaries are held back until the rest of the
/// sequence arrives. Malformed sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(REPLACEMENT);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let remainder = rest.to_vec();
        self.pending = remainder;
        out
    }

    /// Flushes a dangling partial sequence at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            REPLACEMENT.to_string()
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Running text of a streamed assistant reply.
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    decoder: Utf8StreamDecoder,
    text: String,
}

impl ReplyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> &str {
        let decoded = self.decoder.decode(chunk);
        self.text.push_str(&decoded);
        &self.text
    }

    pub fn finish(&mut self) -> &str {
        let tail = self.decoder.finish();
        self.text.push_str(&tail);
        &self.text
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}
