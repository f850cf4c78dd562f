use std::fmt;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum FramingError {
    FrameTooLarge { size: usize, limit: usize },
    MismatchedDelimiter { found: char },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge { size, limit } => {
                write!(f, "frame size {size} exceeds limit {limit}")
            }
            Self::MismatchedDelimiter { found } => {
                write!(f, "mismatched closing delimiter '{found}' inside frame")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// Incremental extractor of top-level JSON arrays from an unframed byte stream.
///
/// Nesting is tracked with a stack of expected closers, and string/escape state
/// is tracked so that brackets inside string values never end a frame. Bytes
/// outside a frame are discarded.
#[derive(Debug)]
pub struct FrameScanner {
    buffer: Vec<u8>,
    scan_pos: usize,
    frame_start: Option<usize>,
    closers: Vec<u8>,
    in_string: bool,
    escaped: bool,
    max_frame_bytes: usize,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameScanner {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scan_pos: 0,
            frame_start: None,
            closers: Vec::new(),
            in_string: false,
            escaped: false,
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_mid_frame(&self) -> bool {
        self.frame_start.is_some()
    }

    /// Returns the next complete frame, or `None` when more bytes are needed.
    ///
    /// After an error the partial frame is dropped and scanning resumes with
    /// the bytes that follow the offending position.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        while self.scan_pos < self.buffer.len() {
            let pos = self.scan_pos;
            let byte = self.buffer[pos];
            self.scan_pos += 1;

            let Some(start) = self.frame_start else {
                if byte == b'[' {
                    self.frame_start = Some(pos);
                    self.closers.push(b']');
                }
                continue;
            };

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'[' => self.closers.push(b']'),
                b'{' => self.closers.push(b'}'),
                b']' | b'}' => {
                    if self.closers.pop() != Some(byte) {
                        self.consume(pos + 1);
                        return Err(FramingError::MismatchedDelimiter {
                            found: byte as char,
                        });
                    }

                    if self.closers.is_empty() {
                        let size = pos + 1 - start;
                        if size > self.max_frame_bytes {
                            self.consume(pos + 1);
                            return Err(FramingError::FrameTooLarge {
                                size,
                                limit: self.max_frame_bytes,
                            });
                        }

                        let frame = self.buffer[start..=pos].to_vec();
                        self.consume(pos + 1);
                        return Ok(Some(frame));
                    }
                }
                _ => {}
            }
        }

        match self.frame_start {
            None => {
                self.buffer.clear();
                self.scan_pos = 0;
            }
            Some(start) => {
                if start > 0 {
                    self.buffer.drain(..start);
                    self.scan_pos -= start;
                    self.frame_start = Some(0);
                }

                let size = self.buffer.len();
                if size > self.max_frame_bytes {
                    self.consume(size);
                    return Err(FramingError::FrameTooLarge {
                        size,
                        limit: self.max_frame_bytes,
                    });
                }
            }
        }

        Ok(None)
    }

    fn consume(&mut self, end: usize) {
        self.buffer.drain(..end);
        self.scan_pos = 0;
        self.frame_start = None;
        self.closers.clear();
        self.in_string = false;
        self.escaped = false;
    }
}
