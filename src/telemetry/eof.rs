//! End-of-message detection for unframed telemetry responses.
//!
//! Backend APIs answer with raw JSON and no length prefix, and some keep the
//! connection open afterwards. The only signal that a response is complete is
//! the shape of its last few bytes, and that shape differs per backend.

/// Rule over the last three received bytes
///
/// Each slot is either a required byte or `None` for "anything". Slots are
/// ordered oldest to newest: `[third_to_last, second_to_last, last]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofHeuristic {
    window: [Option<u8>; 3],
}

impl EofHeuristic {
    /// `}` followed by a newline: one JSON object per line
    pub const BRACE_NEWLINE: Self = Self::new([None, Some(b'}'), Some(b'\n')]);

    /// `}` newline `}`: pretty-printed object closed without a trailing newline
    pub const BRACE_NEWLINE_BRACE: Self = Self::new([Some(b'}'), Some(b'\n'), Some(b'}')]);

    pub const fn new(window: [Option<u8>; 3]) -> Self {
        Self { window }
    }

    /// Check the trailing window of `received`
    ///
    /// Buffers shorter than three bytes are treated as if left-padded with
    /// zero bytes, so a required slot can never match a missing byte.
    pub fn is_complete(&self, received: &[u8]) -> bool {
        let mut tail = [0u8; 3];
        let n = received.len().min(3);
        tail[3 - n..].copy_from_slice(&received[received.len() - n..]);
        self.matches(tail[0], tail[1], tail[2])
    }

    pub fn matches(&self, third: u8, second: u8, last: u8) -> bool {
        self.window
            .iter()
            .zip([third, second, last])
            .all(|(want, got)| want.map_or(true, |w| w == got))
    }
}
