//! `<think>` block parsing for streamed tokens.
//!
//! Models emit reasoning wrapped in `<think>...</think>`. The markers arrive
//! inside arbitrary token boundaries, including split across tokens, so
//! the parser carries a partial-marker tail between feeds and only ever
//! emits text it knows cannot still become a marker.

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// One parsed piece of a token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Ordinary response text.
    Content(String),
    /// Text inside a think block.
    Thinking(String),
    /// A `</think>` marker was consumed.
    ThinkingEnd,
}

#[derive(Debug, Default)]
pub struct ThinkParser {
    in_think: bool,
    carry: String,
}

/// Length of the longest suffix of `text` that is a proper prefix of
/// `marker`. That suffix may still grow into the marker, so it must be
/// withheld from output.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        if marker.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}

impl ThinkParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream token, producing the segments that are now final.
    pub fn feed(&mut self, token: &str) -> Vec<Segment> {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(token);
        let mut segments = Vec::new();

        loop {
            let marker = if self.in_think { THINK_CLOSE } else { THINK_OPEN };
            if let Some(pos) = text.find(marker) {
                let before = &text[..pos];
                if !before.is_empty() {
                    segments.push(if self.in_think {
                        Segment::Thinking(before.to_string())
                    } else {
                        Segment::Content(before.to_string())
                    });
                }
                if self.in_think {
                    segments.push(Segment::ThinkingEnd);
                }
                self.in_think = !self.in_think;
                text.drain(..pos + marker.len());
            } else {
                // Hold back any tail that might still become the marker.
                let held = partial_marker_len(&text, marker);
                let emit_len = text.len() - held;
                if emit_len > 0 {
                    let emitted: String = text.drain(..emit_len).collect();
                    segments.push(if self.in_think {
                        Segment::Thinking(emitted)
                    } else {
                        Segment::Content(emitted)
                    });
                }
                self.carry = text;
                return segments;
            }
        }
    }

    /// Flush at stream end: a held partial marker never completed, so it is
    /// literal text in whichever channel is open.
    pub fn finish(&mut self) -> Vec<Segment> {
        let carry = std::mem::take(&mut self.carry);
        if carry.is_empty() {
            return Vec::new();
        }
        if self.in_think {
            vec![Segment::Thinking(carry)]
        } else {
            vec![Segment::Content(carry)]
        }
    }
}
