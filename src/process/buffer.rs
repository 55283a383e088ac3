use crate::model::{OutputLine, StreamOrigin};
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Bounded ring of captured output lines. The oldest line is evicted once
/// the capacity is reached; sequence numbers keep counting across evictions.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Append a line, assigning it the next sequence number.
    pub fn push(&mut self, stream: StreamOrigin, text: String) -> OutputLine {
        let line = OutputLine {
            seq: self.next_seq,
            stream,
            text,
        };
        self.next_seq += 1;
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line.clone());
        line
    }

    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_lines() {
        let mut buffer = OutputBuffer::new(3);
        for i in 0..5 {
            buffer.push(StreamOrigin::Stdout, i.to_string());
        }
        let texts: Vec<_> = buffer.snapshot().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, ["2", "3", "4"]);
        assert_eq!(buffer.dropped(), 2);
    }

    #[test]
    fn sequence_spans_both_streams() {
        let mut buffer = OutputBuffer::default();
        let a = buffer.push(StreamOrigin::Stdout, "a".into());
        let b = buffer.push(StreamOrigin::Stderr, "b".into());
        assert_eq!((a.seq, b.seq), (0, 1));
        assert_eq!(buffer.len(), 2);
    }
}
