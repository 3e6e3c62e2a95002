use tether_domain::LogLine;

/// Collects output lines into batches of at most `max_lines`.
#[derive(Debug)]
pub struct LineBatcher {
    max_lines: usize,
    pending: Vec<LogLine>,
}

impl LineBatcher {
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            pending: Vec::with_capacity(max_lines),
        }
    }

    /// Adds one line and returns a full batch once `max_lines` is reached.
    pub fn push(&mut self, line: LogLine) -> Option<Vec<LogLine>> {
        self.pending.push(line);
        if self.pending.len() >= self.max_lines {
            return self.take();
        }

        None
    }

    /// Returns whatever is pending, or `None` when nothing is.
    pub fn take(&mut self) -> Option<Vec<LogLine>> {
        if self.pending.is_empty() {
            return None;
        }

        Some(std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.max_lines),
        ))
    }
}

#[cfg(test)]
mod tests {
    use tether_domain::LogLine;

    use super::LineBatcher;

    fn line(message: &str) -> LogLine {
        LogLine {
            timestamp: 1_700_000_000_000,
            message: message.to_owned(),
        }
    }

    #[test]
    fn emits_full_batches_and_flushes_remainder() {
        let mut batcher = LineBatcher::new(2);

        assert!(batcher.push(line("a")).is_none());
        let full = batcher.push(line("b"));
        assert_eq!(full.map(|batch| batch.len()), Some(2));

        assert!(batcher.push(line("c")).is_none());
        let rest = batcher.take();
        assert_eq!(
            rest.map(|batch| batch.into_iter().map(|line| line.message).collect::<Vec<_>>()),
            Some(vec!["c".to_owned()])
        );
        assert!(batcher.take().is_none());
    }

    #[test]
    fn zero_limit_behaves_as_one_line_batches() {
        let mut batcher = LineBatcher::new(0);
        assert!(batcher.push(line("only")).is_some());
    }
}
