// Per-file state machine, evaluated once per run:
//
//   no checkpoint                                  -> New      (start at 0)
//   identity changed, or size < recorded offset    -> Rotated  (start at 0)
//   size > recorded offset                         -> Grew     (start at offset)
//   otherwise                                      -> Unchanged (nothing read, nothing saved)
//
// New, Rotated and Grew stream [start, size) once and end with the
// checkpoint advanced to (identity, start + bytes read).

use std::fmt;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Take};

use regex::{Regex, RegexBuilder};

use crate::error::HostWatchError;

use super::state::Checkpoint;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileState {
    New,
    Unchanged,
    Grew,
    Rotated,
}

impl FileState {
    pub fn full_name(&self) -> &'static str {
        match self {
            FileState::New => "New",
            FileState::Unchanged => "Unchanged",
            FileState::Grew => "Grew",
            FileState::Rotated => "Rotated",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: FileState,
    /// First byte to read this cycle
    pub start: u64,
}

pub fn classify(previous: Option<Checkpoint>, identity: u64, size: u64) -> Transition {
    match previous {
        None => Transition {
            state: FileState::New,
            start: 0,
        },
        Some(prev) if prev.identity != identity || size < prev.offset => Transition {
            state: FileState::Rotated,
            start: 0,
        },
        Some(prev) if size > prev.offset => Transition {
            state: FileState::Grew,
            start: prev.offset,
        },
        Some(prev) => Transition {
            state: FileState::Unchanged,
            start: prev.offset,
        },
    }
}

/// Reader over bytes `[start, end)` and nothing else. Yields fewer bytes if
/// the file was truncated after it was sized.
pub fn range_reader(file: File, start: u64, end: u64) -> io::Result<BufReader<Take<File>>> {
    let mut file = file;
    file.seek(SeekFrom::Start(start))?;
    Ok(BufReader::new(file.take(end.saturating_sub(start))))
}

/// Case-insensitive literal match of one configured keyword
pub struct KeywordMatcher {
    keyword: String,
    regex: Regex,
}

impl KeywordMatcher {
    pub fn new(keyword: &str) -> Result<Self, HostWatchError> {
        let regex = RegexBuilder::new(&regex::escape(keyword))
            .case_insensitive(true)
            .build()
            .map_err(|e| HostWatchError::Error(format!("Bad keyword '{}': {}", keyword, e)))?;

        Ok(KeywordMatcher {
            keyword: keyword.to_owned(),
            regex,
        })
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// One keyword's excerpt, assembled while lines stream past
#[derive(Debug, Default)]
struct ExcerptBuilder {
    lines: Vec<String>,
    last: Option<usize>,
    after: usize,
    matched: bool,
}

impl ExcerptBuilder {
    fn push(&mut self, index: usize, line: &str, max_lines: usize) {
        if self.lines.len() < max_lines && self.last.is_none_or(|last| index > last) {
            self.lines.push(line.to_owned());
            self.last = Some(index);
        }
    }
}

/// What one pass over a byte range found
#[derive(Debug)]
pub struct RangeScan {
    /// Bytes consumed, including a final unterminated line
    pub bytes: u64,
    /// Per matcher, in order: the excerpt if the keyword occurred at all
    pub excerpts: Vec<Option<String>>,
}

/// Streams `reader` line by line, matching every keyword against each line.
///
/// An excerpt holds matched lines with up to `context` lines either side, in
/// file order with overlapping windows merged, and never more than
/// `max_lines` lines. Leading context gives way to the matched line when the
/// cap is near, and only the last `max_lines` lines are ever buffered, so
/// memory stays bounded whatever the range size.
pub fn scan_lines<R: BufRead>(
    mut reader: R,
    matchers: &[KeywordMatcher],
    context: usize,
    max_lines: usize,
) -> io::Result<RangeScan> {
    let mut builders: Vec<ExcerptBuilder> =
        matchers.iter().map(|_| ExcerptBuilder::default()).collect();
    let before_capacity = context.min(max_lines);
    let mut before: VecDeque<(usize, String)> = VecDeque::with_capacity(before_capacity);

    let mut bytes = 0u64;
    let mut raw = Vec::new();
    let mut index = 0usize;

    loop {
        raw.clear();
        let n = reader.read_until(b'\n', &mut raw)?;
        if n == 0 {
            break;
        }
        bytes += n as u64;

        let mut content: &[u8] = &raw;
        if let Some(stripped) = content.strip_suffix(b"\n") {
            content = stripped;
            if let Some(stripped) = content.strip_suffix(b"\r") {
                content = stripped;
            }
        }
        let line = String::from_utf8_lossy(content);

        for (matcher, builder) in matchers.iter().zip(builders.iter_mut()) {
            if builder.matched && builder.lines.len() >= max_lines {
                continue;
            }
            if matcher.is_match(&line) {
                builder.matched = true;
                // The matched line itself always fits
                let room = max_lines.saturating_sub(builder.lines.len() + 1);
                let unseen: Vec<&(usize, String)> = before
                    .iter()
                    .filter(|(i, _)| builder.last.is_none_or(|last| *i > last))
                    .collect();
                for entry in unseen.iter().skip(unseen.len().saturating_sub(room)) {
                    builder.push(entry.0, &entry.1, max_lines);
                }
                builder.push(index, &line, max_lines);
                builder.after = context;
            } else if builder.after > 0 {
                builder.push(index, &line, max_lines);
                builder.after -= 1;
            }
        }

        if before_capacity > 0 {
            if before.len() == before_capacity {
                before.pop_front();
            }
            before.push_back((index, line.into_owned()));
        }
        index += 1;
    }

    let excerpts = builders
        .into_iter()
        .map(|builder| builder.matched.then(|| builder.lines.join("\n")))
        .collect();

    Ok(RangeScan { bytes, excerpts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn checkpoint(identity: u64, offset: u64) -> Option<Checkpoint> {
        Some(Checkpoint { identity, offset })
    }

    #[test]
    fn test_classify_transitions() {
        assert_eq!(
            classify(None, 10, 100),
            Transition {
                state: FileState::New,
                start: 0
            }
        );
        assert_eq!(
            classify(checkpoint(10, 100), 10, 250),
            Transition {
                state: FileState::Grew,
                start: 100
            }
        );
        assert_eq!(classify(checkpoint(10, 250), 10, 250).state, FileState::Unchanged);
        // Truncated in place
        assert_eq!(
            classify(checkpoint(10, 250), 10, 40),
            Transition {
                state: FileState::Rotated,
                start: 0
            }
        );
        // Replaced by a larger file
        assert_eq!(
            classify(checkpoint(10, 250), 11, 400),
            Transition {
                state: FileState::Rotated,
                start: 0
            }
        );
        // Replaced by a file of exactly the old size
        assert_eq!(classify(checkpoint(10, 250), 11, 250).state, FileState::Rotated);
    }

    proptest! {
        #[test]
        fn prop_start_never_past_end_unless_unchanged(
            identity in 0u64..4,
            prev_identity in 0u64..4,
            offset in 0u64..10_000,
            size in 0u64..10_000,
        ) {
            let t = classify(checkpoint(prev_identity, offset), identity, size);
            match t.state {
                FileState::Unchanged => {
                    prop_assert_eq!(identity, prev_identity);
                    prop_assert_eq!(size, offset);
                }
                FileState::Grew => {
                    prop_assert_eq!(t.start, offset);
                    prop_assert!(size > offset);
                }
                FileState::Rotated => prop_assert_eq!(t.start, 0),
                FileState::New => prop_assert!(false, "checkpoint was present"),
            }
            prop_assert!(t.start <= size || t.state == FileState::Unchanged);
        }
    }

    fn scan(text: &str, keywords: &[&str], context: usize, max_lines: usize) -> RangeScan {
        let matchers: Vec<KeywordMatcher> = keywords
            .iter()
            .map(|k| KeywordMatcher::new(k).unwrap())
            .collect();
        scan_lines(text.as_bytes(), &matchers, context, max_lines).unwrap()
    }

    #[test]
    fn test_range_reader_reads_only_new_bytes() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"old line\nnew line\n").unwrap();

        let mut bytes = Vec::new();
        range_reader(File::open(tmp.path()).unwrap(), 9, 18)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, b"new line\n");

        // Asking past the end returns what exists
        let mut bytes = Vec::new();
        range_reader(File::open(tmp.path()).unwrap(), 9, 100)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, b"new line\n");
    }

    #[test]
    fn test_keyword_matching_is_case_insensitive_and_literal() {
        let matcher = KeywordMatcher::new("error").unwrap();
        assert!(matcher.is_match("kernel: ERROR in module"));
        assert!(matcher.is_match("Error again"));
        assert!(!matcher.is_match("all good"));
        assert_eq!(matcher.keyword(), "error");

        // Regex metacharacters are matched literally
        let dotted = KeywordMatcher::new("a.b").unwrap();
        assert!(!dotted.is_match("axb"));
        assert!(dotted.is_match("a.b"));
    }

    #[test]
    fn test_scan_counts_bytes_and_reports_each_keyword() {
        let text = "boot ok\r\nkernel: I/O error\nlast line";
        let result = scan(text, &["error", "denied"], 0, 20);

        assert_eq!(result.bytes, text.len() as u64);
        assert_eq!(
            result.excerpts,
            vec![Some("kernel: I/O error".to_owned()), None]
        );
    }

    #[test]
    fn test_excerpt_includes_context() {
        let middle = scan("l0\nl1\nl2\nl3\nl4\nl5\nl6\n", &["l3"], 1, 20);
        assert_eq!(middle.excerpts[0].as_deref(), Some("l2\nl3\nl4"));
        // Overlapping context windows are merged
        let both = scan("l0\nl1 x\nl2 x\nl3\nl4\n", &["x"], 1, 20);
        assert_eq!(both.excerpts[0].as_deref(), Some("l0\nl1 x\nl2 x\nl3"));
        // Windows clamp at the edges
        let edges = scan("l0 x\nl1\nl2\nl3\nl4\nl5\nl6 x", &["x"], 2, 20);
        assert_eq!(
            edges.excerpts[0].as_deref(),
            Some("l0 x\nl1\nl2\nl4\nl5\nl6 x")
        );
    }

    #[test]
    fn test_excerpt_is_capped() {
        let text: String = (0..100).map(|i| format!("error {}\n", i)).collect();

        let result = scan(&text, &["error"], 2, 20);
        let excerpt = result.excerpts[0].clone().unwrap();
        assert_eq!(excerpt.lines().count(), 20);
        assert!(excerpt.starts_with("error 0\n"));
        assert_eq!(result.bytes, text.len() as u64);
    }

    #[test]
    fn test_huge_context_stays_within_cap() {
        let mut text: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        text.push_str("fatal error\n");

        let result = scan(&text, &["error"], usize::MAX, 5);
        assert_eq!(
            result.excerpts[0].as_deref(),
            Some("line 46\nline 47\nline 48\nline 49\nfatal error")
        );
    }
}
