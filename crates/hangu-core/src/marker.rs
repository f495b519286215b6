//! Word markers decoded from the line-delimited speech-mark stream.
//!
//! The service returns one JSON object per line with a heterogeneous `type`
//! field (`sentence`, `word`, `viseme`, ...). Only `word` records become
//! [`Marker`]s; everything else is dropped.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// A timestamped word boundary tying a span of the source text to an audio offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub word: String,
    pub start_offset_ms: u64,
    pub char_start: usize,
    pub char_end: usize,
}

impl Marker {
    pub fn new(word: impl Into<String>, start_offset_ms: u64, char_start: usize, char_end: usize) -> Self {
        Self {
            word: word.into(),
            start_offset_ms,
            char_start,
            char_end,
        }
    }
}

#[derive(Deserialize)]
struct RawMark {
    time: u64,
    #[serde(rename = "type")]
    kind: String,
    start: usize,
    end: usize,
    value: String,
}

const WORD_KIND: &str = "word";

/// Decode a speech-mark buffer into word markers, in stream order.
///
/// Malformed lines are skipped. A buffer that is not UTF-8 yields an empty
/// sequence, which callers treat as an empty (not failed) result.
pub fn parse_lines(data: &[u8]) -> Vec<Marker> {
    let Ok(text) = std::str::from_utf8(data) else {
        debug!(bytes = data.len(), "Speech-mark buffer is not valid UTF-8");
        return Vec::new();
    };

    let mut markers = Vec::new();
    let mut skipped = 0usize;
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw = match serde_json::from_str::<RawMark>(line) {
            Ok(raw) => raw,
            Err(err) => {
                skipped += 1;
                debug!(line = line_no + 1, "Skipping malformed speech mark: {err}");
                continue;
            }
        };
        if raw.kind != WORD_KIND {
            continue;
        }
        if raw.end <= raw.start {
            skipped += 1;
            debug!(
                line = line_no + 1,
                start = raw.start,
                end = raw.end,
                "Skipping word mark with empty character span"
            );
            continue;
        }
        markers.push(Marker {
            word: raw.value,
            start_offset_ms: raw.time,
            char_start: raw.start,
            char_end: raw.end,
        });
    }

    trace!(kept = markers.len(), skipped, "Parsed speech marks");
    markers
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        r#"{"time":0,"type":"sentence","start":0,"end":22,"value":"안녕하세요, 만나서 반갑습니다."}"#,
        "\n",
        r#"{"time":103,"type":"word","start":0,"end":5,"value":"안녕하세요"}"#,
        "\n",
        r#"{"time":701,"type":"word","start":6,"end":9,"value":"만나서"}"#,
        "\n",
        r#"{"time":1137,"type":"word","start":10,"end":15,"value":"반갑습니다"}"#,
        "\n"
    );

    #[test]
    fn keeps_only_word_marks_in_order() {
        let marks = parse_lines(SAMPLE.as_bytes());
        assert_eq!(
            marks,
            vec![
                Marker::new("안녕하세요", 103, 0, 5),
                Marker::new("만나서", 701, 6, 9),
                Marker::new("반갑습니다", 1137, 10, 15),
            ]
        );
    }

    #[test]
    fn malformed_lines_do_not_stop_parsing() {
        let data = concat!(
            r#"{"time":103,"type":"word","start":0,"end":5,"value":"안녕하세요"}"#,
            "\n",
            "{not json at all\n",
            r#"{"time":400,"type":"word","start":6}"#,
            "\n",
            r#"{"time":-5,"type":"word","start":6,"end":9,"value":"negative"}"#,
            "\n",
            r#"{"time":701,"type":"word","start":6,"end":9,"value":"만나서"}"#,
        );
        let marks = parse_lines(data.as_bytes());
        let words: Vec<_> = marks.iter().map(|m| m.word.as_str()).collect();
        assert_eq!(words, vec!["안녕하세요", "만나서"]);
    }

    #[test]
    fn invalid_utf8_yields_empty_sequence() {
        let data = [0xff, 0xfe, b'{', b'}', b'\n'];
        assert!(parse_lines(&data).is_empty());
    }

    #[test]
    fn tolerates_crlf_and_blank_lines() {
        let data = "\r\n{\"time\":5,\"type\":\"word\",\"start\":0,\"end\":2,\"value\":\"hi\"}\r\n\r\n";
        assert_eq!(parse_lines(data.as_bytes()), vec![Marker::new("hi", 5, 0, 2)]);
    }

    #[test]
    fn drops_word_marks_with_empty_span() {
        let data = concat!(
            r#"{"time":5,"type":"word","start":4,"end":4,"value":""}"#,
            "\n",
            r#"{"time":9,"type":"word","start":4,"end":7,"value":"abc"}"#,
        );
        assert_eq!(parse_lines(data.as_bytes()), vec![Marker::new("abc", 9, 4, 7)]);
    }

    #[test]
    fn output_is_a_subset_of_input_lines() {
        let marks = parse_lines(SAMPLE.as_bytes());
        let line_count = SAMPLE.lines().count();
        assert!(marks.len() < line_count);
        for mark in &marks {
            assert!(SAMPLE.contains(&format!("\"value\":\"{}\"", mark.word)));
        }
    }
}
