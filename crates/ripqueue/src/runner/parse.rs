//! Incremental line decoding and progress extraction for transcoder output.

use regex::Regex;

use crate::job::JobPhase;

/// Splits a byte stream into logical lines, tolerating chunk boundaries
/// that fall inside multi-byte sequences or between `\r` and `\n`.
///
/// Bytes are buffered until a line terminator arrives, so UTF-8 sequences
/// split across reads decode correctly. Either newline convention works;
/// the external tool mixes them.
#[derive(Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns all complete lines it produced.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.buf.len() {
            match self.buf[i] {
                b'\n' => {
                    lines.push(decode(&self.buf[start..i]));
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    if i + 1 == self.buf.len() {
                        // Cannot yet tell \r from \r\n; wait for more bytes
                        break;
                    }
                    lines.push(decode(&self.buf[start..i]));
                    i += if self.buf[i + 1] == b'\n' { 2 } else { 1 };
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.buf.drain(..start);
        lines
    }

    /// Flushes any trailing unterminated line after the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.buf);
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        if rest.is_empty() {
            None
        } else {
            Some(decode(&rest))
        }
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// One recognized progress line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedProgress {
    /// Complete progress line with rate and ETA.
    Full {
        percentage: f32,
        rate_fps: f32,
        current_pass: u32,
        total_passes: u32,
        remaining_seconds: u64,
    },
    /// Percent-only line; rate and ETA keep their prior values.
    Percent { percentage: f32 },
    /// Phase transition marker, optionally pinning a percentage floor.
    Phase {
        phase: JobPhase,
        percentage_floor: Option<f32>,
    },
}

/// Recognizes the external tool's progress line formats.
///
/// `Encoding: task 1 of 2, 45.67 % (123.45 fps, avg 98.76 fps, ETA 01h23m45s)`
/// is a full update; the same line without the parenthesized detail is a
/// percent-only update. `Scanning title` and `Muxing` are phase markers.
pub struct ProgressParser {
    encoding: Regex,
}

impl ProgressParser {
    pub fn new() -> Self {
        let encoding = Regex::new(
            r"Encoding: task (\d+) of (\d+), (\d+(?:\.\d+)?) ?%(?:.*?(\d+(?:\.\d+)?) fps.*?ETA (\d+)h(\d+)m(\d+)s)?",
        )
        .expect("progress pattern is valid");
        Self { encoding }
    }

    pub fn parse(&self, line: &str) -> Option<ParsedProgress> {
        if let Some(caps) = self.encoding.captures(line) {
            let current_pass: u32 = caps[1].parse().ok()?;
            let total_passes: u32 = caps[2].parse().ok()?;
            let percentage: f32 = caps[3].parse().ok()?;

            return Some(match caps.get(4) {
                Some(fps) => {
                    let rate_fps: f32 = fps.as_str().parse().ok()?;
                    let hours: u64 = caps[5].parse().ok()?;
                    let minutes: u64 = caps[6].parse().ok()?;
                    let seconds: u64 = caps[7].parse().ok()?;
                    ParsedProgress::Full {
                        percentage,
                        rate_fps,
                        current_pass,
                        total_passes,
                        remaining_seconds: hours * 3600 + minutes * 60 + seconds,
                    }
                }
                None => ParsedProgress::Percent { percentage },
            });
        }

        if line.contains("Scanning title") {
            return Some(ParsedProgress::Phase {
                phase: JobPhase::Preparing,
                percentage_floor: None,
            });
        }

        if line.contains("Muxing") {
            return Some(ParsedProgress::Phase {
                phase: JobPhase::Finalizing,
                percentage_floor: Some(99.0),
            });
        }

        None
    }
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_newline_conventions() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"one\ntwo\r\nthree\rfour");
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(decoder.finish(), Some("four".to_string()));
    }

    #[test]
    fn test_decoder_cr_at_chunk_boundary() {
        let mut decoder = LineDecoder::new();
        // \r arrives at the end of one chunk, \n at the start of the next
        assert_eq!(decoder.push(b"alpha\r"), Vec::<String>::new());
        assert_eq!(decoder.push(b"\nbeta\n"), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_decoder_bare_cr_followed_by_text() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.push(b"alpha\r"), Vec::<String>::new());
        assert_eq!(decoder.push(b"beta\n"), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_decoder_split_multibyte_sequence() {
        let text = "caf\u{e9} 50%\n";
        let bytes = text.as_bytes();
        // Split inside the two-byte e-acute sequence
        let split = 4;
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.push(&bytes[..split]), Vec::<String>::new());
        assert_eq!(decoder.push(&bytes[split..]), vec!["caf\u{e9} 50%"]);
    }

    #[test]
    fn test_decoder_finish_empty() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"done\n");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_parse_full_progress_line() {
        let parser = ProgressParser::new();
        let parsed = parser
            .parse("Encoding: task 1 of 2, 45.67 % (123.45 fps, avg 98.76 fps, ETA 01h23m45s)")
            .unwrap();
        assert_eq!(
            parsed,
            ParsedProgress::Full {
                percentage: 45.67,
                rate_fps: 123.45,
                current_pass: 1,
                total_passes: 2,
                remaining_seconds: 3600 + 23 * 60 + 45,
            }
        );
    }

    #[test]
    fn test_parse_percent_only_line() {
        let parser = ProgressParser::new();
        let parsed = parser.parse("Encoding: task 1 of 1, 5.11 %").unwrap();
        assert_eq!(parsed, ParsedProgress::Percent { percentage: 5.11 });
    }

    #[test]
    fn test_parse_scanning_marker() {
        let parser = ProgressParser::new();
        let parsed = parser.parse("Scanning title 1 of 1...").unwrap();
        assert_eq!(
            parsed,
            ParsedProgress::Phase {
                phase: JobPhase::Preparing,
                percentage_floor: None,
            }
        );
    }

    #[test]
    fn test_parse_muxing_marker() {
        let parser = ProgressParser::new();
        let parsed = parser.parse("Muxing: this may take awhile...").unwrap();
        assert_eq!(
            parsed,
            ParsedProgress::Phase {
                phase: JobPhase::Finalizing,
                percentage_floor: Some(99.0),
            }
        );
    }

    #[test]
    fn test_parse_unrecognized_line() {
        let parser = ProgressParser::new();
        assert_eq!(parser.parse("libhb: work result = 0"), None);
        assert_eq!(parser.parse(""), None);
        assert_eq!(parser.parse("ERROR: no valid source"), None);
    }
}
