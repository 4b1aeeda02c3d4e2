use serde::Serialize;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    /// 0.0 to 100.0
    pub percent: f32,
    pub line: String,
}

/// First well-formed percentage in `line`, clamped to 0..=100.
///
/// `pct rescued:   45.12%` -> 45.12. Tokens that do not parse (`%`, `1.2.3%`)
/// are skipped.
pub fn parse_percent(line: &str) -> Option<f32> {
    let bytes = line.as_bytes();
    for (idx, _) in line.match_indices('%') {
        let mut start = idx;
        while start > 0 && (bytes[start - 1].is_ascii_digit() || bytes[start - 1] == b'.') {
            start -= 1;
        }
        if start == idx {
            continue;
        }
        if let Ok(value) = line[start..idx].parse::<f32>() {
            if value.is_finite() {
                return Some(value.clamp(0.0, 100.0));
            }
        }
    }
    None
}

/// Keeps the highest percentage seen for one candidate.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<ProgressSample>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new sample when `line` moved progress forward.
    pub fn observe(&mut self, line: &str) -> Option<ProgressSample> {
        let percent = parse_percent(line)?;
        if let Some(last) = &self.last {
            if percent < last.percent {
                return None;
            }
        }
        let sample = ProgressSample {
            percent,
            line: line.to_string(),
        };
        self.last = Some(sample.clone());
        Some(sample)
    }
}

/// Split a stream into lines on `\n` or `\r`, calling `on_line` for each
/// non-empty one in order.
///
/// Tools such as ddrescue and dd redraw their status with carriage returns,
/// so waiting for `\n` alone would hold progress back until the end. The stop
/// flag is checked before every read; once it is set the remaining output is
/// discarded.
pub fn for_each_line<R, F>(reader: &mut R, stop: &AtomicBool, mut on_line: F) -> io::Result<()>
where
    R: BufRead,
    F: FnMut(&str),
{
    let mut pending: Vec<u8> = Vec::new();
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        let chunk = match reader.fill_buf() {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if chunk.is_empty() {
            break;
        }
        let consumed = chunk.len();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    on_line(String::from_utf8_lossy(&pending).trim_end());
                    pending.clear();
                }
            } else {
                pending.push(byte);
            }
        }
        reader.consume(consumed);
    }
    if !pending.is_empty() {
        on_line(String::from_utf8_lossy(&pending).trim_end());
    }
    Ok(())
}
