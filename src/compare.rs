//! Output comparison policies.
//!
//! All text policies work line by line on any [`BufRead`]. `\n`, `\r\n` and a
//! lone `\r` all end a line. Input that is not
//! valid UTF-8 (or that cannot be read at all) makes the comparison fail
//! instead of raising, since the compared output comes from untrusted code.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use crate::error::CompareError;

/// Lines of both sides must match one to one, ignoring trailing whitespace.
pub fn exact_text_compare(a: impl BufRead, b: impl BufRead) -> bool {
    let mut lines_a = universal_lines(a);
    let mut lines_b = universal_lines(b);

    loop {
        match (lines_a.next(), lines_b.next()) {
            (None, None) => return true,
            (Some(Ok(line_a)), Some(Ok(line_b))) => {
                if line_a.trim_end() != line_b.trim_end() {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Formatting-tolerant comparison.
///
/// Blank lines are skipped on both sides. Lines that differ verbatim are
/// compared again token by token, case-insensitively. Both sides must run
/// out of non-blank lines at the same time.
pub fn lenient_text_compare(a: impl BufRead, b: impl BufRead) -> bool {
    let mut lines_a = universal_lines(a);
    let mut lines_b = universal_lines(b);

    loop {
        let line_a = match next_non_blank(&mut lines_a) {
            Ok(line) => line,
            Err(_) => return false,
        };
        let line_b = match next_non_blank(&mut lines_b) {
            Ok(line) => line,
            Err(_) => return false,
        };

        match (line_a, line_b) {
            (None, None) => return true,
            (Some(line_a), Some(line_b)) => {
                if line_a != line_b && !same_tokens_ignoring_case(&line_a, &line_b) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Token-wise comparison where numeric tokens may differ by at most
/// `abs_error`. Non-numeric tokens must be equal as text.
///
/// # Errors
///
/// Returns [`CompareError::NegativeTolerance`] when `abs_error` is negative
/// (or NaN), before looking at any input.
pub fn numeric_tolerant_compare(
    a: impl BufRead,
    b: impl BufRead,
    abs_error: f64,
) -> Result<bool, CompareError> {
    if !(abs_error >= 0.0) {
        return Err(CompareError::NegativeTolerance(abs_error));
    }

    let mut lines_a = universal_lines(a);
    let mut lines_b = universal_lines(b);

    loop {
        let (line_a, line_b) = match (lines_a.next(), lines_b.next()) {
            (None, None) => return Ok(true),
            (Some(Ok(line_a)), Some(Ok(line_b))) => (line_a, line_b),
            _ => return Ok(false),
        };

        let tokens_a: Vec<&str> = line_a.split_whitespace().collect();
        let tokens_b: Vec<&str> = line_b.split_whitespace().collect();
        if tokens_a.len() != tokens_b.len() {
            return Ok(false);
        }

        for (tok_a, tok_b) in tokens_a.iter().zip(tokens_b.iter()) {
            match (tok_a.parse::<f64>(), tok_b.parse::<f64>()) {
                (Ok(x), Ok(y)) => {
                    if (x - y).abs() > abs_error {
                        return Ok(false);
                    }
                }
                _ => {
                    if tok_a != tok_b {
                        return Ok(false);
                    }
                }
            }
        }
    }
}

/// Byte-for-byte equality of two streams.
pub fn bytes_compare(mut a: impl Read, mut b: impl Read) -> io::Result<bool> {
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];

    loop {
        let n_a = fill(&mut a, &mut buf_a)?;
        let n_b = fill(&mut b, &mut buf_b)?;
        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
        if n_a == 0 {
            return Ok(true);
        }
    }
}

pub fn exact_text_compare_files(a: impl AsRef<Path>, b: impl AsRef<Path>) -> io::Result<bool> {
    Ok(exact_text_compare(open(a)?, open(b)?))
}

pub fn lenient_text_compare_files(a: impl AsRef<Path>, b: impl AsRef<Path>) -> io::Result<bool> {
    Ok(lenient_text_compare(open(a)?, open(b)?))
}

/// File variant of [`numeric_tolerant_compare`]. The tolerance is checked
/// before any file is opened.
pub fn numeric_tolerant_compare_files(
    a: impl AsRef<Path>,
    b: impl AsRef<Path>,
    abs_error: f64,
) -> anyhow::Result<bool> {
    if !(abs_error >= 0.0) {
        return Err(CompareError::NegativeTolerance(abs_error).into());
    }
    Ok(numeric_tolerant_compare(open(a)?, open(b)?, abs_error)?)
}

pub fn bytes_compare_files(a: impl AsRef<Path>, b: impl AsRef<Path>) -> io::Result<bool> {
    let file_a = File::open(a)?;
    let file_b = File::open(b)?;
    if file_a.metadata()?.len() != file_b.metadata()?.len() {
        return Ok(false);
    }
    bytes_compare(BufReader::new(file_a), BufReader::new(file_b))
}

/// Lines of `reader` without their terminators.
fn universal_lines<R: BufRead>(reader: R) -> UniversalLines<R> {
    UniversalLines {
        reader,
        after_cr: false,
    }
}

struct UniversalLines<R> {
    reader: R,
    /// The previous line ended with `\r`; a leading `\n` belongs to it.
    after_cr: bool,
}

impl<R: BufRead> Iterator for UniversalLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = Vec::new();
        let mut terminated = false;

        loop {
            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            };
            if available.is_empty() {
                break;
            }

            if self.after_cr {
                self.after_cr = false;
                if available[0] == b'\n' {
                    self.reader.consume(1);
                    continue;
                }
            }

            match available.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(end) => {
                    line.extend_from_slice(&available[..end]);
                    self.after_cr = available[end] == b'\r';
                    self.reader.consume(end + 1);
                    terminated = true;
                    break;
                }
                None => {
                    let len = available.len();
                    line.extend_from_slice(available);
                    self.reader.consume(len);
                }
            }
        }

        if !terminated && line.is_empty() {
            return None;
        }
        Some(String::from_utf8(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

fn open(path: impl AsRef<Path>) -> io::Result<BufReader<File>> {
    File::open(path).map(BufReader::new)
}

fn next_non_blank(lines: &mut impl Iterator<Item = io::Result<String>>) -> io::Result<Option<String>> {
    for line in lines {
        let line = line?;
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

fn same_tokens_ignoring_case(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let mut tokens_a = a.split_whitespace();
    let mut tokens_b = b.split_whitespace();

    // Lock-step: a token missing on one side is a mismatch
    loop {
        match (tokens_a.next(), tokens_b.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if x == y => continue,
            _ => return false,
        }
    }
}

/// Reads until `buf` is full or the stream ends.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
