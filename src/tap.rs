use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use log::warn;

use crate::error::{Error, Result};

/// Which way a chunk moved, for dump annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Sent,
    Rcvd,
}

/// Side-effect sinks observing the byte flow: a raw duplicate of the
/// transferred data and/or a hex dump. Tap failures degrade to a warning;
/// they never surface as transfer errors.
pub struct Taps {
    out: Option<File>,
    hex: Option<File>,
}

impl Taps {
    pub fn none() -> Taps {
        Taps { out: None, hex: None }
    }

    pub fn new(
        output_file: Option<&Path>,
        append: bool,
        hex_file: Option<&Path>,
    ) -> Result<Taps> {
        let out = match output_file {
            Some(path) => Some(open_sink(path, append)?),
            None => None,
        };
        let hex = match hex_file {
            Some(path) => Some(open_sink(path, false)?),
            None => None,
        };
        Ok(Taps { out, hex })
    }

    pub fn is_active(&self) -> bool {
        self.out.is_some() || self.hex.is_some()
    }

    /// Mirror one transferred chunk into the configured sinks.
    pub fn observe(&mut self, dir: Dir, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if let Some(f) = &mut self.out {
            if let Err(e) = f.write_all(chunk) {
                warn!("output tap failed: {}", e);
                self.out = None;
            }
        }
        if let Some(f) = &mut self.hex {
            let rendered = hex_dump(dir, chunk);
            if let Err(e) = f.write_all(rendered.as_bytes()) {
                warn!("hex-dump tap failed: {}", e);
                self.hex = None;
            }
        }
    }
}

fn open_sink(path: &Path, append: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true);
    if append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    options
        .open(path)
        .map_err(|e| Error::InvalidConfiguration(format!("cannot open {:?}: {}", path, e)))
}

/// Classic 16-bytes-per-row rendering: offset, hex columns, ASCII gutter.
fn hex_dump(dir: Dir, chunk: &[u8]) -> String {
    let label = match dir {
        Dir::Sent => "Sent",
        Dir::Rcvd => "Rcvd",
    };
    let mut out = format!("{} {} bytes:\n", label, chunk.len());
    for (row, bytes) in chunk.chunks(16).enumerate() {
        out.push_str(&format!("[{:04x}]  ", row * 16));
        for i in 0..16 {
            match bytes.get(i) {
                Some(b) => out.push_str(&format!("{:02x} ", b)),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push(' ');
        for &b in bytes {
            out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_rows_are_sixteen_wide() {
        let rendered = hex_dump(Dir::Sent, b"Hello, World!\n and a second row");
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Sent 31 bytes:");
        assert!(lines[1].starts_with("[0000]  48 65 6c 6c 6f "));
        assert!(lines[1].ends_with("Hello, World!. a"));
        assert!(lines[2].starts_with("[0010]  "));
    }

    #[test]
    fn nonprintable_bytes_render_as_dots() {
        let rendered = hex_dump(Dir::Rcvd, &[0x00, 0xff, b'A']);
        assert!(rendered.contains("..A"));
    }
}
