//! Descriptor sources: inline text or a file on disk.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{Result, WsimError};

/// Largest descriptor file accepted.
pub const MAX_DESCRIPTOR_SIZE: u64 = 1 << 20;

/// Resolve a descriptor argument to workload text.
///
/// An argument naming an existing regular file is read from disk, with
/// newlines turned into step separators. Anything else is the text itself.
pub fn load_descriptor(arg: &str) -> Result<String> {
    let path = Path::new(arg);
    let meta = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Ok(arg.to_string()),
    };

    let load_err = |source| WsimError::Load {
        path: arg.to_string(),
        source,
    };

    if meta.len() > MAX_DESCRIPTOR_SIZE {
        return Err(load_err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("descriptor larger than {} bytes", MAX_DESCRIPTOR_SIZE),
        )));
    }

    let text = fs::read_to_string(path).map_err(load_err)?;
    log::info!("Loaded workload descriptor from {} ({} bytes)", arg, text.len());
    Ok(normalize_file_text(&text))
}

/// Join lines with `,` and drop trailing separators.
fn normalize_file_text(text: &str) -> String {
    let joined: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ',' } else { c })
        .collect();
    joined.trim_end_matches(|c: char| c == ',' || c.is_whitespace()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_inline_text_passes_through() {
        assert_eq!(load_descriptor("1.RCS.100.0.0").unwrap(), "1.RCS.100.0.0");
    }

    #[test]
    fn test_file_lines_become_steps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.RCS.100.0.0").unwrap();
        writeln!(file, "d.50").unwrap();
        writeln!(file).unwrap();
        let text = load_descriptor(file.path().to_str().unwrap()).unwrap();
        assert_eq!(text, "1.RCS.100.0.0,d.50");
    }

    #[test]
    fn test_oversized_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let line = "d.1,".repeat(1024);
        for _ in 0..300 {
            file.write_all(line.as_bytes()).unwrap();
        }
        let err = load_descriptor(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, WsimError::Load { .. }));
    }
}
