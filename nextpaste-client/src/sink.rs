use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use nextpaste_core::{ClipboardContent, ClipboardKind, ClipboardSink};
use tracing::{info, warn};

const MAX_FILE_NAME_CHARS: usize = 128;

/// Headless stand-in for the desktop clipboard: text goes to stdout, images and
/// files are saved under `output_dir`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    output_dir: PathBuf,
}

impl DirectorySink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Saves binary content and returns where it landed. Never overwrites.
    pub fn save(&self, content: &ClipboardContent) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let name = match (&content.kind, content.name.as_deref()) {
            (ClipboardKind::File, Some(name)) => sanitize_file_name(name),
            _ => format!(
                "clipboard-{}.{}",
                now_unix_ms(),
                extension_for_mime(&content.mime)
            ),
        };
        let dest = unique_destination(&self.output_dir, &name);
        fs::write(&dest, &content.bytes)?;
        Ok(dest)
    }
}

impl ClipboardSink for DirectorySink {
    fn write(&self, content: ClipboardContent) {
        match content.kind {
            ClipboardKind::Text => {
                let text = String::from_utf8_lossy(&content.bytes);
                let mut stdout = io::stdout().lock();
                if let Err(err) = writeln!(stdout, "{text}").and_then(|()| stdout.flush()) {
                    warn!("failed to print received text: {}", err);
                }
            }
            ClipboardKind::Image | ClipboardKind::File => match self.save(&content) {
                Ok(path) => info!(
                    kind = %content.kind,
                    bytes = content.bytes.len(),
                    path = %path.display(),
                    "saved received content"
                ),
                Err(err) => warn!(kind = %content.kind, "failed to save received content: {}", err),
            },
        }
    }
}

/// Replaces path separators, reserved and control characters, and caps the length.
pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return "file.bin".to_owned();
    }

    trimmed
        .chars()
        .map(|ch| match ch {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect()
}

/// `dir/name`, or `dir/stem (n).ext` for the first free `n` when taken.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = as_path.extension().and_then(|s| s.to_str());
    (1..)
        .map(|i| match ext {
            Some(ext) => dir.join(format!("{stem} ({i}).{ext}")),
            None => dir.join(format!("{stem} ({i})")),
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "text/plain" => "txt",
        _ => "bin",
    }
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_separators_and_control_chars() {
        assert_eq!(sanitize_file_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_file_name("a\tb:c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_file_name("   "), "file.bin");
        assert_eq!(sanitize_file_name(".."), "file.bin");
        assert_eq!(sanitize_file_name(&"x".repeat(300)).len(), MAX_FILE_NAME_CHARS);
    }

    #[test]
    fn saved_files_never_overwrite() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let sink = DirectorySink::new(dir.path());
        let content = ClipboardContent::file("notes.txt", b"one".to_vec(), "text/plain");

        let first = sink.save(&content).expect("save first");
        let second = sink.save(&content).expect("save second");
        assert_eq!(first, dir.path().join("notes.txt"));
        assert_eq!(second, dir.path().join("notes (1).txt"));
        assert_eq!(fs::read(&second).expect("read second"), b"one");
    }

    #[test]
    fn images_get_an_extension_from_their_mime() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let sink = DirectorySink::new(dir.path().join("nested"));
        let path = sink
            .save(&ClipboardContent::image(vec![1, 2, 3], "image/jpeg"))
            .expect("save image");
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
        assert!(path.starts_with(dir.path().join("nested")));
    }
}
