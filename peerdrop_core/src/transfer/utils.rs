use crate::error::TransferError;
use crate::transfer::constants::{MAX_FILE_SIZE, MAX_FILENAME_LENGTH};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::sync::mpsc;

const FALLBACK_FILE_NAME: &str = "received_file";

/// Windows device names that cannot be used as file names
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Progress of one file in either direction
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub file_name: String,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub speed: String,
    pub is_sending: bool,
}

impl TransferProgress {
    /// Completion percentage in `0.0..=100.0`
    pub fn percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_done as f32 / self.total_bytes as f32) * 100.0
    }
}

/// Check a declared transfer against the receiver's limits
pub fn validate_transfer_info(file_name: &str, file_size: u64) -> Result<(), TransferError> {
    if file_size > MAX_FILE_SIZE {
        return Err(TransferError::Rejected(format!(
            "{} ({} MB) exceeds the maximum of {} MB",
            file_name,
            file_size / (1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024)
        )));
    }
    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err(TransferError::Rejected(format!(
            "file name too long ({} bytes, max {})",
            file_name.len(),
            MAX_FILENAME_LENGTH
        )));
    }
    Ok(())
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Publish a progress update if anyone is listening
pub fn report_progress(
    progress_tx: Option<&mpsc::UnboundedSender<TransferProgress>>,
    file_name: &str,
    bytes_done: u64,
    total_bytes: u64,
    start_time: Instant,
    is_sending: bool,
) {
    let Some(tx) = progress_tx else {
        return;
    };
    let speed = format_transfer_speed(bytes_done, start_time.elapsed().as_secs_f64());
    let _ = tx.send(TransferProgress {
        file_name: file_name.to_string(),
        bytes_done,
        total_bytes,
        speed,
        is_sending,
    });
}

/// Reduce a peer-declared file name to a safe single path component
pub fn sanitize_file_name(file_name: &str) -> String {
    // Only the last component counts, whichever separator the peer used
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();

    let mut clean: String = last
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();

    let trimmed = clean.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || RESERVED_NAMES.iter().any(|r| clean.eq_ignore_ascii_case(r))
    {
        return FALLBACK_FILE_NAME.to_string();
    }

    if clean.len() > MAX_FILENAME_LENGTH {
        clean = shorten_keeping_extension(&clean);
    }
    clean
}

/// Truncate to `MAX_FILENAME_LENGTH` bytes, keeping a short extension intact
fn shorten_keeping_extension(name: &str) -> String {
    if let Some(dot) = name.rfind('.') {
        let ext = &name[dot..];
        if ext.len() < 20 {
            let mut base = name[..dot].to_string();
            truncate_at_boundary(&mut base, MAX_FILENAME_LENGTH - ext.len());
            base.push_str(ext);
            return base;
        }
    }
    let mut out = name.to_string();
    truncate_at_boundary(&mut out, MAX_FILENAME_LENGTH);
    out
}

fn truncate_at_boundary(s: &mut String, max_len: usize) {
    if s.len() <= max_len {
        return;
    }
    let mut cutoff = max_len;
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s.truncate(cutoff);
}

/// Pick a path in `dir` for `file_name` that does not exist yet
pub async fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return candidate;
    }

    let (stem, ext) = match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    };
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        n += 1;
    }
}

/// Create a new file readable and writable by the owner only (0o600 on Unix)
pub async fn create_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_transfer_info() {
        assert!(validate_transfer_info("valid.txt", 1024).is_ok());
        assert!(validate_transfer_info("huge.bin", MAX_FILE_SIZE + 1).is_err());

        let long_name = "a".repeat(MAX_FILENAME_LENGTH + 1);
        assert!(validate_transfer_info(&long_name, 1024).is_err());
    }

    #[test]
    fn test_format_transfer_speed() {
        assert_eq!(format_transfer_speed(100, 0.0), "Starting...");
        assert_eq!(format_transfer_speed(500, 1.0), "500 B/s");
        assert_eq!(format_transfer_speed(2_500, 1.0), "2.5 KB/s");
        assert_eq!(format_transfer_speed(5_000_000, 2.0), "2.50 MB/s");
    }

    #[test]
    fn test_progress_percent() {
        let progress = TransferProgress {
            file_name: "a".to_string(),
            bytes_done: 25,
            total_bytes: 100,
            speed: String::new(),
            is_sending: true,
        };
        assert_eq!(progress.percent(), 25.0);
    }

    #[test]
    fn test_sanitize_file_name_paths() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(sanitize_file_name("/absolute/path/to/file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\calc.exe"), "calc.exe");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("folder\\../file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_dangerous() {
        assert_eq!(sanitize_file_name(".."), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name(""), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("dir/"), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("nul"), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("LPT1"), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("bad\u{0}name.txt"), "badname.txt");
        assert_eq!(sanitize_file_name("console.log"), "console.log");
    }

    #[test]
    fn test_sanitize_file_name_length() {
        let long_name = "a".repeat(300) + ".txt";
        let sanitized = sanitize_file_name(&long_name);
        assert!(sanitized.len() <= MAX_FILENAME_LENGTH);
        assert!(sanitized.ends_with(".txt"));

        // 🦀 is 4 bytes; never cut one in half
        let crabs = "🦀".repeat(100) + ".txt";
        let sanitized = sanitize_file_name(&crabs);
        assert!(sanitized.len() <= MAX_FILENAME_LENGTH);
        assert!(sanitized.trim_end_matches(".txt").ends_with('🦀'));
    }

    #[tokio::test]
    async fn test_unique_path_avoids_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "notes.txt").await;
        assert_eq!(first, dir.path().join("notes.txt"));

        tokio::fs::write(&first, b"x").await.unwrap();
        let second = unique_path(dir.path(), "notes.txt").await;
        assert_eq!(second, dir.path().join("notes (1).txt"));
    }

    #[tokio::test]
    async fn test_create_secure_file_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        let _file = create_secure_file(&path).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
