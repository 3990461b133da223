//! Post-transfer file verification.
//!
//! Discovers checksum manifests shipped with a delivery, compares file
//! hashes against them, and summarizes the directory contents in a text
//! report. Verification problems are advisory: they are reported and
//! logged as warnings, but transfer success is what completes a task.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::warn;

use crate::Result;

/// How many of the largest files the report lists.
const LARGEST_FILES_LIMIT: usize = 10;

/// Basic statistics over a delivery directory.
#[derive(Debug, Default)]
pub struct DirectoryStats {
    pub total_files: usize,
    pub total_size: u64,
    /// Relative paths of zero-length files.
    pub empty_files: Vec<String>,
    /// Relative path and size of the largest files, descending.
    pub largest_files: Vec<(String, u64)>,
}

/// Result of checking one checksum manifest.
#[derive(Debug)]
pub struct ManifestCheck {
    pub manifest: PathBuf,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    /// Entries whose file could not be read.
    pub missing: Vec<String>,
}

impl ManifestCheck {
    pub fn all_passed(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }
}

/// Outcome of verifying a delivery directory.
#[derive(Debug)]
pub struct VerificationReport {
    pub stats: DirectoryStats,
    pub checks: Vec<ManifestCheck>,
    /// Human-readable report, stored alongside the delivery.
    pub text: String,
}

impl VerificationReport {
    /// Whether any manifest entry failed or was missing.
    pub fn has_problems(&self) -> bool {
        self.checks.iter().any(|check| !check.all_passed())
    }
}

/// Verify a delivery directory: statistics plus every manifest found.
pub fn verify_directory(dir: &Path) -> VerificationReport {
    let stats = directory_stats(dir);
    let manifests = find_manifests(dir);

    let mut checks = Vec::new();
    for manifest in manifests {
        match check_manifest(&manifest) {
            Ok(check) => checks.push(check),
            Err(e) => warn!(manifest = %manifest.display(), error = %e, "Failed to check manifest"),
        }
    }

    let text = render_report(dir, &stats, &checks);
    VerificationReport {
        stats,
        checks,
        text,
    }
}

/// Find checksum manifests under a directory (recursive).
///
/// The vendor ships `MD5.txt`-style manifests next to the data; anything
/// whose name mentions md5 counts.
pub fn find_manifests(dir: &Path) -> Vec<PathBuf> {
    let mut manifests = Vec::new();
    walk_files(dir, &mut |path| {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            let lower = name.to_lowercase();
            if lower.ends_with(".md5") || lower.contains("md5") {
                manifests.push(path.to_path_buf());
            }
        }
    });
    manifests.sort();
    manifests
}

/// Check one manifest: each line is `<hex digest>  <relative path>`,
/// resolved against the manifest's own directory.
pub fn check_manifest(manifest: &Path) -> Result<ManifestCheck> {
    let base = manifest.parent().unwrap_or(Path::new("."));
    let contents = std::fs::read_to_string(manifest)?;

    let mut check = ManifestCheck {
        manifest: manifest.to_path_buf(),
        passed: Vec::new(),
        failed: Vec::new(),
        missing: Vec::new(),
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((expected, name)) = split_manifest_line(line) else {
            continue;
        };

        match file_md5(&base.join(name)) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => {
                check.passed.push(name.to_string());
            }
            Ok(_) => check.failed.push(name.to_string()),
            Err(_) => check.missing.push(name.to_string()),
        }
    }

    Ok(check)
}

/// Split a manifest line into (digest, filename).
fn split_manifest_line(line: &str) -> Option<(&str, &str)> {
    let (digest, rest) = line.split_once(char::is_whitespace)?;
    if digest.len() != 32 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    // md5sum marks binary mode with a leading '*'.
    let name = rest.trim_start().trim_start_matches('*');
    if name.is_empty() {
        return None;
    }
    Some((digest, name))
}

/// Compute the MD5 digest of a file, reading in chunks.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Collect statistics over every regular file under a directory.
pub fn directory_stats(dir: &Path) -> DirectoryStats {
    let mut stats = DirectoryStats::default();
    let mut sizes: Vec<(String, u64)> = Vec::new();

    walk_files(dir, &mut |path| {
        let relative = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        stats.total_files += 1;
        stats.total_size += size;
        if size == 0 {
            stats.empty_files.push(relative.clone());
        }
        sizes.push((relative, size));
    });

    sizes.sort_by(|a, b| b.1.cmp(&a.1));
    sizes.truncate(LARGEST_FILES_LIMIT);
    stats.largest_files = sizes;
    stats.empty_files.sort();
    stats
}

/// Format a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Depth-first walk over regular files; unreadable directories are skipped.
fn walk_files(dir: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, visit);
        } else if path.is_file() {
            visit(&path);
        }
    }
}

fn render_report(dir: &Path, stats: &DirectoryStats, checks: &[ManifestCheck]) -> String {
    let mut lines = Vec::new();
    lines.push("File verification report".to_string());
    lines.push(format!("Directory: {}", dir.display()));
    lines.push(String::new());
    lines.push(format!("Total files: {}", stats.total_files));
    lines.push(format!("Total size: {}", format_size(stats.total_size)));

    if !stats.largest_files.is_empty() {
        lines.push(String::new());
        lines.push("Largest files:".to_string());
        for (name, size) in &stats.largest_files {
            lines.push(format!("  {}: {}", name, format_size(*size)));
        }
    }

    if !stats.empty_files.is_empty() {
        lines.push(String::new());
        lines.push("Empty files:".to_string());
        for name in &stats.empty_files {
            lines.push(format!("  {}", name));
        }
    }

    lines.push(String::new());
    if checks.is_empty() {
        lines.push("Checksum manifests: none found".to_string());
    } else {
        for check in checks {
            lines.push(format!("Manifest {}:", check.manifest.display()));
            lines.push(format!("  passed: {}", check.passed.len()));
            lines.push(format!("  failed: {}", check.failed.len()));
            lines.push(format!("  unreadable: {}", check.missing.len()));
            for name in &check.failed {
                lines.push(format!("  FAILED {}", name));
            }
            for name in &check.missing {
                lines.push(format!("  MISSING {}", name));
            }
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_split_manifest_line() {
        let line = "b10a8db164e0754105b7a99be72e3fe5  data/sample_1.fq.gz";
        let (digest, name) = split_manifest_line(line).unwrap();
        assert_eq!(digest, "b10a8db164e0754105b7a99be72e3fe5");
        assert_eq!(name, "data/sample_1.fq.gz");

        // binary-mode marker
        let (_, name) = split_manifest_line("b10a8db164e0754105b7a99be72e3fe5 *file.bin").unwrap();
        assert_eq!(name, "file.bin");

        assert!(split_manifest_line("not a manifest line").is_none());
        assert!(split_manifest_line("").is_none());
    }

    #[test]
    fn test_file_md5_matches_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "Hello World").unwrap();

        assert_eq!(
            file_md5(&path).unwrap(),
            "b10a8db164e0754105b7a99be72e3fe5"
        );
    }

    #[test]
    fn test_find_manifests_recursive() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("MD5.txt"), "").unwrap();
        std::fs::write(dir.path().join("sub/checksums.md5"), "").unwrap();
        std::fs::write(dir.path().join("sample.fq.gz"), "x").unwrap();

        let manifests = find_manifests(dir.path());
        assert_eq!(manifests.len(), 2);
    }

    #[test]
    fn test_check_manifest_pass_fail_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("good.txt"), "Hello World").unwrap();
        std::fs::write(dir.path().join("bad.txt"), "tampered").unwrap();

        let manifest = dir.path().join("MD5.txt");
        std::fs::write(
            &manifest,
            "b10a8db164e0754105b7a99be72e3fe5  good.txt\n\
             b10a8db164e0754105b7a99be72e3fe5  bad.txt\n\
             b10a8db164e0754105b7a99be72e3fe5  gone.txt\n",
        )
        .unwrap();

        let check = check_manifest(&manifest).unwrap();
        assert_eq!(check.passed, ["good.txt"]);
        assert_eq!(check.failed, ["bad.txt"]);
        assert_eq!(check.missing, ["gone.txt"]);
        assert!(!check.all_passed());
    }

    #[test]
    fn test_verify_directory_empty() {
        let dir = TempDir::new().unwrap();
        let report = verify_directory(dir.path());

        assert_eq!(report.stats.total_files, 0);
        assert!(!report.has_problems());
        assert!(report.text.contains("Total files: 0"));
        assert!(report.text.contains("none found"));
    }

    #[test]
    fn test_directory_stats() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "12345").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "").unwrap();

        let stats = directory_stats(dir.path());
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_size, 5);
        assert_eq!(stats.empty_files, ["empty.txt"]);
        assert_eq!(stats.largest_files[0].0, "a.txt");
    }
}
