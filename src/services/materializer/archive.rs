//! Archive Extraction
//!
//! Unpacks zip, gzip, and tar payloads into a workspace logs tree with
//! sandbox guards: entries may not escape the destination, no single entry
//! may exceed the per-entry ceiling, and the running total is capped.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Payload kinds recognized by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Zip,
    Gzip,
    Tar,
    Plain,
}

/// Sniff the payload type from magic bytes.
pub fn detect_kind(bytes: &[u8]) -> PayloadKind {
    if bytes.len() >= 2 && &bytes[..2] == b"PK" {
        return PayloadKind::Zip;
    }
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        return PayloadKind::Gzip;
    }
    if bytes.len() >= 262 && &bytes[257..262] == b"ustar" {
        return PayloadKind::Tar;
    }
    PayloadKind::Plain
}

/// Extraction ceilings, taken from the limits config.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
}

/// Outcome of one extraction.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub files_written: usize,
    pub bytes_written: u64,
}

/// Extract an archive payload into `dest`, preserving relative paths.
/// `total_so_far` carries the byte count already materialized for this task
/// so the cap spans all artifacts.
pub fn extract_archive(
    bytes: &[u8],
    original_name: &str,
    dest: &Path,
    limits: ExtractLimits,
    total_so_far: u64,
) -> AppResult<ExtractReport> {
    match detect_kind(bytes) {
        PayloadKind::Zip => extract_zip(bytes, dest, limits, total_so_far),
        PayloadKind::Gzip => extract_gzip(bytes, original_name, dest, limits, total_so_far),
        PayloadKind::Tar => extract_tar(bytes, dest, limits, total_so_far),
        PayloadKind::Plain => Err(AppError::validation(format!(
            "payload '{}' is not a recognized archive format",
            original_name
        ))),
    }
}

fn extract_zip(
    bytes: &[u8],
    dest: &Path,
    limits: ExtractLimits,
    total_so_far: u64,
) -> AppResult<ExtractReport> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| AppError::validation(format!("unreadable zip archive: {}", e)))?;

    let mut report = ExtractReport::default();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| AppError::validation(format!("corrupt zip entry: {}", e)))?;
        if entry.is_dir() {
            continue;
        }

        // enclosed_name rejects absolute paths and parent traversal
        let rel = entry.enclosed_name().ok_or_else(|| {
            AppError::validation(format!("zip entry '{}' escapes the workspace", entry.name()))
        })?;
        check_entry_size(entry.size(), entry.name(), limits)?;

        let target = dest.join(rel);
        let written = write_entry(&mut entry, &target, limits, total_so_far + report.bytes_written)?;
        report.files_written += 1;
        report.bytes_written += written;
    }
    Ok(report)
}

fn extract_gzip(
    bytes: &[u8],
    original_name: &str,
    dest: &Path,
    limits: ExtractLimits,
    total_so_far: u64,
) -> AppResult<ExtractReport> {
    let inner_name = original_name
        .strip_suffix(".gz")
        .filter(|s| !s.is_empty())
        .unwrap_or("decompressed.log");
    let target = dest.join(sanitize_relative(Path::new(inner_name))?);

    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let written = write_entry(&mut decoder, &target, limits, total_so_far)?;

    // A gzip member inside may itself be a tar or zip; unpack it in place
    let unpacked = std::fs::read(&target)?;
    match detect_kind(&unpacked) {
        PayloadKind::Tar | PayloadKind::Zip => {
            std::fs::remove_file(&target)?;
            let mut report = extract_archive(
                &unpacked,
                inner_name,
                dest,
                limits,
                total_so_far,
            )?;
            report.bytes_written = report.bytes_written.max(written);
            Ok(report)
        }
        _ => Ok(ExtractReport {
            files_written: 1,
            bytes_written: written,
        }),
    }
}

fn extract_tar(
    bytes: &[u8],
    dest: &Path,
    limits: ExtractLimits,
    total_so_far: u64,
) -> AppResult<ExtractReport> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut report = ExtractReport::default();

    for entry in archive
        .entries()
        .map_err(|e| AppError::validation(format!("unreadable tar archive: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| AppError::validation(format!("corrupt tar entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .map_err(|e| AppError::validation(format!("bad tar path: {}", e)))?
            .into_owned();
        let rel = sanitize_relative(&rel)?;
        check_entry_size(entry.size(), &rel.to_string_lossy(), limits)?;

        let target = dest.join(rel);
        let written = write_entry(&mut entry, &target, limits, total_so_far + report.bytes_written)?;
        report.files_written += 1;
        report.bytes_written += written;
    }
    Ok(report)
}

/// Reject absolute components and `..` traversal; return a clean relative path.
fn sanitize_relative(path: &Path) -> AppResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(AppError::validation(format!(
                    "archive entry '{}' escapes the workspace",
                    path.display()
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(AppError::validation("archive entry has an empty path"));
    }
    Ok(clean)
}

fn check_entry_size(size: u64, name: &str, limits: ExtractLimits) -> AppResult<()> {
    if size > limits.max_entry_bytes {
        return Err(AppError::validation(format!(
            "archive entry '{}' is {} bytes, over the {} byte ceiling",
            name, size, limits.max_entry_bytes
        )));
    }
    Ok(())
}

/// Stream an entry to disk, enforcing the running total cap as bytes flow.
fn write_entry(
    reader: &mut impl Read,
    target: &Path,
    limits: ExtractLimits,
    total_so_far: u64,
) -> AppResult<u64> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let remaining = limits.max_total_bytes.saturating_sub(total_so_far);
    let mut file = std::fs::File::create(target)?;
    // Allow one extra byte so an over-quota stream is detectable
    let written = std::io::copy(&mut reader.take(remaining + 1), &mut file)?;
    if written > remaining {
        drop(file);
        let _ = std::fs::remove_file(target);
        return Err(AppError::validation(format!(
            "total extracted size exceeds the {} byte quota",
            limits.max_total_bytes
        )));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LIMITS: ExtractLimits = ExtractLimits {
        max_entry_bytes: 1024 * 1024,
        max_total_bytes: 4 * 1024 * 1024,
    };

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn gzip_of(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_detect_kinds() {
        assert_eq!(detect_kind(&zip_with(&[("a", b"x")])), PayloadKind::Zip);
        assert_eq!(detect_kind(&gzip_of(b"hello")), PayloadKind::Gzip);
        assert_eq!(detect_kind(b"plain text"), PayloadKind::Plain);
    }

    #[test]
    fn test_zip_extraction_preserves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let payload = zip_with(&[
            ("device.log", b"2026-07-01 10:00:00 INFO: boot\n"),
            ("sub/app.log", b"app line\n"),
        ]);

        let report = extract_archive(&payload, "bundle.zip", dir.path(), LIMITS, 0).unwrap();
        assert_eq!(report.files_written, 2);
        assert!(dir.path().join("device.log").exists());
        assert!(dir.path().join("sub/app.log").exists());
    }

    #[test]
    fn test_zip_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let payload = zip_with(&[("../escape.log", b"nope")]);
        let result = extract_archive(&payload, "evil.zip", dir.path(), LIMITS, 0);
        assert!(result.is_err());
        assert!(!dir.path().parent().unwrap().join("escape.log").exists());
    }

    #[test]
    fn test_sanitize_relative_rejects_traversal() {
        assert!(sanitize_relative(Path::new("../escape.log")).is_err());
        assert!(sanitize_relative(Path::new("/etc/escape.log")).is_err());
        assert!(sanitize_relative(Path::new("a/../../escape.log")).is_err());
        assert!(sanitize_relative(Path::new("")).is_err());
        assert_eq!(
            sanitize_relative(Path::new("./ok/nested.log")).unwrap(),
            PathBuf::from("ok/nested.log")
        );
    }

    #[test]
    fn test_gzip_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let payload = gzip_of(b"2026-07-01 10:00:00 INFO: boot\n");
        let report = extract_archive(&payload, "device.log.gz", dir.path(), LIMITS, 0).unwrap();
        assert_eq!(report.files_written, 1);
        let content = std::fs::read_to_string(dir.path().join("device.log")).unwrap();
        assert!(content.contains("boot"));
    }

    #[test]
    fn test_tar_gz_nested_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"tar line\n";
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "inner/device.log", &data[..])
            .unwrap();
        let tarball = builder.into_inner().unwrap();
        let payload = gzip_of(&tarball);

        let report = extract_archive(&payload, "logs.tar.gz", dir.path(), LIMITS, 0).unwrap();
        assert_eq!(report.files_written, 1);
        assert!(dir.path().join("inner/device.log").exists());
    }

    #[test]
    fn test_total_quota_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let tight = ExtractLimits {
            max_entry_bytes: 1024 * 1024,
            max_total_bytes: 10,
        };
        let payload = zip_with(&[("big.log", b"0123456789abcdef")]);
        let result = extract_archive(&payload, "big.zip", dir.path(), tight, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_plain_payload_is_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_archive(b"just text", "notes.txt", dir.path(), LIMITS, 0);
        assert!(result.is_err());
    }
}
