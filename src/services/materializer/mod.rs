//! Log Materializer
//!
//! Turns an issue's artifact list into a workspace `logs/` tree the agent
//! can grep: resolve bytes (inline upload or resolver token), decrypt the
//! proprietary encrypted bundles through the injected codec, and unpack
//! archives under sandbox guards. Artifacts within one task are processed
//! sequentially; isolation is per task.

pub mod archive;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::issue::Issue;
use crate::services::workspace::Workspace;
use crate::storage::config::{LimitsConfig, MaterializerConfig};
use crate::utils::error::{AppResult, FailureKind, StageError};
use crate::utils::paths::safe_filename;
use archive::{detect_kind, extract_archive, ExtractLimits, PayloadKind};

/// The decryption codec: an opaque bytes-in/bytes-out function supplied by
/// the composition root. The service never looks inside it.
pub type Codec = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Passthrough codec used when no proprietary codec is wired in.
pub fn passthrough_codec() -> Codec {
    Arc::new(|bytes: &[u8]| Ok(bytes.to_vec()))
}

/// Resolves artifact bytes from an opaque producer token.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn fetch(&self, token: &str) -> AppResult<Vec<u8>>;
}

/// Resolver used when no producer integration is configured: any fetch is an
/// error, so only inline-uploaded artifacts can be analyzed.
pub struct UnconfiguredResolver;

#[async_trait]
impl ArtifactResolver for UnconfiguredResolver {
    async fn fetch(&self, token: &str) -> AppResult<Vec<u8>> {
        Err(crate::utils::error::AppError::config(format!(
            "no artifact resolver configured (token '{}')",
            token
        )))
    }
}

/// An artifact whose bytes are on disk under the workspace `raw/` directory.
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub name: String,
    pub path: PathBuf,
}

/// What materialization produced.
#[derive(Debug, Default)]
pub struct MaterializeReport {
    pub files: usize,
    pub bytes: u64,
    /// Human-readable notes surfaced in the agent prompt (merge fallback,
    /// skipped artifacts, …)
    pub notes: Vec<String>,
}

pub struct Materializer {
    codec: Codec,
    resolver: Arc<dyn ArtifactResolver>,
    encrypted_suffix: String,
    limits: LimitsConfig,
}

impl Materializer {
    pub fn new(
        codec: Codec,
        resolver: Arc<dyn ArtifactResolver>,
        config: &MaterializerConfig,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            codec,
            resolver,
            encrypted_suffix: config.encrypted_suffix.clone(),
            limits: limits.clone(),
        }
    }

    /// Stage C, first half: make every artifact's bytes locally available
    /// under `raw/`. Direct uploads are already there; tokens go through the
    /// resolver with a per-artifact deadline.
    pub async fn resolve(
        &self,
        issue: &Issue,
        ws: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResolvedArtifact>, StageError> {
        let mut resolved = Vec::new();

        for artifact in &issue.log_artifacts {
            if cancel.is_cancelled() {
                return Err(StageError::new(FailureKind::Cancelled, "task cancelled"));
            }

            let name = safe_filename(&artifact.name);
            let path = ws.raw_dir().join(&name);

            if path.exists() {
                resolved.push(ResolvedArtifact { name, path });
                continue;
            }

            if artifact.token.is_empty() {
                return Err(StageError::new(
                    FailureKind::ArtifactFetch,
                    format!("artifact '{}' has neither payload nor fetch token", artifact.name),
                ));
            }

            let deadline = Duration::from_secs(self.limits.artifact_timeout_secs);
            let fetched = tokio::select! {
                result = tokio::time::timeout(deadline, self.resolver.fetch(&artifact.token)) => {
                    match result {
                        Ok(Ok(bytes)) => bytes,
                        Ok(Err(e)) => {
                            return Err(StageError::new(
                                FailureKind::ArtifactFetch,
                                format!("artifact '{}' unreachable: {}", artifact.name, e),
                            ))
                        }
                        Err(_) => {
                            return Err(StageError::new(
                                FailureKind::ArtifactFetch,
                                format!(
                                    "artifact '{}' fetch exceeded {}s",
                                    artifact.name, self.limits.artifact_timeout_secs
                                ),
                            ))
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    return Err(StageError::new(FailureKind::Cancelled, "task cancelled"))
                }
            };

            tokio::fs::write(&path, &fetched).await.map_err(|e| {
                StageError::new(
                    FailureKind::ArtifactFetch,
                    format!("cannot store artifact '{}': {}", artifact.name, e),
                )
            })?;
            resolved.push(ResolvedArtifact { name, path });
        }

        if resolved.is_empty() {
            return Err(StageError::new(
                FailureKind::ArtifactFetch,
                "issue carries no log artifacts",
            ));
        }
        Ok(resolved)
    }

    /// Stage C, second half: decrypt encrypted bundles, unpack archives into
    /// `logs/`, write plain files through. One bad artifact fails the task.
    pub async fn decrypt_and_extract(
        &self,
        artifacts: &[ResolvedArtifact],
        ws: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<MaterializeReport, StageError> {
        let mut report = MaterializeReport::default();
        let logs_dir = ws.logs_dir();

        for artifact in artifacts {
            if cancel.is_cancelled() {
                return Err(StageError::new(FailureKind::Cancelled, "task cancelled"));
            }

            let bytes = tokio::fs::read(&artifact.path).await.map_err(|e| {
                StageError::new(
                    FailureKind::ArtifactFetch,
                    format!("cannot read artifact '{}': {}", artifact.name, e),
                )
            })?;

            let (payload, effective_name) = if artifact.name.ends_with(&self.encrypted_suffix) {
                let decrypted = (self.codec)(&bytes).map_err(|e| {
                    StageError::new(
                        FailureKind::DecryptFailure,
                        format!("codec rejected '{}': {}", artifact.name, e),
                    )
                })?;
                let stripped = artifact
                    .name
                    .strip_suffix(&self.encrypted_suffix)
                    .unwrap_or(&artifact.name)
                    .to_string();
                (decrypted, stripped)
            } else {
                (bytes, artifact.name.clone())
            };

            let written = self
                .unpack_payload(payload, &effective_name, &logs_dir, report.bytes, cancel)
                .await?;
            report.files += written.0;
            report.bytes += written.1;
        }

        if report.files == 0 {
            return Err(StageError::new(
                FailureKind::ExtractFailure,
                "no usable log files after extraction",
            ));
        }

        self.merge_fallback(ws, &mut report)?;
        Ok(report)
    }

    async fn unpack_payload(
        &self,
        payload: Vec<u8>,
        name: &str,
        logs_dir: &std::path::Path,
        bytes_so_far: u64,
        cancel: &CancellationToken,
    ) -> Result<(usize, u64), StageError> {
        let kind = detect_kind(&payload);

        if kind == PayloadKind::Plain {
            // A bare log file: write it through under its own name
            if payload.len() as u64 + bytes_so_far > self.limits.max_total_bytes {
                return Err(StageError::new(
                    FailureKind::ExtractFailure,
                    format!("total log size exceeds the {} byte quota", self.limits.max_total_bytes),
                ));
            }
            let target = logs_dir.join(safe_filename(name));
            let len = payload.len() as u64;
            tokio::fs::write(&target, payload).await.map_err(|e| {
                StageError::new(FailureKind::ExtractFailure, format!("cannot write '{}': {}", name, e))
            })?;
            return Ok((1, len));
        }

        let limits = ExtractLimits {
            max_entry_bytes: self.limits.max_entry_bytes,
            max_total_bytes: self.limits.max_total_bytes,
        };
        let dest = logs_dir.to_path_buf();
        let name_owned = name.to_string();
        let deadline = Duration::from_secs(self.limits.extract_timeout_secs);

        let handle = tokio::task::spawn_blocking(move || {
            extract_archive(&payload, &name_owned, &dest, limits, bytes_so_far)
        });

        let result = tokio::select! {
            joined = tokio::time::timeout(deadline, handle) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => {
                    return Err(StageError::new(
                        FailureKind::ExtractFailure,
                        format!("extraction worker died: {}", join_err),
                    ))
                }
                Err(_) => {
                    return Err(StageError::new(
                        FailureKind::ExtractFailure,
                        format!("extraction of '{}' exceeded {}s", name, self.limits.extract_timeout_secs),
                    ))
                }
            },
            _ = cancel.cancelled() => {
                return Err(StageError::new(FailureKind::Cancelled, "task cancelled"))
            }
        };

        match result {
            Ok(r) => Ok((r.files_written, r.bytes_written)),
            Err(e) => Err(StageError::new(FailureKind::ExtractFailure, e.to_string())),
        }
    }

    /// When nothing in `logs/` looks like a device log, concatenate every
    /// non-empty text file into `merged_logs.log` (with banners) so the
    /// pre-extractor and agent still have a single place to look.
    fn merge_fallback(&self, ws: &Workspace, report: &mut MaterializeReport) -> Result<(), StageError> {
        let logs_dir = ws.logs_dir();
        let files = collect_files(&logs_dir);
        if files.iter().any(|p| looks_like_device_log(p)) {
            return Ok(());
        }

        let merged_path = logs_dir.join("merged_logs.log");
        let mut merged = String::new();
        for path in &files {
            let Ok(content) = std::fs::read_to_string(path) else {
                continue; // binary member, skip
            };
            if content.trim().is_empty() {
                continue;
            }
            let rel = path.strip_prefix(&logs_dir).unwrap_or(path);
            merged.push_str(&format!(
                "\n{}\n=== FILE: {} ===\n{}\n",
                "=".repeat(60),
                rel.display(),
                "=".repeat(60)
            ));
            merged.push_str(&content);
        }
        if merged.is_empty() {
            return Ok(());
        }

        std::fs::write(&merged_path, &merged).map_err(|e| {
            StageError::new(FailureKind::ExtractFailure, format!("merge failed: {}", e))
        })?;
        report.files += 1;
        report
            .notes
            .push("no device-format log found; plain files merged into merged_logs.log".to_string());
        Ok(())
    }
}

/// Heuristic for recognized device logs: a leading ISO-like timestamp within
/// the first couple of KB.
pub fn looks_like_device_log(path: &std::path::Path) -> bool {
    let Ok(content) = std::fs::read(path) else {
        return false;
    };
    let head = String::from_utf8_lossy(&content[..content.len().min(2048)]);
    let re = regex::Regex::new(r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}").expect("static regex");
    re.is_match(&head)
}

/// All regular files under a directory, sorted for determinism.
pub fn collect_files(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::issue::{IssueSource, LogArtifact};
    use std::io::Write;

    fn materializer_with(codec: Codec, resolver: Arc<dyn ArtifactResolver>) -> Materializer {
        Materializer::new(
            codec,
            resolver,
            &MaterializerConfig::default(),
            &LimitsConfig::default(),
        )
    }

    fn issue_with_artifacts(artifacts: Vec<LogArtifact>) -> Issue {
        let mut issue = Issue::new("rec_1", "test", IssueSource::Api);
        issue.log_artifacts = artifacts;
        issue
    }

    fn zip_of(name: &str, data: &[u8]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            writer
                .start_file(name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    /// XOR "encryption" standing in for the real codec in tests.
    fn xor_codec() -> Codec {
        Arc::new(|bytes: &[u8]| Ok(bytes.iter().map(|b| b ^ 0x5a).collect()))
    }

    struct MapResolver(std::collections::HashMap<String, Vec<u8>>);

    #[async_trait]
    impl ArtifactResolver for MapResolver {
        async fn fetch(&self, token: &str) -> AppResult<Vec<u8>> {
            self.0
                .get(token)
                .cloned()
                .ok_or_else(|| crate::utils::error::AppError::not_found(token.to_string()))
        }
    }

    #[tokio::test]
    async fn test_resolve_prefers_local_raw_files() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();
        std::fs::write(ws.raw_dir().join("upload.log"), b"local bytes").unwrap();

        let m = materializer_with(passthrough_codec(), Arc::new(UnconfiguredResolver));
        let issue = issue_with_artifacts(vec![LogArtifact {
            name: "upload.log".into(),
            token: String::new(),
            size: 11,
        }]);

        let resolved = m
            .resolve(&issue, &ws, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "upload.log");
    }

    #[tokio::test]
    async fn test_resolve_fetches_by_token() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();

        let mut map = std::collections::HashMap::new();
        map.insert("tok_1".to_string(), b"fetched".to_vec());
        let m = materializer_with(passthrough_codec(), Arc::new(MapResolver(map)));
        let issue = issue_with_artifacts(vec![LogArtifact {
            name: "device.log".into(),
            token: "tok_1".into(),
            size: 7,
        }]);

        let resolved = m
            .resolve(&issue, &ws, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&resolved[0].path).unwrap(), b"fetched");
    }

    #[tokio::test]
    async fn test_resolve_fails_on_unknown_token() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();

        let m = materializer_with(
            passthrough_codec(),
            Arc::new(MapResolver(Default::default())),
        );
        let issue = issue_with_artifacts(vec![LogArtifact {
            name: "ghost.log".into(),
            token: "tok_missing".into(),
            size: 0,
        }]);

        let err = m
            .resolve(&issue, &ws, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ArtifactFetch);
    }

    #[tokio::test]
    async fn test_decrypt_then_extract_encrypted_zip() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();

        let inner = zip_of("device.log", b"2026-07-01 10:00:00 INFO: boot ok\n");
        let encrypted: Vec<u8> = inner.iter().map(|b| b ^ 0x5a).collect();
        std::fs::write(ws.raw_dir().join("bundle.enc"), &encrypted).unwrap();

        let m = materializer_with(xor_codec(), Arc::new(UnconfiguredResolver));
        let issue = issue_with_artifacts(vec![LogArtifact {
            name: "bundle.enc".into(),
            token: String::new(),
            size: encrypted.len() as u64,
        }]);

        let cancel = CancellationToken::new();
        let resolved = m.resolve(&issue, &ws, &cancel).await.unwrap();
        let report = m
            .decrypt_and_extract(&resolved, &ws, &cancel)
            .await
            .unwrap();
        assert_eq!(report.files, 1);
        assert!(ws.logs_dir().join("device.log").exists());
    }

    #[tokio::test]
    async fn test_codec_rejection_is_decrypt_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();
        std::fs::write(ws.raw_dir().join("bundle.enc"), b"whatever").unwrap();

        let refusing: Codec = Arc::new(|_: &[u8]| Err("not an encrypted bundle".to_string()));
        let m = materializer_with(refusing, Arc::new(UnconfiguredResolver));
        let issue = issue_with_artifacts(vec![LogArtifact {
            name: "bundle.enc".into(),
            token: String::new(),
            size: 8,
        }]);

        let cancel = CancellationToken::new();
        let resolved = m.resolve(&issue, &ws, &cancel).await.unwrap();
        let err = m
            .decrypt_and_extract(&resolved, &ws, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::DecryptFailure);
    }

    #[tokio::test]
    async fn test_plain_log_written_through() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();
        std::fs::write(
            ws.raw_dir().join("app.log"),
            b"2026-07-01 10:00:00 INFO: fine\n",
        )
        .unwrap();

        let m = materializer_with(passthrough_codec(), Arc::new(UnconfiguredResolver));
        let issue = issue_with_artifacts(vec![LogArtifact {
            name: "app.log".into(),
            token: String::new(),
            size: 30,
        }]);

        let cancel = CancellationToken::new();
        let resolved = m.resolve(&issue, &ws, &cancel).await.unwrap();
        let report = m
            .decrypt_and_extract(&resolved, &ws, &cancel)
            .await
            .unwrap();
        assert_eq!(report.files, 1);
        assert!(ws.logs_dir().join("app.log").exists());
        // Recognized device log, so no merge fallback
        assert!(!ws.logs_dir().join("merged_logs.log").exists());
    }

    #[tokio::test]
    async fn test_merge_fallback_for_unrecognized_logs() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();
        std::fs::write(ws.raw_dir().join("notes.log"), b"no timestamps here\n").unwrap();

        let m = materializer_with(passthrough_codec(), Arc::new(UnconfiguredResolver));
        let issue = issue_with_artifacts(vec![LogArtifact {
            name: "notes.log".into(),
            token: String::new(),
            size: 19,
        }]);

        let cancel = CancellationToken::new();
        let resolved = m.resolve(&issue, &ws, &cancel).await.unwrap();
        let report = m
            .decrypt_and_extract(&resolved, &ws, &cancel)
            .await
            .unwrap();
        assert!(ws.logs_dir().join("merged_logs.log").exists());
        assert!(!report.notes.is_empty());
    }

    #[tokio::test]
    async fn test_no_artifacts_is_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();
        let m = materializer_with(passthrough_codec(), Arc::new(UnconfiguredResolver));
        let issue = issue_with_artifacts(vec![]);

        let err = m
            .resolve(&issue, &ws, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ArtifactFetch);
    }

    #[tokio::test]
    async fn test_cancelled_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();
        let m = materializer_with(passthrough_codec(), Arc::new(UnconfiguredResolver));
        let issue = issue_with_artifacts(vec![LogArtifact {
            name: "a.log".into(),
            token: "tok".into(),
            size: 0,
        }]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = m.resolve(&issue, &ws, &cancel).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Cancelled);
    }
}
