//! File-based inbound polling and outbound writing (§4.1, §6.1). The
//! inbound side never emits a reply -- a file drop has no peer to ACK.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AdapterError;

use super::{expand_filename_template, FrameHandler, FrameMeta, InboundAdapter, OutboundAdapter, OutboundFrame};

#[derive(Debug, Clone)]
pub struct FileInboundConfig {
    pub work_path: PathBuf,
    pub file_spec: String,
    pub archive_path: Option<PathBuf>,
    pub error_path: PathBuf,
    pub poll_interval: Duration,
}

pub struct FileInbound {
    config: FileInboundConfig,
}

impl FileInbound {
    pub fn new(config: FileInboundConfig) -> Self {
        Self { config }
    }

    async fn poll_once(&self, handler: &Arc<dyn FrameHandler>) {
        let pattern = self.config.work_path.join(&self.config.file_spec);
        let pattern = pattern.to_string_lossy().to_string();
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = match glob::glob(&pattern) {
            Ok(paths) => paths
                .filter_map(|p| p.ok())
                .filter_map(|p| {
                    let modified = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                    Some((p, modified))
                })
                .collect(),
            Err(e) => {
                warn!(pattern, error = %e, "invalid file_spec glob pattern");
                return;
            }
        };
        entries.sort_by_key(|(_, modified)| *modified);

        for (path, _) in entries {
            self.process_one(&path, handler).await;
        }
    }

    async fn process_one(&self, path: &Path, handler: &Arc<dyn FrameHandler>) {
        let filename = path.file_name().map(|f| f.to_string_lossy().to_string());
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read dropped file");
                return;
            }
        };

        let meta = FrameMeta {
            remote_addr: None,
            filename: filename.clone(),
        };
        let outcome = handler.handle_frame(raw, meta).await;

        let destination = match outcome {
            Ok(_reply) => self.config.archive_path.clone(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file handler error, moving to error_path");
                Some(self.config.error_path.clone())
            }
        };

        if let Some(dest_dir) = destination {
            if let Some(name) = filename {
                let dest = dest_dir.join(name);
                if let Err(e) = tokio::fs::rename(path, &dest).await {
                    warn!(path = %path.display(), dest = %dest.display(), error = %e, "failed to move processed file");
                }
            }
        } else if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove processed file with no archive_path");
        }
    }
}

#[async_trait]
impl InboundAdapter for FileInbound {
    async fn start(&self, cancel: CancellationToken, handler: Arc<dyn FrameHandler>) -> Result<(), AdapterError> {
        debug!(work_path = %self.config.work_path.display(), "file inbound polling");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once(&handler).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileOutboundConfig {
    pub file_path: PathBuf,
    pub filename_template: String,
    pub overwrite: bool,
}

pub struct FileOutbound {
    config: FileOutboundConfig,
}

impl FileOutbound {
    pub fn new(config: FileOutboundConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl OutboundAdapter for FileOutbound {
    async fn send(&self, frame: OutboundFrame) -> Result<Vec<u8>, AdapterError> {
        let filename = expand_filename_template(&self.config.filename_template, &frame.message_type, &frame.id);
        let dest = self.config.file_path.join(&filename);

        if !self.config.overwrite && tokio::fs::metadata(&dest).await.is_ok() {
            return Err(AdapterError::Permanent(format!("{} already exists and overwrite=false", dest.display())));
        }

        let tmp = self.config.file_path.join(format!(".{filename}.tmp"));
        tokio::fs::write(&tmp, &frame.raw)
            .await
            .map_err(|e| AdapterError::Transient(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| AdapterError::Transient(format!("rename {} -> {}: {e}", tmp.display(), dest.display())))?;

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl FrameHandler for EchoHandler {
        async fn handle_frame(&self, _raw: Vec<u8>, _meta: FrameMeta) -> Result<Vec<u8>, AdapterError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn inbound_moves_file_to_archive_after_handling() {
        let dir = tempdir();
        let work = dir.join("work");
        let archive = dir.join("archive");
        let error = dir.join("error");
        tokio::fs::create_dir_all(&work).await.unwrap();
        tokio::fs::create_dir_all(&archive).await.unwrap();
        tokio::fs::create_dir_all(&error).await.unwrap();
        tokio::fs::write(work.join("msg1.hl7"), b"MSH|^~\\&|A|B|C|D|20260101||ADT^A01|1|P|2.4\r")
            .await
            .unwrap();

        let inbound = FileInbound::new(FileInboundConfig {
            work_path: work.clone(),
            file_spec: "*.hl7".into(),
            archive_path: Some(archive.clone()),
            error_path: error,
            poll_interval: Duration::from_millis(10),
        });
        inbound.poll_once(&(Arc::new(EchoHandler) as Arc<dyn FrameHandler>)).await;

        assert!(tokio::fs::metadata(archive.join("msg1.hl7")).await.is_ok());
        assert!(tokio::fs::metadata(work.join("msg1.hl7")).await.is_err());
    }

    #[tokio::test]
    async fn outbound_expands_template_and_writes_file() {
        let dir = tempdir();
        let outbound = FileOutbound::new(FileOutboundConfig {
            file_path: dir.clone(),
            filename_template: "%type%-%id%.hl7".into(),
            overwrite: false,
        });
        outbound
            .send(OutboundFrame {
                raw: b"MSH|...".to_vec(),
                message_type: "ADT_A01".into(),
                id: "abc".into(),
            })
            .await
            .unwrap();
        let written = tokio::fs::read(dir.join("ADT_A01-abc.hl7")).await.unwrap();
        assert_eq!(written, b"MSH|...");
    }

    #[tokio::test]
    async fn outbound_rejects_existing_file_without_overwrite() {
        let dir = tempdir();
        tokio::fs::write(dir.join("ADT_A01-abc.hl7"), b"old").await.unwrap();
        let outbound = FileOutbound::new(FileOutboundConfig {
            file_path: dir.clone(),
            filename_template: "%type%-%id%.hl7".into(),
            overwrite: false,
        });
        let err = outbound
            .send(OutboundFrame {
                raw: b"new".to_vec(),
                message_type: "ADT_A01".into(),
                id: "abc".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)));
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hie-core-file-adapter-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
