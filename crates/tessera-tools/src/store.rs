use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::FileStore;
use tessera_core::types::{FileRef, NewFile};

/// Content-addressed file store on the local disk.
///
/// Files land under `<root>/<run_id>/<sha256>/<filename>`.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileStore for LocalFileStore {
    fn put(&self, file: NewFile) -> BoxFuture<'_, Result<FileRef>> {
        Box::pin(async move {
            let sha256 = format!("{:x}", Sha256::digest(&file.data));
            let filename = sanitize_filename(&file.filename);
            let dir = self.root.join(&file.run_id.0).join(&sha256);
            tokio::fs::create_dir_all(&dir).await?;

            let path = dir.join(&filename);
            tokio::fs::write(&path, &file.data).await?;
            debug!(path = %path.display(), bytes = file.data.len(), "Stored file");

            let media_type = file.media_type.unwrap_or_else(|| {
                mime_guess::from_path(&filename)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });

            Ok(FileRef {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: file.run_id,
                node_id: file.node_id,
                kind: file.kind,
                uri: format!("file://{}", path.display()),
                filename,
                media_type,
                bytes: file.data.len() as u64,
                sha256,
                created_at: Utc::now(),
                metadata: file.metadata,
            })
        })
    }

    fn read(&self, file: &FileRef) -> BoxFuture<'_, Result<Vec<u8>>> {
        let uri = file.uri.clone();
        Box::pin(async move {
            let path = uri.strip_prefix("file://").ok_or_else(|| {
                TesseraError::InvalidInput(format!("not a local file uri: {}", uri))
            })?;
            Ok(tokio::fs::read(path).await?)
        })
    }
}

/// Keep only the last path component, so a filename cannot escape its directory.
fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}
