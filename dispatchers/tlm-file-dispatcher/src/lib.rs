use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tlm_core::{Event, ExportError, Exporter};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use tracing::{debug, info, warn};

/// Appends every event as one JSON object per line.
///
/// The file is opened lazily on the first export and reopened after a write
/// error. Writes are buffered until [`Exporter::flush`].
#[derive(Deserialize, Debug)]
pub struct FileDispatcher {
    id: String,
    path: PathBuf,
    #[serde(skip)]
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileDispatcher {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<BufWriter<File>, ExportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        info!("{} appends to {}", self.id, self.path.display());
        Ok(BufWriter::new(file))
    }
}

#[async_trait]
impl Exporter for FileDispatcher {
    fn id(&self) -> &str {
        &self.id
    }

    async fn export(&self, event: &Event) -> Result<(), ExportError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(self.open().await?);
        }
        let Some(file) = writer.as_mut() else {
            return Err(ExportError::Unavailable(format!("{} is not open", self.id)));
        };
        if let Err(e) = file.write_all(&line).await {
            warn!("{} failed to write, reopening on next export, {e}", self.id);
            *writer = None;
            return Err(e.into());
        }
        debug!("event {} is written to {}", event.id(), self.path.display());
        Ok(())
    }

    async fn flush(&self) -> Result<(), ExportError> {
        if let Some(file) = self.writer.lock().await.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}
