//! Download bridge: HTTP transfers to files on disk.
//!
//! Each transfer streams into a temporary file next to its destination while
//! computing the MD5 of the bytes, then renames into place. Completion is
//! posted whether the transfer succeeded or not; completion events wait for
//! queue capacity and are never dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{lock, next_operation_id, BridgeError, EventSink, ScriptEvent};

const MODULE: &str = "downloader";

struct DownloadEntry {
    id: u64,
    callback: String,
    task: JoinHandle<()>,
}

/// Download bridge for one host.
#[derive(Clone)]
pub struct DownloadBridge {
    downloads: Arc<Mutex<HashMap<String, DownloadEntry>>>,
    sink: EventSink,
    http: reqwest::Client,
}

impl DownloadBridge {
    pub fn new(sink: EventSink, http: reqwest::Client) -> Self {
        Self {
            downloads: Arc::new(Mutex::new(HashMap::new())),
            sink,
            http,
        }
    }

    /// Start a transfer of `url` into `dest`.
    ///
    /// A second fetch under a tag that is still in flight is rejected.
    pub fn fetch(
        &self,
        tag: &str,
        url: &str,
        dest: PathBuf,
        callback: &str,
    ) -> Result<(), BridgeError> {
        if url.is_empty() {
            return Err(BridgeError::InvalidArgument {
                module: MODULE,
                reason: "url must not be empty".to_string(),
            });
        }

        let mut downloads = lock(&self.downloads);
        if downloads.contains_key(tag) {
            return Err(BridgeError::DuplicateTag {
                module: MODULE,
                tag: tag.to_string(),
            });
        }

        let id = next_operation_id();
        let task = tokio::spawn({
            let sink = self.sink.clone();
            let http = self.http.clone();
            let tag = tag.to_string();
            let url = url.to_string();
            async move {
                let result = download_to(&http, &url, &dest).await;
                let (md5, error) = match result {
                    Ok(md5) => (Some(md5), None),
                    Err(e) => {
                        warn!(tag = %tag, url = %url, error = %e, "Download failed");
                        (None, Some(e))
                    }
                };

                let delivered = sink
                    .post(ScriptEvent::Download {
                        tag: tag.clone(),
                        id,
                        file_path: dest,
                        md5,
                        error,
                    })
                    .await;
                if !delivered {
                    debug!(tag = %tag, "Event queue closed, download completion discarded");
                }
            }
        });

        downloads.insert(
            tag.to_string(),
            DownloadEntry {
                id,
                callback: callback.to_string(),
                task,
            },
        );
        Ok(())
    }

    /// Abort an in-flight transfer. No completion is delivered for it.
    pub fn cancel(&self, tag: &str) -> bool {
        match lock(&self.downloads).remove(tag) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn has(&self, tag: &str) -> bool {
        lock(&self.downloads).contains_key(tag)
    }

    /// Retire a drained completion, returning the callback to invoke.
    pub fn on_drained(&self, tag: &str, id: u64) -> Option<String> {
        let mut downloads = lock(&self.downloads);
        match downloads.get(tag) {
            Some(entry) if entry.id == id => downloads.remove(tag).map(|e| e.callback),
            _ => None,
        }
    }

    pub fn clear(&self) {
        for (_, entry) in lock(&self.downloads).drain() {
            entry.task.abort();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.downloads).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stream `url` into `dest`, returning the hex MD5 of the body.
async fn download_to(http: &reqwest::Client, url: &str, dest: &Path) -> Result<String, String> {
    let mut response = http.get(url).send().await.map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("unexpected status {}", response.status()));
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("create {}: {}", parent.display(), e))?;
    }

    let temp_path = temp_path_for(dest);
    let result = async {
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| format!("create {}: {}", temp_path.display(), e))?;
        let mut hasher = Md5::new();

        while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
        }
        file.flush().await.map_err(|e| e.to_string())?;
        drop(file);

        tokio::fs::rename(&temp_path, dest)
            .await
            .map_err(|e| format!("rename into {}: {}", dest.display(), e))?;
        Ok(hex::encode(hasher.finalize()))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::Envelope;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bridge() -> (DownloadBridge, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(4);
        (
            DownloadBridge::new(EventSink::new(tx, 1), reqwest::Client::new()),
            rx,
        )
    }

    #[tokio::test]
    async fn test_download_reports_md5_and_retires_on_drain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("blob.bin");
        let (downloads, mut rx) = bridge();

        downloads
            .fetch("d1", &format!("{}/blob", server.uri()), dest.clone(), "on_done")
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        let ScriptEvent::Download {
            tag,
            id,
            file_path,
            md5,
            error,
        } = envelope.event
        else {
            panic!("expected download event");
        };

        assert_eq!(file_path, dest);
        assert_eq!(md5.as_deref(), Some("0cc175b9c0f1b6a831c399e269772661"));
        assert_eq!(error, None);
        assert_eq!(std::fs::read(&dest).unwrap(), b"a");

        assert!(downloads.has("d1"), "entry stays until drained");
        assert_eq!(downloads.on_drained(&tag, id).as_deref(), Some("on_done"));
        assert!(!downloads.has("d1"));
        assert_eq!(downloads.on_drained(&tag, id), None);
    }

    #[tokio::test]
    async fn test_failed_download_still_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.bin");
        let (downloads, mut rx) = bridge();

        downloads
            .fetch("d1", &format!("{}/missing", server.uri()), dest.clone(), "on_done")
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        let ScriptEvent::Download { md5, error, .. } = envelope.event else {
            panic!("expected download event");
        };
        assert_eq!(md5, None);
        assert!(error.unwrap().contains("404"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_tag_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (downloads, _rx) = bridge();
        let url = format!("{}/slow", server.uri());

        downloads
            .fetch("d1", &url, dir.path().join("a"), "on_done")
            .unwrap();
        let err = downloads
            .fetch("d1", &url, dir.path().join("b"), "on_done")
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateTag { .. }));

        assert!(downloads.cancel("d1"));
        assert!(downloads.is_empty());
    }
}
