//! src/services/local_endpoint.rs
//!
//! LocalEndpoint: an endpoint agent that serves stores mounted on the local
//! filesystem. Each store's URL is its root directory. Templates are laid out
//! as `template/tmpl/{account}/{template}/{unique_name}` next to a
//! `template.json` manifest recording the expected size and md5, which is
//! what lets a listing flag corrupted payloads.

use crate::{
    errors::{OrchestratorError, OrchestratorResult},
    models::{association::InstallInfo, store::DataStore},
    services::endpoint::{
        Answer, AnswerPayload, Command, EndpointGateway, InstallTemplateCommand,
        PrimaryStorageDownloadCommand, TEMPLATE_ROOT, TemplateProp, template_dir,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MANIFEST_NAME: &str = "template.json";
const MAX_INSTALL_PATH_LEN: usize = 1024;

/// Sidecar written next to every installed payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct TemplateManifest {
    template_id: i64,
    unique_name: String,
    filename: String,
    size: i64,
    physical_size: i64,
    checksum: String,
}

#[derive(Clone, Default)]
pub struct LocalEndpoint {
    /// Re-hash every payload during listings instead of only checking lengths.
    verify_checksums: bool,

    /// One lock per target store for commands that must run in sequence.
    sequence_locks: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LocalEndpoint {
    pub fn new(verify_checksums: bool) -> Self {
        Self {
            verify_checksums,
            sequence_locks: Arc::default(),
        }
    }

    /// Resolve the root directory of `store`. A missing root means the
    /// endpoint cannot reach the store at all.
    async fn store_root(&self, store: &DataStore) -> OrchestratorResult<PathBuf> {
        let root = PathBuf::from(&store.url);
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(root),
            Ok(_) => Err(OrchestratorError::EndpointUnreachable {
                store: store.id,
                reason: format!("{} is not a directory", root.display()),
            }),
            Err(err) => Err(OrchestratorError::EndpointUnreachable {
                store: store.id,
                reason: format!("{}: {}", root.display(), err),
            }),
        }
    }

    fn sequence_lock(&self, target: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .sequence_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(target).or_default().clone()
    }

    /// Walk every manifest under the template root.
    async fn list_templates(&self, root: &Path) -> io::Result<HashMap<String, TemplateProp>> {
        let mut templates = HashMap::new();
        let base = root.join(TEMPLATE_ROOT);

        let mut accounts = match fs::read_dir(&base).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(templates),
            Err(err) => return Err(err),
        };
        while let Some(account) = accounts.next_entry().await? {
            if !account.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(account.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let dir = entry.path();
                let manifest_path = dir.join(MANIFEST_NAME);
                let raw = match fs::read(&manifest_path).await {
                    Ok(raw) => raw,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(err),
                };
                let manifest: TemplateManifest = match serde_json::from_slice(&raw) {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        warn!("skipping unreadable manifest {}: {}", manifest_path.display(), err);
                        continue;
                    }
                };
                let prop = self.inspect(root, &dir, manifest).await?;
                templates.insert(prop.unique_name.clone(), prop);
            }
        }

        Ok(templates)
    }

    /// Compare a payload on disk against its manifest.
    async fn inspect(
        &self,
        root: &Path,
        dir: &Path,
        manifest: TemplateManifest,
    ) -> io::Result<TemplateProp> {
        let payload = dir.join(&manifest.filename);
        let corrupted = match fs::metadata(&payload).await {
            Ok(meta) if meta.len() as i64 != manifest.size => true,
            Ok(_) if self.verify_checksums => checksum(&payload).await? != manifest.checksum,
            Ok(_) => false,
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(err) => return Err(err),
        };
        if corrupted {
            debug!("payload {} does not match its manifest", payload.display());
        }

        Ok(TemplateProp {
            template_id: Some(manifest.template_id),
            unique_name: manifest.unique_name,
            install_path: relative_to(root, &payload),
            size: manifest.size,
            physical_size: manifest.physical_size,
            corrupted,
        })
    }

    async fn install(&self, root: &Path, cmd: &InstallTemplateCommand) -> Result<InstallInfo, String> {
        ensure_path_safe(&cmd.unique_name)?;
        if cmd.unique_name.contains('/') {
            return Err(format!("invalid unique name `{}`", cmd.unique_name));
        }
        let source = resolve_source(&cmd.source)?;
        let install_path = format!(
            "{}{}",
            template_dir(cmd.account_id, cmd.template_id),
            cmd.unique_name
        );
        let payload = root.join(&install_path);

        let (size, checksum) = copy_payload(&source, &payload)
            .await
            .map_err(|err| format!("failed to install {} from {}: {}", cmd.unique_name, cmd.source, err))?;

        let manifest = TemplateManifest {
            template_id: cmd.template_id,
            unique_name: cmd.unique_name.clone(),
            filename: cmd.unique_name.clone(),
            size,
            physical_size: size,
            checksum,
        };
        let manifest_path = payload.with_file_name(MANIFEST_NAME);
        let body = serde_json::to_vec_pretty(&manifest).map_err(|err| err.to_string())?;
        fs::write(&manifest_path, body)
            .await
            .map_err(|err| format!("failed to write {}: {}", manifest_path.display(), err))?;

        info!("installed {} at {}", cmd.unique_name, install_path);
        Ok(InstallInfo {
            install_path,
            size,
            physical_size: size,
        })
    }

    /// Remove a template directory and prune the parents it leaves empty.
    ///
    /// `install_path` names either a payload, whose directory is removed, or
    /// a directory when it ends in `/`. Deleting something already gone
    /// succeeds.
    async fn delete(&self, root: &Path, install_path: &str) -> Result<(), String> {
        ensure_path_safe(install_path)?;
        let path = root.join(install_path.trim_end_matches('/'));
        let target = if install_path.ends_with('/') {
            path
        } else {
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => path,
                _ => path.parent().map(Path::to_path_buf).unwrap_or(path),
            }
        };
        if target == root || !target.starts_with(root) {
            return Err(format!("refusing to delete store root for `{}`", install_path));
        }

        match fs::remove_dir_all(&target).await {
            Ok(_) => debug!("removed template directory {}", target.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("template directory {} already missing", target.display());
            }
            Err(err) => return Err(format!("failed to remove {}: {}", target.display(), err)),
        }

        if let Some(parent) = target.parent() {
            prune_empty_dirs(parent, root).await;
        }
        Ok(())
    }

    async fn primary_download(
        &self,
        root: &Path,
        cmd: &PrimaryStorageDownloadCommand,
    ) -> Result<InstallInfo, String> {
        ensure_path_safe(&cmd.local_path)?;
        let source = resolve_source(&cmd.url)?;
        let (size, _) = copy_payload(&source, &root.join(&cmd.local_path))
            .await
            .map_err(|err| {
                format!(
                    "failed to stage {} onto pool {}: {}",
                    cmd.url, cmd.pool_uuid, err
                )
            })?;

        Ok(InstallInfo {
            install_path: cmd.local_path.clone(),
            size,
            physical_size: size,
        })
    }
}

#[async_trait]
impl EndpointGateway for LocalEndpoint {
    async fn send(&self, store: &DataStore, command: Command) -> OrchestratorResult<Answer> {
        let root = self.store_root(store).await?;

        let lock = command
            .execute_in_sequence()
            .then(|| self.sequence_lock(store.id));
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let answer = match command {
            Command::ListTemplates => {
                let templates = self.list_templates(&root).await.map_err(|err| {
                    OrchestratorError::EndpointUnreachable {
                        store: store.id,
                        reason: err.to_string(),
                    }
                })?;
                Answer::success(AnswerPayload::Templates(templates))
            }
            Command::InstallTemplate(cmd) => match self.install(&root, &cmd).await {
                Ok(info) => Answer::success(AnswerPayload::Installed(info)),
                Err(msg) => Answer::failure(msg),
            },
            Command::DeleteTemplate { install_path } => {
                match self.delete(&root, &install_path).await {
                    Ok(()) => Answer::success(AnswerPayload::None),
                    Err(msg) => Answer::failure(msg),
                }
            }
            Command::PrimaryStorageDownload(cmd) => {
                match self.primary_download(&root, &cmd).await {
                    Ok(info) => Answer::success(AnswerPayload::Installed(info)),
                    Err(msg) => Answer::failure(msg),
                }
            }
        };

        Ok(answer)
    }
}

/// Reject paths that could escape the store root.
fn ensure_path_safe(path: &str) -> Result<(), String> {
    if path.is_empty() || path.len() > MAX_INSTALL_PATH_LEN {
        return Err(format!("invalid path `{}`", path));
    }
    if path.starts_with('/') || path.contains("..") {
        return Err(format!("path `{}` escapes the store root", path));
    }
    if path
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(format!("invalid path `{}`", path));
    }
    Ok(())
}

/// Map a source URL onto a local path. Only `file://` URLs and plain paths are served.
fn resolve_source(source: &str) -> Result<PathBuf, String> {
    if let Some(path) = source.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if let Some((scheme, _)) = source.split_once("://") {
        return Err(format!("unsupported url scheme `{}` in {}", scheme, source));
    }
    Ok(PathBuf::from(source))
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

async fn copy_payload(source: &Path, dest: &Path) -> io::Result<(i64, String)> {
    let file = File::open(source).await?;
    write_stream(ReaderStream::new(file), dest).await
}

/// Stream bytes into `dest`.
///
/// - Writes into a temporary sibling file.
/// - Computes size and md5 while streaming.
/// - fsyncs, then renames into place.
///
/// The temporary file is removed on any error.
async fn write_stream<S>(stream: S, dest: &Path) -> io::Result<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
        io::Error::new(ErrorKind::Other, "payload path missing parent directory")
    })?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = File::create(&tmp_path).await?;

    let mut size: i64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk_res) = stream.next().await {
        let chunk = match chunk_res {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        size += chunk.len() as i64;
        digest.consume(&chunk);
        if let Err(err) = file.write_all(&chunk).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
    }
    if let Err(err) = file.flush().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    if let Err(err) = file.sync_all().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&tmp_path, dest).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(dest).await?;
            fs::rename(&tmp_path, dest).await?;
        } else {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
    }

    Ok((size, format!("{:x}", digest.compute())))
}

async fn checksum(path: &Path) -> io::Result<String> {
    let mut stream = ReaderStream::new(File::open(path).await?);
    let mut digest = Context::new();
    while let Some(chunk) = stream.next().await {
        digest.consume(&chunk?);
    }
    Ok(format!("{:x}", digest.compute()))
}

/// Recursively remove empty directories up to (not including) `stop`.
///
/// Stops when:
/// - directory not empty
/// - directory not found
/// - reached root
/// - encountered unexpected I/O errors
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::store::StoreRole;
    use tempfile::TempDir;

    fn store_at(dir: &Path) -> DataStore {
        DataStore {
            id: 1,
            uuid: Uuid::new_v4(),
            name: "local".into(),
            zone_id: Some(1),
            role: StoreRole::Image,
            url: dir.to_string_lossy().into_owned(),
        }
    }

    async fn source_file(dir: &Path, name: &str, body: &[u8]) -> String {
        let path = dir.join(name);
        fs::write(&path, body).await.unwrap();
        format!("file://{}", path.display())
    }

    fn install_cmd(source: String, id: i64, name: &str) -> Command {
        Command::InstallTemplate(InstallTemplateCommand {
            source,
            template_id: id,
            account_id: 2,
            unique_name: name.into(),
        })
    }

    async fn listing(endpoint: &LocalEndpoint, store: &DataStore) -> HashMap<String, TemplateProp> {
        match endpoint.send(store, Command::ListTemplates).await.unwrap().payload {
            AnswerPayload::Templates(t) => t,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn install_then_list() {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let store = store_at(root.path());
        let endpoint = LocalEndpoint::new(true);

        let src = source_file(sources.path(), "img", b"disk-bytes").await;
        let answer = endpoint.send(&store, install_cmd(src, 7, "tmpl-7")).await.unwrap();
        assert!(answer.result);
        let AnswerPayload::Installed(info) = answer.payload else {
            panic!("expected install info");
        };
        assert_eq!(info.install_path, "template/tmpl/2/7/tmpl-7");
        assert_eq!(info.size, 10);

        let templates = listing(&endpoint, &store).await;
        let prop = &templates["tmpl-7"];
        assert_eq!(prop.template_id, Some(7));
        assert_eq!(prop.install_path, "template/tmpl/2/7/tmpl-7");
        assert!(!prop.corrupted);
    }

    #[tokio::test]
    async fn truncated_payload_is_corrupted() {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let store = store_at(root.path());
        let endpoint = LocalEndpoint::new(false);

        let src = source_file(sources.path(), "img", b"0123456789").await;
        endpoint.send(&store, install_cmd(src, 4, "tmpl-4")).await.unwrap();
        fs::write(root.path().join("template/tmpl/2/4/tmpl-4"), b"0123")
            .await
            .unwrap();

        assert!(listing(&endpoint, &store).await["tmpl-4"].corrupted);
    }

    #[tokio::test]
    async fn checksum_mismatch_needs_verification() {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let store = store_at(root.path());

        let src = source_file(sources.path(), "img", b"aaaa").await;
        LocalEndpoint::new(false)
            .send(&store, install_cmd(src, 5, "tmpl-5"))
            .await
            .unwrap();
        fs::write(root.path().join("template/tmpl/2/5/tmpl-5"), b"bbbb")
            .await
            .unwrap();

        assert!(!listing(&LocalEndpoint::new(false), &store).await["tmpl-5"].corrupted);
        assert!(listing(&LocalEndpoint::new(true), &store).await["tmpl-5"].corrupted);
    }

    #[tokio::test]
    async fn delete_removes_directory_and_prunes_parents() {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let store = store_at(root.path());
        let endpoint = LocalEndpoint::new(false);

        let src = source_file(sources.path(), "img", b"x").await;
        endpoint.send(&store, install_cmd(src, 3, "tmpl-3")).await.unwrap();

        let answer = endpoint
            .send(
                &store,
                Command::DeleteTemplate {
                    install_path: "template/tmpl/2/3/tmpl-3".into(),
                },
            )
            .await
            .unwrap();
        assert!(answer.result);
        assert!(listing(&endpoint, &store).await.is_empty());
        assert!(!root.path().join("template").exists());

        // deleting again is not an error
        let again = endpoint
            .send(
                &store,
                Command::DeleteTemplate {
                    install_path: "template/tmpl/2/3/tmpl-3".into(),
                },
            )
            .await
            .unwrap();
        assert!(again.result);
    }

    #[tokio::test]
    async fn delete_rejects_escaping_paths() {
        let root = TempDir::new().unwrap();
        let store = store_at(root.path());
        let answer = LocalEndpoint::new(false)
            .send(
                &store,
                Command::DeleteTemplate {
                    install_path: "../etc".into(),
                },
            )
            .await
            .unwrap();
        assert!(!answer.result);
    }

    #[tokio::test]
    async fn missing_root_is_unreachable() {
        let root = TempDir::new().unwrap();
        let store = store_at(&root.path().join("absent"));
        let err = LocalEndpoint::new(false)
            .send(&store, Command::ListTemplates)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EndpointUnreachable { store: 1, .. }));
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_the_command() {
        let root = TempDir::new().unwrap();
        let store = store_at(root.path());
        let answer = LocalEndpoint::new(false)
            .send(
                &store,
                install_cmd("http://mirror/tmpl.qcow2".into(), 9, "tmpl-9"),
            )
            .await
            .unwrap();
        assert!(!answer.result);
        assert!(answer.details.unwrap().contains("unsupported url scheme"));
    }

    #[tokio::test]
    async fn primary_download_stages_payload() {
        let pool = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let mut store = store_at(pool.path());
        store.role = StoreRole::Primary;
        let src = source_file(sources.path(), "img", b"staged").await;

        let answer = LocalEndpoint::new(false)
            .send(
                &store,
                Command::PrimaryStorageDownload(PrimaryStorageDownloadCommand {
                    url: src,
                    pool_id: store.id,
                    pool_uuid: store.uuid.to_string(),
                    local_path: "tmpl-9".into(),
                    secondary_storage_url: sources.path().to_string_lossy().into_owned(),
                }),
            )
            .await
            .unwrap();
        assert!(answer.result);
        assert_eq!(fs::read(pool.path().join("tmpl-9")).await.unwrap(), b"staged");
    }

    #[tokio::test]
    async fn deleting_missing_template_dir_keeps_account_siblings() {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let store = store_at(root.path());
        let endpoint = LocalEndpoint::new(false);

        let src = source_file(sources.path(), "img", b"x").await;
        endpoint.send(&store, install_cmd(src, 3, "tmpl-3")).await.unwrap();

        let answer = endpoint
            .send(
                &store,
                Command::DeleteTemplate {
                    install_path: "template/tmpl/2/7/".into(),
                },
            )
            .await
            .unwrap();
        assert!(answer.result);
        assert!(listing(&endpoint, &store).await.contains_key("tmpl-3"));
    }

    #[tokio::test]
    async fn primary_downloads_to_one_pool_run_in_sequence() {
        let pool = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let mut store = store_at(pool.path());
        store.role = StoreRole::Primary;
        let src = source_file(sources.path(), "img", b"payload").await;
        let endpoint = LocalEndpoint::new(false);

        let lock = endpoint.sequence_lock(store.id);
        let held = lock.lock().await;
        let pending = tokio::spawn({
            let endpoint = endpoint.clone();
            let store = store.clone();
            async move {
                let cmd = Command::PrimaryStorageDownload(PrimaryStorageDownloadCommand {
                    url: src,
                    pool_id: store.id,
                    pool_uuid: store.uuid.to_string(),
                    local_path: "staged".into(),
                    secondary_storage_url: String::new(),
                });
                endpoint.send(&store, cmd).await
            }
        });

        // Listings never queue behind a download.
        assert!(endpoint.send(&store, Command::ListTemplates).await.unwrap().result);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert!(!pool.path().join("staged").exists());

        drop(held);
        let answer = pending.await.unwrap().unwrap();
        assert!(answer.result);
        assert_eq!(fs::read(pool.path().join("staged")).await.unwrap(), b"payload");
    }
}
