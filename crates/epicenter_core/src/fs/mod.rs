//! POSIX-flavored virtual filesystem over the workspace `files` table.
//!
//! File metadata lives as rows of a flat table (one row per file or folder,
//! keyed by a stable id); file content lives in per-file content documents
//! materialized through the [`ContentDocPool`]. Paths are a *derived* notion:
//! an in-memory index maps `path -> id` and `parent -> children` over the
//! active (non-trashed) rows and is updated incrementally from table change
//! events.
//!
//! Because identity is the row id, `mv` is a pure metadata write (rename +
//! reparent) that never touches content, and a rename of a folder implicitly
//! moves every descendant path.
//!
//! All failures surface as [`FsError`] `{ code, path }` with a POSIX-style
//! code. Reads of metadata are synchronous; content reads/writes and
//! structural operations may suspend (they await pool providers).

mod events;
mod index;
pub mod path;

pub use events::FsEvent;

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::content::{ContentDocPool, ContentKind};
use crate::error::{EpicenterError, FsError, FsErrorCode};
use crate::kv::ObserverHandle;
use crate::schema::{RowRecord, TypedSchema};
use crate::table::{GetResult, TableHelper};
use crate::workspace::{BoxFuture, WorkspaceClient};

use events::EventRegistry;
use index::FsIndex;

/// Table name holding file metadata rows.
pub const FILES_TABLE: &str = "files";

/// Result alias for filesystem operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Schema of the `files` table.
pub type FilesSchema = TypedSchema<FileRow>;

/// Whether a row is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Regular file with a content document
    File,
    /// Folder; purely structural, no content document
    Folder,
}

/// One metadata row of the `files` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRow {
    /// Globally unique, stable file id (also the content document guid)
    pub id: String,
    /// Name within the parent folder
    pub name: String,
    /// Parent folder id; `None` means the implicit root
    pub parent_id: Option<String>,
    /// File or folder
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Byte length of the current content version (0 for folders)
    pub size: u64,
    /// Creation time, unix millis
    pub created_at: i64,
    /// Last metadata/content touch, unix millis
    pub updated_at: i64,
    /// Soft-delete marker; `Some` rows are in the trash
    pub trashed_at: Option<i64>,
}

impl RowRecord for FileRow {
    fn row_id(&self) -> &str {
        &self.id
    }
}

impl FileRow {
    /// Whether the row is live (not in the trash).
    pub fn is_active(&self) -> bool {
        self.trashed_at.is_none()
    }

    /// Whether the row is a folder.
    pub fn is_folder(&self) -> bool {
        self.kind == FileKind::Folder
    }
}

/// Data accepted by the write paths.
#[derive(Debug, Clone)]
pub enum FileContent {
    /// UTF-8 text; stored as a collaborative text version
    Text(String),
    /// Opaque bytes; stored as an atomic binary version
    Bytes(Vec<u8>),
}

impl From<&str> for FileContent {
    fn from(s: &str) -> Self {
        FileContent::Text(s.to_string())
    }
}

impl From<String> for FileContent {
    fn from(s: String) -> Self {
        FileContent::Text(s)
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(b: Vec<u8>) -> Self {
        FileContent::Bytes(b)
    }
}

impl From<&[u8]> for FileContent {
    fn from(b: &[u8]) -> Self {
        FileContent::Bytes(b.to_vec())
    }
}

/// Stat result. The root directory is synthetic: it has no row, epoch
/// timestamps, and mode `0o755`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStat {
    /// File id; `None` for the root
    pub id: Option<String>,
    /// Name within the parent folder; empty for the root
    pub name: String,
    /// File or folder
    pub kind: FileKind,
    /// Byte length of the current content version
    pub size: u64,
    /// Last modification, unix millis
    pub mtime: i64,
    /// Creation, unix millis
    pub ctime: i64,
    /// POSIX-style mode bits (no-op permissions)
    pub mode: u32,
}

impl FileStat {
    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Folder
    }
}

/// A directory listing entry with type information.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    /// Display name (disambiguated on sibling collisions)
    pub name: String,
    /// File id
    pub id: String,
    /// File or folder
    pub kind: FileKind,
}

/// Options for [`FileSystem::mkdir`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MkdirOptions {
    /// Create missing ancestors
    pub recursive: bool,
}

/// Options for [`FileSystem::rm`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RmOptions {
    /// Delete folder subtrees
    pub recursive: bool,
    /// Suppress `ENOENT` for missing paths
    pub force: bool,
}

/// Options for [`FileSystem::cp`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpOptions {
    /// Copy folder subtrees
    pub recursive: bool,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Reject names that cannot live in a folder.
fn validate_name(name: &str, at: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::new(FsErrorCode::EINVAL, at));
    }
    Ok(())
}

/// The collaborative virtual filesystem.
pub struct FileSystem {
    files: TableHelper<FilesSchema>,
    pool: Arc<ContentDocPool>,
    fs_index: Arc<RwLock<FsIndex>>,
    events: Arc<EventRegistry>,
    cwd: RwLock<String>,
    observer: ObserverHandle,
}

impl FileSystem {
    /// Build a filesystem over an existing `files` table and content pool.
    pub fn new(files: TableHelper<FilesSchema>, pool: Arc<ContentDocPool>) -> Self {
        let fs_index = Arc::new(RwLock::new(FsIndex::build(files.get_all_valid())));
        let events = Arc::new(EventRegistry::new());

        // One observer keeps the path index current and derives semantic
        // events from the row diff, so local writes and remote sync surface
        // identically to subscribers.
        let observer = {
            let fs_index = Arc::clone(&fs_index);
            let events = Arc::clone(&events);
            let table = files.clone();
            files.observe(move |row_ids| {
                let mut batch: Vec<FsEvent> = Vec::new();
                {
                    let mut idx = fs_index.write().unwrap();
                    for id in row_ids {
                        let old_path = idx.path_of(id).cloned();
                        let old_row = idx.row(id).cloned();
                        let active = match table.get(id) {
                            GetResult::Valid(row) if row.is_active() => Some(row),
                            _ => None,
                        };
                        idx.apply_change(id, active.clone());
                        let new_path = idx.path_of(id).cloned();

                        match (old_row, active) {
                            (None, Some(new)) => {
                                if let Some(path) = new_path {
                                    batch.push(FsEvent::Created {
                                        path,
                                        id: id.clone(),
                                        kind: new.kind,
                                    });
                                }
                            }
                            (Some(_), None) => {
                                if let Some(path) = old_path {
                                    batch.push(FsEvent::Removed {
                                        path,
                                        id: id.clone(),
                                    });
                                }
                            }
                            (Some(old), Some(new)) => {
                                if old.name != new.name || old.parent_id != new.parent_id {
                                    if let (Some(from), Some(to)) = (old_path, new_path) {
                                        batch.push(FsEvent::Moved {
                                            from,
                                            to,
                                            id: id.clone(),
                                        });
                                    }
                                } else if let Some(path) = new_path {
                                    batch.push(FsEvent::Modified {
                                        path,
                                        id: id.clone(),
                                    });
                                }
                            }
                            (None, None) => {}
                        }
                    }
                }
                // Listeners run outside the index lock; they may read back.
                events.emit(&batch);
            })
        };

        Self {
            files,
            pool,
            fs_index,
            events,
            cwd: RwLock::new("/".to_string()),
            observer,
        }
    }

    /// Subscribe to filesystem change events. The listener fires once per
    /// committed table transaction with every event it produced.
    pub fn observe(&self, f: impl Fn(&[FsEvent]) + Send + Sync + 'static) -> ObserverHandle {
        self.events.subscribe(f)
    }

    /// Remove a previously registered event listener.
    pub fn unobserve(&self, handle: ObserverHandle) {
        self.events.unsubscribe(handle);
    }

    /// Build a filesystem over a workspace's `files` table.
    pub fn for_workspace(client: &WorkspaceClient, pool: Arc<ContentDocPool>) -> Self {
        Self::new(client.table(FILES_TABLE, TypedSchema::new()), pool)
    }

    /// The content-doc pool.
    pub fn pool(&self) -> &Arc<ContentDocPool> {
        &self.pool
    }

    /// The backing files table.
    pub fn files(&self) -> &TableHelper<FilesSchema> {
        &self.files
    }

    /// Current working directory for relative path resolution.
    pub fn cwd(&self) -> String {
        self.cwd.read().unwrap().clone()
    }

    /// Change the working directory; the target must be an existing folder.
    pub fn set_cwd(&self, dir: &str) -> FsResult<()> {
        let resolved = self.resolve_path(dir);
        if resolved != "/" {
            let idx = self.fs_index.read().unwrap();
            match idx.lookup(&resolved) {
                None => return Err(FsError::new(FsErrorCode::ENOENT, resolved)),
                Some(row) if !row.is_folder() => {
                    return Err(FsError::new(FsErrorCode::ENOTDIR, resolved));
                }
                Some(_) => {}
            }
        }
        *self.cwd.write().unwrap() = resolved;
        Ok(())
    }

    fn resolve_path(&self, p: &str) -> String {
        path::resolve(&self.cwd.read().unwrap(), p)
    }

    fn lookup(&self, resolved: &str) -> Option<FileRow> {
        self.fs_index.read().unwrap().lookup(resolved).cloned()
    }

    fn pool_failure(&self, at: &str, err: EpicenterError) -> FsError {
        log::warn!("fs: content pool failure at '{}': {}", at, err);
        FsError::new(FsErrorCode::EINVAL, at)
    }

    /// Resolve the parent folder of a target path.
    /// Errors: `EINVAL` for the root, `ENOENT` for a missing parent,
    /// `ENOTDIR` when a parent component is a file.
    fn locate_parent(&self, resolved: &str) -> FsResult<(Option<String>, String)> {
        let Some(parent_path) = path::parent(resolved) else {
            return Err(FsError::new(FsErrorCode::EINVAL, resolved));
        };
        let name = path::basename(resolved).to_string();
        if parent_path == "/" {
            return Ok((None, name));
        }
        let idx = self.fs_index.read().unwrap();
        match idx.lookup(&parent_path) {
            None => Err(FsError::new(FsErrorCode::ENOENT, parent_path)),
            Some(row) if !row.is_folder() => Err(FsError::new(FsErrorCode::ENOTDIR, parent_path)),
            Some(row) => Ok((Some(row.id.clone()), name)),
        }
    }

    /// Whether an active sibling of `parent` already uses `name`.
    fn sibling_conflict(&self, parent: Option<&str>, name: &str, exclude: Option<&str>) -> bool {
        let idx = self.fs_index.read().unwrap();
        idx.children_ids(parent).iter().any(|id| {
            exclude != Some(id.as_str())
                && idx.row(id).is_some_and(|row| row.name == name)
        })
    }

    /// Subtree rows rooted at `id` (pre-order, root first).
    fn collect_subtree(&self, id: &str) -> Vec<FileRow> {
        let idx = self.fs_index.read().unwrap();
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(row) = idx.row(&current) {
                out.push(row.clone());
                stack.extend(idx.children_ids(Some(&current)));
            }
        }
        out
    }

    fn touch_row(&self, id: &str, size: u64) {
        if let GetResult::Valid(mut row) = self.files.get(id) {
            row.size = size;
            row.updated_at = now_millis();
            if let Err(err) = self.files.set(row) {
                log::warn!("fs: failed to touch row '{}': {}", id, err);
            }
        }
    }

    // ==================== Metadata Reads ====================

    /// Whether a path resolves to an active file or folder.
    pub fn exists(&self, p: &str) -> bool {
        let resolved = self.resolve_path(p);
        resolved == "/" || self.lookup(&resolved).is_some()
    }

    /// Stat a path. The root is synthetic (`mtime = 0`, mode `0o755`).
    pub fn stat(&self, p: &str) -> FsResult<FileStat> {
        let resolved = self.resolve_path(p);
        if resolved == "/" {
            return Ok(FileStat {
                id: None,
                name: String::new(),
                kind: FileKind::Folder,
                size: 0,
                mtime: 0,
                ctime: 0,
                mode: 0o755,
            });
        }
        let row = self
            .lookup(&resolved)
            .ok_or_else(|| FsError::new(FsErrorCode::ENOENT, resolved.clone()))?;
        Ok(FileStat {
            mode: if row.is_folder() { 0o755 } else { 0o644 },
            id: Some(row.id),
            name: row.name,
            kind: row.kind,
            size: row.size,
            mtime: row.updated_at,
            ctime: row.created_at,
        })
    }

    /// Identical to [`stat`](Self::stat): the filesystem has no symlinks.
    pub fn lstat(&self, p: &str) -> FsResult<FileStat> {
        self.stat(p)
    }

    /// List child names of a folder, sorted ascending. Colliding sibling
    /// names are disambiguated deterministically.
    pub fn readdir(&self, p: &str) -> FsResult<Vec<String>> {
        Ok(self
            .readdir_with_file_types(p)?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// List children of a folder with type information, sorted by name.
    pub fn readdir_with_file_types(&self, p: &str) -> FsResult<Vec<DirEntry>> {
        let resolved = self.resolve_path(p);
        let parent_id = if resolved == "/" {
            None
        } else {
            let row = self
                .lookup(&resolved)
                .ok_or_else(|| FsError::new(FsErrorCode::ENOENT, resolved.clone()))?;
            if !row.is_folder() {
                return Err(FsError::new(FsErrorCode::ENOTDIR, resolved));
            }
            Some(row.id)
        };

        let idx = self.fs_index.read().unwrap();
        Ok(idx
            .display_entries(parent_id.as_deref())
            .into_iter()
            .filter_map(|(name, id)| {
                idx.row(&id).map(|row| DirEntry {
                    name,
                    id: id.clone(),
                    kind: row.kind,
                })
            })
            .collect())
    }

    // ==================== Content Reads ====================

    /// Read a file as text. Binary content decodes as UTF-8 (lossy); an
    /// empty timeline reads as the empty string.
    pub async fn read_file(&self, p: &str) -> FsResult<String> {
        let resolved = self.resolve_path(p);
        let row = self.require_file(&resolved)?;
        let doc = self
            .pool
            .ensure(&row.id)
            .await
            .map_err(|e| self.pool_failure(&resolved, e))?;
        Ok(doc.read_text())
    }

    /// Read a file as bytes. Text content encodes as UTF-8.
    pub async fn read_file_buffer(&self, p: &str) -> FsResult<Vec<u8>> {
        let resolved = self.resolve_path(p);
        let row = self.require_file(&resolved)?;
        let doc = self
            .pool
            .ensure(&row.id)
            .await
            .map_err(|e| self.pool_failure(&resolved, e))?;
        Ok(doc.read_bytes())
    }

    fn require_file(&self, resolved: &str) -> FsResult<FileRow> {
        if resolved == "/" {
            return Err(FsError::new(FsErrorCode::EISDIR, resolved));
        }
        let row = self
            .lookup(resolved)
            .ok_or_else(|| FsError::new(FsErrorCode::ENOENT, resolved))?;
        if row.is_folder() {
            return Err(FsError::new(FsErrorCode::EISDIR, resolved));
        }
        Ok(row)
    }

    // ==================== Writes ====================

    /// Write file content, creating the file if the path is new.
    ///
    /// Writing to an existing file preserves its id. Text written onto a
    /// current text version edits the nested text in place; every other
    /// combination appends a new timeline version. The row's `size` and
    /// `updatedAt` are refreshed after the content lands.
    pub async fn write_file(&self, p: &str, data: impl Into<FileContent>) -> FsResult<()> {
        let resolved = self.resolve_path(p);
        let content = data.into();
        if resolved == "/" {
            return Err(FsError::new(FsErrorCode::EISDIR, resolved));
        }

        if let Some(row) = self.lookup(&resolved) {
            if row.is_folder() {
                return Err(FsError::new(FsErrorCode::EISDIR, resolved));
            }
            let doc = self
                .pool
                .ensure(&row.id)
                .await
                .map_err(|e| self.pool_failure(&resolved, e))?;
            match &content {
                FileContent::Text(s) => doc.write_text(s),
                FileContent::Bytes(b) => doc.write_binary(b),
            }
            self.touch_row(&row.id, doc.current_byte_len());
            return Ok(());
        }

        // New path: validate, assert sibling uniqueness, create row + content.
        let (parent_id, name) = self.locate_parent(&resolved)?;
        validate_name(&name, &resolved)?;
        if self.sibling_conflict(parent_id.as_deref(), &name, None) {
            return Err(FsError::new(FsErrorCode::EEXIST, resolved));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let doc = self
            .pool
            .ensure(&id)
            .await
            .map_err(|e| self.pool_failure(&resolved, e))?;
        match &content {
            FileContent::Text(s) => doc.write_text(s),
            FileContent::Bytes(b) => doc.write_binary(b),
        }
        let now = now_millis();
        let row = FileRow {
            id,
            name,
            parent_id,
            kind: FileKind::File,
            size: doc.current_byte_len(),
            created_at: now,
            updated_at: now,
            trashed_at: None,
        };
        self.files
            .set(row)
            .map_err(|_| FsError::new(FsErrorCode::EINVAL, resolved))?;
        Ok(())
    }

    /// Append to a file. Text versions extend in place; binary content is
    /// decoded, concatenated, and appended as a new text version; a missing
    /// file behaves like [`write_file`](Self::write_file).
    pub async fn append_file(&self, p: &str, data: impl Into<FileContent>) -> FsResult<()> {
        let resolved = self.resolve_path(p);
        let chunk = match data.into() {
            FileContent::Text(s) => s,
            FileContent::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
        };

        let Some(row) = self.lookup(&resolved) else {
            return self.write_file(&resolved, chunk).await;
        };
        if row.is_folder() {
            return Err(FsError::new(FsErrorCode::EISDIR, resolved));
        }
        let doc = self
            .pool
            .ensure(&row.id)
            .await
            .map_err(|e| self.pool_failure(&resolved, e))?;
        doc.append_text(&chunk);
        self.touch_row(&row.id, doc.current_byte_len());
        Ok(())
    }

    // ==================== Structure ====================

    /// Create a folder. With `recursive`, every missing ancestor is created
    /// and an existing target folder is a no-op.
    pub async fn mkdir(&self, p: &str, opts: MkdirOptions) -> FsResult<()> {
        let resolved = self.resolve_path(p);
        if resolved == "/" {
            return if opts.recursive {
                Ok(())
            } else {
                Err(FsError::new(FsErrorCode::EEXIST, resolved))
            };
        }

        if !opts.recursive {
            if self.lookup(&resolved).is_some() {
                return Err(FsError::new(FsErrorCode::EEXIST, resolved));
            }
            let (parent_id, name) = self.locate_parent(&resolved)?;
            validate_name(&name, &resolved)?;
            if self.sibling_conflict(parent_id.as_deref(), &name, None) {
                return Err(FsError::new(FsErrorCode::EEXIST, resolved));
            }
            self.create_folder(parent_id, &name, &resolved)?;
            return Ok(());
        }

        let components: Vec<String> = resolved[1..].split('/').map(String::from).collect();
        let mut current = String::new();
        let mut parent_id: Option<String> = None;
        let last = components.len() - 1;
        for (i, component) in components.iter().enumerate() {
            let parent_path = if current.is_empty() {
                "/".to_string()
            } else {
                current.clone()
            };
            current = path::join(&parent_path, component);
            match self.lookup(&current) {
                Some(row) if row.is_folder() => parent_id = Some(row.id),
                Some(_) => {
                    let code = if i == last {
                        FsErrorCode::EEXIST
                    } else {
                        FsErrorCode::ENOTDIR
                    };
                    return Err(FsError::new(code, current));
                }
                None => {
                    validate_name(component, &current)?;
                    parent_id = Some(self.create_folder(parent_id, component, &current)?);
                }
            }
        }
        Ok(())
    }

    fn create_folder(&self, parent_id: Option<String>, name: &str, at: &str) -> FsResult<String> {
        let now = now_millis();
        let id = uuid::Uuid::new_v4().to_string();
        let row = FileRow {
            id: id.clone(),
            name: name.to_string(),
            parent_id,
            kind: FileKind::Folder,
            size: 0,
            created_at: now,
            updated_at: now,
            trashed_at: None,
        };
        self.files
            .set(row)
            .map_err(|_| FsError::new(FsErrorCode::EINVAL, at))?;
        Ok(id)
    }

    /// Remove a path (soft delete: the subtree rows get `trashedAt` and the
    /// content docs leave the pool). A non-empty folder needs `recursive`;
    /// `force` suppresses `ENOENT`; the root is never removable.
    pub async fn rm(&self, p: &str, opts: RmOptions) -> FsResult<()> {
        let resolved = self.resolve_path(p);
        if resolved == "/" {
            return Err(FsError::new(FsErrorCode::EINVAL, resolved));
        }
        let Some(row) = self.lookup(&resolved) else {
            return if opts.force {
                Ok(())
            } else {
                Err(FsError::new(FsErrorCode::ENOENT, resolved))
            };
        };

        let subtree = self.collect_subtree(&row.id);
        if row.is_folder() && !opts.recursive && subtree.len() > 1 {
            return Err(FsError::new(FsErrorCode::ENOTEMPTY, resolved));
        }

        let now = now_millis();
        let file_ids: Vec<String> = subtree
            .iter()
            .filter(|r| !r.is_folder())
            .map(|r| r.id.clone())
            .collect();
        let trashed: Vec<FileRow> = subtree
            .into_iter()
            .map(|mut r| {
                r.trashed_at = Some(now);
                r.updated_at = now;
                r
            })
            .collect();
        self.files
            .set(trashed)
            .map_err(|_| FsError::new(FsErrorCode::EINVAL, resolved))?;

        for id in file_ids {
            self.pool.destroy(&id).await;
        }
        Ok(())
    }

    /// Copy a file or (with `recursive`) a folder subtree. Content is copied
    /// through the pool: the source's current version is read and written as
    /// a new version at the destination.
    pub async fn cp(&self, src: &str, dst: &str, opts: CpOptions) -> FsResult<()> {
        let src = self.resolve_path(src);
        let dst = self.resolve_path(dst);
        self.cp_inner(src, dst, opts.recursive).await
    }

    fn cp_inner<'a>(&'a self, src: String, dst: String, recursive: bool) -> BoxFuture<'a, FsResult<()>> {
        Box::pin(async move {
            let src_row = self
                .lookup(&src)
                .ok_or_else(|| FsError::new(FsErrorCode::ENOENT, src.clone()))?;

            if src_row.is_folder() {
                if !recursive {
                    return Err(FsError::new(FsErrorCode::EISDIR, src));
                }
                if dst == src || dst.starts_with(&format!("{}/", src)) {
                    return Err(FsError::new(FsErrorCode::EINVAL, dst));
                }
                match self.lookup(&dst) {
                    Some(row) if row.is_folder() => {}
                    Some(_) => return Err(FsError::new(FsErrorCode::ENOTDIR, dst)),
                    None => self.mkdir(&dst, MkdirOptions { recursive: false }).await?,
                }
                let children: Vec<String> = {
                    let idx = self.fs_index.read().unwrap();
                    idx.display_entries(Some(&src_row.id))
                        .into_iter()
                        .map(|(name, _)| name)
                        .collect()
                };
                for name in children {
                    self.cp_inner(path::join(&src, &name), path::join(&dst, &name), true)
                        .await?;
                }
                return Ok(());
            }

            if dst == src {
                return Err(FsError::new(FsErrorCode::EINVAL, dst));
            }
            let doc = self
                .pool
                .ensure(&src_row.id)
                .await
                .map_err(|e| self.pool_failure(&src, e))?;
            match doc.current_kind() {
                Some(ContentKind::Binary) => self.write_file(&dst, doc.read_bytes()).await,
                _ => self.write_file(&dst, doc.read_text()).await,
            }
        })
    }

    /// Move/rename: a pure metadata write. The file id and content document
    /// are untouched; an occupied destination fails `EEXIST`.
    pub async fn mv(&self, src: &str, dst: &str) -> FsResult<()> {
        let src = self.resolve_path(src);
        let dst = self.resolve_path(dst);
        if src == "/" || dst == "/" {
            return Err(FsError::new(FsErrorCode::EINVAL, dst));
        }
        let src_row = self
            .lookup(&src)
            .ok_or_else(|| FsError::new(FsErrorCode::ENOENT, src.clone()))?;
        if dst == src {
            return Ok(());
        }
        if src_row.is_folder() && dst.starts_with(&format!("{}/", src)) {
            return Err(FsError::new(FsErrorCode::EINVAL, dst));
        }

        let (parent_id, name) = self.locate_parent(&dst)?;
        validate_name(&name, &dst)?;
        if let Some(existing) = self.lookup(&dst)
            && existing.id != src_row.id
        {
            return Err(FsError::new(FsErrorCode::EEXIST, dst));
        }
        if self.sibling_conflict(parent_id.as_deref(), &name, Some(&src_row.id)) {
            return Err(FsError::new(FsErrorCode::EEXIST, dst));
        }

        let mut row = src_row;
        row.name = name;
        row.parent_id = parent_id;
        row.updated_at = now_millis();
        self.files
            .set(row)
            .map_err(|_| FsError::new(FsErrorCode::EINVAL, dst))?;
        Ok(())
    }

    // ==================== Permissions (no-op) ====================

    /// Permissions are not modeled; validates existence and does nothing.
    pub fn chmod(&self, p: &str, _mode: u32) -> FsResult<()> {
        let resolved = self.resolve_path(p);
        if resolved == "/" || self.lookup(&resolved).is_some() {
            Ok(())
        } else {
            Err(FsError::new(FsErrorCode::ENOENT, resolved))
        }
    }

    /// Updates `updatedAt` only.
    pub fn utimes(&self, p: &str, mtime: i64) -> FsResult<()> {
        let resolved = self.resolve_path(p);
        let row = self
            .lookup(&resolved)
            .ok_or_else(|| FsError::new(FsErrorCode::ENOENT, resolved.clone()))?;
        let mut updated = row;
        updated.updated_at = mtime;
        self.files
            .set(updated)
            .map_err(|_| FsError::new(FsErrorCode::EINVAL, resolved))?;
        Ok(())
    }

    /// Symlinks are not supported.
    pub fn symlink(&self, _target: &str, link_path: &str) -> FsResult<()> {
        Err(FsError::new(
            FsErrorCode::ENOSYS,
            self.resolve_path(link_path),
        ))
    }

    /// Hardlinks are not supported.
    pub fn link(&self, _target: &str, link_path: &str) -> FsResult<()> {
        Err(FsError::new(
            FsErrorCode::ENOSYS,
            self.resolve_path(link_path),
        ))
    }

    /// No symlinks exist to read.
    pub fn readlink(&self, p: &str) -> FsResult<String> {
        Err(FsError::new(FsErrorCode::ENOSYS, self.resolve_path(p)))
    }

    // ==================== Trash ====================

    /// Rows currently in the trash.
    pub fn trashed(&self) -> Vec<FileRow> {
        self.files
            .get_all_valid()
            .into_iter()
            .filter(|row| !row.is_active())
            .collect()
    }

    /// Restore a trashed row by id. When the original parent is gone or
    /// itself trashed, the row re-parents to root.
    pub fn restore(&self, id: &str) -> FsResult<()> {
        let GetResult::Valid(mut row) = self.files.get(id) else {
            return Err(FsError::new(FsErrorCode::ENOENT, id));
        };
        if row.is_active() {
            return Ok(());
        }
        let parent_alive = row.parent_id.as_ref().is_some_and(|p| {
            matches!(self.files.get(p), GetResult::Valid(parent) if parent.is_active())
        });
        if !parent_alive {
            row.parent_id = None;
        }
        row.trashed_at = None;
        row.updated_at = now_millis();
        self.files
            .set(row)
            .map_err(|_| FsError::new(FsErrorCode::EINVAL, id))?;
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.files.unobserve(self.observer);
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("rows", &self.files.count())
            .field("cwd", &self.cwd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;
    use yrs::Doc;

    fn create_fs() -> FileSystem {
        let doc = Doc::new();
        let files = TableHelper::new(&doc, FILES_TABLE, TypedSchema::new());
        FileSystem::new(files, Arc::new(ContentDocPool::new()))
    }

    #[test]
    fn test_write_and_read_text() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "hello").await.unwrap();
            assert_eq!(fs.read_file("/a.txt").await.unwrap(), "hello");
            assert!(fs.exists("/a.txt"));
        });
    }

    #[test]
    fn test_write_and_read_binary() {
        block_on(async {
            let fs = create_fs();
            let payload = vec![0u8, 1, 2, 250];
            fs.write_file("/a.dat", payload.clone()).await.unwrap();
            assert_eq!(fs.read_file_buffer("/a.dat").await.unwrap(), payload);
        });
    }

    #[test]
    fn test_overwrite_preserves_file_id() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "one").await.unwrap();
            let id1 = fs.stat("/a.txt").unwrap().id;
            fs.write_file("/a.txt", "two").await.unwrap();
            let id2 = fs.stat("/a.txt").unwrap().id;
            assert_eq!(id1, id2);
            assert_eq!(fs.read_file("/a.txt").await.unwrap(), "two");
        });
    }

    #[test]
    fn test_size_bookkeeping() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "hello").await.unwrap();
            assert_eq!(fs.stat("/a.txt").unwrap().size, 5);
            fs.write_file("/a.txt", vec![1u8, 2, 3]).await.unwrap();
            assert_eq!(fs.stat("/a.txt").unwrap().size, 3);
        });
    }

    #[test]
    fn test_read_missing_is_enoent() {
        block_on(async {
            let fs = create_fs();
            let err = fs.read_file("/missing.txt").await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::ENOENT);
            assert_eq!(err.path, "/missing.txt");
        });
    }

    #[test]
    fn test_read_folder_is_eisdir() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/docs", MkdirOptions::default()).await.unwrap();
            let err = fs.read_file("/docs").await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::EISDIR);
        });
    }

    #[test]
    fn test_readdir_on_file_is_enotdir() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "x").await.unwrap();
            let err = fs.readdir("/a.txt").unwrap_err();
            assert_eq!(err.code, FsErrorCode::ENOTDIR);
        });
    }

    #[test]
    fn test_stat_root_is_synthetic() {
        let fs = create_fs();
        let stat = fs.stat("/").unwrap();
        assert!(stat.is_dir());
        assert_eq!(stat.id, None);
        assert_eq!(stat.mtime, 0);
        assert_eq!(stat.mode, 0o755);
    }

    #[test]
    fn test_mkdir_and_readdir_sorted() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/docs", MkdirOptions::default()).await.unwrap();
            fs.write_file("/docs/b.txt", "b").await.unwrap();
            fs.write_file("/docs/a.txt", "a").await.unwrap();

            assert_eq!(fs.readdir("/docs").unwrap(), vec!["a.txt", "b.txt"]);
            let entries = fs.readdir_with_file_types("/").unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].kind, FileKind::Folder);
        });
    }

    #[test]
    fn test_mkdir_missing_parent_is_enoent() {
        block_on(async {
            let fs = create_fs();
            let err = fs.mkdir("/a/b", MkdirOptions::default()).await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::ENOENT);
        });
    }

    #[test]
    fn test_mkdir_existing_is_eexist() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/x", "content").await.unwrap();
            let err = fs.mkdir("/x", MkdirOptions::default()).await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::EEXIST);
        });
    }

    #[test]
    fn test_mkdir_recursive_creates_ancestors() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/a/b/c", MkdirOptions { recursive: true })
                .await
                .unwrap();
            assert!(fs.stat("/a").unwrap().is_dir());
            assert!(fs.stat("/a/b").unwrap().is_dir());
            assert!(fs.stat("/a/b/c").unwrap().is_dir());

            // Idempotent for an existing target.
            fs.mkdir("/a/b/c", MkdirOptions { recursive: true })
                .await
                .unwrap();
        });
    }

    #[test]
    fn test_mkdir_root_recursive_is_noop() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/", MkdirOptions { recursive: true }).await.unwrap();
            let err = fs.mkdir("/", MkdirOptions::default()).await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::EEXIST);
        });
    }

    #[test]
    fn test_rm_file_soft_deletes() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "x").await.unwrap();
            let id = fs.stat("/a.txt").unwrap().id.unwrap();

            fs.rm("/a.txt", RmOptions::default()).await.unwrap();
            assert!(!fs.exists("/a.txt"));
            assert!(!fs.pool().is_open(&id));

            // The row survives in the trash.
            let trashed = fs.trashed();
            assert_eq!(trashed.len(), 1);
            assert_eq!(trashed[0].id, id);
        });
    }

    #[test]
    fn test_rm_root_is_rejected() {
        block_on(async {
            let fs = create_fs();
            let err = fs.rm("/", RmOptions { recursive: true, force: true }).await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::EINVAL);
        });
    }

    #[test]
    fn test_rm_nonempty_folder_needs_recursive() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/d", MkdirOptions::default()).await.unwrap();
            fs.write_file("/d/a.txt", "x").await.unwrap();

            let err = fs.rm("/d", RmOptions::default()).await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::ENOTEMPTY);

            fs.rm("/d", RmOptions { recursive: true, force: false })
                .await
                .unwrap();
            assert!(!fs.exists("/d"));
            assert!(!fs.exists("/d/a.txt"));
        });
    }

    #[test]
    fn test_rm_force_suppresses_enoent() {
        block_on(async {
            let fs = create_fs();
            let err = fs.rm("/missing", RmOptions::default()).await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::ENOENT);
            fs.rm("/missing", RmOptions { recursive: false, force: true })
                .await
                .unwrap();
        });
    }

    #[test]
    fn test_mv_is_metadata_only() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "x").await.unwrap();
            let id = fs.stat("/a.txt").unwrap().id.unwrap();
            fs.mkdir("/b", MkdirOptions::default()).await.unwrap();

            let calls_before = fs.pool().ensure_calls();
            fs.mv("/a.txt", "/b/a.txt").await.unwrap();
            assert_eq!(fs.pool().ensure_calls(), calls_before);

            assert!(!fs.exists("/a.txt"));
            assert_eq!(fs.stat("/b/a.txt").unwrap().id.unwrap(), id);
            assert_eq!(fs.read_file("/b/a.txt").await.unwrap(), "x");
        });
    }

    #[test]
    fn test_mv_to_occupied_path_is_eexist() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "a").await.unwrap();
            fs.write_file("/b.txt", "b").await.unwrap();
            let err = fs.mv("/a.txt", "/b.txt").await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::EEXIST);
        });
    }

    #[test]
    fn test_mv_folder_moves_subtree_paths() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/a", MkdirOptions::default()).await.unwrap();
            fs.write_file("/a/x.txt", "x").await.unwrap();
            fs.mkdir("/b", MkdirOptions::default()).await.unwrap();

            fs.mv("/a", "/b/a").await.unwrap();
            assert!(fs.exists("/b/a/x.txt"));
            assert!(!fs.exists("/a/x.txt"));
        });
    }

    #[test]
    fn test_mv_folder_into_itself_is_einval() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/a", MkdirOptions::default()).await.unwrap();
            let err = fs.mv("/a", "/a/sub").await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::EINVAL);
        });
    }

    #[test]
    fn test_cp_file_copies_content() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "payload").await.unwrap();
            fs.cp("/a.txt", "/b.txt", CpOptions::default()).await.unwrap();

            assert_eq!(fs.read_file("/b.txt").await.unwrap(), "payload");
            // Distinct identities: editing the copy leaves the source alone.
            fs.write_file("/b.txt", "changed").await.unwrap();
            assert_eq!(fs.read_file("/a.txt").await.unwrap(), "payload");
        });
    }

    #[test]
    fn test_cp_folder_requires_recursive() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/d", MkdirOptions::default()).await.unwrap();
            let err = fs.cp("/d", "/e", CpOptions::default()).await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::EISDIR);
        });
    }

    #[test]
    fn test_cp_folder_recursive() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/d/sub", MkdirOptions { recursive: true }).await.unwrap();
            fs.write_file("/d/a.txt", "a").await.unwrap();
            fs.write_file("/d/sub/b.dat", vec![7u8]).await.unwrap();

            fs.cp("/d", "/copy", CpOptions { recursive: true }).await.unwrap();
            assert_eq!(fs.read_file("/copy/a.txt").await.unwrap(), "a");
            assert_eq!(
                fs.read_file_buffer("/copy/sub/b.dat").await.unwrap(),
                vec![7u8]
            );
        });
    }

    #[test]
    fn test_cp_folder_into_itself_is_einval() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/d", MkdirOptions::default()).await.unwrap();
            let err = fs
                .cp("/d", "/d/inner", CpOptions { recursive: true })
                .await
                .unwrap_err();
            assert_eq!(err.code, FsErrorCode::EINVAL);
            let err = fs.cp("/d", "/d", CpOptions { recursive: true }).await.unwrap_err();
            assert_eq!(err.code, FsErrorCode::EINVAL);
        });
    }

    #[test]
    fn test_append_file() {
        block_on(async {
            let fs = create_fs();
            fs.append_file("/log.txt", "one").await.unwrap();
            fs.append_file("/log.txt", " two").await.unwrap();
            assert_eq!(fs.read_file("/log.txt").await.unwrap(), "one two");

            // Appending after a binary write concatenates into a text version.
            fs.write_file("/log.txt", b"bin".as_slice()).await.unwrap();
            fs.append_file("/log.txt", "!").await.unwrap();
            assert_eq!(fs.read_file("/log.txt").await.unwrap(), "bin!");
        });
    }

    #[test]
    fn test_symlinks_are_enosys() {
        let fs = create_fs();
        assert_eq!(
            fs.symlink("/a", "/b").unwrap_err().code,
            FsErrorCode::ENOSYS
        );
        assert_eq!(fs.link("/a", "/b").unwrap_err().code, FsErrorCode::ENOSYS);
        assert_eq!(fs.readlink("/a").unwrap_err().code, FsErrorCode::ENOSYS);
    }

    #[test]
    fn test_chmod_and_utimes() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "x").await.unwrap();

            fs.chmod("/a.txt", 0o600).unwrap();
            assert_eq!(fs.chmod("/nope", 0o600).unwrap_err().code, FsErrorCode::ENOENT);

            fs.utimes("/a.txt", 123_456).unwrap();
            assert_eq!(fs.stat("/a.txt").unwrap().mtime, 123_456);
        });
    }

    #[test]
    fn test_relative_paths_resolve_against_cwd() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/docs", MkdirOptions::default()).await.unwrap();
            fs.set_cwd("/docs").unwrap();

            fs.write_file("note.md", "hi").await.unwrap();
            assert!(fs.exists("/docs/note.md"));
            assert_eq!(fs.read_file("../docs/note.md").await.unwrap(), "hi");
        });
    }

    #[test]
    fn test_restore_from_trash() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.txt", "x").await.unwrap();
            let id = fs.stat("/a.txt").unwrap().id.unwrap();

            fs.rm("/a.txt", RmOptions::default()).await.unwrap();
            assert!(!fs.exists("/a.txt"));

            fs.restore(&id).unwrap();
            assert!(fs.exists("/a.txt"));
            assert_eq!(fs.read_file("/a.txt").await.unwrap(), "x");
        });
    }

    #[test]
    fn test_restore_with_trashed_parent_reparents_to_root() {
        block_on(async {
            let fs = create_fs();
            fs.mkdir("/d", MkdirOptions::default()).await.unwrap();
            fs.write_file("/d/a.txt", "x").await.unwrap();
            let id = fs.stat("/d/a.txt").unwrap().id.unwrap();

            fs.rm("/d", RmOptions { recursive: true, force: false })
                .await
                .unwrap();
            fs.restore(&id).unwrap();

            assert!(fs.exists("/a.txt"));
        });
    }

    #[test]
    fn test_events_for_create_modify_move_remove() {
        block_on(async {
            let fs = create_fs();
            let seen: Arc<std::sync::Mutex<Vec<FsEvent>>> =
                Arc::new(std::sync::Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let _h = fs.observe(move |events| {
                sink.lock().unwrap().extend(events.to_vec());
            });

            fs.write_file("/a.txt", "one").await.unwrap();
            fs.write_file("/a.txt", "two").await.unwrap();
            fs.mkdir("/d", MkdirOptions::default()).await.unwrap();
            fs.mv("/a.txt", "/d/a.txt").await.unwrap();
            fs.rm("/d/a.txt", RmOptions::default()).await.unwrap();

            let events = seen.lock().unwrap();
            assert!(matches!(
                &events[0],
                FsEvent::Created { path, kind: FileKind::File, .. } if path == "/a.txt"
            ));
            // The overwrite touches size/updatedAt.
            assert!(matches!(
                &events[1],
                FsEvent::Modified { path, .. } if path == "/a.txt"
            ));
            assert!(events.iter().any(|e| matches!(
                e,
                FsEvent::Created { path, kind: FileKind::Folder, .. } if path == "/d"
            )));
            assert!(events.iter().any(|e| matches!(
                e,
                FsEvent::Moved { from, to, .. } if from == "/a.txt" && to == "/d/a.txt"
            )));
            assert!(matches!(
                events.last().unwrap(),
                FsEvent::Removed { path, .. } if path == "/d/a.txt"
            ));
        });
    }

    #[test]
    fn test_unobserve_stops_events() {
        block_on(async {
            let fs = create_fs();
            let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let counter = Arc::clone(&count);
            let handle = fs.observe(move |events| {
                counter.fetch_add(events.len(), std::sync::atomic::Ordering::SeqCst);
            });

            fs.write_file("/a.txt", "x").await.unwrap();
            let after_first = count.load(std::sync::atomic::Ordering::SeqCst);
            assert!(after_first >= 1);

            fs.unobserve(handle);
            fs.write_file("/b.txt", "y").await.unwrap();
            assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), after_first);
        });
    }

    #[test]
    fn test_mode_switch_round_trip() {
        block_on(async {
            let fs = create_fs();
            fs.write_file("/a.dat", "hello").await.unwrap();
            fs.write_file("/a.dat", vec![0u8, 1, 2]).await.unwrap();
            assert_eq!(fs.read_file_buffer("/a.dat").await.unwrap(), vec![0, 1, 2]);
            fs.write_file("/a.dat", "world").await.unwrap();
            assert_eq!(fs.read_file("/a.dat").await.unwrap(), "world");
        });
    }
}
