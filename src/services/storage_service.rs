//! StorageService: the file-item catalog.
//!
//! The logical tree lives in SQLite (`file_items`); bytes live on the object
//! backends. Every operation authorises the caller against the node's owner,
//! then drives the backend, the bucket policy and the quota ledger so the
//! three stay in step. Mutating operations hold in-process scope locks until
//! they return: exclusive on the node or directory they change, shared on
//! every directory above it (see `Claim`).
//!
//! Multi-object operations are not atomic. A failure part way leaves the
//! catalog untouched and the backend partially updated; repeating the same
//! call converges.

use super::{
    backend::{Backend, ByteStream},
    directory_engine::{DirectoryEngine, KeyPermissions, TransferMode, basename, rebase},
    error::{StorageError, StorageResult},
    file_items,
    locks::LockRegistry,
    policy_manager::PolicyManager,
    quota::{QuotaLedger, kb_for, release_in},
    registry::BackendRegistry,
    urls::UrlSynthesizer,
};
use crate::{
    config::AppConfig,
    models::{
        caller::Caller,
        file_item::{FileItem, FileItemView, FileKind, FileTreeNode, Permission, ServerKey},
        quota::StorageQuota,
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::SqlitePool;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_NAME_LEN: usize = 255;
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";

/// Lock key of a directory scope: an owner's top level (`None`) or a node.
type Scope = (i64, Option<Uuid>);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Access {
    Shared,
    Exclusive,
}

/// Part of the tree an operation is about to change.
///
/// Claiming a scope exclusively also takes every scope above it shared, so
/// work inside a directory and work on the directory itself exclude each
/// other while disjoint subtrees proceed in parallel.
#[derive(Clone, Copy, Debug)]
enum Claim {
    /// The names inside a directory, or inside an owner's top level.
    Names { owner_id: i64, parent_id: Option<Uuid> },
    /// A node and everything under it.
    Node(Uuid, Access),
    /// The names next to a node, in its current parent.
    Siblings(Uuid),
}

#[derive(Default)]
struct ScopeGuards {
    _shared: Vec<OwnedRwLockReadGuard<()>>,
    _exclusive: Vec<OwnedRwLockWriteGuard<()>>,
}

/// A file's content as the backend currently holds it.
pub struct Download {
    pub item: FileItem,
    /// Type reported by the backend, falling back to the catalog's.
    pub content_type: String,
    pub etag: Option<String>,
    pub body: ByteStream,
}

/// Where a node is (or will be) attached.
struct Placement {
    owner_id: i64,
    parent_id: Option<Uuid>,
    server_key: ServerKey,
    bucket: String,
    /// Key prefix of the containing directory, ending in `/`.
    prefix: String,
}

#[derive(Clone)]
pub struct StorageService {
    db: Arc<SqlitePool>,
    registry: Arc<BackendRegistry>,
    policies: Arc<PolicyManager>,
    directories: Arc<DirectoryEngine>,
    urls: Arc<UrlSynthesizer>,
    quota: QuotaLedger,
    scope_locks: Arc<LockRegistry<Scope>>,
    /// Backend and bucket for top-level nodes; children inherit their parent's.
    default_server: ServerKey,
    default_bucket: String,
}

impl StorageService {
    pub fn new(
        db: Arc<SqlitePool>,
        registry: Arc<BackendRegistry>,
        default_server: ServerKey,
        default_bucket: impl Into<String>,
        presign_max_ttl: Duration,
    ) -> Self {
        let policies = Arc::new(PolicyManager::new(registry.clone()));
        Self {
            directories: Arc::new(DirectoryEngine::new(registry.clone(), policies.clone())),
            urls: Arc::new(UrlSynthesizer::new(registry.clone(), presign_max_ttl)),
            quota: QuotaLedger::new(db.clone()),
            scope_locks: Arc::new(LockRegistry::new()),
            policies,
            registry,
            db,
            default_server,
            default_bucket: default_bucket.into(),
        }
    }

    pub fn from_config(db: Arc<SqlitePool>, registry: Arc<BackendRegistry>, cfg: &AppConfig) -> Self {
        Self::new(
            db,
            registry,
            cfg.default_server,
            cfg.default_bucket.clone(),
            cfg.presign_max_ttl,
        )
    }

    /// Create an empty directory and its marker object.
    pub async fn create_directory(
        &self,
        caller: &Caller,
        parent_id: Option<Uuid>,
        name: &str,
        permission: Permission,
    ) -> StorageResult<FileItemView> {
        validate_name(name)?;
        let _guards = self
            .lock_scopes(&[Claim::Names {
                owner_id: caller.owner_id,
                parent_id,
            }])
            .await?;
        let place = self.placement(caller, parent_id).await?;
        self.ensure_name_free(place.owner_id, place.parent_id, name, None)
            .await?;

        let key = child_key(&place.prefix, name, FileKind::Directory);
        let backend = self.registry.resolve(place.server_key)?;
        backend.ensure_bucket(&place.bucket).await?;
        backend
            .put(&place.bucket, &key, Bytes::new(), DIRECTORY_CONTENT_TYPE)
            .await?;
        self.policies
            .apply(place.server_key, &place.bucket, &key, permission, false)
            .await?;

        let item = new_item(
            &place,
            name,
            FileKind::Directory,
            permission,
            key,
            0,
            DIRECTORY_CONTENT_TYPE,
        );
        file_items::insert(&*self.db, &item).await?;
        info!(owner_id = item.owner_id, id = %item.id, key = %item.object_key, "directory created");
        self.view(item)
    }

    /// Store a file. Quota is reserved first and given back if any later
    /// step fails.
    pub async fn upload_file(
        &self,
        caller: &Caller,
        parent_id: Option<Uuid>,
        name: &str,
        body: Bytes,
        content_type: Option<&str>,
        permission: Permission,
    ) -> StorageResult<FileItemView> {
        validate_name(name)?;
        let _guards = self
            .lock_scopes(&[Claim::Names {
                owner_id: caller.owner_id,
                parent_id,
            }])
            .await?;
        let place = self.placement(caller, parent_id).await?;
        self.ensure_name_free(place.owner_id, place.parent_id, name, None)
            .await?;

        let size_bytes = body.len() as i64;
        let content_type = content_type
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        self.quota.reserve_or_fail(place.owner_id, size_bytes).await?;

        let key = child_key(&place.prefix, name, FileKind::File);
        let item = new_item(
            &place,
            name,
            FileKind::File,
            permission,
            key,
            size_bytes,
            content_type,
        );
        match self.store_upload(&item, body).await {
            Ok(()) => {
                info!(
                    owner_id = item.owner_id,
                    id = %item.id,
                    key = %item.object_key,
                    size_bytes,
                    "file uploaded"
                );
                self.view(item)
            }
            Err(err) => {
                warn!(owner_id = item.owner_id, key = %item.object_key, error = %err, "upload failed");
                if let Err(release_err) = self.quota.release(item.owner_id, size_bytes).await {
                    warn!(owner_id = item.owner_id, error = %release_err, "could not release quota");
                }
                Err(err)
            }
        }
    }

    async fn store_upload(&self, item: &FileItem, body: Bytes) -> StorageResult<()> {
        let backend = self.registry.resolve(item.server_key)?;
        backend.ensure_bucket(&item.bucket).await?;
        backend
            .put(&item.bucket, &item.object_key, body, &item.content_type)
            .await?;

        let recorded = async {
            self.policies
                .apply(item.server_key, &item.bucket, &item.object_key, item.permission, false)
                .await?;
            file_items::insert(&*self.db, item).await
        }
        .await;
        if recorded.is_err() {
            self.discard_object(backend, item).await;
        }
        recorded
    }

    /// Best-effort cleanup of an object that never made it into the catalog.
    async fn discard_object(&self, backend: &Backend, item: &FileItem) {
        let cleanup = async {
            self.policies
                .apply(item.server_key, &item.bucket, &item.object_key, item.permission, true)
                .await?;
            backend.remove(&item.bucket, &item.object_key).await
        };
        if let Err(err) = cleanup.await {
            warn!(
                server = %item.server_key,
                bucket = %item.bucket,
                key = %item.object_key,
                error = %err,
                "orphaned object left behind"
            );
        }
    }

    /// Give a node a new name in the same directory.
    pub async fn rename(
        &self,
        caller: &Caller,
        id: Uuid,
        new_name: &str,
    ) -> StorageResult<FileItemView> {
        validate_name(new_name)?;
        let _guards = self
            .lock_scopes(&[Claim::Siblings(id), Claim::Node(id, Access::Exclusive)])
            .await?;
        let item = self.fetch_live(caller, id).await?;
        if item.name == new_name {
            return self.view(item);
        }
        self.ensure_name_free(item.owner_id, item.parent_id, new_name, Some(item.id))
            .await?;

        let prefix = item
            .object_key
            .strip_suffix(basename(&item.object_key))
            .unwrap_or_default();
        let new_key = child_key(prefix, new_name, item.kind);
        let parent_id = item.parent_id;
        self.relocate(item, new_name, parent_id, new_key).await
    }

    /// Re-parent a node; `None` moves it to the owner's top level.
    pub async fn move_item(
        &self,
        caller: &Caller,
        id: Uuid,
        new_parent_id: Option<Uuid>,
    ) -> StorageResult<FileItemView> {
        let owner_id = file_items::fetch(&*self.db, id).await?.owner_id;
        let _guards = self
            .lock_scopes(&[
                Claim::Node(id, Access::Exclusive),
                Claim::Names {
                    owner_id,
                    parent_id: new_parent_id,
                },
            ])
            .await?;
        let item = self.fetch_live(caller, id).await?;
        if item.parent_id == new_parent_id {
            return self.view(item);
        }
        let place = self.destination(caller, &item, new_parent_id).await?;
        self.ensure_name_free(place.owner_id, place.parent_id, &item.name, Some(item.id))
            .await?;

        let new_key = child_key(&place.prefix, &item.name, item.kind);
        let name = item.name.clone();
        self.relocate(item, &name, place.parent_id, new_key).await
    }

    /// Move the physical subtree, then repoint every row at its new key.
    async fn relocate(
        &self,
        item: FileItem,
        name: &str,
        parent_id: Option<Uuid>,
        new_key: String,
    ) -> StorageResult<FileItemView> {
        let rows = file_items::subtree(&*self.db, item.id).await?;
        self.directories
            .rename_or_move(
                item.server_key,
                &item.bucket,
                &item.object_key,
                &new_key,
                &key_permissions(&rows),
                TransferMode::Resume,
            )
            .await?;

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        file_items::relocate_root(&mut *tx, item.id, name, parent_id, &new_key, now).await?;
        for row in rows.iter().filter(|row| row.id != item.id) {
            let key = rebase(&row.object_key, &item.object_key, &new_key);
            file_items::set_object_key(&mut *tx, row.id, &key, now).await?;
        }
        tx.commit().await?;

        debug!(
            id = %item.id,
            old_key = %item.object_key,
            new_key = %new_key,
            nodes = rows.len(),
            "node relocated"
        );
        let updated = file_items::fetch(&*self.db, item.id).await?;
        self.view(updated)
    }

    /// Duplicate a node (and its whole subtree) into another directory.
    pub async fn copy(
        &self,
        caller: &Caller,
        id: Uuid,
        new_parent_id: Option<Uuid>,
    ) -> StorageResult<FileItemView> {
        let owner_id = file_items::fetch(&*self.db, id).await?.owner_id;
        let _guards = self
            .lock_scopes(&[
                Claim::Node(id, Access::Shared),
                Claim::Names {
                    owner_id,
                    parent_id: new_parent_id,
                },
            ])
            .await?;
        let item = self.fetch_live(caller, id).await?;
        let place = self.destination(caller, &item, new_parent_id).await?;
        self.ensure_name_free(place.owner_id, place.parent_id, &item.name, None)
            .await?;

        let rows = file_items::subtree(&*self.db, item.id).await?;
        let kb: i64 = rows
            .iter()
            .filter(|row| !row.is_directory())
            .map(|row| kb_for(row.size_bytes))
            .sum();
        self.quota.reserve_kb(item.owner_id, kb).await?;

        match self.copy_subtree(&item, &rows, &place).await {
            Ok(root) => {
                info!(
                    owner_id = root.owner_id,
                    source = %item.id,
                    id = %root.id,
                    nodes = rows.len(),
                    "node copied"
                );
                self.view(root)
            }
            Err(err) => {
                warn!(owner_id = item.owner_id, source = %item.id, error = %err, "copy failed");
                if let Err(release_err) = self.quota.release_kb(item.owner_id, kb).await {
                    warn!(owner_id = item.owner_id, error = %release_err, "could not release quota");
                }
                Err(err)
            }
        }
    }

    async fn copy_subtree(
        &self,
        item: &FileItem,
        rows: &[FileItem],
        place: &Placement,
    ) -> StorageResult<FileItem> {
        self.directories
            .copy_into(
                item.server_key,
                &item.bucket,
                &item.object_key,
                &place.prefix,
                &key_permissions(rows),
                TransferMode::Resume,
            )
            .await?;

        let root_key = child_key(&place.prefix, &item.name, item.kind);
        let now = Utc::now();
        let new_ids: HashMap<Uuid, Uuid> = rows.iter().map(|row| (row.id, Uuid::new_v4())).collect();
        let copies: Vec<FileItem> = rows
            .iter()
            .filter_map(|row| {
                let id = *new_ids.get(&row.id)?;
                let parent_id = if row.id == item.id {
                    place.parent_id
                } else {
                    row.parent_id.and_then(|parent| new_ids.get(&parent).copied())
                };
                Some(FileItem {
                    id,
                    parent_id,
                    object_key: rebase(&row.object_key, &item.object_key, &root_key),
                    created_at: now,
                    updated_at: now,
                    ..row.clone()
                })
            })
            .collect();

        let mut tx = self.db.begin().await?;
        for copy in &copies {
            file_items::insert(&mut *tx, copy).await?;
        }
        tx.commit().await?;

        copies
            .into_iter()
            .find(|copy| copy.object_key == root_key)
            .ok_or_else(|| StorageError::NotFound(format!("copy of `{}`", item.object_key)))
    }

    /// Set the permission of a file, or of a directory and everything in it.
    pub async fn change_permission(
        &self,
        caller: &Caller,
        id: Uuid,
        permission: Permission,
    ) -> StorageResult<FileItemView> {
        let _guards = self.lock_scopes(&[Claim::Node(id, Access::Exclusive)]).await?;
        let item = self.fetch_live(caller, id).await?;
        let rows = if item.is_directory() {
            file_items::subtree(&*self.db, id).await?
        } else {
            vec![item.clone()]
        };

        {
            let guard = self
                .policies
                .lock_bucket(item.server_key, &item.bucket)
                .await;
            self.policies
                .apply_many(
                    &guard,
                    rows.iter().map(|row| row.object_key.as_str()),
                    permission,
                    false,
                )
                .await
                .inspect_err(|err| {
                    warn!(
                        server = %item.server_key,
                        bucket = %item.bucket,
                        key = %item.object_key,
                        error = %err,
                        "permission change interrupted; re-run to converge"
                    )
                })?;
        }

        let updated_rows = file_items::set_permission(&*self.db, id, permission, Utc::now()).await?;
        debug!(id = %id, %permission, nodes = updated_rows, "permission changed");
        let updated = file_items::fetch(&*self.db, id).await?;
        self.view(updated)
    }

    /// Move a node and its descendants to the trash. Objects and quota stay.
    pub async fn soft_delete(&self, caller: &Caller, id: Uuid) -> StorageResult<()> {
        let _guards = self.lock_scopes(&[Claim::Node(id, Access::Exclusive)]).await?;
        let item = self.fetch_authorized(caller, id).await?;
        if item.is_deleted {
            return Ok(());
        }
        let marked = file_items::set_deleted(&*self.db, id, true, Utc::now()).await?;
        info!(owner_id = item.owner_id, id = %id, marked, "moved to trash");
        Ok(())
    }

    /// Bring a trashed node and its descendants back.
    pub async fn restore(&self, caller: &Caller, id: Uuid) -> StorageResult<FileItemView> {
        let _guards = self
            .lock_scopes(&[Claim::Siblings(id), Claim::Node(id, Access::Exclusive)])
            .await?;
        let item = self.fetch_authorized(caller, id).await?;
        if !item.is_deleted {
            return self.view(item);
        }
        if let Some(parent_id) = item.parent_id {
            let parent = file_items::fetch(&*self.db, parent_id).await?;
            if parent.is_deleted {
                return Err(StorageError::InvalidTarget(format!(
                    "parent of `{}` is in the trash; restore it first",
                    item.name
                )));
            }
        }
        if file_items::sibling_exists(
            &*self.db,
            item.owner_id,
            item.parent_id,
            &item.name,
            Some(item.id),
            false,
        )
        .await?
        {
            return Err(StorageError::AlreadyExists(format!(
                "`{}` in the original directory",
                item.name
            )));
        }

        let restored = file_items::set_deleted(&*self.db, id, false, Utc::now()).await?;
        info!(owner_id = item.owner_id, id = %id, restored, "restored from trash");
        let updated = file_items::fetch(&*self.db, id).await?;
        self.view(updated)
    }

    /// Destroy a node, its descendants and their objects, and give back
    /// their quota.
    pub async fn force_delete(&self, caller: &Caller, id: Uuid) -> StorageResult<()> {
        let _guards = self.lock_scopes(&[Claim::Node(id, Access::Exclusive)]).await?;
        let item = self.fetch_authorized(caller, id).await?;
        self.destroy(item).await
    }

    async fn destroy(&self, item: FileItem) -> StorageResult<()> {
        let rows = file_items::subtree(&*self.db, item.id).await?;
        let backend = self.registry.resolve(item.server_key)?;

        {
            let guard = self
                .policies
                .lock_bucket(item.server_key, &item.bucket)
                .await;
            self.policies
                .apply_many(
                    &guard,
                    rows.iter().map(|row| row.object_key.as_str()),
                    item.permission,
                    true,
                )
                .await?;
        }
        let removed = self.remove_objects(backend, &item).await?;

        let kb: i64 = rows
            .iter()
            .filter(|row| !row.is_directory())
            .map(|row| kb_for(row.size_bytes))
            .sum();
        let mut tx = self.db.begin().await?;
        let deleted = file_items::delete(&mut *tx, item.id).await?;
        release_in(&mut tx, item.owner_id, kb).await?;
        tx.commit().await?;

        info!(
            owner_id = item.owner_id,
            id = %item.id,
            nodes = deleted,
            objects = removed,
            released_kb = kb,
            "node destroyed"
        );
        Ok(())
    }

    /// Remove every object under the node's key, the directory marker last.
    async fn remove_objects(&self, backend: &Backend, item: &FileItem) -> StorageResult<usize> {
        let remove = |key: String| async move {
            backend
                .remove(&item.bucket, &key)
                .await
                .inspect_err(|err| {
                    warn!(
                        server = %item.server_key,
                        bucket = %item.bucket,
                        key = %key,
                        error = %err,
                        "force delete interrupted; re-run to converge"
                    )
                })
        };

        let mut removed = 0usize;
        if item.is_directory() {
            let mut keys = backend.list(&item.bucket, &item.object_key);
            while let Some(key) = keys.next().await {
                let key = key?;
                if key != item.object_key {
                    remove(key).await?;
                    removed += 1;
                }
            }
        }
        remove(item.object_key.clone()).await?;
        Ok(removed + 1)
    }

    /// Live nodes under `root_id`, or the owner's whole live forest.
    pub async fn tree(
        &self,
        caller: &Caller,
        root_id: Option<Uuid>,
    ) -> StorageResult<Vec<FileTreeNode>> {
        let forest = match root_id {
            Some(root_id) => {
                let root = self.fetch_authorized(caller, root_id).await?;
                if root.is_deleted {
                    return Err(StorageError::NotFound(format!("file item `{}`", root_id)));
                }
                let rows = file_items::subtree(&*self.db, root_id)
                    .await?
                    .into_iter()
                    .filter(|row| !row.is_deleted)
                    .collect();
                build_forest(rows, |row| row.id == root_id)
            }
            None => {
                let rows = file_items::by_owner(&*self.db, caller.owner_id)
                    .await?
                    .into_iter()
                    .filter(|row| !row.is_deleted)
                    .collect();
                build_forest(rows, |row| row.parent_id.is_none())
            }
        };
        debug!(
            owner_id = caller.owner_id,
            roots = forest.len(),
            nodes = forest.iter().map(FileTreeNode::node_count).sum::<usize>(),
            "tree listed"
        );
        Ok(forest)
    }

    /// The owner's trash: trashed nodes whose parent is live (or absent),
    /// each with its trashed descendants.
    pub async fn deleted_tree(&self, caller: &Caller) -> StorageResult<Vec<FileTreeNode>> {
        let trashed: Vec<FileItem> = file_items::by_owner(&*self.db, caller.owner_id)
            .await?
            .into_iter()
            .filter(|row| row.is_deleted)
            .collect();
        let trashed_ids: HashSet<Uuid> = trashed.iter().map(|row| row.id).collect();
        Ok(build_forest(trashed, |row| {
            row.parent_id
                .is_none_or(|parent| !trashed_ids.contains(&parent))
        }))
    }

    /// Force-delete every top-level trash entry. Returns how many were destroyed.
    pub async fn empty_trash(&self, caller: &Caller) -> StorageResult<usize> {
        let roots: Vec<Uuid> = self
            .deleted_tree(caller)
            .await?
            .into_iter()
            .map(|node| node.item.id)
            .collect();

        let mut destroyed = 0usize;
        for id in roots {
            let _guards = match self.lock_scopes(&[Claim::Node(id, Access::Exclusive)]).await {
                Ok(guards) => guards,
                Err(StorageError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let item = match file_items::fetch(&*self.db, id).await {
                Ok(item) if item.is_deleted => item,
                Ok(_) | Err(StorageError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            self.destroy(item).await?;
            destroyed += 1;
        }
        info!(owner_id = caller.owner_id, destroyed, "trash emptied");
        Ok(destroyed)
    }

    /// Signed, time-limited download URL of a file.
    pub async fn presign(&self, caller: &Caller, id: Uuid, ttl: Duration) -> StorageResult<String> {
        let item = self.fetch_live(caller, id).await?;
        if item.is_directory() {
            return Err(StorageError::InvalidTarget(format!(
                "`{}` is a directory",
                item.name
            )));
        }
        self.urls.presign(&item, ttl).await
    }

    /// Stream a file's bytes. Any caller may read public files, which the
    /// bucket policy already serves anonymously; private files only their
    /// owner or an admin.
    pub async fn download(&self, caller: &Caller, id: Uuid) -> StorageResult<Download> {
        let item = file_items::fetch(&*self.db, id).await?;
        if item.permission != Permission::Public {
            authorize(caller, &item)?;
        }
        if item.is_deleted {
            return Err(StorageError::NotFound(format!("file item `{}`", id)));
        }
        if item.is_directory() {
            return Err(StorageError::InvalidTarget(format!(
                "`{}` is a directory",
                item.name
            )));
        }
        let backend = self.registry.resolve(item.server_key)?;
        let stat = backend
            .stat(&item.bucket, &item.object_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("object `{}/{}`", item.bucket, item.object_key)))?;
        let body = backend.get(&item.bucket, &item.object_key).await?;
        Ok(Download {
            content_type: stat.content_type.unwrap_or_else(|| item.content_type.clone()),
            etag: stat.etag,
            item,
            body,
        })
    }

    pub async fn get_item(&self, caller: &Caller, id: Uuid) -> StorageResult<FileItemView> {
        let item = self.fetch_authorized(caller, id).await?;
        self.view(item)
    }

    /// Live direct children, directories first, then by name.
    pub async fn list_children(
        &self,
        caller: &Caller,
        parent_id: Option<Uuid>,
    ) -> StorageResult<Vec<FileItemView>> {
        let owner_id = match parent_id {
            Some(parent_id) => {
                let parent = self.fetch_live(caller, parent_id).await?;
                if !parent.is_directory() {
                    return Err(StorageError::InvalidTarget(format!(
                        "`{}` is not a directory",
                        parent.name
                    )));
                }
                parent.owner_id
            }
            None => caller.owner_id,
        };
        file_items::children(&*self.db, owner_id, parent_id, false)
            .await?
            .into_iter()
            .map(|item| self.view(item))
            .collect()
    }

    pub async fn quota_status(&self, caller: &Caller) -> StorageResult<StorageQuota> {
        self.quota.ensure_exists(caller.owner_id).await
    }

    /// Overwrite an owner's allowance. Admin only.
    pub async fn recharge(
        &self,
        caller: &Caller,
        owner_id: i64,
        quota_kb: i64,
        expire_at: DateTime<Utc>,
    ) -> StorageResult<StorageQuota> {
        if !caller.is_admin {
            return Err(StorageError::Unauthorized {
                owner_id: caller.owner_id,
                target: format!("quota of owner {}", owner_id),
            });
        }
        self.quota.recharge(owner_id, quota_kb, expire_at).await
    }

    /// Take the scope locks of `claims` in key order, so overlapping callers
    /// cannot deadlock. The plan is recomputed once the locks are held; if a
    /// node moved in between, the locks are released and taken again.
    async fn lock_scopes(&self, claims: &[Claim]) -> StorageResult<ScopeGuards> {
        loop {
            let plan = self.lock_plan(claims).await?;
            let mut guards = ScopeGuards::default();
            for (&scope, &access) in &plan {
                match access {
                    Access::Shared => guards._shared.push(self.scope_locks.lock_shared(scope).await),
                    Access::Exclusive => guards._exclusive.push(self.scope_locks.lock(scope).await),
                }
            }
            if self.lock_plan(claims).await? == plan {
                return Ok(guards);
            }
            debug!(?claims, "tree changed while locking, retrying");
        }
    }

    async fn lock_plan(&self, claims: &[Claim]) -> StorageResult<BTreeMap<Scope, Access>> {
        let mut plan = BTreeMap::new();
        for claim in claims {
            match *claim {
                Claim::Names {
                    owner_id,
                    parent_id: None,
                } => widen(&mut plan, (owner_id, None), Access::Exclusive),
                Claim::Names {
                    parent_id: Some(parent_id),
                    ..
                } => self.plan_chain(&mut plan, parent_id, 0, Access::Exclusive).await?,
                Claim::Node(id, access) => self.plan_chain(&mut plan, id, 0, access).await?,
                Claim::Siblings(id) => self.plan_chain(&mut plan, id, 1, Access::Exclusive).await?,
            }
        }
        Ok(plan)
    }

    /// Claim the scope `up` levels above `id` with `access`, and every scope
    /// above that one shared.
    async fn plan_chain(
        &self,
        plan: &mut BTreeMap<Scope, Access>,
        id: Uuid,
        up: usize,
        access: Access,
    ) -> StorageResult<()> {
        let chain = file_items::lineage(&*self.db, id).await?;
        let Some(&(_, owner_id)) = chain.first() else {
            return Err(StorageError::NotFound(format!("file item `{}`", id)));
        };
        let scopes: Vec<Option<Uuid>> = std::iter::once(None)
            .chain(chain.iter().map(|&(node, _)| Some(node)))
            .collect();
        let target = scopes.len().saturating_sub(1 + up);
        for (depth, &scope) in scopes.iter().enumerate().take(target + 1) {
            let wanted = if depth == target { access } else { Access::Shared };
            widen(plan, (owner_id, scope), wanted);
        }
        Ok(())
    }

    async fn fetch_authorized(&self, caller: &Caller, id: Uuid) -> StorageResult<FileItem> {
        let item = file_items::fetch(&*self.db, id).await?;
        authorize(caller, &item)?;
        Ok(item)
    }

    async fn fetch_live(&self, caller: &Caller, id: Uuid) -> StorageResult<FileItem> {
        let item = self.fetch_authorized(caller, id).await?;
        if item.is_deleted {
            return Err(StorageError::InvalidTarget(format!(
                "`{}` is in the trash",
                item.name
            )));
        }
        Ok(item)
    }

    /// Directory a new node goes into: a live directory, or the caller's top level.
    async fn placement(&self, caller: &Caller, parent_id: Option<Uuid>) -> StorageResult<Placement> {
        let Some(parent_id) = parent_id else {
            return Ok(Placement {
                owner_id: caller.owner_id,
                parent_id: None,
                server_key: self.default_server,
                bucket: self.default_bucket.clone(),
                prefix: root_prefix(caller.owner_id),
            });
        };
        let parent = self.fetch_live(caller, parent_id).await?;
        directory_placement(parent)
    }

    /// Target of a move or copy of `item`: same owner, same backend and
    /// bucket, never the item itself or one of its descendants.
    async fn destination(
        &self,
        caller: &Caller,
        item: &FileItem,
        parent_id: Option<Uuid>,
    ) -> StorageResult<Placement> {
        let Some(parent_id) = parent_id else {
            return Ok(Placement {
                owner_id: item.owner_id,
                parent_id: None,
                server_key: item.server_key,
                bucket: item.bucket.clone(),
                prefix: root_prefix(item.owner_id),
            });
        };
        if file_items::is_within(&*self.db, item.id, parent_id).await? {
            return Err(StorageError::InvalidTarget(format!(
                "cannot place `{}` inside itself",
                item.name
            )));
        }
        let parent = self.fetch_live(caller, parent_id).await?;
        if parent.owner_id != item.owner_id {
            return Err(StorageError::InvalidTarget(format!(
                "`{}` belongs to another owner",
                parent.name
            )));
        }
        if parent.server_key != item.server_key || parent.bucket != item.bucket {
            return Err(StorageError::InvalidTarget(format!(
                "`{}` lives on another backend",
                parent.name
            )));
        }
        directory_placement(parent)
    }

    /// Names are unique among siblings. Trashed siblings still hold their
    /// object key, so they count too.
    async fn ensure_name_free(
        &self,
        owner_id: i64,
        parent_id: Option<Uuid>,
        name: &str,
        except: Option<Uuid>,
    ) -> StorageResult<()> {
        if file_items::sibling_exists(&*self.db, owner_id, parent_id, name, except, true).await? {
            return Err(StorageError::AlreadyExists(format!("`{}` in the target directory", name)));
        }
        Ok(())
    }

    fn view(&self, item: FileItem) -> StorageResult<FileItemView> {
        let url = self.urls.public_url(&item)?;
        Ok(FileItemView { item, url })
    }
}

fn widen(plan: &mut BTreeMap<Scope, Access>, scope: Scope, access: Access) {
    let held = plan.entry(scope).or_insert(access);
    *held = (*held).max(access);
}

fn authorize(caller: &Caller, item: &FileItem) -> StorageResult<()> {
    if caller.can_access(item.owner_id) {
        Ok(())
    } else {
        Err(StorageError::Unauthorized {
            owner_id: caller.owner_id,
            target: format!("file item `{}`", item.id),
        })
    }
}

/// Non-empty, at most `MAX_NAME_LEN` characters, a single path segment.
pub fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(StorageError::InvalidTarget(format!(
            "name must be between 1 and {} characters",
            MAX_NAME_LEN
        )));
    }
    if name == "." || name == ".." || name.contains('/') || name.chars().any(char::is_control) {
        return Err(StorageError::InvalidTarget(format!("`{}` is not a valid name", name)));
    }
    Ok(())
}

fn root_prefix(owner_id: i64) -> String {
    format!("u{}/", owner_id)
}

fn child_key(prefix: &str, name: &str, kind: FileKind) -> String {
    match kind {
        FileKind::Directory => format!("{}{}/", prefix, name),
        FileKind::File => format!("{}{}", prefix, name),
    }
}

fn directory_placement(parent: FileItem) -> StorageResult<Placement> {
    if !parent.is_directory() {
        return Err(StorageError::InvalidTarget(format!(
            "`{}` is not a directory",
            parent.name
        )));
    }
    Ok(Placement {
        owner_id: parent.owner_id,
        parent_id: Some(parent.id),
        server_key: parent.server_key,
        bucket: parent.bucket,
        prefix: parent.object_key,
    })
}

fn new_item(
    place: &Placement,
    name: &str,
    kind: FileKind,
    permission: Permission,
    object_key: String,
    size_bytes: i64,
    content_type: &str,
) -> FileItem {
    let now = Utc::now();
    FileItem {
        id: Uuid::new_v4(),
        owner_id: place.owner_id,
        parent_id: place.parent_id,
        name: name.to_string(),
        kind,
        permission,
        server_key: place.server_key,
        bucket: place.bucket.clone(),
        object_key,
        size_bytes,
        content_type: content_type.to_string(),
        is_deleted: false,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Per-key permissions of a subtree, as recorded in the catalog.
fn key_permissions(rows: &[FileItem]) -> KeyPermissions {
    let default = rows
        .first()
        .map_or(Permission::Private, |row| row.permission);
    let mut permissions = KeyPermissions::uniform(default);
    for row in rows {
        permissions.insert(row.object_key.clone(), row.permission);
    }
    permissions
}

fn build_forest(rows: Vec<FileItem>, is_root: impl Fn(&FileItem) -> bool) -> Vec<FileTreeNode> {
    let (roots, rest): (Vec<FileItem>, Vec<FileItem>) =
        rows.into_iter().partition(|row| is_root(row));
    let mut by_parent: HashMap<Uuid, Vec<FileItem>> = HashMap::new();
    for row in rest {
        if let Some(parent_id) = row.parent_id {
            by_parent.entry(parent_id).or_default().push(row);
        }
    }
    let mut forest: Vec<FileTreeNode> = roots
        .into_iter()
        .map(|root| attach(root, &mut by_parent))
        .collect();
    sort_nodes(&mut forest);
    forest
}

fn attach(item: FileItem, by_parent: &mut HashMap<Uuid, Vec<FileItem>>) -> FileTreeNode {
    let mut children: Vec<FileTreeNode> = by_parent
        .remove(&item.id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| attach(child, by_parent))
        .collect();
    sort_nodes(&mut children);
    FileTreeNode { item, children }
}

fn sort_nodes(nodes: &mut [FileTreeNode]) {
    nodes.sort_by(|a, b| {
        b.item
            .is_directory()
            .cmp(&a.item.is_directory())
            .then_with(|| a.item.name.cmp(&b.item.name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{ScratchDatabase, memory_pool},
        services::{backend::ObjectBackend, memory_backend::MemoryBackend},
    };
    use futures::TryStreamExt;

    const OWNER: Caller = Caller {
        owner_id: 7,
        is_admin: false,
    };
    const STRANGER: Caller = Caller {
        owner_id: 8,
        is_admin: false,
    };
    const ADMIN: Caller = Caller {
        owner_id: 1,
        is_admin: true,
    };

    struct Harness {
        service: StorageService,
        memory: Arc<MemoryBackend>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_pool(memory_pool().await).await
        }

        async fn with_pool(pool: SqlitePool) -> Self {
            let memory = Arc::new(MemoryBackend::new());
            let registry = Arc::new(BackendRegistry::new().with_backend(
                ServerKey::S1,
                "files.test",
                memory.clone(),
                Duration::from_secs(5),
            ));
            let service = StorageService::new(
                Arc::new(pool),
                registry,
                ServerKey::S1,
                "b",
                Duration::from_secs(3600),
            );
            service
                .recharge(&ADMIN, OWNER.owner_id, 1024, Utc::now() + chrono::Duration::hours(1))
                .await
                .unwrap();
            Self { service, memory }
        }

        async fn upload(
            &self,
            parent: Option<Uuid>,
            name: &str,
            size: usize,
            permission: Permission,
        ) -> FileItemView {
            self.service
                .upload_file(&OWNER, parent, name, Bytes::from(vec![b'x'; size]), None, permission)
                .await
                .unwrap()
        }

        async fn mkdir(&self, parent: Option<Uuid>, name: &str, permission: Permission) -> FileItemView {
            self.service
                .create_directory(&OWNER, parent, name, permission)
                .await
                .unwrap()
        }

        async fn used_kb(&self) -> i64 {
            self.service.quota_status(&OWNER).await.unwrap().used_space_kb
        }

        async fn policy_document(&self) -> Option<String> {
            self.memory.get_bucket_policy("b").await.ok()
        }

        async fn item(&self, id: Uuid) -> FileItem {
            self.service.get_item(&OWNER, id).await.unwrap().item
        }
    }

    fn arn(key: &str) -> String {
        format!("arn:aws:s3:::b/{}", key)
    }

    fn names(nodes: &[FileTreeNode]) -> Vec<&str> {
        nodes.iter().map(|node| node.item.name.as_str()).collect()
    }

    #[tokio::test]
    async fn upload_reserves_rounded_quota_and_publishes() {
        let h = Harness::new().await;
        let n1 = h.upload(None, "a.txt", 1536, Permission::Public).await;

        assert_eq!(n1.item.object_key, "u7/a.txt");
        assert_eq!(n1.item.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(n1.url, "https://files.test/b/u7/a.txt");
        assert_eq!(h.used_kb().await, 2);
        assert_eq!(
            h.memory.policy("b").resources(Permission::Public),
            vec![arn("u7/a.txt")]
        );
    }

    #[tokio::test]
    async fn making_a_file_private_drops_the_empty_public_statement() {
        let h = Harness::new().await;
        let n1 = h.upload(None, "a.txt", 1536, Permission::Public).await;

        let updated = h
            .service
            .change_permission(&OWNER, n1.item.id, Permission::Private)
            .await
            .unwrap();

        assert_eq!(updated.item.permission, Permission::Private);
        let policy = h.memory.policy("b");
        assert!(policy.resources(Permission::Public).is_empty());
        assert_eq!(policy.resources(Permission::Private), vec![arn("u7/a.txt")]);
        assert_eq!(policy.statements().len(), 1);
    }

    #[tokio::test]
    async fn renaming_a_directory_rekeys_its_descendants() {
        let h = Harness::new().await;
        let n2 = h.mkdir(None, "d", Permission::Public).await;
        assert_eq!(h.memory.keys("b"), vec!["u7/d/"]);
        let n3 = h.upload(Some(n2.item.id), "x", 0, Permission::Public).await;

        let renamed = h.service.rename(&OWNER, n2.item.id, "e").await.unwrap();

        assert_eq!(renamed.item.object_key, "u7/e/");
        assert_eq!(renamed.item.name, "e");
        assert_eq!(h.item(n3.item.id).await.object_key, "u7/e/x");
        assert_eq!(h.memory.keys("b"), vec!["u7/e/", "u7/e/x"]);
        let policy = h.memory.policy("b");
        assert_eq!(policy.permission_of(&arn("u7/e/x")), Some(Permission::Public));
        assert_eq!(policy.permission_of(&arn("u7/d/x")), None);
    }

    #[tokio::test]
    async fn trash_and_restore_leave_tree_and_policy_unchanged() {
        let h = Harness::new().await;
        let n2 = h.mkdir(None, "d", Permission::Public).await;
        h.upload(Some(n2.item.id), "x", 0, Permission::Private).await;
        let tree_before = h.service.tree(&OWNER, None).await.unwrap();
        let policy_before = h.policy_document().await;

        h.service.soft_delete(&OWNER, n2.item.id).await.unwrap();
        assert!(h.service.tree(&OWNER, None).await.unwrap().is_empty());
        let trash = h.service.deleted_tree(&OWNER).await.unwrap();
        assert_eq!(names(&trash), vec!["d"]);
        assert_eq!(names(&trash[0].children), vec!["x"]);
        assert!(trash[0].children[0].item.is_deleted);
        assert_eq!(h.used_kb().await, 0);

        h.service.restore(&OWNER, n2.item.id).await.unwrap();
        let tree_after = h.service.tree(&OWNER, None).await.unwrap();
        assert_eq!(tree_after.len(), 1);
        assert_eq!(tree_after[0].node_count(), tree_before[0].node_count());
        assert!(!tree_after[0].children[0].item.is_deleted);
        assert!(h.service.deleted_tree(&OWNER).await.unwrap().is_empty());
        assert_eq!(h.policy_document().await, policy_before);
    }

    #[tokio::test]
    async fn force_delete_removes_objects_rows_and_quota() {
        let h = Harness::new().await;
        let n2 = h.mkdir(None, "d", Permission::Public).await;
        h.upload(Some(n2.item.id), "x", 2048, Permission::Public).await;
        h.upload(Some(n2.item.id), "y", 1, Permission::Private).await;
        assert_eq!(h.used_kb().await, 3);

        h.service.force_delete(&OWNER, n2.item.id).await.unwrap();

        assert!(h.memory.keys("b").is_empty());
        assert_eq!(h.used_kb().await, 0);
        assert!(h.policy_document().await.is_none());
        assert!(matches!(
            h.service.get_item(&OWNER, n2.item.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_of_a_vanished_object_changes_nothing() {
        let h = Harness::new().await;
        let n1 = h.upload(None, "a.txt", 10, Permission::Public).await;
        h.memory.remove("b", "u7/a.txt").await.unwrap();
        let policy_before = h.policy_document().await;

        let err = h.service.rename(&OWNER, n1.item.id, "b.txt").await.unwrap_err();

        assert!(matches!(err, StorageError::NotFound(_)));
        assert_eq!(h.item(n1.item.id).await, n1.item);
        assert_eq!(h.policy_document().await, policy_before);
    }

    #[tokio::test]
    async fn rename_there_and_back_is_a_round_trip() {
        let h = Harness::new().await;
        let d = h.mkdir(None, "d", Permission::Private).await;
        h.upload(Some(d.item.id), "x", 5, Permission::Public).await;
        let policy_before = h.memory.policy("b");
        let keys_before = h.memory.keys("b");

        h.service.rename(&OWNER, d.item.id, "e").await.unwrap();
        let back = h.service.rename(&OWNER, d.item.id, "d").await.unwrap();

        assert_eq!(back.item.object_key, d.item.object_key);
        assert_eq!(h.memory.keys("b"), keys_before);
        assert_eq!(h.memory.policy("b"), policy_before);
    }

    #[tokio::test]
    async fn renaming_to_the_same_name_writes_nothing() {
        let h = Harness::new().await;
        let n1 = h.upload(None, "a.txt", 10, Permission::Public).await;
        h.memory.fail_on("set_bucket_policy");
        h.memory.fail_on("copy");

        let same = h.service.rename(&OWNER, n1.item.id, "a.txt").await.unwrap();
        assert_eq!(same.item, n1.item);
    }

    #[tokio::test]
    async fn sibling_name_collisions_are_refused() {
        let h = Harness::new().await;
        let a = h.upload(None, "a", 1, Permission::Public).await;
        h.upload(None, "b", 1, Permission::Public).await;

        let err = h.service.rename(&OWNER, a.item.id, "b").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        let err = h
            .service
            .create_directory(&OWNER, None, "a", Permission::Public)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn invalid_names_are_refused_before_any_write() {
        let h = Harness::new().await;
        let long = "n".repeat(MAX_NAME_LEN + 1);
        for name in ["", ".", "..", "a/b", "tab\there", long.as_str()] {
            let err = h
                .service
                .create_directory(&OWNER, None, name, Permission::Public)
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidTarget(_)), "{name:?}");
        }
        assert!(validate_name(&"n".repeat(MAX_NAME_LEN)).is_ok());
        assert!(h.memory.keys("b").is_empty());
    }

    #[tokio::test]
    async fn failed_put_releases_the_reservation() {
        let h = Harness::new().await;
        h.mkdir(None, "warmup", Permission::Public).await;
        h.memory.fail_on("put");

        let err = h
            .service
            .upload_file(&OWNER, None, "a.txt", Bytes::from_static(&[1; 4096]), None, Permission::Public)
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Backend { op: "put", .. }));
        assert_eq!(h.used_kb().await, 0);
        assert_eq!(names(&h.service.tree(&OWNER, None).await.unwrap()), vec!["warmup"]);
    }

    #[tokio::test]
    async fn failed_policy_write_releases_quota_and_removes_the_object() {
        let h = Harness::new().await;
        h.mkdir(None, "warmup", Permission::Public).await;
        h.memory.fail_on("set_bucket_policy");

        let err = h
            .service
            .upload_file(&OWNER, None, "a.txt", Bytes::from_static(b"data"), None, Permission::Private)
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Backend { .. }));
        assert_eq!(h.used_kb().await, 0);
        assert_eq!(h.memory.keys("b"), vec!["u7/warmup/"]);
    }

    #[tokio::test]
    async fn over_quota_upload_leaves_no_trace() {
        let h = Harness::new().await;
        let err = h
            .service
            .upload_file(
                &OWNER,
                None,
                "big.bin",
                Bytes::from(vec![0; 1024 * 1024 + 1]),
                Some("application/zip"),
                Permission::Public,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::QuotaExceeded { requested_kb: 1025, .. }));
        assert!(h.memory.keys("b").is_empty());
        assert_eq!(h.used_kb().await, 0);
    }

    #[tokio::test]
    async fn new_owner_gets_a_quota_refusal() {
        let h = Harness::new().await;
        let err = h
            .service
            .upload_file(&STRANGER, None, "a", Bytes::from_static(b"a"), None, Permission::Public)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn strangers_are_unauthorized_and_admins_are_not() {
        let h = Harness::new().await;
        let n1 = h.upload(None, "a.txt", 10, Permission::Private).await;

        for result in [
            h.service.rename(&STRANGER, n1.item.id, "b").await.map(|_| ()),
            h.service.soft_delete(&STRANGER, n1.item.id).await,
            h.service.force_delete(&STRANGER, n1.item.id).await,
            h.service.get_item(&STRANGER, n1.item.id).await.map(|_| ()),
        ] {
            assert!(matches!(result, Err(StorageError::Unauthorized { owner_id: 8, .. })));
        }
        assert!(matches!(
            h.service.recharge(&OWNER, 7, 1 << 20, Utc::now()).await,
            Err(StorageError::Unauthorized { .. })
        ));

        let renamed = h.service.rename(&ADMIN, n1.item.id, "b.txt").await.unwrap();
        assert_eq!(renamed.item.object_key, "u7/b.txt");
        assert_eq!(renamed.item.owner_id, 7);
    }

    #[tokio::test]
    async fn move_updates_parent_and_keys() {
        let h = Harness::new().await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        let a = h.upload(None, "a", 3, Permission::Private).await;

        let moved = h.service.move_item(&OWNER, a.item.id, Some(d.item.id)).await.unwrap();
        assert_eq!(moved.item.parent_id, Some(d.item.id));
        assert_eq!(moved.item.object_key, "u7/d/a");
        assert_eq!(h.memory.keys("b"), vec!["u7/d/", "u7/d/a"]);
        assert_eq!(
            h.memory.policy("b").permission_of(&arn("u7/d/a")),
            Some(Permission::Private)
        );

        let back = h.service.move_item(&OWNER, a.item.id, None).await.unwrap();
        assert_eq!(back.item.parent_id, None);
        assert_eq!(back.item.object_key, "u7/a");
    }

    #[tokio::test]
    async fn moving_into_a_descendant_is_invalid() {
        let h = Harness::new().await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        let sub = h.mkdir(Some(d.item.id), "sub", Permission::Public).await;
        let keys_before = h.memory.keys("b");

        for target in [d.item.id, sub.item.id] {
            let err = h
                .service
                .move_item(&OWNER, d.item.id, Some(target))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidTarget(_)));
        }
        assert_eq!(h.memory.keys("b"), keys_before);
    }

    #[tokio::test]
    async fn copy_mirrors_the_subtree_and_charges_quota() {
        let h = Harness::new().await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        h.upload(Some(d.item.id), "x", 1024, Permission::Private).await;
        let t = h.mkdir(None, "t", Permission::Public).await;

        let copy = h.service.copy(&OWNER, d.item.id, Some(t.item.id)).await.unwrap();

        assert_ne!(copy.item.id, d.item.id);
        assert_eq!(copy.item.object_key, "u7/t/d/");
        assert_eq!(copy.item.parent_id, Some(t.item.id));
        assert_eq!(h.used_kb().await, 2);
        assert_eq!(
            h.memory.keys("b"),
            vec!["u7/d/", "u7/d/x", "u7/t/", "u7/t/d/", "u7/t/d/x"]
        );
        let tree = h.service.tree(&OWNER, Some(copy.item.id)).await.unwrap();
        assert_eq!(names(&tree[0].children), vec!["x"]);
        assert_eq!(tree[0].children[0].item.permission, Permission::Private);
        assert_eq!(
            h.memory.policy("b").permission_of(&arn("u7/t/d/x")),
            Some(Permission::Private)
        );
    }

    #[tokio::test]
    async fn copy_into_the_same_directory_collides() {
        let h = Harness::new().await;
        let a = h.upload(None, "a", 3, Permission::Public).await;
        let err = h.service.copy(&OWNER, a.item.id, None).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert_eq!(h.used_kb().await, 1);
    }

    #[tokio::test]
    async fn copy_without_quota_changes_nothing() {
        let h = Harness::new().await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        h.upload(Some(d.item.id), "x", 600 * 1024, Permission::Public).await;
        let t = h.mkdir(None, "t", Permission::Public).await;
        let keys_before = h.memory.keys("b");

        let err = h.service.copy(&OWNER, d.item.id, Some(t.item.id)).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(h.memory.keys("b"), keys_before);
        assert_eq!(h.used_kb().await, 600);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_on_one_name_admit_one_winner() {
        let scratch = ScratchDatabase::open().await;
        let h = Harness::with_pool(scratch.pool.clone()).await;

        let (a, b) = tokio::join!(
            h.service.upload_file(&OWNER, None, "a.txt", Bytes::from_static(b"first"), None, Permission::Public),
            h.service.upload_file(&OWNER, None, "a.txt", Bytes::from_static(b"second"), None, Permission::Public),
        );
        let uploads = [a, b];
        assert_eq!(uploads.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(uploads.iter().any(|r| matches!(r, Err(StorageError::AlreadyExists(_)))));
        assert_eq!(h.used_kb().await, 1);

        let x = h.upload(None, "x", 1, Permission::Public).await;
        let y = h.upload(None, "y", 2000, Permission::Public).await;
        let (rx, ry) = tokio::join!(
            h.service.rename(&OWNER, x.item.id, "z"),
            h.service.rename(&OWNER, y.item.id, "z"),
        );
        let winner = match (rx, ry) {
            (Ok(winner), Err(StorageError::AlreadyExists(_)))
            | (Err(StorageError::AlreadyExists(_)), Ok(winner)) => winner,
            other => panic!("expected exactly one rename to win, got {other:?}"),
        };

        let named_z = file_items::by_owner(&*h.service.db, OWNER.owner_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|row| row.name == "z")
            .count();
        assert_eq!(named_z, 1);
        let stored = h.memory.stat("b", "u7/z").await.unwrap();
        assert_eq!(stored.size_bytes, winner.item.size_bytes);
        assert_eq!(h.memory.keys("b").len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn uploads_racing_a_directory_rename_stay_in_step() {
        let scratch = ScratchDatabase::open().await;
        let h = Harness::with_pool(scratch.pool.clone()).await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        let sub = h.mkdir(Some(d.item.id), "sub", Permission::Public).await;
        for i in 0..20 {
            h.upload(Some(sub.item.id), &format!("f{i}"), 1, Permission::Public)
                .await;
        }

        for round in 0..5 {
            let new_name = format!("e{round}");
            let late_name = format!("late{round}");
            let (renamed, uploaded) = tokio::join!(
                h.service.rename(&OWNER, d.item.id, &new_name),
                h.service.upload_file(
                    &OWNER,
                    Some(sub.item.id),
                    &late_name,
                    Bytes::from_static(b"z"),
                    None,
                    Permission::Public,
                ),
            );
            renamed.unwrap();
            uploaded.unwrap();
        }

        let mut catalog: Vec<String> = file_items::by_owner(&*h.service.db, OWNER.owner_id)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.object_key)
            .collect();
        let mut stored = h.memory.keys("b");
        catalog.sort();
        stored.sort();
        assert_eq!(catalog, stored);
        assert_eq!(catalog.len(), 2 + 20 + 5);
        assert!(catalog.iter().all(|key| key.starts_with("u7/e4/")), "{catalog:?}");
    }

    #[tokio::test]
    async fn lock_plans_share_ancestors_and_claim_the_target() {
        let h = Harness::new().await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        let sub = h.mkdir(Some(d.item.id), "sub", Permission::Public).await;
        let x = h.upload(Some(sub.item.id), "x", 1, Permission::Public).await;
        let (d, sub, x) = (d.item.id, sub.item.id, x.item.id);

        let plan = h
            .service
            .lock_plan(&[Claim::Node(x, Access::Exclusive)])
            .await
            .unwrap();
        assert_eq!(
            plan.into_iter().collect::<Vec<_>>(),
            vec![
                ((7, None), Access::Shared),
                ((7, Some(d)), Access::Shared),
                ((7, Some(sub)), Access::Shared),
                ((7, Some(x)), Access::Exclusive),
            ]
        );

        let plan = h
            .service
            .lock_plan(&[Claim::Siblings(d), Claim::Node(d, Access::Exclusive)])
            .await
            .unwrap();
        assert_eq!(plan.get(&(7, None)), Some(&Access::Exclusive));
        assert_eq!(plan.get(&(7, Some(d))), Some(&Access::Exclusive));

        assert!(matches!(
            h.service.lock_plan(&[Claim::Node(Uuid::new_v4(), Access::Shared)]).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn directory_permission_reaches_every_descendant() {
        let h = Harness::new().await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        let sub = h.mkdir(Some(d.item.id), "sub", Permission::Public).await;
        h.upload(Some(d.item.id), "x", 1, Permission::Public).await;
        h.upload(Some(sub.item.id), "y", 1, Permission::Public).await;

        h.service
            .change_permission(&OWNER, d.item.id, Permission::Private)
            .await
            .unwrap();

        let policy = h.memory.policy("b");
        for key in ["u7/d/", "u7/d/sub/", "u7/d/x", "u7/d/sub/y"] {
            assert_eq!(policy.permission_of(&arn(key)), Some(Permission::Private), "{key}");
        }
        assert!(policy.resources(Permission::Public).is_empty());
        let tree = h.service.tree(&OWNER, Some(d.item.id)).await.unwrap();
        assert_eq!(tree[0].node_count(), 4);
        fn all_private(node: &FileTreeNode) -> bool {
            node.item.permission == Permission::Private && node.children.iter().all(all_private)
        }
        assert!(all_private(&tree[0]));
    }

    #[tokio::test]
    async fn trashed_names_stay_reserved_until_restored() {
        let h = Harness::new().await;
        let a = h.upload(None, "a", 1, Permission::Public).await;
        let b = h.upload(None, "b", 1, Permission::Public).await;
        h.service.soft_delete(&OWNER, a.item.id).await.unwrap();

        let err = h
            .service
            .upload_file(&OWNER, None, "a", Bytes::from_static(b"z"), None, Permission::Public)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        let err = h.service.rename(&OWNER, b.item.id, "a").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let restored = h.service.restore(&OWNER, a.item.id).await.unwrap();
        assert!(!restored.item.is_deleted);
        assert_eq!(h.memory.keys("b"), vec!["u7/a", "u7/b"]);
    }

    #[tokio::test]
    async fn children_of_a_trashed_directory_wait_for_their_parent() {
        let h = Harness::new().await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        let x = h.upload(Some(d.item.id), "x", 1, Permission::Public).await;
        h.service.soft_delete(&OWNER, d.item.id).await.unwrap();

        let err = h.service.restore(&OWNER, x.item.id).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTarget(_)));
        let err = h
            .service
            .upload_file(&OWNER, Some(d.item.id), "y", Bytes::new(), None, Permission::Public)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn empty_trash_destroys_only_trashed_nodes() {
        let h = Harness::new().await;
        let keep = h.upload(None, "keep", 1024, Permission::Public).await;
        let d = h.mkdir(None, "d", Permission::Public).await;
        h.upload(Some(d.item.id), "x", 1024, Permission::Public).await;
        let loose = h.upload(None, "loose", 1024, Permission::Private).await;
        h.service.soft_delete(&OWNER, d.item.id).await.unwrap();
        h.service.soft_delete(&OWNER, loose.item.id).await.unwrap();

        assert_eq!(h.service.empty_trash(&OWNER).await.unwrap(), 2);

        assert_eq!(h.memory.keys("b"), vec!["u7/keep"]);
        assert_eq!(h.used_kb().await, 1);
        assert!(h.service.deleted_tree(&OWNER).await.unwrap().is_empty());
        assert_eq!(h.item(keep.item.id).await, keep.item);
    }

    #[tokio::test]
    async fn download_respects_permission() {
        let h = Harness::new().await;
        let public = h
            .service
            .upload_file(
                &OWNER,
                None,
                "pub.txt",
                Bytes::from_static(b"hello"),
                Some("text/plain"),
                Permission::Public,
            )
            .await
            .unwrap();
        let private = h.upload(None, "priv", 3, Permission::Private).await;
        let d = h.mkdir(None, "d", Permission::Public).await;

        let download = h.service.download(&STRANGER, public.item.id).await.unwrap();
        assert_eq!(download.item.id, public.item.id);
        assert_eq!(download.content_type, "text/plain");
        assert_eq!(download.etag, Some(format!("{:x}", md5::compute(b"hello"))));
        let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello");

        assert!(matches!(
            h.service.download(&STRANGER, private.item.id).await,
            Err(StorageError::Unauthorized { .. })
        ));
        assert!(h.service.download(&OWNER, private.item.id).await.is_ok());
        assert!(matches!(
            h.service.download(&OWNER, d.item.id).await,
            Err(StorageError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn presign_validates_target_and_ttl() {
        let h = Harness::new().await;
        let a = h.upload(None, "a", 3, Permission::Private).await;
        let d = h.mkdir(None, "d", Permission::Private).await;

        let url = h
            .service
            .presign(&OWNER, a.item.id, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(url.contains("X-Amz-Expires=300"));
        assert!(matches!(
            h.service.presign(&OWNER, d.item.id, Duration::from_secs(300)).await,
            Err(StorageError::InvalidTarget(_))
        ));
        assert!(matches!(
            h.service.presign(&OWNER, a.item.id, Duration::from_secs(7200)).await,
            Err(StorageError::InvalidTarget(_))
        ));
        assert!(matches!(
            h.service.presign(&STRANGER, a.item.id, Duration::from_secs(60)).await,
            Err(StorageError::Unauthorized { .. })
        ));
    }

    #[tokio::test]
    async fn listings_put_directories_first() {
        let h = Harness::new().await;
        h.upload(None, "b.txt", 1, Permission::Public).await;
        let z = h.mkdir(None, "z", Permission::Public).await;
        h.upload(None, "a.txt", 1, Permission::Public).await;
        h.upload(Some(z.item.id), "inner", 1, Permission::Public).await;

        let listed: Vec<String> = h
            .service
            .list_children(&OWNER, None)
            .await
            .unwrap()
            .into_iter()
            .map(|view| view.item.name)
            .collect();
        assert_eq!(listed, vec!["z", "a.txt", "b.txt"]);

        let tree = h.service.tree(&OWNER, None).await.unwrap();
        assert_eq!(names(&tree), vec!["z", "a.txt", "b.txt"]);
        assert_eq!(names(&tree[0].children), vec!["inner"]);

        let inside = h.service.list_children(&OWNER, Some(z.item.id)).await.unwrap();
        assert_eq!(inside[0].url, "https://files.test/b/u7/z/inner");
    }

    #[tokio::test]
    async fn backend_timeouts_surface_as_such() {
        let pool = Arc::new(memory_pool().await);
        let stalled = Arc::new(StalledBackend);
        let registry = Arc::new(BackendRegistry::new().with_backend(
            ServerKey::S1,
            "files.test",
            stalled,
            Duration::from_millis(20),
        ));
        let service =
            StorageService::new(pool, registry, ServerKey::S1, "b", Duration::from_secs(60));

        let err = service
            .create_directory(&OWNER, None, "d", Permission::Public)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BackendTimeout { op: "ensure_bucket", .. }));
    }

    /// Backend whose every call hangs.
    struct StalledBackend;

    #[async_trait::async_trait]
    impl ObjectBackend for StalledBackend {
        async fn put(&self, _: &str, _: &str, _: Bytes, _: &str) -> crate::services::backend::BackendResult<()> {
            futures::future::pending().await
        }
        async fn get(&self, _: &str, _: &str) -> crate::services::backend::BackendResult<ByteStream> {
            futures::future::pending().await
        }
        async fn stat(
            &self,
            _: &str,
            _: &str,
        ) -> crate::services::backend::BackendResult<crate::services::backend::ObjectStat> {
            futures::future::pending().await
        }
        async fn remove(&self, _: &str, _: &str) -> crate::services::backend::BackendResult<()> {
            futures::future::pending().await
        }
        async fn copy(&self, _: &str, _: &str, _: &str) -> crate::services::backend::BackendResult<()> {
            futures::future::pending().await
        }
        fn list(&self, _: &str, _: &str) -> crate::services::backend::KeyStream {
            futures::stream::pending().boxed()
        }
        async fn presign_get(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> crate::services::backend::BackendResult<String> {
            futures::future::pending().await
        }
        async fn ensure_bucket(&self, _: &str) -> crate::services::backend::BackendResult<()> {
            futures::future::pending().await
        }
        async fn get_bucket_policy(&self, _: &str) -> crate::services::backend::BackendResult<String> {
            futures::future::pending().await
        }
        async fn set_bucket_policy(&self, _: &str, _: &str) -> crate::services::backend::BackendResult<()> {
            futures::future::pending().await
        }
        async fn delete_bucket_policy(&self, _: &str) -> crate::services::backend::BackendResult<()> {
            futures::future::pending().await
        }
    }
}
