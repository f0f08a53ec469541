//! SQL access to `file_items` rows.
//!
//! Functions take any SQLite executor so they run equally on the pool and
//! inside a transaction.

use super::error::{StorageError, StorageResult};
use crate::models::file_item::{FileItem, Permission};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqliteExecutor, sqlite::Sqlite};
use uuid::Uuid;

pub(crate) const ITEM_COLUMNS: &str = "id, owner_id, parent_id, name, kind, permission, \
     server_key, bucket, object_key, size_bytes, content_type, is_deleted, deleted_at, \
     created_at, updated_at";

pub async fn fetch(db: impl SqliteExecutor<'_>, id: Uuid) -> StorageResult<FileItem> {
    sqlx::query_as::<_, FileItem>(&format!(
        "SELECT {ITEM_COLUMNS} FROM file_items WHERE id = ?"
    ))
    .bind(id)
    .fetch_one(db)
    .await
    .map_err(|err| match err {
        sqlx::Error::RowNotFound => StorageError::NotFound(format!("file item `{}`", id)),
        other => StorageError::Sqlx(other),
    })
}

/// The node and every descendant, trashed or not, ordered by object key so
/// parents precede their children.
pub async fn subtree(db: impl SqliteExecutor<'_>, id: Uuid) -> StorageResult<Vec<FileItem>> {
    let rows = sqlx::query_as::<_, FileItem>(&format!(
        "WITH RECURSIVE subtree(id) AS (
             SELECT id FROM file_items WHERE id = ?
             UNION ALL
             SELECT f.id FROM file_items f JOIN subtree s ON f.parent_id = s.id
         )
         SELECT {ITEM_COLUMNS} FROM file_items
         WHERE id IN (SELECT id FROM subtree)
         ORDER BY object_key"
    ))
    .bind(id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Whether `ancestor` lies on the parent chain of `node` (or is `node`).
pub async fn is_within(
    db: impl SqliteExecutor<'_>,
    ancestor: Uuid,
    node: Uuid,
) -> StorageResult<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "WITH RECURSIVE chain(id, parent_id) AS (
             SELECT id, parent_id FROM file_items WHERE id = ?
             UNION ALL
             SELECT f.id, f.parent_id FROM file_items f JOIN chain c ON f.id = c.parent_id
         )
         SELECT 1 FROM chain WHERE id = ? LIMIT 1",
    )
    .bind(node)
    .bind(ancestor)
    .fetch_optional(db)
    .await?;
    Ok(found.is_some())
}

/// Direct children of `parent_id` (top-level nodes when `None`).
pub async fn children(
    db: impl SqliteExecutor<'_>,
    owner_id: i64,
    parent_id: Option<Uuid>,
    include_deleted: bool,
) -> StorageResult<Vec<FileItem>> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {ITEM_COLUMNS} FROM file_items WHERE owner_id = "
    ));
    builder.push_bind(owner_id);
    builder.push(" AND parent_id IS ");
    builder.push_bind(parent_id);
    if !include_deleted {
        builder.push(" AND is_deleted = 0");
    }
    builder.push(" ORDER BY kind = 'file', name");
    Ok(builder.build_query_as().fetch_all(db).await?)
}

pub async fn by_owner(db: impl SqliteExecutor<'_>, owner_id: i64) -> StorageResult<Vec<FileItem>> {
    let rows = sqlx::query_as::<_, FileItem>(&format!(
        "SELECT {ITEM_COLUMNS} FROM file_items WHERE owner_id = ? ORDER BY object_key"
    ))
    .bind(owner_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Whether a sibling other than `except` already carries `name`.
/// Trashed siblings count when `include_deleted` is set, since they still
/// hold their physical key.
pub async fn sibling_exists(
    db: impl SqliteExecutor<'_>,
    owner_id: i64,
    parent_id: Option<Uuid>,
    name: &str,
    except: Option<Uuid>,
    include_deleted: bool,
) -> StorageResult<bool> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT 1 FROM file_items WHERE owner_id = ");
    builder.push_bind(owner_id);
    builder.push(" AND parent_id IS ");
    builder.push_bind(parent_id);
    builder.push(" AND name = ");
    builder.push_bind(name);
    if let Some(except) = except {
        builder.push(" AND id <> ");
        builder.push_bind(except);
    }
    if !include_deleted {
        builder.push(" AND is_deleted = 0");
    }
    builder.push(" LIMIT 1");
    let found: Option<i32> = builder.build_query_scalar().fetch_optional(db).await?;
    Ok(found.is_some())
}

pub async fn insert(db: impl SqliteExecutor<'_>, item: &FileItem) -> StorageResult<()> {
    sqlx::query(&format!(
        "INSERT INTO file_items ({ITEM_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(item.id)
    .bind(item.owner_id)
    .bind(item.parent_id)
    .bind(&item.name)
    .bind(item.kind)
    .bind(item.permission)
    .bind(item.server_key)
    .bind(&item.bucket)
    .bind(&item.object_key)
    .bind(item.size_bytes)
    .bind(&item.content_type)
    .bind(item.is_deleted)
    .bind(item.deleted_at)
    .bind(item.created_at)
    .bind(item.updated_at)
    .execute(db)
    .await
    .map_err(|err| name_conflict(err, &item.name))?;
    Ok(())
}

/// Point the subtree root at its new name and parent.
pub async fn relocate_root(
    db: impl SqliteExecutor<'_>,
    id: Uuid,
    name: &str,
    parent_id: Option<Uuid>,
    object_key: &str,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    sqlx::query(
        "UPDATE file_items SET name = ?, parent_id = ?, object_key = ?, updated_at = ? WHERE id = ?",
    )
    .bind(name)
    .bind(parent_id)
    .bind(object_key)
    .bind(now)
    .bind(id)
    .execute(db)
    .await
    .map_err(|err| name_conflict(err, name))?;
    Ok(())
}

pub async fn set_object_key(
    db: impl SqliteExecutor<'_>,
    id: Uuid,
    object_key: &str,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    sqlx::query("UPDATE file_items SET object_key = ?, updated_at = ? WHERE id = ?")
        .bind(object_key)
        .bind(now)
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

/// The sibling-name index turns a lost race into `AlreadyExists`.
fn name_conflict(err: sqlx::Error, name: &str) -> StorageError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::AlreadyExists(format!("`{}` in the target directory", name))
        }
        other => StorageError::Sqlx(other),
    }
}

/// Ids of a node and all its descendants, bound to the root id.
const SUBTREE_IDS: &str = "WITH RECURSIVE subtree(id) AS (
         SELECT id FROM file_items WHERE id = ?
         UNION ALL
         SELECT f.id FROM file_items f JOIN subtree s ON f.parent_id = s.id
     )
     SELECT id FROM subtree";

/// Flag (or unflag) a node and all its descendants as trashed.
pub async fn set_deleted(
    db: impl SqliteExecutor<'_>,
    root: Uuid,
    deleted: bool,
    now: DateTime<Utc>,
) -> StorageResult<u64> {
    let done = sqlx::query(&format!(
        "UPDATE file_items SET is_deleted = ?, deleted_at = ?, updated_at = ?
         WHERE id IN ({SUBTREE_IDS})"
    ))
    .bind(deleted)
    .bind(deleted.then_some(now))
    .bind(now)
    .bind(root)
    .execute(db)
    .await?;
    Ok(done.rows_affected())
}

pub async fn set_permission(
    db: impl SqliteExecutor<'_>,
    root: Uuid,
    permission: Permission,
    now: DateTime<Utc>,
) -> StorageResult<u64> {
    let done = sqlx::query(&format!(
        "UPDATE file_items SET permission = ?, updated_at = ? WHERE id IN ({SUBTREE_IDS})"
    ))
    .bind(permission)
    .bind(now)
    .bind(root)
    .execute(db)
    .await?;
    Ok(done.rows_affected())
}

/// Delete a node and all its descendants.
pub async fn delete(db: impl SqliteExecutor<'_>, root: Uuid) -> StorageResult<u64> {
    let done = sqlx::query(&format!("DELETE FROM file_items WHERE id IN ({SUBTREE_IDS})"))
        .bind(root)
        .execute(db)
        .await?;
    Ok(done.rows_affected())
}

/// The parent chain of `id` as `(id, owner_id)`, top-level node first and
/// `id` itself last. Empty when the node does not exist.
pub async fn lineage(db: impl SqliteExecutor<'_>, id: Uuid) -> StorageResult<Vec<(Uuid, i64)>> {
    let rows = sqlx::query_as::<_, (Uuid, i64)>(
        "WITH RECURSIVE chain(id, parent_id, owner_id, depth) AS (
             SELECT id, parent_id, owner_id, 0 FROM file_items WHERE id = ?
             UNION ALL
             SELECT f.id, f.parent_id, f.owner_id, c.depth + 1
             FROM file_items f JOIN chain c ON f.id = c.parent_id
         )
         SELECT id, owner_id FROM chain ORDER BY depth DESC",
    )
    .bind(id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}
