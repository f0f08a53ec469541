//! Routes of the file-item catalog.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `GET    /files?parent_id=` lists the live children of a directory
//!   - `GET    /files/tree?root_id=` returns the live tree
//!   - `GET    /files/trash` / `DELETE /files/trash` show or empty the trash
//!   - `POST   /files/directories` creates a directory
//!   - `PUT    /files/upload?parent_id=&name=&permission=` uploads the raw body
//!
//! - **Item endpoints** (`{id}` is the node's UUID)
//!   - `GET    /files/{id}`, `GET /files/{id}/content`, `GET /files/{id}/presign`
//!   - `PATCH  /files/{id}/name`, `/parent`, `/permission`
//!   - `POST   /files/{id}/copy`, `/restore`
//!   - `DELETE /files/{id}` (trash) and `DELETE /files/{id}/force`
//!
//! - **Quota**
//!   - `GET /quota`, `PUT /quota/{owner_id}` (admin only)
//!
//! Every route expects the `x-owner-id` (and optionally `x-is-admin`) header.

use crate::{
    handlers::file_handlers::{
        change_permission, copy, create_directory, deleted_tree, download, empty_trash,
        force_delete, get_item, list_children, move_item, presign, quota_status, recharge,
        rename, restore, soft_delete, tree, upload_file,
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, patch, post, put},
};

/// Build the catalog router. Upload bodies above `max_upload_bytes` are refused.
pub fn routes(max_upload_bytes: usize) -> Router<StorageService> {
    Router::new()
        .route("/files", get(list_children))
        .route("/files/tree", get(tree))
        .route("/files/trash", get(deleted_tree).delete(empty_trash))
        .route("/files/directories", post(create_directory))
        .route("/files/upload", put(upload_file))
        .route("/files/{id}", get(get_item).delete(soft_delete))
        .route("/files/{id}/content", get(download))
        .route("/files/{id}/presign", get(presign))
        .route("/files/{id}/name", patch(rename))
        .route("/files/{id}/parent", patch(move_item))
        .route("/files/{id}/copy", post(copy))
        .route("/files/{id}/permission", patch(change_permission))
        .route("/files/{id}/restore", post(restore))
        .route("/files/{id}/force", delete(force_delete))
        .route("/quota", get(quota_status))
        .route("/quota/{owner_id}", put(recharge))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
