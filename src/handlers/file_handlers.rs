//! HTTP handlers for the file-item catalog.
//! Request bodies and queries are decoded here; all storage concerns are
//! delegated to `StorageService`. Download bodies are streamed, never
//! buffered.

use crate::{
    errors::AppError,
    models::{
        caller::Caller,
        file_item::{FileItemView, FileTreeNode, Permission},
        quota::StorageQuota,
    },
    services::storage_service::StorageService,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Header carrying the authenticated owner id, set by the gateway.
pub const OWNER_HEADER: &str = "x-owner-id";
/// Header flagging administrators, set by the gateway.
pub const ADMIN_HEADER: &str = "x-is-admin";

const DEFAULT_PRESIGN_TTL_SECS: u64 = 3600;

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner_id = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .ok_or_else(|| AppError::unauthenticated(format!("missing or invalid {}", OWNER_HEADER)))?;
        let is_admin = parts
            .headers
            .get(ADMIN_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "True"));

        Ok(if is_admin {
            Caller::admin(owner_id)
        } else {
            Caller::owner(owner_id)
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ParentQuery {
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    pub root_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDirectoryReq {
    pub parent_id: Option<Uuid>,
    pub name: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
}

/// Query of `PUT /files/upload`; the request body is the file content.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub parent_id: Option<Uuid>,
    pub name: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
}

#[derive(Debug, Deserialize)]
pub struct PresignQuery {
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RenameReq {
    pub name: String,
}

/// Target directory of a move or copy; `null` means the owner's top level.
#[derive(Debug, Deserialize)]
pub struct ParentReq {
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PermissionReq {
    pub permission: Permission,
}

#[derive(Debug, Deserialize)]
pub struct RechargeReq {
    pub quota_kb: i64,
    pub expire_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PresignResponse {
    pub url: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
pub struct EmptyTrashResponse {
    pub destroyed: usize,
}

fn default_permission() -> Permission {
    Permission::Private
}

/// `GET /files?parent_id=`
pub async fn list_children(
    State(service): State<StorageService>,
    caller: Caller,
    Query(q): Query<ParentQuery>,
) -> Result<Json<Vec<FileItemView>>, AppError> {
    Ok(Json(service.list_children(&caller, q.parent_id).await?))
}

/// `GET /files/tree?root_id=`
pub async fn tree(
    State(service): State<StorageService>,
    caller: Caller,
    Query(q): Query<TreeQuery>,
) -> Result<Json<Vec<FileTreeNode>>, AppError> {
    Ok(Json(service.tree(&caller, q.root_id).await?))
}

/// `GET /files/trash`
pub async fn deleted_tree(
    State(service): State<StorageService>,
    caller: Caller,
) -> Result<Json<Vec<FileTreeNode>>, AppError> {
    Ok(Json(service.deleted_tree(&caller).await?))
}

/// `DELETE /files/trash`
pub async fn empty_trash(
    State(service): State<StorageService>,
    caller: Caller,
) -> Result<Json<EmptyTrashResponse>, AppError> {
    let destroyed = service.empty_trash(&caller).await?;
    Ok(Json(EmptyTrashResponse { destroyed }))
}

/// `POST /files/directories`
pub async fn create_directory(
    State(service): State<StorageService>,
    caller: Caller,
    Json(req): Json<CreateDirectoryReq>,
) -> Result<impl IntoResponse, AppError> {
    let view = service
        .create_directory(&caller, req.parent_id, &req.name, req.permission)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// `PUT /files/upload?parent_id=&name=&permission=`
pub async fn upload_file(
    State(service): State<StorageService>,
    caller: Caller,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let view = service
        .upload_file(&caller, q.parent_id, &q.name, body, content_type, q.permission)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// `GET /files/{id}`
pub async fn get_item(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<FileItemView>, AppError> {
    Ok(Json(service.get_item(&caller, id).await?))
}

/// `GET /files/{id}/content` streams the object body.
pub async fn download(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let download = service.download(&caller, id).await?;

    let mut response = Response::new(Body::from_stream(download.body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&download.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(download.item.size_bytes.max(0)),
    );
    if let Some(etag) = download
        .etag
        .and_then(|etag| HeaderValue::from_str(&format!("\"{}\"", etag)).ok())
    {
        headers.insert(header::ETAG, etag);
    }
    Ok(response)
}

/// `GET /files/{id}/presign?ttl_secs=`
pub async fn presign(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Query(q): Query<PresignQuery>,
) -> Result<Json<PresignResponse>, AppError> {
    let ttl_secs = q.ttl_secs.unwrap_or(DEFAULT_PRESIGN_TTL_SECS);
    let url = service
        .presign(&caller, id, Duration::from_secs(ttl_secs))
        .await?;
    Ok(Json(PresignResponse {
        url,
        expires_in: ttl_secs,
    }))
}

/// `PATCH /files/{id}/name`
pub async fn rename(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameReq>,
) -> Result<Json<FileItemView>, AppError> {
    Ok(Json(service.rename(&caller, id, &req.name).await?))
}

/// `PATCH /files/{id}/parent`
pub async fn move_item(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<ParentReq>,
) -> Result<Json<FileItemView>, AppError> {
    Ok(Json(service.move_item(&caller, id, req.parent_id).await?))
}

/// `POST /files/{id}/copy`
pub async fn copy(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<ParentReq>,
) -> Result<impl IntoResponse, AppError> {
    let view = service.copy(&caller, id, req.parent_id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// `PATCH /files/{id}/permission`
pub async fn change_permission(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<PermissionReq>,
) -> Result<Json<FileItemView>, AppError> {
    Ok(Json(
        service.change_permission(&caller, id, req.permission).await?,
    ))
}

/// `DELETE /files/{id}` moves the node to the trash.
pub async fn soft_delete(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    service.soft_delete(&caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /files/{id}/restore`
pub async fn restore(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<FileItemView>, AppError> {
    Ok(Json(service.restore(&caller, id).await?))
}

/// `DELETE /files/{id}/force`
pub async fn force_delete(
    State(service): State<StorageService>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    service.force_delete(&caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /quota`
pub async fn quota_status(
    State(service): State<StorageService>,
    caller: Caller,
) -> Result<Json<StorageQuota>, AppError> {
    Ok(Json(service.quota_status(&caller).await?))
}

/// `PUT /quota/{owner_id}` (admin only)
pub async fn recharge(
    State(service): State<StorageService>,
    caller: Caller,
    Path(owner_id): Path<i64>,
    Json(req): Json<RechargeReq>,
) -> Result<Json<StorageQuota>, AppError> {
    let quota = service
        .recharge(&caller, owner_id, req.quota_kb, req.expire_at)
        .await?;
    Ok(Json(quota))
}
