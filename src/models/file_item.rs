//! Represents a node of the logical file tree (a file or a directory).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Whether a node holds bytes or groups other nodes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// Read access granted to anonymous clients through the bucket policy.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Permission {
    Public,
    Private,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Public => "public",
            Permission::Private => "private",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of one of the configured object backends.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum ServerKey {
    S1,
    S2,
    S3,
}

impl ServerKey {
    pub const ALL: [ServerKey; 3] = [ServerKey::S1, ServerKey::S2, ServerKey::S3];

    pub fn as_str(self) -> &'static str {
        match self {
            ServerKey::S1 => "S1",
            ServerKey::S2 => "S2",
            ServerKey::S3 => "S3",
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ServerKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown server key `{}`", value))
    }
}

/// A single node in an owner's file tree.
///
/// The node stores where its bytes live (`server_key`, `bucket`, `object_key`)
/// but never the bytes themselves. Directory keys always end with `/` and are
/// the prefix of every descendant's key.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileItem {
    /// Stable identifier of the node.
    pub id: Uuid,

    /// User that owns the node (and is charged for its bytes).
    pub owner_id: i64,

    /// Containing directory; `None` for top-level nodes.
    pub parent_id: Option<Uuid>,

    /// Display name, unique among live siblings.
    pub name: String,

    pub kind: FileKind,

    pub permission: Permission,

    /// Backend holding the object.
    pub server_key: ServerKey,

    pub bucket: String,

    /// Object key for files, key prefix (ending in `/`) for directories.
    pub object_key: String,

    /// Payload size; always 0 for directories.
    pub size_bytes: i64,

    pub content_type: String,

    /// Soft-delete flag (node sits in the trash).
    pub is_deleted: bool,

    pub deleted_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl FileItem {
    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// A node together with the URL clients use to reach its object.
#[derive(Serialize, Clone, Debug)]
pub struct FileItemView {
    #[serde(flatten)]
    pub item: FileItem,
    pub url: String,
}

/// A node and its live (or trashed, for trash listings) children.
#[derive(Serialize, Clone, Debug)]
pub struct FileTreeNode {
    #[serde(flatten)]
    pub item: FileItem,
    pub children: Vec<FileTreeNode>,
}

impl FileTreeNode {
    /// Total number of nodes in this subtree, including the node itself.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(FileTreeNode::node_count).sum::<usize>()
    }
}
