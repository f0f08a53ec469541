//! Storage core: object backends, bucket policies, quota and the file-item catalog.

pub mod backend;
pub mod directory_engine;
pub mod error;
pub mod file_items;
pub mod locks;
pub mod memory_backend;
pub mod policy_manager;
pub mod quota;
pub mod registry;
pub mod s3_backend;
pub mod storage_service;
pub mod urls;
