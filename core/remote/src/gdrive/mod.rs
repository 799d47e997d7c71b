//! Google Drive mirror for SnapSync.
//!
//! This module provides a remote mirror backed by Google Drive with:
//! - OAuth2 authentication with automatic token refresh and persistence
//! - Resumable uploads for large files
//! - Upsert semantics: re-uploading a snapshot replaces files by name

pub mod auth;
pub mod client;
pub mod mirror;

pub use auth::{AuthConfig, AuthManager, DriveCredentials, TokenManager, Tokens};
pub use client::{DriveClient, DriveFile};
pub use mirror::{DriveConfig, DriveMirror};
