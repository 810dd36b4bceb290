//! Environment constants and path utilities for the session gateway.
//!
//! This module centralizes the directory names, file names and remote key
//! layout used by the persistence layer, so the on-disk and remote formats are
//! defined in exactly one place.

use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const GATEWAY_DIR_NAME: &str = ".wagw";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "gateway.toml";

/// Session-related directory and file names
pub mod session {
    /// Default sessions root directory name
    pub const SESSIONS_DIR_NAME: &str = "sessions";

    /// Primary credentials file; a session directory is only valid if it holds one
    pub const CREDS_FILE_NAME: &str = "creds.json";

    /// Separator between user id and phone number in a session directory name
    pub const DIR_SEPARATOR: char = '-';

    /// Default root directory for the filesystem-backed object store
    pub const REMOTE_DIR_NAME: &str = "remote";

    /// Subdirectory of the remote root holding metadata documents
    pub const METADATA_DIR_NAME: &str = "metadata";
}

/// Remote object key layout
pub mod remote {
    /// Namespace every session object lives under
    pub const SESSIONS_PREFIX: &str = "sessions";
}

/// Environment variables recognized as configuration overrides
pub mod vars {
    pub const STORAGE_TIER: &str = "SESSION_STORAGE_TIER";
    pub const ENCRYPTION_KEY: &str = "SESSION_ENCRYPTION_KEY";
    pub const BUCKET: &str = "SESSION_BUCKET";
    pub const SESSIONS_ROOT: &str = "SESSIONS_ROOT";
    pub const MAX_CONNECTIONS: &str = "MAX_CONNECTIONS";
}

/// Build the main .wagw directory path from a base directory
pub fn gateway_dir_path(base: &Path) -> PathBuf {
    base.join(GATEWAY_DIR_NAME)
}

/// Build a local config file path (.wagw/config.toml)
pub fn local_config_file_path(base: &Path) -> PathBuf {
    gateway_dir_path(base).join(CONFIG_FILE_NAME)
}

/// Build the user config directory path (~/.wagw)
pub fn user_config_dir_path(home: &Path) -> PathBuf {
    home.join(GATEWAY_DIR_NAME)
}

/// Build the user config file path (~/.wagw/config.toml)
pub fn user_config_file_path(home: &Path) -> PathBuf {
    user_config_dir_path(home).join(CONFIG_FILE_NAME)
}

/// Build a session directory path: `<sessions_root>/<user_id>-<phone_number>`
pub fn session_dir_path(sessions_root: &Path, user_id: &str, phone_number: &str) -> PathBuf {
    sessions_root.join(format!(
        "{}{}{}",
        user_id,
        session::DIR_SEPARATOR,
        phone_number
    ))
}

/// Build the primary credentials file path of a session directory
pub fn creds_file_path(session_dir: &Path) -> PathBuf {
    session_dir.join(session::CREDS_FILE_NAME)
}

/// Remote namespace of one session: `sessions/<user_id>/<phone_number>/`
pub fn remote_session_prefix(user_id: &str, phone_number: &str) -> String {
    format!("{}/{}/{}/", remote::SESSIONS_PREFIX, user_id, phone_number)
}

/// Remote object key of one session file: `sessions/<user_id>/<phone_number>/<file_name>`
pub fn remote_object_key(user_id: &str, phone_number: &str, file_name: &str) -> String {
    format!("{}{}", remote_session_prefix(user_id, phone_number), file_name)
}

/// Metadata document id of one session
pub fn metadata_document_id(user_id: &str, phone_number: &str) -> String {
    format!("{}:{}", user_id, phone_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_dir_layout() {
        let dir = session_dir_path(Path::new("/data/sessions"), "alice", "+15550001111");
        assert_eq!(dir, PathBuf::from("/data/sessions/alice-+15550001111"));
        assert_eq!(
            creds_file_path(&dir),
            PathBuf::from("/data/sessions/alice-+15550001111/creds.json")
        );
    }

    #[test]
    fn test_remote_key_layout() {
        assert_eq!(
            remote_session_prefix("alice", "+15550001111"),
            "sessions/alice/+15550001111/"
        );
        assert_eq!(
            remote_object_key("alice", "+15550001111", "creds.json"),
            "sessions/alice/+15550001111/creds.json"
        );
    }
}
