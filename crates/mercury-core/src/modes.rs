//! Mode templates: one `{mode}.txt` file per mode in a configured directory.
//!
//! A mode name coming from user input is sanitized to a pure filename before
//! it touches the filesystem. A missing file or directory yields empty
//! content rather than an error.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Reduce a user-supplied mode name to a safe filename stem.
///
/// Keeps ASCII alphanumerics, `-` and `_`; everything else is dropped.
pub fn sanitize_mode_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Path of the template file for `mode` inside `dir`.
pub fn mode_template_path(dir: &Path, mode: &str) -> PathBuf {
    dir.join(format!("{}.txt", sanitize_mode_name(mode)))
}

/// Read the template for `mode`. Missing file or directory → empty string.
pub async fn load_mode_template(dir: &Path, mode: &str) -> String {
    let path = mode_template_path(dir, mode);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "mode template not readable, using empty");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_mode_name("../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_mode_name("general"), "general");
        assert_eq!(sanitize_mode_name("my mode!"), "mymode");
        assert_eq!(sanitize_mode_name("a_b-c"), "a_b-c");
    }

    #[tokio::test]
    async fn missing_dir_yields_empty() {
        let content = load_mode_template(Path::new("/nonexistent/mercury-modes"), "general").await;
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn existing_template_is_read() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("general.txt"), "You are helpful.")
            .await
            .unwrap();
        let content = load_mode_template(dir.path(), "general").await;
        assert_eq!(content, "You are helpful.");
    }

    #[tokio::test]
    async fn hostile_mode_name_cannot_escape_dir() {
        let dir = tempfile::tempdir().unwrap();
        let content = load_mode_template(dir.path(), "../../secret").await;
        assert_eq!(content, "");
    }
}
