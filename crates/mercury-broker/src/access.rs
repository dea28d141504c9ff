//! Access control: two newline-separated id lists loaded lazily, once,
//! plus per-chat visitor memoisation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use mercury_core::config::AccessConfig;
use mercury_core::types::ChatId;

/// What the checker knows about one chat id.
#[derive(Debug, Clone)]
pub struct Visitor {
    pub access_granted: bool,
    pub premium: bool,
    pub username: String,
    pub latest_access_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AccessLists {
    allowed: HashSet<String>,
    premium: HashSet<String>,
}

/// Loads `ids.txt` / `premium_ids.txt` behind a one-shot async cell; the
/// loader runs at most once even under concurrency. A missing file means an
/// empty set, never an error. The admin id is always allowed.
pub struct AccessChecker {
    admin_user_id: Option<String>,
    ids_path: PathBuf,
    premium_path: PathBuf,
    lists: OnceCell<AccessLists>,
    visitors: DashMap<ChatId, Visitor>,
}

impl AccessChecker {
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            admin_user_id: config.admin_user_id.clone(),
            ids_path: PathBuf::from(&config.ids_file),
            premium_path: PathBuf::from(&config.premium_ids_file),
            lists: OnceCell::new(),
            visitors: DashMap::new(),
        }
    }

    async fn lists(&self) -> &AccessLists {
        self.lists
            .get_or_init(|| async {
                let allowed = read_id_file(&self.ids_path).await;
                let premium = read_id_file(&self.premium_path).await;
                info!(
                    allowed = allowed.len(),
                    premium = premium.len(),
                    "access lists loaded"
                );
                AccessLists { allowed, premium }
            })
            .await
    }

    /// Decide access for `(chat_id, username)` and memoise the visitor.
    pub async fn check(&self, chat_id: &ChatId, username: &str) -> Visitor {
        let lists = self.lists().await;
        let is_admin = self
            .admin_user_id
            .as_deref()
            .is_some_and(|admin| admin.eq_ignore_ascii_case(chat_id.as_str()));

        let visitor = Visitor {
            access_granted: is_admin || lists.allowed.contains(chat_id.as_str()),
            premium: is_admin || lists.premium.contains(chat_id.as_str()),
            username: username.to_string(),
            latest_access_at: Utc::now(),
        };
        self.visitors.insert(chat_id.clone(), visitor.clone());
        visitor
    }

    /// Last memoised visitor for a chat id.
    pub fn visitor(&self, chat_id: &ChatId) -> Option<Visitor> {
        self.visitors.get(chat_id).map(|v| v.clone())
    }
}

/// Newline-separated ids, whitespace trimmed; missing file → empty set.
async fn read_id_file(path: &Path) -> HashSet<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "id list not readable, using empty set");
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn checker_with(ids: &str, premium: &str, admin: Option<&str>) -> (AccessChecker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ids_file = dir.path().join("ids.txt");
        let premium_file = dir.path().join("premium_ids.txt");
        tokio::fs::write(&ids_file, ids).await.unwrap();
        tokio::fs::write(&premium_file, premium).await.unwrap();
        let checker = AccessChecker::new(&AccessConfig {
            admin_user_id: admin.map(String::from),
            ids_file: ids_file.to_string_lossy().into_owned(),
            premium_ids_file: premium_file.to_string_lossy().into_owned(),
        });
        (checker, dir)
    }

    #[tokio::test]
    async fn listed_ids_are_allowed() {
        let (checker, _dir) = checker_with("100\n 200 \n\n300\n", "200\n", None).await;

        let v = checker.check(&ChatId::from("200"), "alice").await;
        assert!(v.access_granted);
        assert!(v.premium);

        let v = checker.check(&ChatId::from("100"), "bob").await;
        assert!(v.access_granted);
        assert!(!v.premium);

        let v = checker.check(&ChatId::from("999"), "eve").await;
        assert!(!v.access_granted);
    }

    #[tokio::test]
    async fn admin_is_always_allowed_case_insensitive() {
        let (checker, _dir) = checker_with("", "", Some("AdminChat")).await;
        let v = checker.check(&ChatId::from("adminchat"), "root").await;
        assert!(v.access_granted);
        assert!(v.premium);
    }

    #[tokio::test]
    async fn missing_files_mean_empty_sets() {
        let checker = AccessChecker::new(&AccessConfig {
            admin_user_id: None,
            ids_file: "/nonexistent/ids.txt".into(),
            premium_ids_file: "/nonexistent/premium.txt".into(),
        });
        let v = checker.check(&ChatId::from("1"), "u").await;
        assert!(!v.access_granted);
    }

    #[tokio::test]
    async fn visitors_are_memoised() {
        let (checker, _dir) = checker_with("1\n", "", None).await;
        checker.check(&ChatId::from("1"), "alice").await;
        let v = checker.visitor(&ChatId::from("1")).unwrap();
        assert_eq!(v.username, "alice");
        assert!(v.access_granted);
        assert!(checker.visitor(&ChatId::from("2")).is_none());
    }
}
