//! Process-wide caches shared by reconcile passes
//!
//! Both caches are hints, never the source of truth: a miss always falls back
//! to the API server and a rotation invalidates the entry explicitly.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use vdb_common::crd::VerticaDB;
use vdb_common::{Error, Result};

use crate::kube_client::KubeClient;

/// Key in a password secret holding the superuser password
pub const SUPERUSER_PASSWORD_KEY: &str = "password";

/// Identifies one password: a secret as seen by one VerticaDB
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PasswordKey {
    /// Namespace of the VerticaDB
    pub namespace: String,
    /// Name of the VerticaDB
    pub name: String,
    /// Secret the password came from
    pub secret: String,
}

impl PasswordKey {
    /// Build a key
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            secret: secret.into(),
        }
    }

    /// Key for the main cluster (`None`) or one sandbox of `vdb`.
    ///
    /// Sandboxes rotate on their own schedule, so each scope tracks its
    /// current password under `name/sandbox`.
    pub fn for_scope(vdb: &VerticaDB, sandbox: Option<&str>, secret: impl Into<String>) -> Self {
        let name = match sandbox.filter(|sb| !sb.is_empty()) {
            Some(sb) => format!("{}/{sb}", vdb.name_any()),
            None => vdb.name_any(),
        };
        Self::new(vdb.namespace_or_default(), name, secret)
    }
}

/// Cache of superuser passwords
#[cfg_attr(test, automock)]
pub trait PasswordCache: Send + Sync {
    /// Cached password, if any
    fn get(&self, key: &PasswordKey) -> Option<String>;
    /// Store a password
    fn set(&self, key: PasswordKey, password: String);
    /// Drop a password
    fn invalidate(&self, key: &PasswordKey);
    /// Password currently in use by a VerticaDB, whatever secret it came from
    fn current(&self, namespace: &str, name: &str) -> Option<String>;
}

/// Cache of last validation times, keyed by VerticaDB
#[cfg_attr(test, automock)]
pub trait TimestampCache: Send + Sync {
    /// Last recorded time
    fn get(&self, namespace: &str, name: &str) -> Option<DateTime<Utc>>;
    /// Record a time
    fn set(&self, namespace: &str, name: &str, at: DateTime<Utc>);
    /// Drop the entry
    fn invalidate(&self, namespace: &str, name: &str);
}

/// [`PasswordCache`] backed by a concurrent map
#[derive(Default)]
pub struct InMemoryPasswordCache {
    by_secret: DashMap<PasswordKey, String>,
    in_use: DashMap<(String, String), String>,
}

impl InMemoryPasswordCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }
}

impl PasswordCache for InMemoryPasswordCache {
    fn get(&self, key: &PasswordKey) -> Option<String> {
        self.by_secret.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: PasswordKey, password: String) {
        self.in_use
            .insert((key.namespace.clone(), key.name.clone()), password.clone());
        self.by_secret.insert(key, password);
    }

    fn invalidate(&self, key: &PasswordKey) {
        self.by_secret.remove(key);
        self.in_use
            .remove(&(key.namespace.clone(), key.name.clone()));
    }

    fn current(&self, namespace: &str, name: &str) -> Option<String> {
        self.in_use
            .get(&(namespace.to_string(), name.to_string()))
            .map(|v| v.value().clone())
    }
}

/// [`TimestampCache`] backed by a concurrent map
#[derive(Default)]
pub struct InMemoryTimestampCache {
    entries: DashMap<(String, String), DateTime<Utc>>,
}

impl InMemoryTimestampCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimestampCache for InMemoryTimestampCache {
    fn get(&self, namespace: &str, name: &str) -> Option<DateTime<Utc>> {
        self.entries
            .get(&(namespace.to_string(), name.to_string()))
            .map(|v| *v.value())
    }

    fn set(&self, namespace: &str, name: &str, at: DateTime<Utc>) {
        self.entries
            .insert((namespace.to_string(), name.to_string()), at);
    }

    fn invalidate(&self, namespace: &str, name: &str) {
        self.entries
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

fn password_from_secret(secret: &Secret, name: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(SUPERUSER_PASSWORD_KEY))
        .ok_or_else(|| {
            Error::validation(format!(
                "secret {name} has no '{SUPERUSER_PASSWORD_KEY}' key"
            ))
        })?;
    String::from_utf8(bytes.0.clone())
        .map_err(|e| Error::serialization(format!("password in secret {name} is not utf-8: {e}")))
}

/// Load the superuser password from `secret`.
///
/// Reads through the cache unless `bypass_cache` is set. Returns `None` when
/// the secret does not exist.
pub async fn load_password(
    kube: &dyn KubeClient,
    cache: &dyn PasswordCache,
    key: &PasswordKey,
    bypass_cache: bool,
) -> Result<Option<String>> {
    if !bypass_cache {
        if let Some(pw) = cache.get(key) {
            return Ok(Some(pw));
        }
    }

    let Some(secret) = kube.get_secret(&key.namespace, &key.secret).await? else {
        debug!(secret = %key.secret, "password secret not found");
        return Ok(None);
    };
    let password = password_from_secret(&secret, &key.secret)?;
    if !bypass_cache {
        cache.set(key.clone(), password.clone());
    }
    Ok(Some(password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::testing::password_secret;

    #[test]
    fn password_cache_tracks_current_password() {
        let cache = InMemoryPasswordCache::new();
        let key = PasswordKey::new("default", "vertdb", "su-secret");
        cache.set(key.clone(), "pw1".to_string());
        assert_eq!(cache.get(&key), Some("pw1".to_string()));
        assert_eq!(cache.current("default", "vertdb"), Some("pw1".to_string()));

        cache.invalidate(&key);
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.current("default", "vertdb"), None);
    }

    #[test]
    fn sandbox_scope_has_its_own_current_password() {
        let vdb = crate::testing::sample_vdb("vertdb");
        let cache = InMemoryPasswordCache::new();
        cache.set(PasswordKey::for_scope(&vdb, None, "su-v2"), "new".to_string());
        cache.set(
            PasswordKey::for_scope(&vdb, Some("sandbox1"), "su-v1"),
            "old".to_string(),
        );

        assert_eq!(cache.current("default", "vertdb"), Some("new".to_string()));
        assert_eq!(cache.current("default", "vertdb/sandbox1"), Some("old".to_string()));
        assert_eq!(PasswordKey::for_scope(&vdb, Some(""), "s").name, "vertdb");
    }

    #[test]
    fn timestamp_cache_is_keyed_by_resource() {
        let cache = InMemoryTimestampCache::new();
        let now = Utc::now();
        cache.set("default", "a", now);
        assert_eq!(cache.get("default", "a"), Some(now));
        assert_eq!(cache.get("default", "b"), None);
        cache.invalidate("default", "a");
        assert_eq!(cache.get("default", "a"), None);
    }

    #[tokio::test]
    async fn load_password_reads_through_the_cache() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .times(1)
            .returning(|_, _| Ok(Some(password_secret("su-secret", "pw1"))));
        let cache = InMemoryPasswordCache::new();
        let key = PasswordKey::new("default", "vertdb", "su-secret");

        let first = load_password(&kube, &cache, &key, false).await.expect("load");
        let second = load_password(&kube, &cache, &key, false).await.expect("load");
        assert_eq!(first, Some("pw1".to_string()));
        assert_eq!(second, Some("pw1".to_string()));
    }

    #[tokio::test]
    async fn bypass_skips_cached_value() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(password_secret("su-secret", "new"))));
        let cache = InMemoryPasswordCache::new();
        let key = PasswordKey::new("default", "vertdb", "su-secret");
        cache.set(key.clone(), "old".to_string());

        let pw = load_password(&kube, &cache, &key, true).await.expect("load");
        assert_eq!(pw, Some("new".to_string()));
        // bypass does not overwrite the cached value
        assert_eq!(cache.get(&key), Some("old".to_string()));
    }

    #[tokio::test]
    async fn missing_secret_is_none() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_, _| Ok(None));
        let cache = InMemoryPasswordCache::new();
        let key = PasswordKey::new("default", "vertdb", "gone");
        assert_eq!(
            load_password(&kube, &cache, &key, false).await.expect("load"),
            None
        );
    }
}
