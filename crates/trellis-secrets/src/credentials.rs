//! Generate-or-reuse credentials
//!
//! A [`Credential`] is generated at most once per identity and persisted in
//! the local state directory. Every later run loads the existing record and
//! never calls the generator again, so secrets published to the cluster stay
//! stable across re-runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Identity + secret material
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identity, also the file name in the state directory
    pub identity: String,
    /// Secret material, keyed by field name
    pub data: BTreeMap<String, String>,
    /// RFC 3339 creation time
    pub created_at: String,
}

impl Credential {
    /// New credential stamped with the current time
    pub fn new(identity: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self {
            identity: identity.into(),
            data,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Value of one field
    pub fn get(&self, key: &str) -> Result<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::store(&self.identity, format!("missing field '{}'", key)))
    }
}

// Secret material never reaches logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Persistence for credentials
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CredentialStore: Send + Sync {
    /// Load a credential; `Ok(None)` if never generated
    fn load(&self, identity: &str) -> Result<Option<Credential>>;

    /// Persist a credential
    fn save(&self, credential: &Credential) -> Result<()>;

    /// Human-readable location of a credential, for error messages
    fn location(&self, identity: &str) -> String;
}

/// One JSON file per identity in a local state directory
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Open a store in `dir`, refusing any location inside `repo_root`
    pub fn new(dir: impl Into<PathBuf>, repo_root: &Path) -> Result<Self> {
        let dir = dir.into();
        let resolved_dir = normalize(&dir);
        let resolved_repo = normalize(repo_root);
        if resolved_dir.starts_with(&resolved_repo) {
            return Err(Error::store(
                "*",
                format!(
                    "state directory {} is inside the git working tree {}",
                    dir.display(),
                    repo_root.display()
                ),
            ));
        }
        Ok(Self { dir })
    }

    /// State directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, identity: &str) -> Result<PathBuf> {
        let valid = !identity.is_empty()
            && identity
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::store(identity, "identity must be alphanumeric, '-' or '_'"));
        }
        Ok(self.dir.join(format!("{}.json", identity)))
    }
}

fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // Not created yet: resolve the nearest existing ancestor
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => normalize(parent).join(name),
        _ => path.to_path_buf(),
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, identity: &str) -> Result<Option<Credential>> {
        let path = self.path_for(identity)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::store(
                    identity,
                    format!("failed to read {}: {}", path.display(), e),
                ))
            }
        };
        let credential: Credential = serde_json::from_str(&content).map_err(|e| {
            Error::store(identity, format!("corrupt record {}: {}", path.display(), e))
        })?;
        if credential.identity != identity {
            return Err(Error::mismatch(
                identity,
                format!("{} holds '{}'", path.display(), credential.identity),
            ));
        }
        Ok(Some(credential))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let path = self.path_for(&credential.identity)?;
        let io_err = |e: std::io::Error| {
            Error::store(
                &credential.identity,
                format!("failed to write {}: {}", path.display(), e),
            )
        };

        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(credential)
            .map_err(|e| Error::store(&credential.identity, e.to_string()))?;

        // Write then rename so a crash never leaves a truncated record
        let tmp = path.with_extension("json.tmp");
        write_private(&tmp, json.as_bytes()).map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(io_err)?;
        debug!(identity = %credential.identity, path = %path.display(), "Saved credential");
        Ok(())
    }

    fn location(&self, identity: &str) -> String {
        self.dir
            .join(format!("{}.json", identity))
            .display()
            .to_string()
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

/// Load `identity` if present, otherwise generate, persist and return it.
///
/// `generate` runs at most once per identity for the lifetime of the store.
pub fn ensure_credential<F>(
    store: &dyn CredentialStore,
    identity: &str,
    generate: F,
) -> Result<Credential>
where
    F: FnOnce() -> Result<BTreeMap<String, String>>,
{
    if let Some(existing) = store.load(identity)? {
        debug!(identity = %identity, "Reusing existing credential");
        return Ok(existing);
    }

    let credential = Credential::new(identity, generate()?);
    store.save(&credential)?;
    info!(identity = %identity, location = %store.location(identity), "Generated credential");
    Ok(credential)
}

/// Random alphanumeric string
pub fn random_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Generator for a single random field
pub fn password_generator(
    key: &str,
    length: usize,
) -> impl FnOnce() -> Result<BTreeMap<String, String>> + '_ {
    move || Ok(BTreeMap::from([(key.to_string(), random_password(length))]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn store() -> (tempfile::TempDir, FileCredentialStore) {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let store = FileCredentialStore::new(root.path().join("state"), &repo).unwrap();
        (root, store)
    }

    #[test]
    fn ensure_twice_generates_once() {
        let (_root, store) = store();
        let calls = Cell::new(0);
        let generate = || {
            calls.set(calls.get() + 1);
            Ok(BTreeMap::from([(
                "admin-password".to_string(),
                random_password(24),
            )]))
        };

        let first = ensure_credential(&store, "grafana-admin", generate).unwrap();
        let second = ensure_credential(&store, "grafana-admin", generate).unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn generator_failure_persists_nothing() {
        let (_root, store) = store();
        let err = ensure_credential(&store, "root-ca", || Err(Error::Pki("no entropy".into())));
        assert!(err.is_err());
        assert!(store.load("root-ca").unwrap().is_none());
    }

    #[test]
    fn state_dir_inside_repo_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        let err = FileCredentialStore::new(repo.join(".trellis"), &repo).unwrap_err();
        assert!(err.to_string().contains("inside the git working tree"));
    }

    #[cfg(unix)]
    #[test]
    fn records_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let (_root, store) = store();
        ensure_credential(&store, "argocd-server", password_generator("secretkey", 32)).unwrap();

        let meta = std::fs::metadata(store.dir().join("argocd-server.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn invalid_identity_is_rejected() {
        let (_root, store) = store();
        assert!(store.load("../escape").is_err());
    }

    #[test]
    fn debug_output_hides_material() {
        let cred = Credential::new(
            "vault-unseal",
            BTreeMap::from([("root-token".to_string(), "hvs.secret".to_string())]),
        );
        let shown = format!("{:?}", cred);
        assert!(shown.contains("root-token"));
        assert!(!shown.contains("hvs.secret"));
    }

    #[test]
    fn random_password_is_alphanumeric() {
        let password = random_password(32);
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, random_password(32));
    }

    #[test]
    fn missing_field_reports_identity() {
        let cred = Credential::new("root-ca", BTreeMap::new());
        let err = cred.get("tls.key").unwrap_err();
        assert!(err.to_string().contains("root-ca"));
    }
}
