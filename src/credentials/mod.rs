//! Kubeconfig merge and removal
//!
//! kbb8 publishes the local API server as one cluster/user/context triple
//! keyed by the cluster name:
//!
//! - cluster and context: `kbb8-<name>`
//! - user: `kbb8-<name>-admin`
//!
//! Merging upserts the triple and points `current-context` at it. Removal
//! deletes the triple and clears `current-context` only when it pointed here.
//! Files we did not create are edited in place: foreign entries and unknown
//! fields survive a round trip.
//!
//! The kubeconfig is the only state shared between concurrent tasks, so every
//! read-modify-write cycle runs under a process-wide lock.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::pki::{CertificateAuthority, ClientIdentity};
use crate::{Error, Result, CREDENTIALS_KEY_PREFIX};

/// Group the API server treats as cluster-admin
pub const SYSTEM_PRIVILEGED_GROUP: &str = "system:masters";

/// Environment variable holding the kubeconfig loading chain
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

static WRITE_LOCK: Mutex<()> = Mutex::new(());

// =============================================================================
// Kubeconfig model
// =============================================================================

/// Kubeconfig file, preserving anything kbb8 does not manage
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version (normally `v1`)
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind (normally `Config`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Named clusters
    #[serde(default, deserialize_with = "null_as_default")]
    pub clusters: Vec<NamedEntry>,
    /// Named users
    #[serde(default, deserialize_with = "null_as_default")]
    pub users: Vec<NamedEntry>,
    /// Named contexts
    #[serde(default, deserialize_with = "null_as_default")]
    pub contexts: Vec<NamedEntry>,
    /// Selected context, empty when none
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub current_context: String,
    /// Fields kbb8 does not manage (preferences, extensions, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// kubectl writes empty lists (and an unset current context) as `null`
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One element of the clusters/users/contexts lists
///
/// Only the name is interpreted; the body is kept verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedEntry {
    /// Entry key
    pub name: String,
    /// Everything else (`cluster`, `user` or `context` plus unknown fields)
    #[serde(flatten)]
    pub body: serde_yaml::Mapping,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterBody {
    server: String,
    certificate_authority_data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct UserBody {
    client_certificate_data: String,
    client_key_data: String,
}

#[derive(Serialize)]
struct ContextBody {
    cluster: String,
    user: String,
}

impl Kubeconfig {
    fn new_v1() -> Self {
        Self {
            api_version: Some("v1".to_string()),
            kind: Some("Config".to_string()),
            ..Default::default()
        }
    }

    /// Parse a kubeconfig document; an empty document is an empty config
    pub fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::new_v1());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Names of all cluster entries
    pub fn cluster_names(&self) -> Vec<&str> {
        self.clusters.iter().map(|e| e.name.as_str()).collect()
    }

    /// Names of all user entries
    pub fn user_names(&self) -> Vec<&str> {
        self.users.iter().map(|e| e.name.as_str()).collect()
    }

    /// Names of all context entries
    pub fn context_names(&self) -> Vec<&str> {
        self.contexts.iter().map(|e| e.name.as_str()).collect()
    }
}

// =============================================================================
// Entry keys and contents
// =============================================================================

/// Keys of the triple written for one cluster name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryKeys {
    /// Cluster entry key
    pub cluster: String,
    /// User entry key
    pub user: String,
    /// Context entry key
    pub context: String,
}

impl EntryKeys {
    /// Keys for `cluster_name`
    pub fn for_cluster(cluster_name: &str) -> Self {
        let base = format!("{}-{}", CREDENTIALS_KEY_PREFIX, cluster_name);
        Self {
            cluster: base.clone(),
            user: format!("{}-admin", base),
            context: base,
        }
    }
}

/// Connection details for one local API server
#[derive(Clone)]
pub struct CredentialsEntry {
    /// Cluster name the keys derive from
    pub cluster_name: String,
    /// API server URL
    pub server: String,
    /// PEM CA certificate the server's certificate chains to
    pub ca_pem: String,
    /// PEM client certificate
    pub client_cert_pem: String,
    /// PEM client key
    pub client_key_pem: String,
}

impl std::fmt::Debug for CredentialsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsEntry")
            .field("cluster_name", &self.cluster_name)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl CredentialsEntry {
    /// Issue an admin client certificate from `ca` and bundle it with the server URL
    pub fn issue(ca: &CertificateAuthority, cluster_name: &str, server: &str) -> Result<Self> {
        let keys = EntryKeys::for_cluster(cluster_name);
        let client = ca.generate_client_cert(&ClientIdentity {
            name: keys.user,
            groups: vec![SYSTEM_PRIVILEGED_GROUP.to_string()],
        })?;
        Ok(Self {
            cluster_name: cluster_name.to_string(),
            server: server.to_string(),
            ca_pem: ca.ca_cert_pem().to_string(),
            client_cert_pem: client.cert_pem().to_string(),
            client_key_pem: client.key_pem().to_string(),
        })
    }

    /// Keys this entry is written under
    pub fn keys(&self) -> EntryKeys {
        EntryKeys::for_cluster(&self.cluster_name)
    }
}

fn body<T: Serialize>(field: &str, value: &T) -> Result<serde_yaml::Mapping> {
    let mut mapping = serde_yaml::Mapping::new();
    mapping.insert(
        serde_yaml::Value::String(field.to_string()),
        serde_yaml::to_value(value)?,
    );
    Ok(mapping)
}

fn upsert(entries: &mut Vec<NamedEntry>, name: &str, body: serde_yaml::Mapping) {
    match entries.iter_mut().find(|e| e.name == name) {
        Some(existing) => existing.body = body,
        None => entries.push(NamedEntry {
            name: name.to_string(),
            body,
        }),
    }
}

fn delete(entries: &mut Vec<NamedEntry>, name: &str) -> bool {
    let before = entries.len();
    entries.retain(|e| e.name != name);
    entries.len() != before
}

/// Upsert the entry's triple into `config` and select its context
pub fn merge_entry(config: &mut Kubeconfig, entry: &CredentialsEntry) -> Result<()> {
    let keys = entry.keys();

    let cluster = body(
        "cluster",
        &ClusterBody {
            server: entry.server.clone(),
            certificate_authority_data: STANDARD.encode(&entry.ca_pem),
        },
    )?;
    let user = body(
        "user",
        &UserBody {
            client_certificate_data: STANDARD.encode(&entry.client_cert_pem),
            client_key_data: STANDARD.encode(&entry.client_key_pem),
        },
    )?;
    let context = body(
        "context",
        &ContextBody {
            cluster: keys.cluster.clone(),
            user: keys.user.clone(),
        },
    )?;

    upsert(&mut config.clusters, &keys.cluster, cluster);
    upsert(&mut config.users, &keys.user, user);
    upsert(&mut config.contexts, &keys.context, context);
    config.current_context = keys.context;
    Ok(())
}

/// Delete the triple for `cluster_name`, returning whether anything changed
pub fn remove_entry(config: &mut Kubeconfig, cluster_name: &str) -> bool {
    let keys = EntryKeys::for_cluster(cluster_name);

    let mut mutated = delete(&mut config.clusters, &keys.cluster);
    mutated |= delete(&mut config.users, &keys.user);
    mutated |= delete(&mut config.contexts, &keys.context);

    if config.current_context == keys.context {
        config.current_context.clear();
        mutated = true;
    }
    mutated
}

// =============================================================================
// File resolution and I/O
// =============================================================================

/// Where credentials were published
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedCredentials {
    /// Kubeconfig file that was written
    pub path: PathBuf,
    /// Context selected in that file
    pub context: String,
}

fn home_kubeconfig() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or_else(|| Error::credentials("unable to determine home directory"))
}

fn chain_from(env: Option<&OsStr>) -> Result<Vec<PathBuf>> {
    let chain: Vec<PathBuf> = env
        .map(|value| {
            std::env::split_paths(value)
                .filter(|p| !p.as_os_str().is_empty())
                .collect()
        })
        .unwrap_or_default();
    if chain.is_empty() {
        return Ok(vec![home_kubeconfig()?]);
    }
    Ok(chain)
}

/// Kubeconfig files consulted when no explicit path is given
pub fn loading_chain() -> Result<Vec<PathBuf>> {
    chain_from(std::env::var_os(KUBECONFIG_ENV).as_deref())
}

/// File merges are written to: `explicit`, else the first chain entry
pub fn default_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    loading_chain()?
        .into_iter()
        .next()
        .ok_or_else(|| Error::credentials("empty kubeconfig loading chain"))
}

/// Read a kubeconfig file; a missing file is an empty config
pub fn read_file(path: &Path) -> Result<Kubeconfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Kubeconfig::parse(&contents).map_err(|e| {
            Error::credentials(format!("failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Kubeconfig::new_v1()),
        Err(e) => Err(Error::credentials(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Write a kubeconfig atomically (temp file + rename) with mode 0600
pub fn write_file(path: &Path, config: &Kubeconfig) -> Result<()> {
    let contents = serde_yaml::to_string(config)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::credentials(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::credentials(format!("invalid kubeconfig path {}", path.display())))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(format!(".kbb8-{}.tmp", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    };

    write().map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        Error::credentials(format!("failed to write {}: {}", path.display(), e))
    })
}

/// Merge `entry` into the kubeconfig and make it the current context
pub fn publish(entry: &CredentialsEntry, explicit: Option<&Path>) -> Result<PublishedCredentials> {
    let path = default_path(explicit)?;

    let _guard = WRITE_LOCK.lock();
    let mut config = read_file(&path)?;
    merge_entry(&mut config, entry)?;
    write_file(&path, &config)?;

    info!(
        path = %path.display(),
        context = %config.current_context,
        "published credentials"
    );
    Ok(PublishedCredentials {
        path,
        context: config.current_context,
    })
}

/// Remove the entry for `cluster_name` from every file in the loading chain
///
/// Missing files are skipped and unchanged files are not rewritten, so
/// removing a name that was never published is a no-op.
pub fn remove(cluster_name: &str, explicit: Option<&Path>) -> Result<()> {
    let chain = match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => loading_chain()?,
    };

    let _guard = WRITE_LOCK.lock();
    for path in chain {
        if !path.exists() {
            debug!(path = %path.display(), "kubeconfig missing, skipping");
            continue;
        }
        let mut config = read_file(&path)?;
        if remove_entry(&mut config, cluster_name) {
            write_file(&path, &config)?;
            info!(path = %path.display(), cluster = cluster_name, "removed credentials");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn entry(name: &str, server: &str) -> CredentialsEntry {
        CredentialsEntry {
            cluster_name: name.to_string(),
            server: server.to_string(),
            ca_pem: "ca".to_string(),
            client_cert_pem: "cert".to_string(),
            client_key_pem: "key".to_string(),
        }
    }

    const FOREIGN: &str = r#"
apiVersion: v1
kind: Config
preferences:
  colors: true
clusters:
- name: prod
  cluster:
    server: https://prod.example.com
    insecure-skip-tls-verify: true
users:
- name: prod-admin
  user:
    token: abc
contexts:
- name: prod
  context:
    cluster: prod
    user: prod-admin
    namespace: default
current-context: prod
"#;

    #[test]
    fn keys_follow_prefix_convention() {
        let keys = EntryKeys::for_cluster("bootstrap");
        assert_eq!(keys.cluster, "kbb8-bootstrap");
        assert_eq!(keys.context, "kbb8-bootstrap");
        assert_eq!(keys.user, "kbb8-bootstrap-admin");
    }

    #[test]
    fn merge_into_empty_config() {
        let mut config = Kubeconfig::parse("").unwrap();
        merge_entry(&mut config, &entry("bootstrap", "https://127.0.0.1:6443")).unwrap();

        assert_eq!(config.cluster_names(), vec!["kbb8-bootstrap"]);
        assert_eq!(config.user_names(), vec!["kbb8-bootstrap-admin"]);
        assert_eq!(config.context_names(), vec!["kbb8-bootstrap"]);
        assert_eq!(config.current_context, "kbb8-bootstrap");

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("certificate-authority-data"));
        assert!(yaml.contains("client-certificate-data"));
        assert!(yaml.contains("client-key-data"));
        assert!(yaml.contains("current-context: kbb8-bootstrap"));
        assert!(yaml.contains(&STANDARD.encode("ca")));
    }

    /// Story: running kbb8 twice against the same kubeconfig
    ///
    /// The second merge replaces the first one in place; there is never more
    /// than one entry per key.
    #[test]
    fn story_merge_is_idempotent_and_second_wins() {
        let mut config = Kubeconfig::parse(FOREIGN).unwrap();
        merge_entry(&mut config, &entry("bootstrap", "https://127.0.0.1:1111")).unwrap();
        merge_entry(&mut config, &entry("bootstrap", "https://127.0.0.1:2222")).unwrap();

        assert_eq!(config.cluster_names(), vec!["prod", "kbb8-bootstrap"]);
        assert_eq!(config.user_names(), vec!["prod-admin", "kbb8-bootstrap-admin"]);
        assert_eq!(config.context_names(), vec!["prod", "kbb8-bootstrap"]);

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("https://127.0.0.1:2222"));
        assert!(!yaml.contains("https://127.0.0.1:1111"));
    }

    /// Story: removal leaves foreign entries and unknown fields alone
    #[test]
    fn story_remove_preserves_foreign_content() {
        let original = Kubeconfig::parse(FOREIGN).unwrap();
        let mut config = original.clone();
        merge_entry(&mut config, &entry("bootstrap", "https://127.0.0.1:6443")).unwrap();
        assert_eq!(config.current_context, "kbb8-bootstrap");

        assert!(remove_entry(&mut config, "bootstrap"));
        assert_eq!(config.cluster_names(), vec!["prod"]);
        assert_eq!(config.user_names(), vec!["prod-admin"]);
        assert_eq!(config.context_names(), vec!["prod"]);
        assert_eq!(config.current_context, "");

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("insecure-skip-tls-verify: true"));
        assert!(yaml.contains("namespace: default"));
        assert!(yaml.contains("colors: true"));
    }

    #[test]
    fn remove_keeps_foreign_current_context() {
        let mut config = Kubeconfig::parse(FOREIGN).unwrap();
        merge_entry(&mut config, &entry("bootstrap", "https://127.0.0.1:6443")).unwrap();
        config.current_context = "prod".to_string();

        assert!(remove_entry(&mut config, "bootstrap"));
        assert_eq!(config.current_context, "prod");
    }

    #[test]
    fn removing_unknown_name_does_not_mutate() {
        let mut config = Kubeconfig::parse(FOREIGN).unwrap();
        let before = config.clone();
        assert!(!remove_entry(&mut config, "never-merged"));
        assert_eq!(config, before);
    }

    #[test]
    fn chain_splits_kubeconfig_env() {
        let joined = std::env::join_paths(["/a/config", "/b/config"]).unwrap();
        let chain = chain_from(Some(joined.as_os_str())).unwrap();
        assert_eq!(
            chain,
            vec![PathBuf::from("/a/config"), PathBuf::from("/b/config")]
        );
    }

    #[test]
    fn empty_env_falls_back_to_home() {
        let chain = chain_from(Some(OsStr::new(""))).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(chain[0].ends_with(".kube/config"));
    }

    #[test]
    fn explicit_path_wins() {
        let path = default_path(Some(Path::new("/tmp/explicit"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/explicit"));
    }

    /// Story: publish to a fresh file, then clean up after ourselves
    #[test]
    fn story_publish_and_remove_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config");

        let published =
            publish(&entry("bootstrap", "https://127.0.0.1:6443"), Some(&path)).unwrap();
        assert_eq!(published.path, path);
        assert_eq!(published.context, "kbb8-bootstrap");

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let on_disk = read_file(&path).unwrap();
        assert_eq!(on_disk.current_context, "kbb8-bootstrap");

        remove("bootstrap", Some(&path)).unwrap();
        let on_disk = read_file(&path).unwrap();
        assert!(on_disk.clusters.is_empty());
        assert!(on_disk.current_context.is_empty());

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn remove_from_missing_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        remove("bootstrap", Some(&path)).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn remove_does_not_rewrite_unrelated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, FOREIGN).unwrap();

        remove("bootstrap", Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), FOREIGN);
    }

    #[test]
    fn issued_entry_carries_admin_identity() {
        let ca = CertificateAuthority::new("apiserver CA").unwrap();
        let entry = CredentialsEntry::issue(&ca, "bootstrap", "https://127.0.0.1:6443").unwrap();
        assert_eq!(entry.ca_pem, ca.ca_cert_pem());
        assert!(entry.client_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(!format!("{:?}", entry).contains("PRIVATE KEY"));
    }

    /// Story: the kubeconfig was last written by kubectl with nothing in it
    ///
    /// kubectl serializes empty lists and an unset context as `null`; the
    /// entry must still be published next to the preserved preferences, and
    /// removed again afterwards.
    #[test]
    fn story_publish_into_kubectl_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            "apiVersion: v1\nclusters: null\ncontexts: null\ncurrent-context: \"\"\nkind: Config\npreferences: {}\nusers: null\n",
        )
        .unwrap();

        let published =
            publish(&entry("bootstrap", "https://127.0.0.1:6443"), Some(&path)).unwrap();
        assert_eq!(published.context, "kbb8-bootstrap");

        let on_disk = read_file(&path).unwrap();
        assert_eq!(on_disk.cluster_names(), vec!["kbb8-bootstrap"]);
        assert_eq!(on_disk.user_names(), vec!["kbb8-bootstrap-admin"]);
        assert!(on_disk.extra.contains_key("preferences"));

        remove("bootstrap", Some(&path)).unwrap();
        let on_disk = read_file(&path).unwrap();
        assert!(on_disk.contexts.is_empty());
        assert!(on_disk.current_context.is_empty());
    }

    #[test]
    fn null_current_context_parses_as_unset() {
        let config =
            Kubeconfig::parse("apiVersion: v1\nkind: Config\ncurrent-context: null\nusers: null\n")
                .unwrap();
        assert!(config.current_context.is_empty());
        assert!(config.users.is_empty());
    }

    #[test]
    fn corrupt_file_is_a_credentials_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "clusters: {not: [a list").unwrap();
        assert!(matches!(read_file(&path), Err(Error::Credentials(_))));
    }
}
