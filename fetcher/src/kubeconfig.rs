use std::{
    env,
    ffi::OsStr,
    fmt, fs,
    path::{Path, PathBuf},
};

use base64::Engine as _;
use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read `{}`", path.display())]
    #[diagnostic(code(kubeconfig::io_error))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid kubeconfig `{}`", path.display())]
    #[diagnostic(code(kubeconfig::invalid))]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("kubeconfig has no current-context")]
    #[diagnostic(
        code(kubeconfig::no_current_context),
        help("select a context with `--context <name>`")
    )]
    NoCurrentContext,

    #[error("context `{0}` is not defined in the kubeconfig")]
    #[diagnostic(code(kubeconfig::unknown_context))]
    UnknownContext(String),

    #[error("cluster `{0}` is not defined in the kubeconfig")]
    #[diagnostic(code(kubeconfig::unknown_cluster))]
    UnknownCluster(String),

    #[error("user `{0}` is not defined in the kubeconfig")]
    #[diagnostic(code(kubeconfig::unknown_user))]
    UnknownUser(String),

    #[error("user `{0}` authenticates through an exec plugin, which is not supported")]
    #[diagnostic(
        code(kubeconfig::exec_unsupported),
        help("use a bearer token or client certificate credentials for verification runs")
    )]
    ExecAuthUnsupported(String),

    #[error("invalid base64 in `{field}`")]
    #[diagnostic(code(kubeconfig::invalid_base64))]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("in-cluster configuration unavailable: {0}")]
    #[diagnostic(code(kubeconfig::in_cluster))]
    InCluster(String),

    #[error("no cluster configuration found")]
    #[diagnostic(
        code(kubeconfig::not_found),
        help("pass `--kubeconfig`, set KUBECONFIG, create ~/.kube/config, or use `--fixtures`")
    )]
    NoConfiguration,

    #[error("failed to build the API client: {0}")]
    #[diagnostic(code(kubeconfig::client))]
    Client(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Where the connection settings were read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    Flag(PathBuf),
    Env(PathBuf),
    Home(PathBuf),
    InCluster,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Flag(path) => write!(f, "--kubeconfig {}", path.display()),
            ConfigSource::Env(path) => write!(f, "KUBECONFIG {}", path.display()),
            ConfigSource::Home(path) => write!(f, "{}", path.display()),
            ConfigSource::InCluster => f.write_str("in-cluster service account"),
        }
    }
}

/// Resolved settings for talking to one API server.
#[derive(Clone)]
pub struct Connection {
    pub server: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate followed by its private key, PEM encoded.
    pub identity_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub source: ConfigSource,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("has_ca", &self.ca_pem.is_some())
            .field("has_identity", &self.identity_pem.is_some())
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .field("source", &self.source)
            .finish()
    }
}

impl Connection {
    /// Resolve settings the way kubectl does: explicit path, then
    /// `KUBECONFIG`, then `~/.kube/config`, then the in-cluster service
    /// account.
    pub fn discover(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Self> {
        let home = env::var_os("HOME").map(PathBuf::from);
        let from_env = env::var_os("KUBECONFIG");
        match kubeconfig_path(kubeconfig, from_env.as_deref(), home.as_deref()) {
            Some(source) => Self::from_kubeconfig(source, context),
            None if env::var_os("KUBERNETES_SERVICE_HOST").is_some() => Self::in_cluster(),
            None => Err(ConfigError::NoConfiguration),
        }
    }

    pub fn from_kubeconfig(source: ConfigSource, context: Option<&str>) -> Result<Self> {
        let path = match &source {
            ConfigSource::Flag(path) | ConfigSource::Env(path) | ConfigSource::Home(path) => {
                path.clone()
            }
            ConfigSource::InCluster => return Self::in_cluster(),
        };
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let doc: Kubeconfig = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.clone(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or(Path::new("."));
        doc.connection(base_dir, context, source)
    }

    pub fn in_cluster() -> Result<Self> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ConfigError::InCluster("missing KUBERNETES_SERVICE_HOST".to_string()))?;
        let port = env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| ConfigError::InCluster("missing KUBERNETES_SERVICE_PORT".to_string()))?;
        let token = fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH).map_err(|err| {
            ConfigError::InCluster(format!("failed to read service account token: {err}"))
        })?;
        let ca_pem = fs::read(SERVICE_ACCOUNT_CA_PATH).map_err(|err| {
            ConfigError::InCluster(format!("failed to read service account CA: {err}"))
        })?;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        Ok(Self {
            server: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
            ca_pem: Some(ca_pem),
            identity_pem: None,
            insecure_skip_tls_verify: false,
            source: ConfigSource::InCluster,
        })
    }
}

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Pick the kubeconfig file to load, if any.
pub(crate) fn kubeconfig_path(
    flag: Option<&Path>,
    from_env: Option<&OsStr>,
    home: Option<&Path>,
) -> Option<ConfigSource> {
    if let Some(path) = flag {
        return Some(ConfigSource::Flag(path.to_path_buf()));
    }
    if let Some(paths) = from_env
        && let Some(first) = env::split_paths(paths).find(|p| !p.as_os_str().is_empty())
    {
        return Some(ConfigSource::Env(first));
    }
    let default = home?.join(".kube").join("config");
    default.exists().then_some(ConfigSource::Home(default))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct Kubeconfig {
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    users: Vec<NamedUser>,
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key: Option<PathBuf>,
    client_key_data: Option<String>,
    exec: Option<serde_yaml::Value>,
}

impl Kubeconfig {
    fn connection(
        &self,
        base_dir: &Path,
        context: Option<&str>,
        source: ConfigSource,
    ) -> Result<Connection> {
        let context_name = context
            .map(str::to_string)
            .or_else(|| self.current_context.clone())
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::NoCurrentContext)?;
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| ConfigError::UnknownContext(context_name.clone()))?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| ConfigError::UnknownCluster(context.cluster.clone()))?;

        let ca_pem = read_inline_or_file(
            base_dir,
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            "certificate-authority-data",
        )?;

        let mut token = None;
        let mut identity_pem = None;
        if let Some(user_name) = &context.user {
            let user = self
                .users
                .iter()
                .find(|u| &u.name == user_name)
                .map(|u| &u.user)
                .ok_or_else(|| ConfigError::UnknownUser(user_name.clone()))?;
            if user.exec.is_some() && user.token.is_none() && user.token_file.is_none() {
                return Err(ConfigError::ExecAuthUnsupported(user_name.clone()));
            }
            token = match (&user.token, &user.token_file) {
                (Some(token), _) => Some(token.trim().to_string()),
                (None, Some(file)) => {
                    let path = base_dir.join(file);
                    let raw = fs::read_to_string(&path)
                        .map_err(|source| ConfigError::Io { path, source })?;
                    Some(raw.trim().to_string())
                }
                (None, None) => None,
            };
            let cert = read_inline_or_file(
                base_dir,
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
                "client-certificate-data",
            )?;
            let key = read_inline_or_file(
                base_dir,
                user.client_key_data.as_deref(),
                user.client_key.as_deref(),
                "client-key-data",
            )?;
            if let (Some(mut cert), Some(key)) = (cert, key) {
                if !cert.ends_with(b"\n") {
                    cert.push(b'\n');
                }
                cert.extend_from_slice(&key);
                identity_pem = Some(cert);
            }
        }

        Ok(Connection {
            server: cluster.server.trim_end_matches('/').to_string(),
            token,
            ca_pem,
            identity_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            source,
        })
    }
}

fn read_inline_or_file(
    base_dir: &Path,
    inline: Option<&str>,
    file: Option<&Path>,
    field: &'static str,
) -> Result<Option<Vec<u8>>> {
    if let Some(data) = inline {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data.trim().as_bytes())
            .map_err(|source| ConfigError::Base64 { field, source })?;
        return Ok(Some(decoded));
    }
    if let Some(file) = file {
        let path = base_dir.join(file);
        let bytes = fs::read(&path).map_err(|source| ConfigError::Io { path, source })?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: kind-e2e
clusters:
  - name: kind-e2e
    cluster:
      server: https://127.0.0.1:6443/
      certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCg==
  - name: staging
    cluster:
      server: https://staging.example.com
      insecure-skip-tls-verify: true
contexts:
  - name: kind-e2e
    context:
      cluster: kind-e2e
      user: kind-e2e
      namespace: frontend
  - name: staging
    context:
      cluster: staging
      user: token-file
  - name: sso
    context:
      cluster: staging
      user: sso
users:
  - name: kind-e2e
    user:
      token: abc123
  - name: token-file
    user:
      tokenFile: token.txt
  - name: sso
    user:
      exec:
        apiVersion: client.authentication.k8s.io/v1
        command: sso-login
"#;

    fn write_kubeconfig(dir: &Path) -> PathBuf {
        let path = dir.join("config");
        fs::write(&path, KUBECONFIG).expect("write kubeconfig");
        fs::write(dir.join("token.txt"), "from-file\n").expect("write token");
        path
    }

    #[test]
    fn current_context_is_used_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_kubeconfig(dir.path());

        let conn = Connection::from_kubeconfig(ConfigSource::Flag(path), None).expect("connection");
        assert_eq!(conn.server, "https://127.0.0.1:6443");
        assert_eq!(conn.token.as_deref(), Some("abc123"));
        assert_eq!(
            conn.ca_pem.as_deref(),
            Some(b"-----BEGIN CERTIFICATE-----\n".as_slice())
        );
        assert!(!conn.insecure_skip_tls_verify);
    }

    #[test]
    fn explicit_context_reads_token_file_relative_to_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_kubeconfig(dir.path());

        let conn = Connection::from_kubeconfig(ConfigSource::Flag(path), Some("staging"))
            .expect("connection");
        assert_eq!(conn.server, "https://staging.example.com");
        assert_eq!(conn.token.as_deref(), Some("from-file"));
        assert!(conn.insecure_skip_tls_verify);
        assert!(conn.ca_pem.is_none());
    }

    #[test]
    fn unknown_context_and_exec_users_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_kubeconfig(dir.path());

        let err = Connection::from_kubeconfig(ConfigSource::Flag(path.clone()), Some("prod"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownContext(name) if name == "prod"));

        let err =
            Connection::from_kubeconfig(ConfigSource::Flag(path), Some("sso")).unwrap_err();
        assert!(matches!(err, ConfigError::ExecAuthUnsupported(user) if user == "sso"));
    }

    #[test]
    fn missing_file_reports_the_path() {
        let err = Connection::from_kubeconfig(
            ConfigSource::Flag(PathBuf::from("/nonexistent/kubeconfig")),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/kubeconfig"), "{err}");
    }

    #[test]
    fn kubeconfig_path_prefers_flag_then_env_then_home() {
        let home = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(home.path().join(".kube")).expect("mkdir");
        fs::write(home.path().join(".kube/config"), KUBECONFIG).expect("write");

        let flag = PathBuf::from("/tmp/flag-config");
        let env_value = OsString::from("/tmp/env-config");

        assert_eq!(
            kubeconfig_path(Some(&flag), Some(&env_value), Some(home.path())),
            Some(ConfigSource::Flag(flag.clone()))
        );
        assert_eq!(
            kubeconfig_path(None, Some(&env_value), Some(home.path())),
            Some(ConfigSource::Env(PathBuf::from("/tmp/env-config")))
        );
        assert_eq!(
            kubeconfig_path(None, None, Some(home.path())),
            Some(ConfigSource::Home(home.path().join(".kube/config")))
        );
    }

    #[test]
    fn kubeconfig_path_is_none_without_candidates() {
        let home = tempfile::tempdir().expect("tempdir");
        assert_eq!(kubeconfig_path(None, None, Some(home.path())), None);
        assert_eq!(kubeconfig_path(None, Some(OsStr::new("")), None), None);
    }
}
