//! Connection preferences and client construction.

use std::collections::{BTreeMap, HashMap};

use kube::config::{
    AuthInfo, Cluster, Context, ExecConfig, KubeConfigOptions, Kubeconfig, KubeconfigError, NamedAuthInfo,
    NamedCluster, NamedContext,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PrefsError {
    #[error("cluster preferences have no host")]
    MissingHost,
    #[error("kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),
}

/// TLS material, base64-encoded PEM as in a kubeconfig.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsMaterial {
    pub ca_data: Option<String>,
    pub cert_data: Option<String>,
    pub key_data: Option<String>,
    pub insecure: bool,
}

/// Exec credential plugin invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecCredential {
    pub api_version: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Everything needed to reach one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterPreferences {
    pub name: String,
    pub host: String,
    pub bearer_token: Option<String>,
    pub tls: TlsMaterial,
    pub exec: Option<ExecCredential>,
    /// Default namespace for namespaced requests.
    pub namespace: Option<String>,
}

impl ClusterPreferences {
    pub fn new(host: impl Into<String>) -> Self { Self { name: "kestrel".into(), host: host.into(), ..Default::default() } }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> { serde_json::from_str(s) }

    fn context_name(&self) -> &str { if self.name.is_empty() { "kestrel" } else { &self.name } }

    fn exec_config(&self) -> Option<ExecConfig> {
        let exec = self.exec.as_ref()?;
        let env = exec
            .env
            .iter()
            .map(|(k, v)| HashMap::from([("name".to_string(), k.clone()), ("value".to_string(), v.clone())]))
            .collect();
        Some(ExecConfig {
            api_version: Some(exec.api_version.clone()),
            command: Some(exec.command.clone()),
            args: Some(exec.args.clone()),
            env: Some(env),
            drop_env: None,
            interactive_mode: None,
            provide_cluster_info: false,
            cluster: None,
        })
    }

    /// Single-context kubeconfig describing these preferences.
    pub fn kubeconfig(&self) -> Result<Kubeconfig, PrefsError> {
        if self.host.is_empty() {
            return Err(PrefsError::MissingHost);
        }
        let name = self.context_name().to_string();
        Ok(Kubeconfig {
            clusters: vec![NamedCluster {
                name: name.clone(),
                cluster: Some(Cluster {
                    server: Some(self.host.clone()),
                    insecure_skip_tls_verify: self.tls.insecure.then_some(true),
                    certificate_authority_data: self.tls.ca_data.clone(),
                    ..Default::default()
                }),
            }],
            auth_infos: vec![NamedAuthInfo {
                name: name.clone(),
                auth_info: Some(AuthInfo {
                    token: self.bearer_token.clone().map(Into::into),
                    client_certificate_data: self.tls.cert_data.clone(),
                    client_key_data: self.tls.key_data.clone().map(Into::into),
                    exec: self.exec_config(),
                    ..Default::default()
                }),
            }],
            contexts: vec![NamedContext {
                name: name.clone(),
                context: Some(Context {
                    cluster: name.clone(),
                    user: name.clone(),
                    namespace: self.namespace.clone(),
                    ..Default::default()
                }),
            }],
            current_context: Some(name),
            ..Default::default()
        })
    }

    /// Client configuration for these preferences.
    pub async fn client_config(&self) -> Result<kube::Config, PrefsError> {
        let kubeconfig = self.kubeconfig()?;
        Ok(kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
    }
}
