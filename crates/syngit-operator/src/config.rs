//! Command line and environment configuration

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use syngit_common::{Error, Result, DEFAULT_MANAGER_NAMESPACE};

/// Name of the feature gate enabling the ResourceFinder
pub const GATE_RESOURCE_FINDER: &str = "ResourceFinder";

/// syngit - mirror intercepted cluster writes into Git
#[derive(Parser, Debug, Clone)]
#[command(name = "syngit", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Address the admission server listens on
    #[arg(long, env = "SYNGIT_BIND_ADDRESS", default_value = "0.0.0.0:9443")]
    pub bind_address: SocketAddr,

    /// PEM certificate served by the admission server
    #[arg(long, env = "SYNGIT_TLS_CERT_FILE", requires = "tls_key_file")]
    pub tls_cert_file: Option<PathBuf>,

    /// PEM private key of the serving certificate
    #[arg(long, env = "SYNGIT_TLS_KEY_FILE", requires = "tls_cert_file")]
    pub tls_key_file: Option<PathBuf>,

    /// Namespace holding cluster default ConfigMaps and host CA bundles
    #[arg(long, env = "MANAGER_NAMESPACE", default_value = DEFAULT_MANAGER_NAMESPACE)]
    pub manager_namespace: String,

    /// Feature gates, `Name=bool` separated by commas
    #[arg(long, env = "SYNGIT_FEATURE_GATES", default_value = "")]
    pub feature_gates: FeatureGates,

    /// Service fronting the admission server, referenced by the dynamic webhooks
    #[arg(
        long,
        env = "SYNGIT_WEBHOOK_SERVICE_NAME",
        default_value = "syngit-webhook-service"
    )]
    pub webhook_service_name: String,

    /// Port of the webhook service
    #[arg(long, env = "SYNGIT_WEBHOOK_SERVICE_PORT", default_value_t = 443)]
    pub webhook_service_port: i32,

    /// PEM CA bundle the API server uses to trust the webhook service
    #[arg(long, env = "SYNGIT_WEBHOOK_CA_BUNDLE_FILE")]
    pub webhook_ca_bundle_file: Option<PathBuf>,

    /// Do not manage the dynamic ValidatingWebhookConfiguration
    #[arg(long, env = "SYNGIT_DISABLE_WEBHOOK_CONFIG_CONTROLLER")]
    pub disable_webhook_config_controller: bool,
}

impl Cli {
    /// Serving certificate and key, when both are configured
    pub fn tls_files(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }

    /// Where the API server reaches the dynamic admission endpoints
    pub fn webhook_service(&self) -> Result<WebhookService> {
        let ca_bundle = match &self.webhook_ca_bundle_file {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                Error::internal_with_context(
                    "config",
                    format!("failed to read {}: {}", path.display(), e),
                )
            })?),
            None => None,
        };
        Ok(WebhookService {
            name: self.webhook_service_name.clone(),
            namespace: self.manager_namespace.clone(),
            port: self.webhook_service_port,
            ca_bundle,
        })
    }
}

/// Service the dynamic webhook entries point at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WebhookService {
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
    /// Service port
    pub port: i32,
    /// CA bundle (PEM) of the serving certificate
    pub ca_bundle: Option<Vec<u8>>,
}

/// Optional behaviours toggled at startup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates {
    /// Edit existing manifests found anywhere in the repository
    pub resource_finder: bool,
}

impl FromStr for FeatureGates {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut gates = FeatureGates::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("feature gate {:?} must be Name=bool", entry))?;
            let enabled: bool = value
                .trim()
                .parse()
                .map_err(|_| format!("feature gate {} has a non boolean value {:?}", name, value))?;
            match name.trim() {
                GATE_RESOURCE_FINDER => gates.resource_finder = enabled,
                other => return Err(format!("unknown feature gate {}", other)),
            }
        }
        Ok(gates)
    }
}

impl fmt::Display for FeatureGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", GATE_RESOURCE_FINDER, self.resource_finder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_gates_parse() {
        assert_eq!(FeatureGates::from_str("").unwrap(), FeatureGates::default());
        assert!(
            FeatureGates::from_str("ResourceFinder=true")
                .unwrap()
                .resource_finder
        );
        assert!(
            !FeatureGates::from_str(" ResourceFinder = false ,")
                .unwrap()
                .resource_finder
        );
        assert!(FeatureGates::from_str("ResourceFinder").is_err());
        assert!(FeatureGates::from_str("ResourceFinder=yes").is_err());
        assert!(FeatureGates::from_str("Unknown=true").is_err());
    }

    #[test]
    fn defaults_apply_without_flags() {
        let cli = Cli::try_parse_from(["syngit"]).unwrap();
        assert_eq!(cli.bind_address.port(), 9443);
        assert!(!cli.crd);
        assert!(cli.tls_files().is_none());
        assert!(!cli.feature_gates.resource_finder);
    }

    #[test]
    fn tls_files_come_in_pairs() {
        assert!(Cli::try_parse_from(["syngit", "--tls-cert-file", "/tls/tls.crt"]).is_err());
        let cli = Cli::try_parse_from([
            "syngit",
            "--tls-cert-file",
            "/tls/tls.crt",
            "--tls-key-file",
            "/tls/tls.key",
        ])
        .unwrap();
        assert!(cli.tls_files().is_some());
    }

    /// Story: the webhook service points at the manager namespace
    #[test]
    fn story_webhook_service_lives_in_the_manager_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.crt");
        std::fs::write(&ca, b"PEM").unwrap();
        let cli = Cli::try_parse_from([
            "syngit",
            "--manager-namespace",
            "syngit-system",
            "--webhook-ca-bundle-file",
            ca.to_str().unwrap(),
        ])
        .unwrap();
        let service = cli.webhook_service().unwrap();
        assert_eq!(service.namespace, "syngit-system");
        assert_eq!(service.port, 443);
        assert_eq!(service.ca_bundle.as_deref(), Some(&b"PEM"[..]));

        let cli = Cli::try_parse_from([
            "syngit",
            "--webhook-ca-bundle-file",
            "/does/not/exist",
        ])
        .unwrap();
        assert!(cli.webhook_service().is_err());
    }
}
