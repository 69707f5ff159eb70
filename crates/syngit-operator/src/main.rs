//! syngit - mirror intercepted cluster writes into Git

use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};

use syngit_common::crd::{RemoteSyncer, RemoteTarget, RemoteUser, RemoteUserBinding};
use syngit_common::telemetry::{init_telemetry, TelemetryConfig};
use syngit_operator::config::Cli;
use syngit_operator::context::Context;
use syngit_operator::controller::build_webhook_config_controller;
use syngit_operator::registry::InterceptorRegistry;
use syngit_operator::server::{serve, WebhookState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print_crds()?;
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        bind_address = %cli.bind_address,
        manager_namespace = %cli.manager_namespace,
        feature_gates = %cli.feature_gates,
        "starting syngit"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let ctx = Arc::new(Context::new(
        client.clone(),
        cli.manager_namespace.clone(),
        cli.feature_gates,
    ));
    let registry = Arc::new(InterceptorRegistry::new());

    if cli.disable_webhook_config_controller {
        tracing::info!("webhook configuration controller disabled");
    } else {
        let service = cli.webhook_service()?;
        tracing::info!("Starting controllers:");
        tokio::spawn(build_webhook_config_controller(
            client,
            registry.clone(),
            service,
        ));
    }

    let state = Arc::new(WebhookState::new(ctx, registry));
    serve(state, cli.bind_address, cli.tls_files()).await?;
    Ok(())
}

/// Print every CRD as a multi-document YAML stream
fn print_crds() -> anyhow::Result<()> {
    let crds = [
        RemoteSyncer::crd(),
        RemoteUser::crd(),
        RemoteUserBinding::crd(),
        RemoteTarget::crd(),
    ];
    let mut documents = Vec::with_capacity(crds.len());
    for crd in &crds {
        documents.push(
            serde_yaml::to_string(crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?,
        );
    }
    println!("{}", documents.join("---\n"));
    Ok(())
}
