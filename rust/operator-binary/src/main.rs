use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use clap::{Args, Parser};
use futures::{future, stream::StreamExt};
use stackable_operator::{
    YamlSchema,
    cli::{Command, ProductOperatorRun},
    client::Client,
    k8s_openapi::api::{
        apps::v1::{Deployment, StatefulSet},
        core::v1::{ConfigMap, Service},
    },
    kube::{
        CustomResourceExt,
        ResourceExt,
        core::DeserializeGuard,
        runtime::{
            Controller,
            events::{Recorder, Reporter},
            reflector::ObjectRef,
            watcher,
        },
    },
    logging::controller::report_controller_reconciled,
    shared::yaml::SerializeOptions,
};

use crate::{
    config::OperatorConfig,
    controller::{
        risingwave::RISINGWAVE_FULL_CONTROLLER_NAME, scale_view::SCALE_VIEW_FULL_CONTROLLER_NAME,
    },
    crd::{
        OPERATOR_NAME,
        RisingWave,
        RisingWavePodTemplate,
        RisingWaveScaleView,
        external::{AdvancedStatefulSet, CloneSet},
    },
    event::MessageStore,
    features::{FeatureGates, FeatureName},
    metrics::OperatorMetrics,
    webhook::WebhookState,
};

mod config;
mod controller;
mod crd;
mod event;
mod factory;
mod features;
mod metrics;
mod scale_view;
mod state;
mod sync;
mod webhook;
mod workload;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Oldest Kubernetes release the operator supports.
const MIN_KUBERNETES_VERSION: semver::Version = semver::Version::new(1, 21, 0);

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<RisingWaveRun>,
}

#[derive(Args)]
struct RisingWaveRun {
    #[clap(flatten)]
    common: ProductOperatorRun,

    /// Comma separated `name=bool` pairs.
    #[arg(long, env = "FEATURE_GATES", default_value = "")]
    feature_gates: String,

    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,

    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    #[arg(long, default_value = "0.0.0.0:9443")]
    webhook_bind_address: SocketAddr,

    #[arg(long)]
    leader_elect: bool,

    #[arg(long)]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            for crd in [
                RisingWave::crd(),
                RisingWaveScaleView::crd(),
                RisingWavePodTemplate::crd(),
            ] {
                crd.print_yaml_schema(built_info::PKG_VERSION, SerializeOptions::default())?;
            }
        }
        Command::Run(run) => {
            let RisingWaveRun {
                common:
                    ProductOperatorRun {
                        watch_namespace,
                        tracing_target,
                        cluster_info_opts,
                        ..
                    },
                feature_gates,
                metrics_bind_address,
                health_probe_bind_address,
                webhook_bind_address,
                leader_elect,
                config_file,
            } = run;

            stackable_operator::logging::initialize_logging(
                "RISINGWAVE_OPERATOR_LOG",
                "risingwave-operator",
                tracing_target,
            );
            tracing::info!(
                built_info.pkg_version = built_info::PKG_VERSION,
                built_info.git_version = built_info::GIT_VERSION,
                built_info.target = built_info::TARGET,
                built_info.built_time_utc = built_info::BUILT_TIME_UTC,
                built_info.rustc_version = built_info::RUSTC_VERSION,
                "Starting {description}",
                description = built_info::PKG_DESCRIPTION
            );

            let feature_gates =
                Arc::new(FeatureGates::parse(&feature_gates).context("invalid --feature-gates")?);
            let config = match &config_file {
                Some(path) => OperatorConfig::from_file(path)?,
                None => OperatorConfig::default(),
            };
            let open_kruise_available =
                config.open_kruise.enable || feature_gates.is_enabled(FeatureName::EnableOpenKruise);
            tracing::info!(
                open_kruise_available,
                leader_elect,
                webhook.enable = config.webhook.enable,
                "Loaded operator configuration"
            );
            if leader_elect {
                tracing::warn!("Leader election is not supported, running as the only instance");
            }

            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|_| anyhow::anyhow!("failed to install the rustls crypto provider"))?;

            let client = stackable_operator::client::initialize_operator(
                Some(OPERATOR_NAME.to_string()),
                &cluster_info_opts,
            )
            .await?;
            check_kubernetes_version(&client).await?;

            let metrics = OperatorMetrics::new()?;

            let webhook_server = {
                let state = Arc::new(WebhookState {
                    client: client.clone(),
                    open_kruise_available,
                    metrics: metrics.clone(),
                });
                let webhook_config = config.webhook.clone();
                async move {
                    if webhook_config.enable {
                        webhook::serve(webhook_bind_address, &webhook_config, state).await?;
                    } else {
                        future::pending::<()>().await;
                    }
                    anyhow::Ok(())
                }
            };

            let risingwave_recorder = Arc::new(Recorder::new(
                client.as_kube_client(),
                Reporter {
                    controller: RISINGWAVE_FULL_CONTROLLER_NAME.to_string(),
                    instance: None,
                },
            ));
            let mut risingwave_controller = Controller::new(
                watch_namespace.get_api::<DeserializeGuard<RisingWave>>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<Service>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<ConfigMap>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<Deployment>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<StatefulSet>(&client),
                watcher::Config::default(),
            );
            if open_kruise_available {
                risingwave_controller = risingwave_controller
                    .owns(
                        watch_namespace.get_api::<CloneSet>(&client),
                        watcher::Config::default(),
                    )
                    .owns(
                        watch_namespace.get_api::<AdvancedStatefulSet>(&client),
                        watcher::Config::default(),
                    );
            }
            let risingwave_controller = risingwave_controller
                .shutdown_on_signal()
                .run(
                    controller::risingwave::reconcile_risingwave,
                    controller::risingwave::error_policy,
                    Arc::new(controller::risingwave::Ctx {
                        client: client.clone(),
                        config: config.clone(),
                        open_kruise_available,
                        messages: Arc::new(MessageStore::default()),
                        metrics: metrics.clone(),
                        event_recorder: risingwave_recorder.clone(),
                    }),
                )
                // We can let the reporting happen in the background
                .for_each_concurrent(
                    16, // concurrency limit
                    move |result| {
                        // The event_recorder needs to be shared across all invocations, so that
                        // events are correctly aggregated
                        let event_recorder = risingwave_recorder.clone();
                        async move {
                            report_controller_reconciled(
                                &event_recorder,
                                RISINGWAVE_FULL_CONTROLLER_NAME,
                                &result,
                            )
                            .await;
                        }
                    },
                );

            let scale_view_recorder = Arc::new(Recorder::new(
                client.as_kube_client(),
                Reporter {
                    controller: SCALE_VIEW_FULL_CONTROLLER_NAME.to_string(),
                    instance: None,
                },
            ));
            let scale_view_controller = Controller::new(
                watch_namespace.get_api::<DeserializeGuard<RisingWaveScaleView>>(&client),
                watcher::Config::default(),
            );
            let scale_view_store = scale_view_controller.store();
            let scale_view_controller = scale_view_controller
                .shutdown_on_signal()
                .watches(
                    watch_namespace.get_api::<DeserializeGuard<RisingWave>>(&client),
                    watcher::Config::default(),
                    move |risingwave| {
                        let name = risingwave.name_any();
                        let namespace = risingwave.namespace();
                        scale_view_store
                            .state()
                            .into_iter()
                            .filter(|scale_view| {
                                scale_view.0.as_ref().is_ok_and(|sv| {
                                    sv.spec.target_ref.name == name && sv.namespace() == namespace
                                })
                            })
                            .map(|scale_view| ObjectRef::from_obj(&*scale_view))
                            .collect::<Vec<_>>()
                    },
                )
                .run(
                    controller::scale_view::reconcile_scale_view,
                    controller::scale_view::error_policy,
                    Arc::new(controller::scale_view::Ctx {
                        client: client.clone(),
                        metrics: metrics.clone(),
                    }),
                )
                .for_each_concurrent(16, move |result| {
                    let event_recorder = scale_view_recorder.clone();
                    async move {
                        report_controller_reconciled(
                            &event_recorder,
                            SCALE_VIEW_FULL_CONTROLLER_NAME,
                            &result,
                        )
                        .await;
                    }
                });

            let servers = future::try_join3(
                serve_metrics(metrics_bind_address, metrics),
                serve_health_probes(health_probe_bind_address),
                webhook_server,
            );

            tokio::select! {
                _ = future::join(risingwave_controller, scale_view_controller) => {}
                result = servers => { result?; }
            }
        }
    }

    Ok(())
}

async fn check_kubernetes_version(client: &Client) -> anyhow::Result<()> {
    let info = client
        .as_kube_client()
        .apiserver_version()
        .await
        .context("failed to get the Kubernetes version")?;
    let major = info.major.trim_end_matches('+').parse::<u64>();
    let minor = info.minor.trim_end_matches('+').parse::<u64>();
    let (Ok(major), Ok(minor)) = (major, minor) else {
        bail!(
            "unexpected Kubernetes version {}.{}",
            info.major,
            info.minor
        );
    };

    let version = semver::Version::new(major, minor, 0);
    if version < MIN_KUBERNETES_VERSION {
        bail!("Kubernetes {version} is not supported, at least {MIN_KUBERNETES_VERSION} is required");
    }
    tracing::info!(%version, git_version = %info.git_version, "Kubernetes version is supported");
    Ok(())
}

async fn metrics_handler(State(metrics): State<OperatorMetrics>) -> (StatusCode, String) {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

async fn serve_metrics(addr: SocketAddr, metrics: OperatorMetrics) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind the metrics address {addr}"))?;
    tracing::info!(%addr, "Serving metrics");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn serve_health_probes(addr: SocketAddr) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind the health probe address {addr}"))?;
    tracing::info!(%addr, "Serving health probes");
    axum::serve(listener, router).await?;
    Ok(())
}
