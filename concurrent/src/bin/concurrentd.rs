// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of concurrent.
//
// concurrent is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// concurrent is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with concurrent.  If not,
// see <http://www.gnu.org/licenses/>.

//! # concurrentd
//!
//! A node in the concurrent network of federated timelines.
//!
//! # Introduction
//!
//! `concurrentd` reads its configuration, connects to its datastore & cache, and serves the
//! concurrent API until told to stop. It stays in the foreground & logs to stdout; run it under
//! a process supervisor (or in a container) for anything long-lived.
//!
//! Send it `SIGHUP` to re-read configuration & re-build its connections; `SIGTERM` to exit.

use std::{fmt::Display, future::IntoFuture, io, path::PathBuf, sync::Arc};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use snafu::prelude::*;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use concurrent::{
    api::make_world_router,
    concurrent::Node,
    config::{parse_config, ConfigV1, OtelExportConfig},
    metrics::check_metric_names,
};

/// The concurrentd application error type
///
/// Like any binary's error type, this one is meant to be read by operators, so I implement [Debug]
/// by hand in terms of [Display]: `main()` returns `Result<(), Error>` & the Rust runtime prints
/// the `Debug` form on failure.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("{source}"))]
    Config { source: concurrent::config::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to start the node: {source}"))]
    Node {
        #[snafu(source(from(concurrent::concurrent::Error, Box::new)))]
        source: Box<concurrent::concurrent::Error>,
    },
    #[snafu(display("While building the OLTP exporter, {source}"))]
    OltpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

/// Build the formatting layer & filter for the process' logging
///
/// Output always goes to stdout; `--plain` selects a compact, human-readable format over JSON.
fn configure_logging(logopts: &LogOpts) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers *of different types*, hence the box.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

/// Serve concurrent API requests
#[tracing::instrument(skip(opts, cfg), fields(fqdn = %cfg.fqdn))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    let exporter = init_telemetry(cfg.otlp_export.as_ref())?;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build the node each pass, in case configuration values have changed:
        let node = Node::new(&cfg, exporter.clone()).await.context(NodeSnafu)?;
        info!("Serving {} on {}", cfg.fqdn, cfg.public_address);

        let nfy = Arc::new(Notify::new());
        let mut server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(node.state()),
        )
        .with_graceful_shutdown(shutdown_signal(nfy.clone()))
        .into_future();

        tokio::select! {
            // The server *should* never shutdown on its own.
            res = &mut server => {
                error!("The server exited unexpectedly ({res:?}); shutting-down.");
                node.shutdown().await;
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; closing connections to re-read configuration.");
                nfy.notify_one();
                log_on_err(server.await);
                node.shutdown().await;
                // Failure to parse here isn't fatal; keep going with the last good configuration.
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("Failed to re-read configuration ({err}); keeping the old one.");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                nfy.notify_one();
                log_on_err(server.await);
                node.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// This must be invoked from inside the Tokio runtime, but before any instruments are accessed.
/// Return an exporter that can be used to implement a `/metrics` endpoint; if `collector_config`
/// is given, metrics are additionally pushed to an OTLP collector.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<PrometheusExporter> {
    check_metric_names();
    let prometheus_exporter = PrometheusExporter::new();

    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "concurrent"))
                .build(),
        )
        .with_reader(prometheus_exporter.clone());

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OltpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    global::set_meter_provider(provider.build());

    Ok(prometheus_exporter)
}

/// Read configuration, set up logging & serve
///
/// Failure to parse configuration at this point is fatal; on `SIGHUP`, `serve()` falls back to
/// the last good configuration instead.
async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(ConfigV1, Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
        let cfg = parse_config(&opts.cfg).context(ConfigSnafu)?;
        let (formatter, filter) = configure_logging(&opts.log_opts)?;
        Ok((cfg, formatter, filter))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter)) => {
            // Nb. this can only be invoked once!
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            drop(bootstrap_logging_guard);

            info!("concurrent version {} starting.", crate_version!());

            serve(opts, cfg).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    // Most of concurrentd's configuration is read from file; the few command-line options it
    // accepts govern where to find that file & how to log. They all have corresponding
    // environment variables for the sake of running in a container.
    let opts = CliOpts::new(
        Command::new("concurrentd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A node in a federated network of timelines")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("CONCURRENT_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CONCURRENT_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CONCURRENT_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CONCURRENT_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CONCURRENT_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    // Plenty can go wrong before we've parsed our configuration & configured logging for real;
    // log to stderr until then (<https://github.com/tokio-rs/tracing/issues/2903>).
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}
