use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;

use tm_domain::config::ObservabilityConfig;
use tm_runtime::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Config(ConfigCommand::Validate) => {
            let (config, config_path) = tm_runtime::cli::load_config()?;
            if !tm_runtime::cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            let (config, _config_path) = tm_runtime::cli::load_config()?;
            tm_runtime::cli::config::show(&config)
        }
        Command::Ask {
            message,
            bot,
            approve_tools,
        } => {
            let (config, _) = tm_runtime::cli::load_config()?;
            let tracer_provider = match config.observability.otlp_endpoint {
                Some(_) => init_tracing(&config.observability),
                None => {
                    init_cli_tracing();
                    None
                }
            };
            let result = tm_runtime::cli::ask::run(Arc::new(config), bot, message, approve_tools).await;
            if let Some(provider) = tracer_provider {
                if let Err(e) = provider.shutdown() {
                    eprintln!("WARNING: OpenTelemetry shutdown failed: {e}");
                }
            }
            result
        }
        Command::Version => {
            println!("threadmind {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing with an OpenTelemetry layer.
///
/// Every `tracing` span is also exported over OTLP/gRPC. The returned
/// [`SdkTracerProvider`](opentelemetry_sdk::trace::SdkTracerProvider) must be
/// shut down on exit to flush pending spans.
fn init_tracing(obs: &ObservabilityConfig) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tm_runtime=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr);

    let Some(endpoint) = &obs.otlp_endpoint else {
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
        return None;
    };

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!("WARNING: failed to create OTLP exporter for {endpoint}: {e}, starting without OpenTelemetry");
            tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
            return None;
        }
    };

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(obs.service_name.clone())
        .build();

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(obs.sample_rate))
        .with_resource(resource)
        .build();

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("threadmind"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Some(tracer_provider)
}

/// Compact stderr-only tracing for one-shot commands.
///
/// Defaults to `warn` so diagnostics stay out of stdout.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
