//! Process bootstrap: configuration layering, logging setup and engine wiring.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::prelude::*;

use tce_common::prelude::*;
use tce_txn::{ActionInvoker, CoordinationEngine, InMemoryRecordStore, Participant, StepInvocation};

use crate::remote::{HttpActionInvoker, HttpParticipant};

/// Values given on the command line. They override the file and are
/// overridden by `TCE_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_addr: Option<String>,
    pub http_port: Option<u16>,
    pub log_level: Option<String>,
    pub action_endpoint: Option<String>,
}

/// Load the configuration: defaults, then the TOML file if it exists, then
/// command line overrides, then environment variables.
pub fn load_config(path: &Path, overrides: &Overrides) -> anyhow::Result<EngineConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
    } else {
        EngineConfig::default()
    };

    if let Some(listen) = &overrides.listen_addr {
        config.server.listen_addr = listen.clone();
    }
    if let Some(port) = overrides.http_port {
        config.server.http_port = port;
    }
    if let Some(level) = &overrides.log_level {
        config.logging.level = level.clone();
    }
    if let Some(endpoint) = &overrides.action_endpoint {
        config.server.action_endpoint = Some(endpoint.clone());
    }

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Apply `TCE_*` variables. Values that fail to parse are ignored.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let duration = |name: &str| lookup(name).and_then(|v| humantime::parse_duration(&v).ok());

    if let Some(val) = lookup("TCE_LISTEN_ADDR") {
        config.server.listen_addr = val;
    }
    if let Some(port) = lookup("TCE_HTTP_PORT").and_then(|v| v.parse().ok()) {
        config.server.http_port = port;
    }
    if let Some(val) = lookup("TCE_ACTION_ENDPOINT") {
        config.server.action_endpoint = Some(val);
    }
    if let Some(val) = lookup("TCE_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(val) = lookup("TCE_LOG_FORMAT") {
        config.logging.format = val;
    }
    if let Some(val) = lookup("TCE_LOG_FILE") {
        config.logging.file = Some(val.into());
    }
    if let Some(val) = lookup("TCE_COORDINATOR_ID") {
        config.two_phase.coordinator_id = val;
    }
    if let Some(retries) = lookup("TCE_MAX_CONFLICT_RETRIES").and_then(|v| v.parse().ok()) {
        config.occ.max_conflict_retries = retries;
    }
    if let Some(enabled) = lookup("TCE_DEADLOCK_ENABLED").and_then(|v| v.parse().ok()) {
        config.deadlock.enabled = enabled;
    }
    if let Some(d) = duration("TCE_STEP_TIMEOUT") {
        config.saga.step_timeout = d;
    }
    if let Some(d) = duration("TCE_PREPARE_TIMEOUT") {
        config.two_phase.prepare_timeout = d;
    }
    if let Some(d) = duration("TCE_COMMIT_TIMEOUT") {
        config.two_phase.commit_timeout = d;
    }
    if let Some(d) = duration("TCE_DEFAULT_LEASE") {
        config.locks.default_lease = d;
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_logging(config: &LoggingConfig, verbose: bool) {
    let log_level = if verbose { "debug" } else { config.level.as_str() };
    let env_filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::filter::EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info"));

    let use_json = config.format == "json";

    let console_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if use_json {
        Box::new(tracing_subscriber::fmt::layer().with_target(true).json())
    } else {
        Box::new(tracing_subscriber::fmt::layer().with_target(true))
    };

    // Optional file layer with daily rotation
    let file_layer: Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> =
        if let Some(ref log_file) = config.file {
            let file_appender = tracing_appender::rolling::daily(
                log_file.parent().unwrap_or_else(|| Path::new(".")),
                log_file
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("tce.log")),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Keep file logging alive for the process lifetime
            std::mem::forget(guard);
            if use_json {
                Some(Box::new(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .json(),
                ))
            } else {
                Some(Box::new(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                ))
            }
        } else {
            None
        };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

/// Invoker used when no action endpoint is configured. Every step fails.
struct NoActionEndpoint;

#[async_trait]
impl ActionInvoker for NoActionEndpoint {
    async fn invoke(&self, invocation: StepInvocation) -> Result<Payload> {
        Err(Error::Config(format!(
            "no action endpoint configured for step type '{}'",
            invocation.step_type
        )))
    }
}

/// Build the engine with HTTP participants and action invoker from config.
pub fn build_engine(config: EngineConfig) -> anyhow::Result<Arc<CoordinationEngine>> {
    if !config.server.sagas.is_empty() && config.server.action_endpoint.is_none() {
        anyhow::bail!("server.sagas requires server.action_endpoint");
    }

    let timeout = config.server.request_timeout;
    let invoker: Arc<dyn ActionInvoker> = match &config.server.action_endpoint {
        Some(endpoint) => Arc::new(HttpActionInvoker::new(
            endpoint,
            timeout,
            config.adapter.clone(),
        )?),
        None => Arc::new(NoActionEndpoint),
    };

    let mut participants = Vec::with_capacity(config.server.participants.len());
    for endpoint in &config.server.participants {
        participants.push(HttpParticipant::new(
            endpoint,
            config.two_phase.coordinator_id.clone(),
            timeout,
            config.adapter.clone(),
        )?);
    }

    let engine = CoordinationEngine::new(config, Arc::new(InMemoryRecordStore::new()), invoker)?;
    for participant in participants {
        info!(participant = %participant.id(), url = participant.base_url(), "participant registered");
        engine.register_participant(Arc::new(participant));
    }

    Ok(Arc::new(engine))
}
