mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use genroute::app::{AppConfig, AppState};
use genroute::models::{ContentType, Credentials, GenerationRequest};
use genroute::platform::AppPaths;

fn init_logging(debug: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let directive = if debug { "genroute=debug" } else { "genroute=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "genroute.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Credentials come from `<KEY>_API_KEY` variables, e.g. `GROQ_API_KEY`.
fn credentials_from_env(config: &AppConfig) -> Credentials {
    let mut credentials = Credentials::new();
    for provider in &config.providers {
        let var = format!(
            "{}_API_KEY",
            provider.credential_key.to_ascii_uppercase().replace('-', "_")
        );
        if let Ok(secret) = std::env::var(&var) {
            credentials.insert(provider.credential_key.clone(), secret);
        }
    }
    credentials
}

async fn load_config(cli: &Cli, paths: &AppPaths) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => AppConfig::load(paths).await.context("failed to load configuration")?,
    };
    Ok(config)
}

fn parse_payload(prompt: Option<String>, payload: Option<String>) -> Result<Map<String, Value>> {
    match (payload, prompt) {
        (Some(raw), _) => match serde_json::from_str::<Value>(&raw).context("payload is not valid JSON")? {
            Value::Object(map) => Ok(map),
            _ => bail!("payload must be a JSON object"),
        },
        (None, Some(prompt)) => {
            let mut map = Map::new();
            map.insert("prompt".to_string(), Value::from(prompt));
            Ok(map)
        }
        (None, None) => bail!("either --prompt or --payload is required"),
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("--{} must be a non-negative number", flag))
}

async fn run(cli: Cli, paths: AppPaths) -> Result<()> {
    if let Commands::ConfigInit { force } = &cli.command {
        let target = cli.config.clone().unwrap_or_else(|| paths.config_file());
        if target.exists() && !force {
            bail!("{} already exists, use --force to overwrite", target.display());
        }
        AppConfig::default_catalog().save_to(&target).await?;
        println!("Wrote default configuration to {}", target.display());
        return Ok(());
    }

    let config = load_config(&cli, &paths).await?;
    let state = AppState::new(config).await?;
    let credentials = credentials_from_env(&state.get_config());
    let gateway = state.gateway().clone();

    let outcome = match cli.command {
        Commands::Generate {
            endpoint,
            content_type,
            prompt,
            payload,
            provider,
            model,
            timeout,
            max_retries,
            deadline,
            json,
            stats,
        } => {
            let content_type: ContentType = content_type.parse().map_err(anyhow::Error::msg)?;
            let mut request = GenerationRequest::new(endpoint, content_type, parse_payload(prompt, payload)?)
                .with_credentials(credentials);
            if let Some(provider) = provider {
                request = request.with_preferred_provider(provider);
            }
            if let Some(model) = model {
                request = request.with_preferred_model(model);
            }
            if let Some(timeout) = timeout {
                request = request.with_timeout(seconds(timeout, "timeout")?);
            }
            if let Some(max_retries) = max_retries {
                request = request.with_max_retries(max_retries);
            }
            if let Some(deadline) = deadline {
                request = request.with_deadline(seconds(deadline, "deadline")?);
            }

            let response = gateway.generate(request).await;
            if stats {
                let report = serde_json::json!({
                    "providers": gateway.stats(),
                    "health": gateway.health_summary(),
                    "metrics": {
                        "providers": gateway.metrics().provider_report(),
                        "endpoints": gateway.metrics().endpoint_report(),
                        "recent": gateway.metrics().recent(10),
                    },
                    "recommendations": gateway.metrics().recommendations(),
                });
                eprintln!("{}", serde_json::to_string_pretty(&report)?);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if response.success {
                println!("{}", response.content);
                eprintln!(
                    "[{} / {} in {} ms, {} tokens]",
                    response.provider.as_deref().unwrap_or("-"),
                    response.model.as_deref().unwrap_or("-"),
                    response.elapsed_ms,
                    response.tokens_used
                );
            }
            if response.success {
                Ok(())
            } else {
                Err(anyhow::anyhow!(response.error.unwrap_or_else(|| "generation failed".to_string())))
            }
        }
        Commands::Providers { content_type } => {
            let filter: Option<ContentType> = content_type
                .map(|c| c.parse().map_err(anyhow::Error::msg))
                .transpose()?;
            let registry = gateway.registry();
            for content_type in registry.content_types() {
                if filter.is_some_and(|c| c != content_type) {
                    continue;
                }
                println!("{}:", content_type);
                for provider in registry.all().filter(|p| p.content_type == content_type) {
                    println!(
                        "  {} [{:?}] priority={} enabled={}",
                        provider.name, provider.kind, provider.priority, provider.enabled
                    );
                    for model in provider.models() {
                        println!("      {} priority={} {:?}", model.name, model.priority, model.status());
                    }
                }
            }
            Ok(())
        }
        Commands::Health => {
            let status = gateway.health_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::ConfigInit { .. } => Ok(()),
    };

    state.shutdown().await;
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::new()?;
    paths.ensure_dirs_exist()?;
    let log_dir = paths.logs_dir();
    let _guard = init_logging(cli.debug, cli.log_file.then_some(log_dir.as_path()));

    info!("Starting genroute {}", env!("CARGO_PKG_VERSION"));
    run(cli, paths).await
}
