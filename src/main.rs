mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use promptgate::app::{AppState, GatewayConfig};
use promptgate::chat::{compose_error, parse_directive, ChatCompletionRequest, GatewayService};
use promptgate::models::{
    FallbackConfig, HttpProviderRegistry, ProviderKind, ProviderResolver, ScriptedOutcome, ScriptedResolver,
};
use promptgate::platform::AppPaths;

fn init_tracing(debug: bool) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let filter = if debug {
        EnvFilter::new("promptgate=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("promptgate=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.debug);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight request");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Complete {
            request,
            fallback,
            stream,
        } => {
            let state = load_state(cli.config.as_deref())?;
            let registry = HttpProviderRegistry::new(state.provider_settings()?)?;
            run_request(state, Arc::new(registry), &request, fallback.as_deref(), stream, cancel).await
        }
        Commands::Simulate {
            request,
            script,
            fallback,
            stream,
        } => {
            let state = load_state(cli.config.as_deref())?;
            let text = read_input(&script).await?;
            let script: HashMap<ProviderKind, Vec<ScriptedOutcome>> =
                serde_json::from_str(&text).with_context(|| format!("invalid script {}", script.display()))?;
            let resolver = ScriptedResolver::from_script(script);
            run_request(state, Arc::new(resolver), &request, fallback.as_deref(), stream, cancel).await
        }
        Commands::Render { request, fallback } => {
            let state = load_state(cli.config.as_deref())?;
            let req = read_request(&request).await?;
            let directive = read_directive(fallback.as_deref()).await?;
            let service = GatewayService::new(Arc::new(state), Arc::new(ScriptedResolver::new()));

            match service.prepare(&req, directive.as_ref()) {
                Ok(prepared) => {
                    print_json(&json!({
                        "prompt": prepared.prompt,
                        "model": prepared.request.model,
                        "messages": prepared.request.messages,
                        "max_tokens": prepared.request.max_tokens,
                        "temperature": prepared.request.temperature,
                        "response_format": prepared.request.response_format,
                        "tools": prepared.request.tools,
                        "fallback": prepared.fallback,
                    }))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => report_error(&e),
            }
        }
        Commands::CheckConfig => {
            let state = load_state(cli.config.as_deref())?;
            for name in state.prompt_names() {
                let Some(prompt) = state.prompt(name) else { continue };
                let chain: Vec<String> = prompt.fallback.providers.iter().map(|p| p.label()).collect();
                println!(
                    "{}: mode={} fallback={} chain=[{}]",
                    name,
                    prompt.templates.mode(),
                    if prompt.fallback.enabled { "on" } else { "off" },
                    chain.join(", ")
                );
            }
            println!("configuration OK");
            Ok(ExitCode::SUCCESS)
        }
        Commands::InitConfig { output, force } => {
            let path = match output {
                Some(path) => path,
                None => AppPaths::new()?.config_file(),
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            GatewayConfig::sample().save(&path).await?;
            println!("wrote {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_state(path: Option<&Path>) -> Result<AppState> {
    let config = GatewayConfig::load(path).context("failed to load configuration")?;
    let state = AppState::new(config)?;
    info!("Loaded prompts: {}", state.prompt_names().join(", "));
    Ok(state)
}

async fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        tokio::io::stdin().read_to_string(&mut text).await?;
        return Ok(text);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

async fn read_request(path: &Path) -> Result<ChatCompletionRequest> {
    let text = read_input(path).await?;
    serde_json::from_str(&text).with_context(|| format!("invalid request {}", path.display()))
}

async fn read_directive(path: Option<&Path>) -> Result<Option<FallbackConfig>> {
    let Some(path) = path else { return Ok(None) };
    let text = read_input(path).await?;
    Ok(Some(parse_directive(&text)?))
}

async fn run_request(
    state: AppState,
    resolver: Arc<dyn ProviderResolver>,
    request: &Path,
    fallback: Option<&Path>,
    stream: bool,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let req = read_request(request).await?;
    let directive = read_directive(fallback).await?;
    let service = GatewayService::new(Arc::new(state), resolver);

    if !(stream || req.stream) {
        return match service.complete(&req, directive.as_ref(), cancel).await {
            Ok(completion) => {
                print_json(&completion)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => report_error(&e),
        };
    }

    let (tx, mut rx) = mpsc::channel(32);
    let printer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            match serde_json::to_string(&chunk) {
                Ok(line) => println!("data: {}\n", line),
                Err(e) => warn!("Failed to encode chunk: {}", e),
            }
        }
    });

    let outcome = service.complete_stream(&req, directive.as_ref(), cancel, tx).await;
    printer.await?;

    match outcome {
        Ok(_) => {
            println!("data: [DONE]\n");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let (_, body) = compose_error(&e);
            println!("data: {}\n", serde_json::to_string(&body)?);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn report_error(error: &promptgate::Error) -> Result<ExitCode> {
    let (status, body) = compose_error(error);
    warn!(status, "Request failed: {}", error);
    print_json(&body)?;
    Ok(ExitCode::FAILURE)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
