//! SecureBot Gateway - Entry Point
//!
//! Modes:
//! - Default: HTTP gateway
//! - --check-skills [DIR]: load the skills root, print what loaded and what was rejected

use anyhow::Context;
use securebot::backends::OllamaGenerator;
use securebot::{server, AppContext, Config, SkillRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let check_position = args.iter().position(|a| a == "--check-skills");

    if help_mode {
        print_help();
        return Ok(());
    }

    init_logging(check_position.is_some())?;

    if let Some(position) = check_position {
        let dir = args
            .get(position + 1)
            .filter(|a| !a.starts_with('-'))
            .map(PathBuf::from)
            .or_else(|| std::env::var("SKILLS_DIR").ok().map(PathBuf::from))
            .context("--check-skills needs a directory argument or SKILLS_DIR")?;
        let clean = check_skills(&dir)?;
        std::process::exit(if clean { 0 } else { 1 });
    }

    info!("SecureBot Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(config = ?config, "Configuration loaded");
    let nonce_sweep = config.nonce_sweep;

    let local = OllamaGenerator::new(&config.ollama_url, &config.ollama_model, config.upstream_timeout);
    if !local.is_available().await {
        warn!(url = %config.ollama_url, "Ollama not reachable; drafting will use the cloud fallback until it is");
    }

    let ctx = Arc::new(AppContext::from_config(config)?);
    let _sweeper = ctx.verifier.nonces().spawn_sweeper(nonce_sweep);

    server::serve(ctx, server::shutdown_signal()).await
}

fn init_logging(interactive: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SECUREBOT_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    if json && !interactive {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(interactive)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Print the skill table; `false` when any file was rejected
fn check_skills(dir: &std::path::Path) -> anyhow::Result<bool> {
    let snapshot =
        SkillRegistry::load(dir).with_context(|| format!("failed to read skills root {}", dir.display()))?;

    println!("Skills in {}:", dir.display());
    println!();
    println!("  {:<32} {:<20} {:>8}  TRIGGERS", "NAME", "MODE", "TIMEOUT");
    for skill in snapshot.skills() {
        let timeout = skill
            .timeout()
            .map(|t| format!("{}s", t.as_secs()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<32} {:<20} {:>8}  {}",
            skill.name,
            skill.mode.as_str(),
            timeout,
            skill.triggers.join(", ")
        );
    }
    println!();
    println!("{} loaded, {} trigger phrases", snapshot.len(), snapshot.triggers().len());

    if !snapshot.rejected().is_empty() {
        println!();
        println!("Rejected:");
        for rejected in snapshot.rejected() {
            println!("  {}: {}", rejected.path.display(), rejected.reason);
        }
    }
    Ok(snapshot.rejected().is_empty())
}

fn print_help() {
    println!("SecureBot Gateway v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: securebot-gateway [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --check-skills [DIR]  Validate the skills root and exit (non-zero if any file is rejected)");
    println!("  --help, -h            Show this help");
    println!();
    println!("Default: Run the HTTP gateway");
    println!();
    println!("Environment variables:");
    println!("  SERVICE_ID, SERVICE_SECRET   Signing identity (required)");
    println!("  SECUREBOT_BIND               Listen address (default: 0.0.0.0:8080)");
    println!("  SKILLS_DIR                   Skills root");
    println!("  SANDBOX_USER                 OS user for skill scripts (default: securebot-scripts)");
    println!("  PRODUCER_CALLERS             Services allowed to raise approvals");
    println!("  OPERATOR_CALLERS             Services allowed to resolve approvals");
    println!("  MESSAGE_CALLERS              Services allowed to submit messages");
    println!("  SANDBOX_CALLERS              Services allowed to sandbox-test scripts");
    println!("  OLLAMA_URL, OLLAMA_MODEL     Local generation backend");
    println!("  DRAFT_MODEL                  Local model for skill drafts");
    println!("  ANTHROPIC_MODEL              Cloud drafting model");
    println!("  ALTERNATE_URL, ALTERNATE_MODEL  Fallback while the cloud is rate limited");
    println!("  RAG_URL, CLASSIFIER_URL      Peer services (optional)");
    println!("  GATEWAY_URL                  Sandbox test endpoint for escalation");
    println!("  VAULT_PATH, VAULT_PASSWORD   Encrypted secret store");
    println!("  RUST_LOG                     Log filter (default: info)");
    println!("  SECUREBOT_LOG_JSON=1         JSON log output");
}
