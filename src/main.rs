use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use schematron::{
    AsyncHttpClient, Cli, Config, ConfigManager, EngineConfig, FileDiscovery, Output,
    SchemaCache, SchemaLoader, SchemaReference, ValidationEngine, ValidationResults,
    VerbosityLevel,
};

fn init_tracing(config: &Config) {
    let default_level = if config.output.verbose {
        "schematron=debug"
    } else if config.output.quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(results: &ValidationResults) -> u8 {
    if results.has_errors() {
        2
    } else if results.has_diagnostics() {
        1
    } else {
        0
    }
}

async fn run(cli: Cli) -> Result<u8> {
    cli.validate().map_err(anyhow::Error::msg)?;
    let config = ConfigManager::load_config(&cli)
        .await
        .context("failed to load configuration")?;
    init_tracing(&config);
    debug!(?config, "effective configuration");

    let cache = Arc::new(SchemaCache::new(config.cache_config()));
    let client = AsyncHttpClient::new(config.http_client_config())?;
    let loader = Arc::new(SchemaLoader::new(cache, client));

    let engine_config = EngineConfig {
        max_concurrent_validations: config.thread_count(),
        fail_fast: config.validation.fail_fast,
        options: config.validation_options(),
        ..EngineConfig::default()
    };
    let mut engine = ValidationEngine::new(loader, engine_config);
    if let Some(schema) = &cli.schema {
        engine = engine.with_schema(SchemaReference::explicit(schema));
    }

    let discovery = FileDiscovery::new()
        .with_extensions(config.files.extensions.clone())
        .with_include_patterns(config.files.include_patterns.clone())?
        .with_exclude_patterns(config.files.exclude_patterns.clone())?;

    let results = engine.validate_path(&cli.path, &discovery, None).await?;

    let verbosity = if config.output.quiet {
        VerbosityLevel::Quiet
    } else if config.output.verbose {
        VerbosityLevel::Verbose
    } else {
        VerbosityLevel::Normal
    };
    let rendered = Output::new(config.output.format, verbosity).render(&results)?;
    print!("{}", rendered);
    if !rendered.ends_with('\n') {
        println!();
    }

    Ok(exit_code(&results))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse_args()).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(2)
        }
    }
}
