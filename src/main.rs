use anyhow::{Context, Result};
use calltrace::cli::Cli;
use calltrace::config::TraceConfig;
use calltrace::filter::FilterEngine;
use calltrace::memory::{MemoryReader, ProcessMemory};
use calltrace::replay::{self, EventScript};
use calltrace::session::TraceSession;
use calltrace::sink::{TraceSink, WriterSink};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Print whether `name` (`module!function` or a bare function) would be traced
fn check_name(filter: &FilterEngine, name: &str) {
    let (module, function) = match name.split_once('!') {
        Some((module, function)) => (Some(module), function),
        None => (None, name),
    };

    let module_ok = filter.module_allowed(module);
    let traced = module_ok && filter.decide(module, function);
    let verdict = match (module_ok, traced) {
        (false, _) => "filtered (module not instrumented)",
        (true, true) => "traced",
        (true, false) => "filtered",
    };
    println!("{}: {}", name, verdict);
}

fn open_sink(config: &TraceConfig) -> Result<Arc<dyn TraceSink>> {
    if config.writes_to_stderr() {
        Ok(Arc::new(WriterSink::stderr()))
    } else {
        let path = Path::new(&config.output);
        let sink = WriterSink::create(path)
            .with_context(|| format!("Failed to create trace log {}", path.display()))?;
        Ok(Arc::new(sink))
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let mut config = match &args.config {
        Some(path) => TraceConfig::from_toml_file(path)?,
        None => TraceConfig::default(),
    };
    config.apply_cli(&args);

    let filter = match &config.filter_file {
        Some(path) => FilterEngine::from_file(path)?,
        None => FilterEngine::all(),
    };

    if let Some(name) = &args.check {
        check_name(&filter, name);
        return Ok(());
    }

    let Some(script_path) = &args.script else {
        anyhow::bail!("Must specify an event script. Usage: calltrace [OPTIONS] SCRIPT");
    };

    let mut script = EventScript::from_file(script_path)?;

    let memory: Arc<dyn MemoryReader> = match args.pid {
        Some(pid) => Arc::new(ProcessMemory::new(pid)),
        None => Arc::new(script.take_memory()),
    };

    let sink = open_sink(&config)?;

    // Allocation failure of the cache is fatal: report it and exit non-zero
    let session = TraceSession::new(filter, config.cache_config(), sink, Some(memory))
        .context("Failed to create return value cache")?;

    replay::replay(&session, &script);

    if !session.finish() {
        anyhow::bail!("Return value cache was not empty at teardown");
    }

    Ok(())
}
