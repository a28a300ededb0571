use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use llama_cot_runner::config::{
    DEFAULT_CONTEXT_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_MODEL_PATH,
};
use llama_cot_runner::llama::LlamaEngine;
use llama_cot_runner::logger::{setup_logging, MAIN_LOG_TARGET};
use llama_cot_runner::memory::{MemoryMonitor, DEFAULT_MEMORY_THRESHOLD_MB};
use llama_cot_runner::{shutdown, LoadOptions, ModelSpec, RetryPolicy, Thinker, ThinkerConfig};

/// Ask a local GGUF model one question, with retries and per-question logs.
#[derive(Parser, Debug)]
#[command(name = "llama_cot", version)]
struct Cli {
    /// Path to the GGUF model file
    #[arg(long, env = "MODEL_PATH", default_value = DEFAULT_MODEL_PATH)]
    model_path: PathBuf,

    #[arg(long, env = "LLAMA_CONTEXT_SIZE", default_value_t = DEFAULT_CONTEXT_SIZE)]
    context_size: u32,

    /// Question to ask; prompted for on stdin when omitted
    #[arg(long, short)]
    question: Option<String>,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Where session logs and the main log are written
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MEMORY_THRESHOLD_MB)]
    memory_threshold_mb: f64,

    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Seconds to wait between failed attempts
    #[arg(long, default_value_t = 5)]
    retry_delay_secs: u64,

    #[arg(long, default_value_t = 4)]
    threads: u32,

    #[arg(long, default_value_t = 512)]
    batch: u32,

    /// Layers to offload to the GPU
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Keep llama.cpp's own log output
    #[arg(long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> (ThinkerConfig, Option<String>) {
        let options = LoadOptions {
            n_threads: self.threads,
            n_batch: self.batch,
            n_gpu_layers: self.gpu_layers,
            quiet: !self.verbose,
            ..LoadOptions::default()
        };
        let config = ThinkerConfig {
            model: ModelSpec {
                path: self.model_path,
                context_size: self.context_size,
                options,
            },
            log_dir: self.log_dir,
            output_dir: self.output_dir,
            memory_threshold_mb: self.memory_threshold_mb,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                retry_delay: Duration::from_secs(self.retry_delay_secs),
                ..RetryPolicy::default()
            },
            ..ThinkerConfig::default()
        };
        (config, self.question)
    }
}

fn read_question() -> anyhow::Result<String> {
    print!("Digite a sua pergunta: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn main() -> anyhow::Result<()> {
    let (config, question) = Cli::parse().into_config();

    if let Err(e) = setup_logging(&config.log_dir, &config.output_dir) {
        eprintln!("Failed to set up logging: {e}");
    }

    let memory = MemoryMonitor::for_current_process(config.memory_threshold_mb)?;
    match memory.current_usage() {
        Ok(mb) => println!("Memória inicial do processo: {mb:.2} MB"),
        Err(e) => println!("Memória inicial do processo: indisponível ({e})"),
    }
    println!("Dica: Feche outros programas para liberar memória");

    shutdown::install_shutdown_handler().context("installing signal handlers")?;

    let question = match question {
        Some(q) => q,
        None => read_question()?,
    };
    info!(target: MAIN_LOG_TARGET, "Pergunta escolhida: {question}");

    let engine = LlamaEngine::new(config.model.options.quiet).map_err(anyhow::Error::msg)?;
    let mut thinker = Thinker::new(engine, config, memory)?;
    let outcome = thinker.process_question(&question);
    let log_path = outcome.log_path.clone();
    let (result, processing_time, memory_used) = outcome.into_parts();

    info!(target: MAIN_LOG_TARGET, "Resultado: {result}");
    info!(target: MAIN_LOG_TARGET, "Tempo de processamento: {processing_time}");
    info!(target: MAIN_LOG_TARGET, "Memória usada para carregar o modelo: {memory_used:.2} MB");

    let rule = "=".repeat(50);
    println!("\n{rule}");
    println!("Resultado: {result}");
    println!("Tempo de processamento: {processing_time}");
    println!("Memória usada para carregar o modelo: {memory_used:.2} MB");
    println!("Log da sessão: {}", log_path.display());
    println!("{rule}");

    drop(thinker);
    shutdown::teardown();
    Ok(())
}
