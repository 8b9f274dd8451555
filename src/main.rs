use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use llama_session::config::parse_key_val;
use llama_session::{
    ChatMessage, ChatRole, ChatTemplateFormat, Model, ModelParams, Session, SessionConfig, Step, backend,
};
use tracing_subscriber::EnvFilter;

/// Stream a completion from a local GGUF model
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the model, or its name inside --model-dir
    model: Option<String>,
    /// Directory to resolve model names in
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// JSON file with model, context, sampler and template settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// Prompt to complete; starts an interactive chat when omitted
    #[arg(short, long)]
    prompt: Option<String>,
    /// System message for chat prompts
    #[arg(long)]
    system: Option<String>,
    /// Send the prompt as raw text instead of rendering it with the chat template
    #[arg(long)]
    raw: bool,
    /// Use the built-in fallback template instead of the model's own
    #[arg(long)]
    fallback_template: bool,
    /// Context size in tokens
    #[arg(long)]
    ctx_size: Option<usize>,
    /// Maximum tokens per decode call
    #[arg(long)]
    batch_size: Option<usize>,
    /// Maximum number of tokens to generate
    #[arg(short = 'n', long)]
    max_tokens: Option<usize>,
    /// Sampling temperature, 0 for greedy
    #[arg(long)]
    temperature: Option<f32>,
    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,
    /// number of threads to use during generation
    #[arg(long)]
    threads: Option<usize>,
    /// override some parameters of the model, as KEY=value
    #[arg(long = "override", value_parser = parse_override)]
    overrides: Vec<(String, String)>,
    /// Disable offloading layers to the gpu
    #[arg(long)]
    disable_gpu: bool,
    /// Enable verbose logging, including llama.cpp's own
    #[arg(short, long)]
    verbose: bool,
}

fn parse_override(s: &str) -> std::result::Result<(String, String), String> {
    parse_key_val(s).map_err(|e| e.to_string())
}

impl Args {
    fn into_config(self) -> Result<(SessionConfig, Option<String>, Option<String>, bool)> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_json_file(path)
                .with_context(|| format!("unable to read config {}", path.display()))?,
            None => SessionConfig::default(),
        };

        match (&self.model, &self.model_dir) {
            (Some(name), Some(dir)) => {
                let resolved = ModelParams::from_name(dir, name)?;
                config.model.model_path = resolved.model_path;
            }
            (Some(path), None) => config.model.model_path = PathBuf::from(path),
            (None, _) if config.model.model_path.as_os_str().is_empty() => {
                bail!("no model given, pass a path or set model.model_path in --config")
            }
            (None, _) => {}
        }

        config.model.key_value_overrides.extend(self.overrides);
        config.model.disable_gpu |= self.disable_gpu;
        if let Some(ctx_size) = self.ctx_size {
            config.context.ctx_size = Some(ctx_size);
        }
        if let Some(batch_size) = self.batch_size {
            config.context.batch_size = batch_size;
        }
        if self.max_tokens.is_some() {
            config.context.max_tokens = self.max_tokens;
        }
        if self.threads.is_some() {
            config.context.threads = self.threads;
        }
        if let Some(temperature) = self.temperature {
            config.sampler.temperature = temperature;
        }
        if let Some(seed) = self.seed {
            config.sampler.seed = seed;
        }
        if self.fallback_template {
            config.template = ChatTemplateFormat::Fallback;
        }
        config.context.validate()?;

        Ok((config, self.prompt, self.system, !self.raw))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .event_format(
            tracing_subscriber::fmt::format::format()
                .compact()
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
                    "%H:%M:%S.%3f".to_owned(),
                )),
        )
        .with_writer(io::stderr)
        .init();
    backend::enable_engine_logs(args.verbose);

    let (config, prompt, system, use_template) = args.into_config()?;

    let model = Model::load(&config.model)?;
    let mut session = model
        .create_session(&config.context, config.sampler.clone())?
        .with_template(config.template.clone());

    match prompt {
        Some(prompt) => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt.clone()));

            if use_template {
                session.initialize(&messages, true)?;
            } else {
                session.initialize(prompt.as_str(), false)?;
            }
            stream_to_stdout(&mut session)?;
        }
        None => chat(&mut session, system, use_template)?,
    }

    Ok(())
}

fn stream_to_stdout(session: &mut Session<'_, Model>) -> Result<()> {
    let mut stdout = io::stdout().lock();
    loop {
        match session.next()? {
            Step::Text(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            Step::End(reason) => {
                writeln!(stdout)?;
                tracing::debug!(?reason, stats = ?session.stats(), "generation finished");
                return Ok(());
            }
        }
    }
}

fn chat(session: &mut Session<'_, Model>, system: Option<String>, use_template: bool) -> Result<()> {
    let mut messages: Vec<ChatMessage> = system.into_iter().map(ChatMessage::system).collect();

    eprintln!("Type your messages and press Enter. 'clear' starts over, 'exit' quits.");
    let stdin = io::stdin();
    loop {
        eprint!("You: ");
        io::stderr().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            return Ok(());
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            return Ok(());
        }
        if input.eq_ignore_ascii_case("clear") {
            messages.retain(|m| m.role == ChatRole::System);
            session.reset();
            eprintln!("Conversation cleared!");
            continue;
        }

        messages.push(ChatMessage::user(input));
        if let Err(e) = session.initialize(&messages, use_template) {
            eprintln!("Error: {}", e);
            messages.pop();
            session.reset();
            continue;
        }

        eprint!("Assistant: ");
        let mut reply = String::new();
        let mut stdout = io::stdout().lock();
        for piece in session.stream() {
            match piece {
                Ok(text) => {
                    write!(stdout, "{}", text)?;
                    stdout.flush()?;
                    reply.push_str(&text);
                }
                Err(e) => {
                    eprintln!("\nError: {}", e);
                    break;
                }
            }
        }
        writeln!(stdout)?;

        if session.is_done() {
            messages.push(ChatMessage::assistant(reply));
        } else {
            messages.pop();
            session.reset();
        }
    }
}
