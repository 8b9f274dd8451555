use llama_session::{ContextParams, Model, ModelParams, Result, SamplerParams, Step};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .event_format(
            tracing_subscriber::fmt::format::format()
                .compact()
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
                    "%H:%M:%S.%3f".to_owned(),
                )),
        )
        .with_writer(std::io::stderr)
        .init();

    let model_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("model.gguf"));

    // Loading the model and creating a session are separate steps
    let model = Model::load(&ModelParams::from_path(model_path))?;
    let context_params = ContextParams {
        ctx_size: Some(1024),
        max_tokens: Some(128),
        ..Default::default()
    };

    // Step through a raw text completion
    let mut session = model.create_session(&context_params, SamplerParams::default())?;
    session.initialize("Once upon a time", false)?;
    print!("Once upon a time");
    loop {
        match session.next()? {
            Step::Text(text) => {
                print!("{}", text);
                std::io::stdout().flush()?;
            }
            Step::End(reason) => {
                println!("\n[{:?}]", reason);
                break;
            }
        }
    }

    // A second, greedy session sharing the same model
    let mut greedy = model.create_session(&context_params, SamplerParams::greedy())?;
    let answer = greedy.respond("What is the Rust programming language?", true)?;
    println!("\nAssistant: {}", answer);
    println!("{:.2} t/s", greedy.stats().tokens_per_second());

    Ok(())
}
