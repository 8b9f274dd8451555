use llama_session::{ContextParams, Model, ModelParams, Result, SamplerParams};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // Check for verbose flag early
    let verbose = args.iter().any(|arg| arg == "--verbose" || arg == "-v");

    let env_filter = if verbose {
        EnvFilter::builder()
            .with_default_directive(Level::DEBUG.into())
            .from_env_lossy()
    } else {
        EnvFilter::builder()
            .with_default_directive(Level::ERROR.into())
            .from_env_lossy()
    };

    fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if args.len() < 2 {
        eprintln!("Usage: {} <model_path> [--system \"<message>\"] [--verbose]", args[0]);
        return Ok(());
    }

    let model_params = ModelParams::from_path(PathBuf::from(&args[1]));
    let system_message = args
        .iter()
        .position(|arg| arg == "--system")
        .and_then(|i| args.get(i + 1))
        .cloned();

    println!("Loading model from {}...", model_params.model_path.display());
    let model = Model::load(&model_params)?;

    let context_params = ContextParams {
        ctx_size: Some(4096),
        max_tokens: Some(512),
        ..Default::default()
    };
    let mut chat_session = match &system_message {
        Some(system) => model.create_chat_session_with_system(
            system,
            &context_params,
            SamplerParams::default(),
        )?,
        None => model.create_chat_session(&context_params, SamplerParams::default())?,
    };

    println!("\n=== Chat Bot ===");
    println!("Type 'exit' or 'quit' to end the conversation.");
    println!("Type 'clear' to start a new conversation.");
    println!("===========================\n");

    loop {
        print!("You: ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Goodbye!");
            break;
        }
        if input.eq_ignore_ascii_case("clear") {
            chat_session.clear();
            println!("Conversation cleared!");
            continue;
        }

        match chat_session.respond(input) {
            Ok(response) => println!("Assistant: {}\n", response),
            Err(e) => eprintln!("Error generating response: {}", e),
        }
    }

    Ok(())
}
