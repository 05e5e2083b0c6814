use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use fable_contracts::config::{load_or_init, FableConfig};
use fable_contracts::credentials::{install_global, CredentialHolder, KeyStore};
use fable_contracts::data_url::{encode_data_url, DataUrlPolicy};
use fable_contracts::events::OperationJournal;
use fable_contracts::models::{AspectRatio, ImageModel, Style, TextModel};
use fable_contracts::session::{GenerationResult, OperationState, SessionState};
use fable_engine::{CredentialBroker, GeminiBackend, Gateway, Orchestrator};
use serde_json::{json, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fable", version, about = "Prompt and story composer for Gemini image models")]
struct Cli {
    /// Directory holding `config.json` and `key.json` (defaults to `$FABLE_HOME` or `~/.fable`).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate images from the prompt (and any references).
    Generate(GenerateArgs),
    /// Replace the prompt with a description of a reference image.
    Describe(TargetArgs),
    /// Caption a reference image and prime the prompt to render it.
    Caption(TargetArgs),
    /// Remove visible text from a reference image.
    RemoveText(TargetArgs),
    /// Pad a reference image to a new ratio and fill the padding.
    Expand(ExpandArgs),
    Enhance(SessionArgs),
    Concept(SessionArgs),
    NextSentence(SessionArgs),
    Summarize(SessionArgs),
    Polish(SessionArgs),
    Translate(TranslateArgs),
    Design(SessionArgs),
    /// Manage the stored API key.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// List selectable models, ratios and styles.
    Models,
}

#[derive(Debug, Subcommand)]
enum KeyAction {
    Apply { token: String },
    Clear,
    Show,
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    story: Option<String>,
    #[arg(long, conflicts_with = "story")]
    story_file: Option<PathBuf>,
    /// Reference image file; repeat up to four times.
    #[arg(long = "ref")]
    references: Vec<PathBuf>,
    #[arg(long)]
    aspect_ratio: Option<AspectRatio>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    caption_max_len: Option<u32>,
    /// Directory for result images and text.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Operation journal (JSONL).
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long, default_value_t = 1)]
    count: u32,
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// 1-based reference position, as in `[ref-1]`.
    #[arg(long, default_value_t = 1)]
    target: usize,
}

#[derive(Debug, Args)]
struct ExpandArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long)]
    ratio: String,
}

#[derive(Debug, Args)]
struct TranslateArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    language: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fable error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let home = cli.home.clone().unwrap_or_else(default_home);
    let config = load_or_init(&home.join("config.json"))?.with_env_overrides();
    let key_store = KeyStore::new(home.join("key.json"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match cli.command {
        Command::Key { action } => run_key(action, &key_store),
        Command::Models => {
            print_models();
            Ok(0)
        }
        Command::Generate(args) => {
            let orch = build_session(&config, &key_store, &args.session)?;
            let settled = runtime.block_on(orch.generate(args.count));
            report(&orch, &config, &args.session, "generate", settled)
        }
        Command::Describe(args) => {
            let orch = build_session(&config, &key_store, &args.session)?;
            let index = reference_index(args.target)?;
            let settled = runtime.block_on(orch.describe_reference(index));
            report(&orch, &config, &args.session, "describe", settled)
        }
        Command::Caption(args) => {
            let orch = build_session(&config, &key_store, &args.session)?;
            let index = reference_index(args.target)?;
            let settled = runtime.block_on(orch.caption_reference(index));
            report(&orch, &config, &args.session, "caption", settled)
        }
        Command::RemoveText(args) => {
            let orch = build_session(&config, &key_store, &args.session)?;
            let index = reference_index(args.target)?;
            let settled = runtime.block_on(orch.remove_text_from_reference(index));
            report(&orch, &config, &args.session, "remove-text", settled)
        }
        Command::Expand(args) => {
            let session = &args.target.session;
            let orch = build_session(&config, &key_store, session)?;
            let index = reference_index(args.target.target)?;
            let settled = runtime.block_on(orch.expand_reference(index, &args.ratio));
            report(&orch, &config, session, "expand", settled)
        }
        Command::Enhance(session) => {
            let orch = build_session(&config, &key_store, &session)?;
            let settled = runtime.block_on(orch.enhance_prompt());
            report(&orch, &config, &session, "enhance", settled)
        }
        Command::Concept(session) => {
            let orch = build_session(&config, &key_store, &session)?;
            let settled = runtime.block_on(orch.generate_concept());
            report(&orch, &config, &session, "concept", settled)
        }
        Command::NextSentence(session) => {
            let orch = build_session(&config, &key_store, &session)?;
            let settled = runtime.block_on(orch.next_sentence());
            report(&orch, &config, &session, "next-sentence", settled)
        }
        Command::Summarize(session) => {
            let orch = build_session(&config, &key_store, &session)?;
            let settled = runtime.block_on(orch.summarize_story());
            report(&orch, &config, &session, "summarize", settled)
        }
        Command::Polish(session) => {
            let orch = build_session(&config, &key_store, &session)?;
            let settled = runtime.block_on(orch.polish_story());
            report(&orch, &config, &session, "polish", settled)
        }
        Command::Translate(args) => {
            let orch = build_session(&config, &key_store, &args.session)?;
            let settled = runtime.block_on(orch.translate_story(&args.language));
            report(&orch, &config, &args.session, "translate", settled)
        }
        Command::Design(session) => {
            let orch = build_session(&config, &key_store, &session)?;
            let settled = runtime.block_on(orch.design_from_story());
            report(&orch, &config, &session, "design", settled)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("FABLE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn default_home() -> PathBuf {
    if let Some(home) = env::var_os("FABLE_HOME").filter(|value| !value.is_empty()) {
        return PathBuf::from(home);
    }
    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".fable"))
        .unwrap_or_else(|| PathBuf::from(".fable"))
}

fn run_key(action: KeyAction, key_store: &KeyStore) -> Result<i32> {
    match action {
        KeyAction::Apply { token } => {
            if token.trim().is_empty() {
                bail!("refusing to store an empty API key");
            }
            key_store.save(&token)?;
            println!("Stored API key in {}", key_store.path().display());
        }
        KeyAction::Clear => {
            key_store.remove()?;
            println!("Removed stored API key");
        }
        KeyAction::Show => match key_store.load() {
            Some(token) => println!("{}", mask_token(&token)),
            None => println!("No API key stored"),
        },
    }
    Ok(0)
}

fn mask_token(token: &str) -> String {
    let visible = token.chars().rev().take(4).collect::<Vec<char>>();
    let tail = visible.into_iter().rev().collect::<String>();
    format!("****{tail}")
}

fn print_models() {
    println!("image models:");
    for model in ImageModel::ALL {
        let default = if model == ImageModel::default() { " (default)" } else { "" };
        println!("  {:<24} {}{}", model.key(), model.label(), default);
    }
    println!("text models:");
    for model in TextModel::ALL {
        let default = if model == TextModel::default() { " (default)" } else { "" };
        println!("  {:<24} {}{}", model.key(), model.label(), default);
    }
    println!(
        "aspect ratios: {}",
        AspectRatio::ALL.map(AspectRatio::as_str).join(", ")
    );
    println!("styles: {}", Style::ALL.map(Style::key).join(", "));
}

fn reference_index(target: usize) -> Result<usize> {
    if target == 0 {
        bail!("--target is 1-based");
    }
    Ok(target - 1)
}

fn build_session(
    config: &FableConfig,
    key_store: &KeyStore,
    args: &SessionArgs,
) -> Result<Orchestrator> {
    let holder = CredentialHolder::from_storage(
        config.default_api_key.clone(),
        key_store.load().as_deref(),
    );
    let credentials = install_global(holder)?.clone();
    let gateway = Gateway::new(
        Arc::new(GeminiBackend::new(config.api_base())),
        credentials,
        config.data_url_policy(),
    );
    let mut orch = Orchestrator::new(gateway)
        .with_broker(Arc::new(TerminalBroker))
        .with_caption_max_len(config.caption_max_len());
    if let Some(path) = &args.events {
        orch = orch.with_journal(OperationJournal::with_random_session(path));
    }

    if let Some(prompt) = &args.prompt {
        orch.set_prompt(prompt);
    }
    if let Some(story) = &args.story {
        orch.set_story(story);
    }
    if let Some(path) = &args.story_file {
        let story = fs::read_to_string(path)
            .with_context(|| format!("failed reading story {}", path.display()))?;
        orch.set_story(&story);
    }
    for path in &args.references {
        let data_url = read_image_data_url(path)?;
        orch.add_reference(&data_url)
            .map_err(|err| anyhow::anyhow!("{}: {err}", path.display()))?;
    }
    if let Some(aspect_ratio) = args.aspect_ratio {
        orch.set_aspect_ratio(aspect_ratio);
    }
    if let Some(raw) = &args.style {
        let Some(style) = Style::parse(raw) else {
            bail!("Unknown style '{raw}'.");
        };
        orch.set_style(style);
    }
    let image_request = args.image_model.as_deref().or(config.image_model.as_deref());
    let image_selection = orch.set_image_model(image_request);
    if let (Some(_), Some(reason)) = (image_request, &image_selection.fallback_reason) {
        warn!("{reason}");
    }
    let text_request = args.text_model.as_deref().or(config.text_model.as_deref());
    let text_selection = orch.set_text_model(text_request);
    if let (Some(_), Some(reason)) = (text_request, &text_selection.fallback_reason) {
        warn!("{reason}");
    }
    if let Some(value) = args.caption_max_len {
        orch.set_caption_max_len(value)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
    }
    Ok(orch)
}

fn read_image_data_url(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading image {}", path.display()))?;
    Ok(encode_data_url(media_type_for_path(path), &bytes))
}

fn media_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "application/octet-stream",
    }
}

fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

fn report(
    orch: &Orchestrator,
    config: &FableConfig,
    args: &SessionArgs,
    operation: &str,
    settled: OperationState,
) -> Result<i32> {
    let state = orch.snapshot();
    let written = match (&settled, &args.out) {
        (OperationState::Succeeded(result), Some(out)) => {
            write_outputs(out, operation, result, &config.data_url_policy())?
        }
        _ => Vec::new(),
    };
    let summary = summarize(operation, &settled, &state, &written);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    match settled {
        OperationState::Succeeded(_) => Ok(0),
        _ => Ok(2),
    }
}

fn write_outputs(
    out: &Path,
    operation: &str,
    result: &GenerationResult,
    policy: &DataUrlPolicy,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out).with_context(|| format!("failed creating {}", out.display()))?;
    let mut written = Vec::new();
    match result {
        GenerationResult::Images(images) => {
            for (idx, image) in images.iter().enumerate() {
                let (media_type, bytes) = policy.decode_bytes(image)?;
                let path = out.join(format!(
                    "{operation}-{}.{}",
                    idx + 1,
                    extension_for_media_type(&media_type)
                ));
                fs::write(&path, bytes)
                    .with_context(|| format!("failed writing {}", path.display()))?;
                written.push(path);
            }
        }
        GenerationResult::Text(text) => {
            let path = out.join(format!("{operation}.txt"));
            fs::write(&path, text).with_context(|| format!("failed writing {}", path.display()))?;
            written.push(path);
        }
    }
    Ok(written)
}

fn summarize(
    operation: &str,
    settled: &OperationState,
    state: &SessionState,
    written: &[PathBuf],
) -> Value {
    let (status, error) = match settled {
        OperationState::Succeeded(_) => ("succeeded", None),
        OperationState::Failed(message) => ("failed", Some(message.clone())),
        OperationState::Running => ("running", None),
        OperationState::Idle => ("idle", None),
    };
    let text = match settled {
        OperationState::Succeeded(GenerationResult::Text(text)) => Some(text.clone()),
        _ => None,
    };
    json!({
        "operation": operation,
        "status": status,
        "error": error,
        "text": text,
        "prompt": state.prompt,
        "story": state.story,
        "story_summary": state.story_summary,
        "reference_count": state.reference_images.len(),
        "result_count": state.result_images.len(),
        "focus_credential_field": state.focus.is_some(),
        "written": written.iter().map(|path| path.display().to_string()).collect::<Vec<String>>(),
    })
}

/// Resolves a brokered key from `FABLE_SELECTED_API_KEY`, or asks on the terminal.
struct TerminalBroker;

#[async_trait]
impl CredentialBroker for TerminalBroker {
    async fn selected_key(&self) -> Option<String> {
        env::var("FABLE_SELECTED_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    async fn prompt_for_key(&self) -> Result<Option<String>> {
        if !io::stdin().is_terminal() {
            return Ok(None);
        }
        let line = tokio::task::spawn_blocking(|| -> Result<String> {
            eprint!("API key for the selected model: ");
            io::stderr().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .context("key prompt task failed")??;
        let key = line.trim().to_string();
        Ok((!key.is_empty()).then_some(key))
    }
}
