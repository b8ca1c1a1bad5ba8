use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quill_contracts::events::{EventBus, EventSink, EventWriter, Fanout, ImageEvent};
use quill_contracts::records::{ImageStore, JsonFileImageStore};
use quill_contracts::settings::{SettingsFile, SettingsSource};
use quill_engine::{
    language_display_name, CancelToken, CharacterDescriptor, GenerateRequest, Generator,
    HttpProviderFactory, ImageGenerationContext, ImageGenerationService, NarrativeRequest,
    TextStream, TranslationService,
};
use serde_json::json;

const DEFAULT_SETTINGS_PATH: &str = "quill-settings.json";

#[derive(Debug, Parser)]
#[command(name = "quill", version, about = "Quill story generation CLI")]
struct Cli {
    /// Settings JSON (defaults to $QUILL_SETTINGS, then ./quill-settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Presets,
    Text(TextArgs),
    Narrate(NarrateArgs),
    Illustrate(IllustrateArgs),
    Images(ImagesArgs),
    Translate(TranslateArgs),
}

#[derive(Debug, Parser)]
struct TextArgs {
    #[arg(long)]
    preset: String,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "")]
    system: String,
    #[arg(long)]
    stream: bool,
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Parser)]
struct NarrateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "")]
    system: String,
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Parser)]
struct IllustrateArgs {
    #[arg(long)]
    story: String,
    #[arg(long)]
    entry: String,
    /// File holding the narrative passage.
    #[arg(long)]
    passage: PathBuf,
    #[arg(long, default_value = "")]
    action: String,
    /// `Name:descriptor,descriptor`; repeatable.
    #[arg(long = "character")]
    characters: Vec<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long, default_value = "images.json")]
    store: PathBuf,
    #[arg(long, default_value = "events.jsonl")]
    events: PathBuf,
    #[arg(long, default_value_t = 180)]
    wait_secs: u64,
}

#[derive(Debug, Parser)]
struct ImagesArgs {
    #[arg(long, default_value = "images.json")]
    store: PathBuf,
    #[arg(long)]
    entry: String,
}

#[derive(Debug, Parser)]
struct TranslateArgs {
    #[arg(long)]
    text: String,
    /// Target language code; defaults to the configured target.
    #[arg(long)]
    to: Option<String>,
    /// Translate player input from this language into English instead.
    #[arg(long)]
    from: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("quill error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let settings: Arc<dyn SettingsSource> =
        Arc::new(SettingsFile::new(settings_path(cli.settings)));
    let generator = Generator::new(settings.clone(), Arc::new(HttpProviderFactory::new()));
    match cli.command {
        Command::Presets => run_presets(settings.as_ref()),
        Command::Text(args) => run_text(&generator, args),
        Command::Narrate(args) => run_narrate(&generator, args),
        Command::Illustrate(args) => run_illustrate(generator, args),
        Command::Images(args) => run_images(args),
        Command::Translate(args) => run_translate(generator, settings.as_ref(), args),
    }
}

fn settings_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| {
            env::var("QUILL_SETTINGS")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
}

fn run_presets(settings: &dyn SettingsSource) -> Result<i32> {
    let settings = settings.load()?;
    let main_profile = settings.api.main_narrative_profile_id.as_deref();
    println!("profiles:");
    for profile in &settings.api.profiles {
        let marker = if Some(profile.id.as_str()) == main_profile {
            " (main)"
        } else {
            ""
        };
        let credential = if profile.credential().is_some() {
            "key set"
        } else {
            "no key"
        };
        println!(
            "  {}{marker}  {}  [{}]",
            profile.id, profile.provider_type, credential
        );
    }
    println!("presets:");
    for preset in settings.presets.values() {
        println!(
            "  {}  model={}  profile={}  effort={}",
            preset.id,
            preset.model,
            preset.profile_id.as_deref().unwrap_or("(main)"),
            preset.reasoning_effort.label()
        );
    }
    Ok(0)
}

fn cancel_token(timeout_secs: Option<u64>) -> Option<CancelToken> {
    timeout_secs.map(|secs| {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_secs(secs));
        token
    })
}

fn run_text(generator: &Generator, args: TextArgs) -> Result<i32> {
    let mut request = GenerateRequest::new(&args.preset, &args.system, &args.prompt);
    request.cancel = cancel_token(args.timeout_secs);
    if args.stream {
        print_stream(generator.stream_plain_text(&request)?)?;
    } else {
        println!("{}", generator.generate_plain_text(&request)?);
    }
    Ok(0)
}

fn run_narrate(generator: &Generator, args: NarrateArgs) -> Result<i32> {
    let mut request = NarrativeRequest::new(&args.system, &args.prompt);
    request.cancel = cancel_token(args.timeout_secs);
    print_stream(generator.stream_narrative(&request)?)?;
    Ok(0)
}

fn print_stream(stream: TextStream) -> Result<()> {
    let mut stdout = io::stdout().lock();
    for chunk in stream {
        stdout.write_all(chunk?.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

fn parse_character(raw: &str) -> CharacterDescriptor {
    let (name, descriptors) = raw.split_once(':').unwrap_or((raw, ""));
    CharacterDescriptor {
        name: name.trim().to_string(),
        visual_descriptors: descriptors
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

fn run_illustrate(generator: Generator, args: IllustrateArgs) -> Result<i32> {
    let passage = fs::read_to_string(&args.passage)
        .with_context(|| format!("failed reading {}", args.passage.display()))?;
    if passage.trim().is_empty() {
        bail!("passage {} is empty", args.passage.display());
    }

    let (ready_tx, ready_rx) = mpsc::channel::<(String, bool)>();
    let ready_tx = Mutex::new(ready_tx);
    let bus = EventBus::new();
    bus.subscribe(move |event| {
        if let ImageEvent::Ready {
            image_id, success, ..
        } = event
        {
            if let Ok(tx) = ready_tx.lock() {
                let _ = tx.send((image_id.clone(), *success));
            }
        }
    });
    let writer = EventWriter::new(&args.events, args.story.clone());
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(writer), Arc::new(bus)];
    let store = Arc::new(JsonFileImageStore::new(&args.store));
    let service =
        ImageGenerationService::new(generator, store.clone(), Arc::new(Fanout::new(sinks)));

    let context = ImageGenerationContext {
        story_id: args.story.clone(),
        entry_id: args.entry.clone(),
        narrative_response: passage,
        user_action: args.action.clone(),
        present_characters: args.characters.iter().map(|raw| parse_character(raw)).collect(),
        current_location: args.location.clone(),
        ..ImageGenerationContext::default()
    };
    let queued = service.generate_for_narrative(&context);
    if queued.is_empty() {
        println!("no images queued for entry {}", args.entry);
        return Ok(0);
    }
    println!("queued {} image(s): {}", queued.len(), queued.join(", "));

    let mut outcomes: HashMap<String, bool> = HashMap::new();
    let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
    while queued.iter().any(|id| !outcomes.contains_key(id)) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match ready_rx.recv_timeout(remaining) {
            Ok((image_id, success)) => {
                outcomes.insert(image_id, success);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let mut failures = 0;
    for image_id in &queued {
        let record = store.get(image_id)?;
        match (outcomes.get(image_id), record) {
            (Some(true), _) => println!("{image_id}: complete"),
            (Some(false), Some(record)) => {
                failures += 1;
                println!(
                    "{image_id}: failed ({})",
                    record.error_message.as_deref().unwrap_or("unknown error")
                );
            }
            (Some(false), None) => {
                failures += 1;
                println!("{image_id}: failed");
            }
            (None, _) => {
                failures += 1;
                println!("{image_id}: still running after {}s", args.wait_secs);
            }
        }
    }
    println!(
        "records: {}  events: {}",
        args.store.display(),
        args.events.display()
    );
    Ok(if failures == 0 { 0 } else { 2 })
}

fn run_images(args: ImagesArgs) -> Result<i32> {
    let store = JsonFileImageStore::new(&args.store);
    let rows = store
        .list_for_entry(&args.entry)?
        .into_iter()
        .map(|record| {
            json!({
                "id": record.id,
                "status": record.status.as_str(),
                "prompt": record.prompt,
                "style_id": record.style_id,
                "model": record.model,
                "width": record.width,
                "height": record.height,
                "image_bytes_b64": record.image_data.len(),
                "error_message": record.error_message,
                "created_at": record.created_at,
            })
        })
        .collect::<Vec<_>>();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(0)
}

fn run_translate(
    generator: Generator,
    settings: &dyn SettingsSource,
    args: TranslateArgs,
) -> Result<i32> {
    let translation = settings.load()?.translation;
    let service = TranslationService::new(generator, translation.preset.clone());
    let translated = match args.from {
        Some(source) => {
            log::info!("translating input from {}", language_display_name(&source));
            service.translate_input(&args.text, &source, None)?
        }
        None => {
            let target = args.to.unwrap_or(translation.target_language);
            log::info!("translating narration to {}", language_display_name(&target));
            service.translate_narration(&args.text, &target, None)?
        }
    };
    println!("{translated}");
    Ok(0)
}
