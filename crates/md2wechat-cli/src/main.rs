use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use md2wechat_contracts::errors::{GenerationError, ImagePostError};
use md2wechat_contracts::events::{EventKind, EventLog, EventPayload};
use md2wechat_contracts::images::ProviderKind;
use md2wechat_contracts::posts::markdown::image_refs;
use md2wechat_contracts::posts::news::NewsDraft;
use md2wechat_contracts::posts::ImagePostRequest;
use md2wechat_engine::{
    build_provider, mask_media_id, Config, ConvertClient, ConvertRequest, DryRunPublisher,
    ImagePostPipeline, WechatClient,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_DIRECTIVE: &str = "md2wechat=info";

#[derive(Debug, Parser)]
#[command(
    name = "md2wechat",
    version,
    about = "Publish Markdown and image posts to WeChat Official Accounts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an image-only ("newspic") draft from local images.
    CreateImagePost(CreateImagePostArgs),
    /// Generate an image from a text prompt.
    GenerateImage(GenerateImageArgs),
    /// Upload a local image to the permanent material library.
    UploadImage(UploadImageArgs),
    /// Download an online image and upload it to the material library.
    DownloadAndUpload(DownloadAndUploadArgs),
    /// Create a regular article draft from a JSON file.
    CreateDraft(CreateDraftArgs),
    /// Convert Markdown to WeChat-styled HTML.
    Convert(ConvertArgs),
}

#[derive(Debug, Args)]
struct CreateImagePostArgs {
    #[arg(short, long)]
    title: Option<String>,
    /// Post text; read from stdin when omitted and stdin is piped.
    #[arg(short, long)]
    content: Option<String>,
    /// Comma-separated image paths.
    #[arg(long)]
    images: Option<String>,
    #[arg(short = 'm', long)]
    from_markdown: Option<PathBuf>,
    #[arg(long)]
    open_comment: bool,
    #[arg(long)]
    fans_only: bool,
    #[arg(long)]
    dry_run: bool,
    /// Also write the result JSON to this file.
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct GenerateImageArgs {
    prompt: String,
    /// `WIDTHxHEIGHT` or `W:H`, e.g. 2560x1440 or 16:9.
    #[arg(short, long)]
    size: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Upload the generated image and remove the local file.
    #[arg(long)]
    upload: bool,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct UploadImageArgs {
    path: PathBuf,
}

#[derive(Debug, Args)]
struct DownloadAndUploadArgs {
    url: String,
}

#[derive(Debug, Args)]
struct CreateDraftArgs {
    /// `{"articles": [{"title": ..., "content": ...}]}`
    json_file: PathBuf,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    file: PathBuf,
    #[arg(long, default_value = "default")]
    theme: String,
    #[arg(long)]
    font_size: Option<String>,
    /// `default`, `grid` or `none`.
    #[arg(long)]
    background_type: Option<String>,
    /// Write the HTML to this file.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let (envelope, code) = match run(cli) {
        Ok(data) => (success_envelope(data), 0),
        Err(err) => (failure_envelope(&err), 1),
    };
    match serde_json::to_string_pretty(&envelope) {
        Ok(text) => println!("{text}"),
        Err(err) => {
            eprintln!("md2wechat error: JSON encode failed: {err}");
            std::process::exit(1);
        }
    }
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<Value> {
    let config = Config::from_env()?;
    match cli.command {
        Command::CreateImagePost(args) => run_create_image_post(args, &config),
        Command::GenerateImage(args) => run_generate_image(args, &config),
        Command::UploadImage(args) => run_upload_image(args, &config),
        Command::DownloadAndUpload(args) => run_download_and_upload(args, &config),
        Command::CreateDraft(args) => run_create_draft(args, &config),
        Command::Convert(args) => run_convert(args, &config),
    }
}

fn run_create_image_post(args: CreateImagePostArgs, config: &Config) -> Result<Value> {
    let content = match args.content {
        Some(content) => content,
        None => read_piped_stdin()?,
    };
    let request = ImagePostRequest {
        title: args.title.unwrap_or_default(),
        content,
        images: args
            .images
            .as_deref()
            .map(parse_image_list)
            .unwrap_or_default(),
        from_markdown: args.from_markdown,
        open_comment: args.open_comment,
        fans_only: args.fans_only,
    };
    let events = EventLog::open(args.events.as_deref());

    if args.dry_run {
        let preview = ImagePostPipeline::new(&DryRunPublisher)
            .with_events(events)
            .preview(&request)?;
        let preview = serde_json::to_value(&preview)?;
        if let Some(output) = args.output.as_deref() {
            write_json_file(output, &preview)?;
        }
        return Ok(json!({ "mode": "dry-run", "preview": preview }));
    }

    let client = WechatClient::new(config.wechat_credentials()?, &config.wechat_api_base);
    let result = ImagePostPipeline::new(&client)
        .with_events(events)
        .run(&request)?;
    let result = serde_json::to_value(&result)?;
    if let Some(output) = args.output.as_deref() {
        write_json_file(output, &result)?;
    }
    Ok(result)
}

fn run_generate_image(args: GenerateImageArgs, config: &Config) -> Result<Value> {
    let kind = args.provider.as_deref().map(parse_provider).transpose()?;
    let settings = config.provider_settings(kind, args.model.as_deref(), args.size.as_deref())?;
    let provider = build_provider(settings);
    let events = EventLog::open(args.events.as_deref());
    emit_event(
        &events,
        EventKind::RunStarted,
        json!({ "command": "generate-image", "provider": provider.name() }),
    );

    info!(provider = provider.name(), "generating image");
    let generated = match provider.generate(&args.prompt) {
        Ok(generated) => generated,
        Err(err) => {
            emit_event(&events, EventKind::RunFailed, err.to_json());
            return Err(err.into());
        }
    };
    emit_event(
        &events,
        EventKind::ImageGenerated,
        json!({
            "provider": generated.provider,
            "path": generated.path.to_string_lossy(),
            "model": generated.model,
            "size": generated.size,
        }),
    );
    let mut data = serde_json::to_value(&generated)?;
    if !args.upload {
        return Ok(data);
    }

    let client = WechatClient::new(config.wechat_credentials()?, &config.wechat_api_base);
    let upload = client
        .upload_image(&generated.path)
        .with_context(|| format!("generated image kept at {}", generated.path.display()))?;
    emit_event(
        &events,
        EventKind::ImageUploaded,
        json!({ "media_id": mask_media_id(&upload.media_id) }),
    );
    if let Err(err) = fs::remove_file(&generated.path) {
        warn!(path = %generated.path.display(), error = %err, "failed to remove generated image");
    }
    if let Value::Object(map) = &mut data {
        map.remove("path");
        map.insert("media_id".to_string(), Value::String(upload.media_id));
        map.insert("wechat_url".to_string(), Value::String(upload.url));
    }
    Ok(data)
}

fn run_upload_image(args: UploadImageArgs, config: &Config) -> Result<Value> {
    let client = WechatClient::new(config.wechat_credentials()?, &config.wechat_api_base);
    let upload = client.upload_image(&args.path)?;
    Ok(json!({
        "path": args.path.to_string_lossy(),
        "media_id": upload.media_id,
        "wechat_url": upload.url,
    }))
}

fn run_download_and_upload(args: DownloadAndUploadArgs, config: &Config) -> Result<Value> {
    let client = WechatClient::new(config.wechat_credentials()?, &config.wechat_api_base);
    let upload = client.upload_remote_image(&args.url)?;
    Ok(json!({
        "url": args.url,
        "media_id": upload.media_id,
        "wechat_url": upload.url,
    }))
}

fn run_create_draft(args: CreateDraftArgs, config: &Config) -> Result<Value> {
    let draft = NewsDraft::from_file(&args.json_file)?;
    draft.validate()?;
    let client = WechatClient::new(config.wechat_credentials()?, &config.wechat_api_base);
    let result = client.create_news_draft(&draft)?;
    Ok(serde_json::to_value(&result)?)
}

fn run_convert(args: ConvertArgs, config: &Config) -> Result<Value> {
    let api_key = config
        .convert_api_key
        .clone()
        .ok_or_else(|| anyhow!("MD2WECHAT_API_KEY must be set for convert"))?;
    let markdown = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let client = ConvertClient::new(&config.convert_base_url, api_key);
    let html = client.convert(&ConvertRequest {
        markdown: markdown.clone(),
        theme: args.theme.clone(),
        font_size: args.font_size,
        background_type: args.background_type,
    })?;
    if let Some(output) = args.output.as_deref() {
        fs::write(output, &html)
            .with_context(|| format!("failed to write {}", output.display()))?;
    }
    Ok(json!({
        "theme": args.theme,
        "html": html,
        "images": image_refs(&markdown),
        "output": args.output.map(|path| path.to_string_lossy().to_string()),
    }))
}

fn parse_provider(raw: &str) -> Result<ProviderKind> {
    ProviderKind::parse(raw)
        .ok_or_else(|| anyhow!("unsupported provider '{raw}' (expected gemini or openrouter)"))
}

fn parse_image_list(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn read_piped_stdin() -> Result<String> {
    let mut stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let mut raw = String::new();
    stdin
        .read_to_string(&mut raw)
        .context("failed to read content from stdin")?;
    Ok(raw.lines().collect::<Vec<_>>().join("\n"))
}

fn write_json_file(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn emit_event(events: &EventLog, kind: EventKind, payload: Value) {
    let payload = match payload {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    };
    if let Err(err) = events.emit(kind, payload) {
        warn!(event = kind.as_str(), error = %err, "failed to write event");
    }
}

fn success_envelope(data: Value) -> Value {
    json!({ "success": true, "data": data })
}

fn failure_envelope(err: &anyhow::Error) -> Value {
    if let Some(generation) = err.downcast_ref::<GenerationError>() {
        return json!({
            "success": false,
            "error": generation.to_string(),
            "provider": generation.provider,
            "code": generation.code,
            "hint": generation.hint,
        });
    }
    let mut envelope = json!({ "success": false, "error": format!("{err:#}") });
    if let Some(post) = err.downcast_ref::<ImagePostError>() {
        if !post.uploaded_media_ids().is_empty() {
            envelope["uploaded_media_ids"] = json!(post.uploaded_media_ids());
        }
    }
    envelope
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use clap::CommandFactory;
    use md2wechat_contracts::errors::{
        GenerationError, GenerationErrorCode, ImagePostError, UploadError, ValidationError,
    };
    use serde_json::json;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn create_image_post_flags_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "md2wechat",
            "create-image-post",
            "-t",
            "Trip",
            "--images",
            "a.png, b.jpg",
            "-m",
            "post.md",
            "--open-comment",
            "--fans-only",
            "--dry-run",
            "-o",
            "out.json",
        ])?;
        let Command::CreateImagePost(args) = cli.command else {
            panic!("expected create-image-post");
        };
        assert_eq!(args.title.as_deref(), Some("Trip"));
        assert_eq!(args.images.as_deref(), Some("a.png, b.jpg"));
        assert_eq!(args.from_markdown, Some(PathBuf::from("post.md")));
        assert!(args.open_comment && args.fans_only && args.dry_run);
        assert_eq!(args.output, Some(PathBuf::from("out.json")));
        Ok(())
    }

    #[test]
    fn generate_image_flags_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "md2wechat",
            "generate-image",
            "a cat on a roof",
            "--size",
            "16:9",
            "--provider",
            "gemini",
            "--upload",
        ])?;
        let Command::GenerateImage(args) = cli.command else {
            panic!("expected generate-image");
        };
        assert_eq!(args.prompt, "a cat on a roof");
        assert_eq!(args.size.as_deref(), Some("16:9"));
        assert_eq!(parse_provider(args.provider.as_deref().unwrap_or(""))?, ProviderKind::Gemini);
        assert!(args.upload);
        Ok(())
    }

    #[test]
    fn draft_and_download_commands_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["md2wechat", "create-draft", "draft.json"])?;
        let Command::CreateDraft(args) = cli.command else {
            panic!("expected create-draft");
        };
        assert_eq!(args.json_file, PathBuf::from("draft.json"));

        let cli = Cli::try_parse_from([
            "md2wechat",
            "download-and-upload",
            "https://example.com/cat.jpg",
        ])?;
        let Command::DownloadAndUpload(args) = cli.command else {
            panic!("expected download-and-upload");
        };
        assert_eq!(args.url, "https://example.com/cat.jpg");
        Ok(())
    }

    #[test]
    fn invalid_draft_file_fails_before_credentials_are_needed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("draft.json");
        fs::write(&path, r#"{"articles":[{"title":"Hello"}]}"#)?;
        let config = Config::from_lookup(|_| None)?;
        let err = run_create_draft(CreateDraftArgs { json_file: path }, &config)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "article 1: content is required");
        Ok(())
    }

    #[test]
    fn dry_run_ignores_unrelated_image_settings() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = temp.path().join("a.png");
        fs::write(&image, b"png")?;
        let image_arg = image.to_string_lossy().to_string();
        let config = Config::from_lookup(|key| {
            (key == "IMAGE_PROVIDER").then(|| "dalle".to_string())
        })?;
        let cli = Cli::try_parse_from([
            "md2wechat",
            "create-image-post",
            "-t",
            "Trip",
            "-c",
            "day one",
            "--images",
            image_arg.as_str(),
            "--dry-run",
        ])?;
        let Command::CreateImagePost(args) = cli.command else {
            panic!("expected create-image-post");
        };
        let data = run_create_image_post(args, &config)?;
        assert_eq!(data["mode"], json!("dry-run"));
        assert_eq!(data["preview"]["image_count"], json!(1));
        Ok(())
    }

    #[test]
    fn image_list_trims_and_drops_blanks() {
        assert_eq!(
            parse_image_list(" a.png ,, b.jpg,  "),
            vec![PathBuf::from("a.png"), PathBuf::from("b.jpg")]
        );
        assert!(parse_image_list(" , ").is_empty());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = parse_provider("dalle")
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("unsupported provider 'dalle'"));
    }

    #[test]
    fn success_envelope_wraps_data() {
        assert_eq!(
            success_envelope(json!({ "media_id": "m" })),
            json!({ "success": true, "data": { "media_id": "m" } })
        );
    }

    #[test]
    fn generation_failure_envelope_carries_taxonomy() {
        let err: anyhow::Error = GenerationError::new(
            "OpenRouter",
            GenerationErrorCode::RateLimit,
            "too many requests, retry later",
        )
        .with_hint("wait before retrying")
        .into();
        assert_eq!(
            failure_envelope(&err),
            json!({
                "success": false,
                "error": "[OpenRouter] rate_limit: too many requests, retry later",
                "provider": "OpenRouter",
                "code": "rate_limit",
                "hint": "wait before retrying",
            })
        );
    }

    #[test]
    fn upload_failure_envelope_lists_orphaned_media() {
        let err: anyhow::Error = ImagePostError::from(UploadError {
            index: 2,
            path: PathBuf::from("/p/b.png"),
            attempts: 3,
            message: "connection reset".to_string(),
            uploaded_media_ids: vec!["media-a".to_string()],
        })
        .into();
        let envelope = failure_envelope(&err);
        assert_eq!(envelope["success"], json!(false));
        assert_eq!(
            envelope["error"],
            json!("upload image 2 (/p/b.png): connection reset")
        );
        assert_eq!(envelope["uploaded_media_ids"], json!(["media-a"]));

        let validation: anyhow::Error = ImagePostError::from(ValidationError::NoImages).into();
        assert_eq!(
            failure_envelope(&validation),
            json!({ "success": false, "error": "no images provided" })
        );
    }

    #[test]
    fn plain_failure_envelope_renders_context_chain() {
        let err = anyhow!("connection refused").context("WeChat token request failed");
        assert_eq!(
            failure_envelope(&err)["error"],
            json!("WeChat token request failed: connection refused")
        );
    }

    #[test]
    fn json_output_file_creates_parent_dirs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("results").join("post.json");
        write_json_file(&path, &json!({ "image_count": 2 }))?;
        let parsed: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(parsed["image_count"], json!(2));
        Ok(())
    }
}
