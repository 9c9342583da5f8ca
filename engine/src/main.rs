use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, io};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use splicing_core::{
    ConfigStore, ConversationService, ConverseRequest, EngineConfig, GraphDelta, Node,
    PipelineStore, ProjectUpdate, PromptLibrary, SettingsProviders,
};
use splicing_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use splicing_providers::ProviderRegistry;
use splicing_store::{codec::table_preview, SqliteStore};
use splicing_types::{
    BlockSetup, LlmType, MoveDirection, ProjectSetup, SectionType, SettingsSectionType,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SUPPORTED_PROVIDER_IDS: [&str; 2] = ["openai", "anthropic"];

#[derive(Parser, Debug)]
#[command(name = "splicing-engine")]
#[command(about = "Conversational data pipeline assistant")]
struct Cli {
    /// Project-level config file layered over the global one.
    #[arg(long, global = true, env = "SPLICING_CONFIG")]
    config: Option<String>,
    #[arg(long, global = true, env = "SPLICING_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, global = true)]
    provider: Option<String>,
    #[arg(long, global = true)]
    model: Option<String>,
    #[arg(long, global = true)]
    max_tool_cycles: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(subcommand)]
    Project(ProjectCommand),
    #[command(subcommand)]
    Section(SectionCommand),
    #[command(subcommand)]
    Block(BlockCommand),
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Sends one message and streams the assistant's reply.
    Chat {
        project_id: String,
        message: String,
        #[arg(long)]
        section: Option<String>,
        /// Print the engine events the turn published to stderr, one JSON
        /// object per line.
        #[arg(long)]
        events: bool,
    },
    History {
        project_id: String,
    },
    /// Drops the conversation and starts over from the greeting.
    Reset {
        project_id: String,
    },
    Dag {
        project_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    Create {
        title: String,
        #[arg(long, default_value = "OpenAI")]
        llm: LlmType,
        #[arg(long, default_value = "")]
        dir: String,
    },
    List,
    Show {
        project_id: String,
    },
    Update {
        project_id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        llm: Option<LlmType>,
        #[arg(long)]
        dir: Option<String>,
    },
    Delete {
        project_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum SectionCommand {
    Add {
        project_id: String,
        section_type: SectionType,
        #[arg(long)]
        title: Option<String>,
    },
    Rename {
        project_id: String,
        section_id: String,
        title: String,
    },
    Move {
        project_id: String,
        section_id: String,
        direction: MoveDirection,
    },
    Delete {
        project_id: String,
        section_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum BlockCommand {
    Add {
        project_id: String,
        section_id: String,
        #[arg(long, default_value_t = 10)]
        num_rows: u64,
    },
    /// Stores a setup given as inline JSON, `@file` or `-` for stdin.
    Setup {
        project_id: String,
        section_id: String,
        block_id: String,
        json: String,
    },
    Select {
        project_id: String,
        section_id: String,
        block_id: Option<String>,
    },
    Generate {
        project_id: String,
        section_id: String,
        block_id: String,
    },
    /// Replaces the generated code with the contents of `file`.
    Save {
        project_id: String,
        section_id: String,
        block_id: String,
        file: PathBuf,
    },
    Execute {
        project_id: String,
        section_id: String,
        block_id: String,
        #[arg(long)]
        code: Option<PathBuf>,
    },
    Reset {
        project_id: String,
        section_id: String,
        block_id: String,
    },
    Delete {
        project_id: String,
        section_id: String,
        block_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Set {
        section_type: SettingsSectionType,
        key: String,
        value: String,
    },
    Get {
        section_type: SettingsSectionType,
        key: String,
    },
    List {
        section_type: Option<SettingsSectionType>,
    },
    Delete {
        section_type: SettingsSectionType,
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let provider = normalize_and_validate_provider(cli.provider)?;
    let overrides = build_cli_overrides(cli.api_key, provider, cli.model, cli.max_tool_cycles)?;
    let config_path = cli.config.map(PathBuf::from).unwrap_or_else(default_config_path);
    let config = ConfigStore::new(&config_path, overrides)
        .await
        .with_context(|| format!("loading config from {}", config_path.display()))?
        .get()
        .await;

    let (_log_guard, log_info) =
        init_process_logging(ProcessKind::Cli, &config.logs_dir(), config.log_retention_days)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("cli logging initialized: {:?}", log_info);

    let service = build_service(&config).await?;
    run_command(&service, cli.command).await
}

async fn build_service(config: &EngineConfig) -> anyhow::Result<ConversationService> {
    let store_path = config.store_path();
    info!(
        "startup paths: app_dir={} store={}",
        config.app_dir.display(),
        store_path.display()
    );
    let store = SqliteStore::open(&store_path)
        .await
        .with_context(|| format!("opening store at {}", store_path.display()))?;
    let pipeline = PipelineStore::new(Arc::new(store), config.app_dir.clone());
    let base = config.providers_config();
    let providers = SettingsProviders::new(
        ProviderRegistry::new(base.clone()),
        pipeline.clone(),
        base,
    );
    let prompts = PromptLibrary::load(config.prompts_path.as_deref()).await?;
    Ok(
        ConversationService::new(pipeline, Arc::new(providers), Arc::new(prompts))
            .with_max_tool_cycles(config.max_tool_cycles),
    )
}

async fn run_command(service: &ConversationService, command: Command) -> anyhow::Result<()> {
    let pipeline = service.pipeline();
    match command {
        Command::Project(command) => match command {
            ProjectCommand::Create { title, llm, dir } => {
                let project = service
                    .start_project(ProjectSetup {
                        title,
                        llm,
                        project_dir: dir,
                    })
                    .await?;
                print_json(&project)?;
            }
            ProjectCommand::List => print_json(&pipeline.list_projects().await?)?,
            ProjectCommand::Show { project_id } => {
                let view = pipeline
                    .project_view(&project_id)
                    .await?
                    .with_context(|| format!("project `{project_id}` not found"))?;
                print_json(&view)?;
            }
            ProjectCommand::Update {
                project_id,
                title,
                llm,
                dir,
            } => {
                let update = ProjectUpdate {
                    title,
                    llm,
                    project_dir: dir,
                };
                let project = pipeline
                    .update_project(&project_id, update)
                    .await?
                    .with_context(|| format!("project `{project_id}` not found"))?;
                print_json(&project)?;
            }
            ProjectCommand::Delete { project_id } => {
                print_json(&json!({"deleted": service.close_project(&project_id).await?}))?;
            }
        },
        Command::Section(command) => match command {
            SectionCommand::Add {
                project_id,
                section_type,
                title,
            } => {
                let title = title.unwrap_or_else(|| section_type.to_string());
                let section = pipeline
                    .add_section(&project_id, &title, section_type)
                    .await?
                    .with_context(|| format!("project `{project_id}` not found"))?;
                print_json(&section)?;
            }
            SectionCommand::Rename {
                project_id,
                section_id,
                title,
            } => {
                let section = pipeline
                    .rename_section(&project_id, &section_id, &title)
                    .await?
                    .with_context(|| format!("section `{section_id}` not found"))?;
                print_json(&section)?;
            }
            SectionCommand::Move {
                project_id,
                section_id,
                direction,
            } => {
                let moved = pipeline
                    .move_section(&project_id, &section_id, direction)
                    .await?;
                print_json(&json!({"moved": moved}))?;
            }
            SectionCommand::Delete {
                project_id,
                section_id,
            } => {
                let deleted = pipeline.delete_section(&project_id, &section_id).await?;
                print_json(&json!({"deleted": deleted}))?;
            }
        },
        Command::Block(command) => run_block_command(service, command).await?,
        Command::Settings(command) => match command {
            SettingsCommand::Set {
                section_type,
                key,
                value,
            } => {
                let value = parse_setting_value(&value);
                pipeline.set_settings(section_type, &key, &value).await?;
                print_json(&json!({"sectionType": section_type, "key": key, "value": value}))?;
            }
            SettingsCommand::Get { section_type, key } => {
                let value = pipeline.get_settings(section_type, &key).await?;
                print_json(&value.unwrap_or(Value::Null))?;
            }
            SettingsCommand::List { section_type } => {
                let entries = match section_type {
                    Some(section_type) => pipeline.list_settings(section_type).await?,
                    None => pipeline.list_all_settings().await?,
                };
                print_json(&entries)?;
            }
            SettingsCommand::Delete { section_type, key } => {
                let deleted = pipeline.delete_settings(section_type, &key).await?;
                print_json(&json!({"deleted": deleted}))?;
            }
        },
        Command::Chat {
            project_id,
            message,
            section,
            events,
        } => {
            chat(
                service,
                &project_id,
                ConverseRequest::new(message, section),
                events,
            )
            .await?
        }
        Command::History { project_id } => print_json(&service.history(&project_id).await?)?,
        Command::Reset { project_id } => {
            let messages = service
                .reset_conversation(&project_id)
                .await?
                .with_context(|| format!("project `{project_id}` not found"))?;
            print_json(&messages)?;
        }
        Command::Dag { project_id } => print_json(&pipeline.build_dag(&project_id).await?)?,
    }
    Ok(())
}

async fn run_block_command(
    service: &ConversationService,
    command: BlockCommand,
) -> anyhow::Result<()> {
    let pipeline = service.pipeline();
    match command {
        BlockCommand::Add {
            project_id,
            section_id,
            num_rows,
        } => {
            let block = service
                .add_block(&project_id, &section_id, num_rows)
                .await?
                .with_context(|| format!("section `{section_id}` not found"))?;
            print_json(&block)?;
        }
        BlockCommand::Setup {
            project_id,
            section_id,
            block_id,
            json,
        } => {
            let section = pipeline
                .get_section(&project_id, &section_id)
                .await?
                .with_context(|| format!("section `{section_id}` not found"))?;
            let setup = BlockSetup::from_value(section.section_type, read_json_arg(&json)?)
                .with_context(|| format!("invalid {} setup", section.section_type))?;
            let outcome = service
                .setup_block(&project_id, &section_id, &block_id, &setup)
                .await?
                .with_context(|| format!("block `{block_id}` not found"))?;
            print_json(&json!({
                "setup": setup.to_value()?,
                "recommendations": outcome.recommendations,
                "message": outcome.recommendation,
            }))?;
        }
        BlockCommand::Select {
            project_id,
            section_id,
            block_id,
        } => {
            let selected = service
                .select_block(&project_id, &section_id, block_id.as_deref())
                .await?;
            print_json(&json!({"selected": selected}))?;
        }
        BlockCommand::Generate {
            project_id,
            section_id,
            block_id,
        } => {
            let result = service
                .generate_block_code(&project_id, &section_id, &block_id)
                .await?
                .with_context(|| format!("block `{block_id}` not found or has no setup"))?;
            print_json(&result)?;
        }
        BlockCommand::Save {
            project_id,
            section_id,
            block_id,
            file,
        } => {
            let code = fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let result = service
                .save_block_code(&project_id, &section_id, &block_id, &code)
                .await?
                .with_context(|| format!("block `{block_id}` has no generated code"))?;
            print_json(&result)?;
        }
        BlockCommand::Execute {
            project_id,
            section_id,
            block_id,
            code,
        } => {
            let code = code
                .map(|path| {
                    fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
                })
                .transpose()?;
            let outcome = service
                .execute_block(&project_id, &section_id, &block_id, code.as_deref())
                .await?
                .with_context(|| format!("block `{block_id}` not found or has no code"))?;
            let record = pipeline.get_block(&project_id, &section_id, &block_id).await?;
            let rows = record.map(|r| r.metadata.num_rows).unwrap_or(10) as usize;
            let mut data = serde_json::Map::new();
            for (name, batch) in &outcome.datasets {
                data.insert(name.clone(), table_preview(batch, rows)?);
            }
            print_json(&json!({"executeResult": outcome.result, "data": data}))?;
        }
        BlockCommand::Reset {
            project_id,
            section_id,
            block_id,
        } => {
            let reset = pipeline
                .reset_block(&project_id, &section_id, &block_id)
                .await?;
            print_json(&json!({"reset": reset}))?;
        }
        BlockCommand::Delete {
            project_id,
            section_id,
            block_id,
        } => {
            let deleted = pipeline
                .delete_block(&project_id, &section_id, &block_id)
                .await?;
            print_json(&json!({"deleted": deleted}))?;
        }
    }
    Ok(())
}

async fn chat(
    service: &ConversationService,
    project_id: &str,
    request: ConverseRequest,
    show_events: bool,
) -> anyhow::Result<()> {
    let mut events = show_events.then(|| service.events().subscribe());
    let (tx, mut rx) = mpsc::channel::<GraphDelta>(256);
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    let printer = tokio::spawn(async move {
        let mut printed = false;
        let mut stdout = io::stdout();
        while let Some(delta) = rx.recv().await {
            if delta.node == Node::Chat && !delta.content.is_empty() {
                let _ = write!(stdout, "{}", delta.content);
                let _ = stdout.flush();
                printed = true;
            }
        }
        printed
    });

    let reply = service
        .converse_stream(project_id, request, tx, cancel)
        .await;
    let printed = printer.await.unwrap_or(false);
    let reply = reply?;
    if printed {
        println!();
    } else {
        println!("{}", reply.content);
    }
    if let Some(events) = events.as_mut() {
        while let Ok(event) = events.try_recv() {
            eprintln!("{}", serde_json::to_string(&event)?);
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Settings values are JSON when they parse as JSON, plain strings otherwise.
fn parse_setting_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    max_tool_cycles: Option<usize>,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() && max_tool_cycles.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(cycles) = max_tool_cycles {
        root.insert("max_tool_cycles".to_string(), json!(cycles));
    }

    // Key and model apply to the named provider, openai when none is given.
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), Value::String(m));
        }
        let mut providers = serde_json::Map::new();
        providers.insert(target_provider.to_string(), Value::Object(provider_config));
        root.insert("providers".to_string(), Value::Object(providers));
    }

    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".splicing")
        .join("config.json")
}

fn read_json_arg(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}
