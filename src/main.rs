use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use taskstream::args::CommonArgs;
use taskstream::client::{ClientUpdate, SubmitOutcome, SubmitRejection, TaskSessionClient};
use taskstream::config::Config;
use taskstream::logging;
use taskstream::protocol::TaskEvent;
use taskstream::runtime::{EntryFollower, spawn_client};
use taskstream::service::{ConfigQuery, HttpTaskService, TaskService};
use taskstream::session::SessionState;
use taskstream::theme as t;
use tokio_util::sync::CancellationToken;

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "taskstream",
    version,
    about = "Submit tasks to a remote agent service and follow them live"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit a task and follow its event stream until it finishes
    Run {
        /// Task description
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
    },
    /// Check whether the task service is reachable
    Health,
    /// List tasks the service is tracking
    Tasks {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a task's status and buffered messages
    Status {
        task_id: String,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Ask the service to stop a task
    Stop { task_id: String },
    /// Show the service's resolved configuration for the current run settings
    Config,
    /// List the agent tools the service offers
    Tools,
    /// Write a default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    t::init_color(cli.common.no_color);
    logging::init_from_env();

    match cli.command {
        Commands::Init { force } => init_config(cli.common.config_path(), force),
        Commands::Run { task } => {
            let (config, service) = connect(&cli.common)?;
            run_task(config, service, &task.join(" ")).await
        }
        Commands::Health => {
            let (_, service) = connect(&cli.common)?;
            let reachable = service.health().await.unwrap_or(false);
            if reachable {
                println!("{}", t::icon_ok(&format!("{} is reachable", service.base_url())));
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{}", t::icon_fail(&format!("{} is unreachable", service.base_url())));
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Tasks { json } => {
            let (_, service) = connect(&cli.common)?;
            let list = service.list_tasks().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if list.active_tasks.is_empty() {
                println!("{}", t::muted("No tasks"));
            } else {
                println!("{}", t::heading(&format!("Tasks ({})", list.total_tasks)));
                for task in &list.active_tasks {
                    println!(
                        "  {}  {}  {}",
                        t::info(&task.task_id),
                        task.status,
                        t::muted(&format!("{:.1}s", task.duration))
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { task_id, json } => {
            let (_, service) = connect(&cli.common)?;
            let report = service.task_status(&task_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(ExitCode::SUCCESS);
            }
            println!("{}", t::label_value("Task", &report.task_id));
            println!("{}", t::label_value("Status", &report.task_status));
            println!("{}", t::label_value("Duration", &format!("{:.1}s", report.duration)));
            for frame in report.frames() {
                match frame {
                    Ok(frame) => println!(
                        "  {} {}",
                        t::accent(&format!("[{}]", frame.event.kind_label())),
                        event_text(&frame.event)
                    ),
                    Err(raw) => println!("  {} {}", t::muted("[raw]"), raw),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop { task_id } => {
            let (_, service) = connect(&cli.common)?;
            service.stop(&task_id).await?;
            println!("{}", t::icon_ok(&format!("Stop requested for {}", task_id)));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            let (config, service) = connect(&cli.common)?;
            let query = ConfigQuery {
                config_file: Some(config.run.config_file.clone()),
                provider: Some(config.run.provider.clone()),
                model: Some(config.run.model.clone()),
                max_steps: Some(config.run.max_steps),
            };
            let value = service.show_config(&query).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tools => {
            let (_, service) = connect(&cli.common)?;
            let list = service.list_tools().await?;
            println!("{}", t::heading(&format!("Tools ({})", list.total_tools)));
            for tool in &list.tools {
                if tool.error {
                    println!("  {}", t::icon_fail(&format!("{}: {}", tool.name, tool.description)));
                } else {
                    println!("  {}  {}", t::info(&tool.name), t::muted(&tool.description));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load the configuration, apply CLI overrides and build the HTTP client.
fn connect(common: &CommonArgs) -> Result<(Config, HttpTaskService)> {
    let mut config = Config::load(common.config_path())?;
    common.apply_overrides(&mut config);
    let service = HttpTaskService::new(&config.api_url, config.request_timeout())
        .with_context(|| format!("Invalid API URL '{}'", config.api_url))?;
    Ok((config, service))
}

fn event_text(event: &TaskEvent) -> String {
    match event {
        TaskEvent::Start { message }
        | TaskEvent::Step { message }
        | TaskEvent::Complete { message, .. }
        | TaskEvent::Unknown { message, .. } => message.clone().unwrap_or_default(),
        TaskEvent::Error { error, message, .. } => {
            error.clone().or_else(|| message.clone()).unwrap_or_default()
        }
        TaskEvent::End => String::new(),
    }
}

fn init_config(path: Option<std::path::PathBuf>, force: bool) -> Result<ExitCode> {
    let path = path.unwrap_or_else(Config::default_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(Some(path.clone()))?;
    println!("{}", t::icon_ok(&format!("Wrote {}", path.display())));
    Ok(ExitCode::SUCCESS)
}

/// Submit one task and print its chat log live until the session settles.
async fn run_task(config: Config, service: HttpTaskService, task: &str) -> Result<ExitCode> {
    let service: Arc<dyn TaskService> = Arc::new(service);
    let (mut client, signals) = TaskSessionClient::new(service, config.run.clone());
    let mut updates = client.subscribe();

    if !client.refresh_reachability().await {
        eprintln!("{}", t::icon_fail(&format!("Task service at {} is unreachable", config.api_url)));
        return Ok(ExitCode::FAILURE);
    }

    let outcome = client.submit(task).await;
    for entry in client.entries() {
        println!("{}", t::render_entry(entry));
    }
    match outcome {
        SubmitOutcome::Started(_) => {}
        SubmitOutcome::Failed => return Ok(ExitCode::FAILURE),
        SubmitOutcome::Ignored(SubmitRejection::EmptyText) => bail!("task text is empty"),
        SubmitOutcome::Ignored(rejection) => bail!("task not submitted: {rejection:?}"),
    }
    // Drain what was already printed from the log above.
    while updates.try_recv().is_ok() {}
    let printed = client.entries().len();

    let cancel = CancellationToken::new();
    let (handle, join) = spawn_client(client, signals, config.probe_interval(), cancel.clone());

    // Ctrl+C stops the task; a second Ctrl+C abandons it.
    let stopper = handle.clone();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_for_signal.cancel();
        }
    });

    let mut follower = EntryFollower::new(handle.clone(), updates, printed);
    let mut exit = ExitCode::FAILURE;
    loop {
        let update = tokio::select! {
            update = follower.next() => update,
            _ = cancel.cancelled() => break,
        };
        match update {
            Some(ClientUpdate::EntryAppended(entry)) => println!("{}", t::render_entry(&entry)),
            Some(ClientUpdate::SessionChanged(session)) if session.state().is_terminal() => {
                println!("{}", t::render_session(&session));
                exit = match session.state() {
                    SessionState::Completed => ExitCode::SUCCESS,
                    SessionState::Stopped => ExitCode::from(130),
                    _ => ExitCode::FAILURE,
                };
                break;
            }
            Some(ClientUpdate::ReachabilityChanged(false)) => {
                eprintln!("{}", t::icon_warn("Task service became unreachable"));
            }
            Some(_) => {}
            None => break,
        }
    }

    handle.shutdown();
    join.await.context("client loop panicked")?;
    Ok(exit)
}
