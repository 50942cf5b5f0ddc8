mod commands;
mod config;
mod render;
mod sketch;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use commands::{Command, HELP};
use config::{load_settings, prepare_database_url, Settings};
use session_core::{
    http::{HttpJudgeClient, HttpTargetAcquisition},
    Collaborators, ControllerHandle, ControllerRuntime, DurableHistoryStore, IdentityHub, Phase,
    SessionController,
};
use shared::domain::{ChatRole, Identity};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "trainer.toml")]
    config: PathBuf,
    /// Signs in as this user at startup, overriding the settings file.
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(user) = args.user {
        settings.user_id = Some(user);
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }

    let database_url = prepare_database_url(&settings.database_url)?;
    let store = DurableHistoryStore::initialize(&database_url)
        .await
        .map_err(|error| {
            error!(%database_url, "failed to open history database: {error:#}");
            error
        })?;

    let hub = IdentityHub::new();
    if let Some(user_id) = &settings.user_id {
        hub.sign_in(identity_for(user_id, settings.display_name.clone()));
    }

    let controller = SessionController::new().with_coach_window(settings.coach_window);
    let (handle, task) =
        ControllerRuntime::spawn(controller, collaborators(&settings, store), hub.subscribe());
    info!(%database_url, "trainer ready");

    let printer = tokio::spawn(print_updates(handle.clone()));
    println!("{}", render::describe_view(&handle.view()));
    println!("type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Quit) => break,
            Ok(command) => run_command(&handle, &hub, command).await,
            Err(err) => println!("{err}"),
        }
    }

    handle.shutdown().await;
    printer.abort();
    let _ = task.await;
    Ok(())
}

fn identity_for(user_id: &str, display_name: Option<String>) -> Identity {
    let identity = Identity::new(user_id);
    match display_name {
        Some(name) => identity.with_display_name(name),
        None => identity,
    }
}

fn collaborators(settings: &Settings, store: Arc<DurableHistoryStore>) -> Collaborators {
    let mut collaborators = Collaborators::default()
        .with_acquisition(Arc::new(HttpTargetAcquisition::new(
            settings.target_source_url.clone(),
        )))
        .with_history(store);

    match &settings.judge_url {
        Some(judge_url) => {
            let judge = Arc::new(HttpJudgeClient::new(
                judge_url.clone(),
                settings.judge_api_key.clone(),
            ));
            collaborators = collaborators
                .with_scoring(judge.clone())
                .with_coaching(judge);
        }
        None => info!("no judge configured; submissions and coaching will fail"),
    }

    if let Some(path) = &settings.sketch_path {
        collaborators = collaborators.with_sketches(Arc::new(sketch::FileSketchSource::new(path)));
    }
    collaborators
}

async fn run_command(handle: &ControllerHandle, hub: &IdentityHub, command: Command) {
    let outcome = match command {
        Command::Start => handle.start_session().await,
        Command::Next => handle.advance_step().await,
        Command::Back => handle.retreat_step().await,
        Command::Notes(text) => handle.record_notes(text).await,
        Command::Sketch(path) => match sketch::read_sketch(&path) {
            Ok(sketch) => handle.record_sketch(sketch).await,
            Err(err) => {
                println!("{err:#}");
                return;
            }
        },
        Command::Capture => match handle.capture_sketch().await {
            Ok(false) => {
                println!("nothing drawn yet");
                Ok(())
            }
            other => other.map(|_| ()),
        },
        Command::Submit => handle.submit_session().await,
        Command::Exit => handle.request_exit().await.map(|_| ()),
        Command::Confirm => handle.confirm_exit().await,
        Command::Stay => handle.cancel_exit().await,
        Command::Done => handle.finish_feedback().await,
        Command::Coach => {
            let view = handle.view();
            if let Some(report) = view.coach_report.as_ref().filter(|_| !view.coach_pending) {
                println!("{}", render::describe_report(report));
                return;
            }
            handle.request_coach_report().await
        }
        Command::Chat(text) => handle.send_chat_message(text).await,
        Command::Transcript => {
            println!("{}", render::describe_conversation(&handle.view().conversation));
            return;
        }
        Command::ClearChat => handle.clear_chat().await,
        Command::History => {
            println!("{}", render::describe_history(&handle.view().history));
            return;
        }
        Command::Stats => {
            println!("{}", render::describe_stats(&handle.view().stats));
            return;
        }
        Command::Login {
            user_id,
            display_name,
        } => {
            hub.sign_in(identity_for(&user_id, display_name));
            return;
        }
        Command::Logout => {
            hub.sign_out();
            return;
        }
        Command::Help => {
            println!("{HELP}");
            return;
        }
        Command::Quit => return,
    };

    if let Err(err) = outcome {
        println!("{err}");
    }
}

async fn print_updates(handle: ControllerHandle) {
    let mut views = handle.watch_view();
    let mut notices = handle.subscribe_notices();
    let mut last = views.borrow_and_update().clone();

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                let headline_changed = view.phase != last.phase
                    || view.loading != last.loading
                    || view.step != last.step
                    || view.notes != last.notes
                    || view.sketch != last.sketch
                    || view.exit_confirmation_pending != last.exit_confirmation_pending
                    || view.identity != last.identity;
                if headline_changed {
                    println!("{}", render::describe_view(&view));
                }
                if view.phase == Phase::Idle && view.history.len() != last.history.len() {
                    println!("{}", render::describe_stats(&view.stats));
                }
                if view.chat_pending && !last.chat_pending {
                    println!("the coach is thinking...");
                }
                if view.conversation.len() > last.conversation.len() {
                    for message in &view.conversation[last.conversation.len()..] {
                        if message.role == ChatRole::Coach {
                            println!("{}", render::describe_chat_message(message));
                        }
                    }
                }
                last = view;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    if let Some(text) = render::describe_notice(&notice) {
                        println!("{text}");
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }
}
