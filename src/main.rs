#![deny(clippy::implicit_return)]
#![allow(clippy::needless_return)]

mod application;
mod configuration;
mod domain;
mod infrastructure;

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Error;
use anyhow::Result;
use domain::models::Action;
use domain::models::ChatContext;
use domain::models::ModelRef;
use domain::models::ServerEvent;
use domain::models::UiEvent;
use infrastructure::server::OpenCodeServer;
use infrastructure::state::FileStateStore;
use tokio::sync::mpsc;
use tokio::task;
use yansi::Paint;

use crate::application::cli;
use crate::application::console;
use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::services::actions::ActionsConfig;
use crate::domain::services::actions::ActionsService;
use crate::domain::services::actions::ChannelConfirmer;
use crate::domain::services::actions::ConfirmRequest;
use crate::domain::services::EventStream;
use crate::domain::services::StreamConfig;
use crate::domain::services::WILDCARD;

fn handle_error(err: Error) {
    eprintln!(
            "{}",
            Paint::red(format!(
                "Oh no! Parley has failed with the following app version and error.\n\nVersion: {}\nCommit: {}\nError: {:#}",
                env!("CARGO_PKG_VERSION"),
                env!("VERGEN_GIT_DESCRIBE"),
                err
            ))
        );

    let backtrace = err.backtrace();
    if backtrace.to_string() == "disabled backtrace" {
        let args = env::args().collect::<Vec<String>>().join(" ");
        eprintln!("\nRunning the following can help explain further what the issue is:");
        eprintln!("\nRUST_BACKTRACE=1 {args}");
    } else {
        eprintln!("\n{}", backtrace);
    }

    process::exit(1);
}

fn chat_context() -> ChatContext {
    let model = Config::get(ConfigKey::Model);
    let mut context = ChatContext::new(
        &Config::get(ConfigKey::Agent),
        ModelRef::parse(&model),
        &Config::get(ConfigKey::Directory),
    );

    let session_id = Config::get(ConfigKey::SessionID);
    if !session_id.is_empty() {
        context.session_id = Some(session_id);
    }

    return context;
}

async fn run() -> Result<()> {
    let server = Arc::new(OpenCodeServer::default());
    let state = Arc::new(FileStateStore::default());

    let (action_tx, mut action_rx) = mpsc::unbounded_channel::<Action>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<UiEvent>();
    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (confirm_tx, confirm_rx) = mpsc::unbounded_channel::<ConfirmRequest>();

    let stream = EventStream::new(StreamConfig::from_config());
    stream.on(WILDCARD, move |event| {
        server_tx
            .send(event.clone())
            .map_err(|_| return anyhow!("Actions service is no longer listening"))?;
        return Ok(());
    });
    let error_tx = event_tx.clone();
    stream.on_error(move |err| {
        tracing::warn!(error = %err, "Event stream error");
        let _ = error_tx.send(UiEvent::Error(err.to_string()));
    });
    let stream_handle = stream.subscribe(server.clone());

    let service = ActionsService::new(
        server,
        state,
        Arc::new(ChannelConfirmer::new(confirm_tx)),
        event_tx,
        chat_context(),
        ActionsConfig {
            create_timeout: Duration::from_millis(Config::get_number(ConfigKey::CreateTimeout)),
            refresh_debounce: Duration::from_millis(Config::get_number(
                ConfigKey::RefreshDebounce,
            )),
        },
    );

    let mut background_futures = task::JoinSet::new();
    background_futures.spawn(async move {
        return service.start(&mut action_rx, &mut server_rx).await;
    });

    let console_future = console::start(action_tx, event_rx, confirm_rx);

    let res = tokio::select!(
        res = background_futures.join_next() => match res {
            Some(Ok(res)) => res,
            Some(Err(err)) => Err(anyhow!("Actions service stopped: {err}")),
            None => Ok(()),
        },
        res = console_future => res,
    );

    stream_handle.cancel();
    background_futures.abort_all();

    return res;
}

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        better_panic::Settings::auto().create_panic_handler()(panic_info);
    }));

    let debug_log_dir = env::var("PARLEY_LOG_DIR").unwrap_or_else(|_| {
        return dirs::cache_dir()
            .unwrap_or_else(env::temp_dir)
            .join("parley")
            .to_string_lossy()
            .to_string();
    });

    let file_appender = tracing_appender::rolling::never(debug_log_dir, "debug.log");
    let (writer, _guard) = tracing_appender::non_blocking(file_appender);
    if env::var("RUST_LOG")
        .unwrap_or_else(|_| return "".to_string())
        .contains("parley")
    {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(writer)
            .init();
    }

    match cli::parse().await {
        Ok(true) => {}
        Ok(false) => process::exit(0),
        Err(err) => {
            handle_error(err);
            return;
        }
    }

    if let Err(err) = run().await {
        handle_error(err);
    }

    process::exit(0);
}
