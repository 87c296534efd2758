#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;

use std::io;
use std::path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use clap::builder::PossibleValuesParser;
use clap::value_parser;
use clap::Arg;
use clap::ArgAction;
use clap::ArgMatches;
use clap::Command;
use clap_complete::generate;
use clap_complete::Generator;
use clap_complete::Shell;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use dialoguer::Select;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use yansi::Paint;

use super::console::session_line;
use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::AgentServer;
use crate::domain::models::Confirmer;
use crate::domain::models::Session;
use crate::domain::services::actions::help_text;
use crate::domain::services::SessionStore;
use crate::infrastructure::server::OpenCodeServer;
use crate::infrastructure::state::FileStateStore;

fn print_completions<G: Generator>(gen: G, cmd: &mut Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
    std::process::exit(0);
}

/// Asks on the terminal before deleting, for the one-shot `sessions delete`
/// command.
struct TerminalConfirmer {}

#[async_trait]
impl Confirmer for TerminalConfirmer {
    #[allow(clippy::implicit_return)]
    async fn confirm_delete(&self, session: &Session) -> bool {
        let prompt = format!("Delete session \"{}\" ({})?", session.title, session.id);
        let res = tokio::task::spawn_blocking(move || {
            return Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(false)
                .interact_opt();
        })
        .await;

        match res {
            Ok(Ok(Some(answer))) => return answer,
            Ok(Ok(None)) => return false,
            Ok(Err(err)) => {
                tracing::error!(error = ?err, "Failed to read confirmation");
                return false;
            }
            Err(err) => {
                tracing::error!(error = ?err, "Confirmation prompt failed");
                return false;
            }
        }
    }
}

fn session_store() -> SessionStore {
    return SessionStore::new(
        Arc::new(OpenCodeServer::default()),
        Arc::new(FileStateStore::default()),
        Duration::from_millis(Config::get_number(ConfigKey::CreateTimeout)),
    );
}

async fn print_sessions_list() -> Result<()> {
    let store = session_store();
    store.load().await?;

    let sessions = store
        .list()
        .iter()
        .map(session_line)
        .collect::<Vec<String>>();

    if sessions.is_empty() {
        println!("There are no sessions available. You should start your first one!");
    } else {
        println!("{}", sessions.join("\n"));
    }

    return Ok(());
}

async fn delete_session(session_id: &str) -> Result<()> {
    let store = session_store();
    store.load().await?;

    if store.delete(session_id, &TerminalConfirmer {}).await? {
        println!("Deleted session {session_id}");
    } else {
        println!("Delete cancelled.");
    }

    return Ok(());
}

async fn fork_session(session_id: &str, message_id: Option<&str>) -> Result<()> {
    let store = session_store();
    store.load().await?;

    let fork = store.fork(session_id, message_id).await?;
    println!("Forked into \"{}\" (ID: {})", fork.title, fork.id);

    return Ok(());
}

async fn print_status() -> Result<()> {
    let server = OpenCodeServer::default();
    let status = server.health().await?;
    let models = server
        .providers(&Config::get(ConfigKey::Directory))
        .await?;

    println!("Server: {}", Config::get(ConfigKey::ServerUrl));
    println!("Version: {}", status.version);
    println!("Agents: {}", status.agents.join(", "));
    println!("Providers: {}", status.providers.join(", "));
    for provider in models.iter() {
        println!("- {}: {}", provider.provider_id, provider.models.join(", "));
    }

    return Ok(());
}

/// Lets the user pick a session to resume when `sessions open` is given no
/// id.
async fn select_session_interactive() -> Result<bool> {
    let store = session_store();
    store.load().await?;
    let sessions = store
        .list()
        .into_iter()
        .filter(|e| return !e.is_placeholder())
        .collect::<Vec<Session>>();

    if sessions.is_empty() {
        println!("There are no sessions available. You should start your first one!");
        return Ok(false);
    }

    let session_options = sessions.iter().map(session_line).collect::<Vec<String>>();
    let idx = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Which session would you like to open?")
        .default(0)
        .items(&session_options)
        .interact_opt()?;

    match idx {
        Some(idx) => {
            Config::set(ConfigKey::SessionID, &sessions[idx].id);
            return Ok(true);
        }
        None => return Ok(false),
    }
}

async fn create_config_file() -> Result<()> {
    let config_file_path_str = Config::default(ConfigKey::ConfigFile);
    let config_file_path = path::PathBuf::from(&config_file_path_str);
    if config_file_path.exists() {
        bail!(format!(
            "Config file already exists at {config_file_path_str}"
        ));
    }

    if let Some(parent) = config_file_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut file = fs::File::create(config_file_path.clone()).await?;
    file.write_all(Config::serialize_default(build()).as_bytes())
        .await?;

    println!("Created default config file at {config_file_path_str}");
    return Ok(());
}

fn subcommand_completions() -> Command {
    return Command::new("completions")
        .about("Generates shell completions.")
        .arg(
            clap::Arg::new("shell")
                .short('s')
                .long("shell")
                .help("Which shell to generate completions for.")
                .action(ArgAction::Set)
                .value_parser(value_parser!(Shell))
                .required(true),
        );
}

fn subcommand_config() -> Command {
    return Command::new("config")
        .about("Configuration file options.")
        .subcommand(
            Command::new("create").about("Saves the default config file to the configuration file path. This command will fail if the file exists already.")
        )
        .subcommand(
            Command::new("default").about("Outputs the default configuration file to stdout.")
        )
        .subcommand(
            Command::new("path").about("Returns the default path for the configuration file.")
        );
}

fn arg_session_id(required: bool) -> Arg {
    return Arg::new(ConfigKey::SessionID.to_string())
        .short('i')
        .long("id")
        .help("Session ID")
        .num_args(1)
        .required(required);
}

fn subcommand_sessions() -> Command {
    return Command::new("sessions")
        .about("Manage sessions on the server.")
        .arg_required_else_help(true)
        .subcommand(Command::new("list").about("List all sessions with their ids, status and message counts."))
        .subcommand(
            Command::new("open")
                .about("Open a session by ID. Omit passing any session ID to load an interactive selection.")
                .arg(arg_session_id(false)),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a session after confirmation.")
                .arg(arg_session_id(true)),
        )
        .subcommand(
            Command::new("fork")
                .about("Fork a session, optionally at a message.")
                .arg(arg_session_id(true))
                .arg(
                    clap::Arg::new("message")
                        .short('m')
                        .long("message")
                        .help("Message ID to fork at")
                        .num_args(1),
                ),
        );
}

fn validate_number(value: &str) -> Result<String, String> {
    if value.parse::<u64>().is_err() {
        return Err(format!("'{value}' is not a whole number"));
    }
    return Ok(value.to_string());
}

fn arg_number(key: ConfigKey, env: &'static str, help: &str) -> Arg {
    return Arg::new(key.to_string())
        .long(key.to_string())
        .env(env)
        .num_args(1)
        .help(format!("{help} [default: {}]", Config::default(key)))
        .value_parser(validate_number)
        .global(true);
}

fn arg_agent() -> Arg {
    return Arg::new(ConfigKey::Agent.to_string())
        .short('a')
        .long(ConfigKey::Agent.to_string())
        .env("PARLEY_AGENT")
        .num_args(1)
        .help(format!(
            "Agent used for new messages. [default: {}]",
            Config::default(ConfigKey::Agent)
        ));
}

fn arg_model() -> Arg {
    return Arg::new(ConfigKey::Model.to_string())
        .short('m')
        .long(ConfigKey::Model.to_string())
        .env("PARLEY_MODEL")
        .num_args(1)
        .help("Model used for new messages, as provider/model. Defaults to the server's choice.");
}

fn subcommand_chat() -> Command {
    return Command::new("chat")
        .about("Start chatting. Resumes the last active session unless told otherwise.")
        .arg(arg_agent())
        .arg(arg_model())
        .arg(arg_session_id(false));
}

pub fn build() -> Command {
    let commands_text = help_text()
        .split('\n')
        .map(|line| {
            if line.starts_with('-') {
                return format!("  {line}");
            }
            if line.starts_with("COMMANDS:") || line.starts_with("MENTIONS:") {
                return Paint::new(format!("CHAT {line}"))
                    .underline()
                    .bold()
                    .to_string();
            }
            return line.to_string();
        })
        .collect::<Vec<String>>()
        .join("\n");

    let about = format!(
        "{}\n\nVersion: {}\nCommit: {}",
        env!("CARGO_PKG_DESCRIPTION"),
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_GIT_DESCRIBE")
    );

    return Command::new("parley")
        .about(about)
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .after_help(commands_text)
        .arg_required_else_help(false)
        .subcommand(subcommand_chat())
        .subcommand(subcommand_completions())
        .subcommand(subcommand_config())
        .subcommand(subcommand_sessions())
        .subcommand(Command::new("status").about("Shows the server version, agents and models."))
        .arg(arg_agent())
        .arg(arg_model())
        .arg(arg_session_id(false))
        .arg(
            Arg::new(ConfigKey::ConfigFile.to_string())
                .short('c')
                .long(ConfigKey::ConfigFile.to_string())
                .env("PARLEY_CONFIG_FILE")
                .num_args(1)
                .help(format!("Path to configuration file [default: {}]", Config::default(ConfigKey::ConfigFile)))
                .global(true)
        )
        .arg(
            Arg::new(ConfigKey::ServerUrl.to_string())
                .short('u')
                .long(ConfigKey::ServerUrl.to_string())
                .env("PARLEY_SERVER_URL")
                .num_args(1)
                .help(format!("URL of the OpenCode server to connect to. [default: {}]", Config::default(ConfigKey::ServerUrl)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::Directory.to_string())
                .short('d')
                .long(ConfigKey::Directory.to_string())
                .env("PARLEY_DIRECTORY")
                .num_args(1)
                .help("Project directory sessions are created in and file mentions resolve against. [default: current directory]")
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::StateFile.to_string())
                .long(ConfigKey::StateFile.to_string())
                .env("PARLEY_STATE_FILE")
                .num_args(1)
                .help(format!("File keeping the active session and per-session bookkeeping between runs. [default: {}]", Config::default(ConfigKey::StateFile)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::Transport.to_string())
                .long(ConfigKey::Transport.to_string())
                .env("PARLEY_TRANSPORT")
                .num_args(1)
                .help(format!("How server events are consumed. [default: {}]", Config::default(ConfigKey::Transport)))
                .value_parser(PossibleValuesParser::new(["sse", "poll"]))
                .global(true),
        )
        .arg(arg_number(ConfigKey::PollInterval, "PARLEY_POLL_INTERVAL", "Milliseconds between reads when polling for events."))
        .arg(arg_number(ConfigKey::PollBatchSize, "PARLEY_POLL_BATCH_SIZE", "Events read per poll."))
        .arg(arg_number(ConfigKey::ReconnectBaseDelay, "PARLEY_RECONNECT_BASE_DELAY", "Milliseconds before the first reconnect attempt, doubled on each retry."))
        .arg(arg_number(ConfigKey::ReconnectMaxDelay, "PARLEY_RECONNECT_MAX_DELAY", "Upper bound for the reconnect delay in milliseconds."))
        .arg(arg_number(ConfigKey::ReconnectMaxAttempts, "PARLEY_RECONNECT_MAX_ATTEMPTS", "Reconnect attempts before giving up."))
        .arg(arg_number(ConfigKey::HeartbeatInterval, "PARLEY_HEARTBEAT_INTERVAL", "Milliseconds between checks that the event connection is still open."))
        .arg(arg_number(ConfigKey::CreateTimeout, "PARLEY_CREATE_TIMEOUT", "Milliseconds to wait for the server to create a session."))
        .arg(arg_number(ConfigKey::PromptRetries, "PARLEY_PROMPT_RETRIES", "Attempts at sending a prompt before reporting failure."))
        .arg(arg_number(ConfigKey::RefreshDebounce, "PARLEY_REFRESH_DEBOUNCE", "Milliseconds to wait for more activity before refreshing the session list."));
}

fn required_session_id(matches: &ArgMatches) -> Result<String> {
    match matches.get_one::<String>(&ConfigKey::SessionID.to_string()) {
        Some(session_id) => return Ok(session_id.to_string()),
        None => bail!("A session ID is required"),
    }
}

/// Parses the command line and runs one-shot commands. Returns whether the
/// chat console should start.
pub async fn parse() -> Result<bool> {
    let matches = build().get_matches();

    match matches.subcommand() {
        Some(("chat", subcmd_matches)) => {
            Config::load(build(), vec![&matches, subcmd_matches]).await?;
        }
        Some(("completions", subcmd_matches)) => {
            if let Some(completions) = subcmd_matches.get_one::<Shell>("shell").copied() {
                let mut app = build();
                print_completions(completions, &mut app);
            }
        }
        Some(("config", subcmd_matches)) => match subcmd_matches.subcommand() {
            Some(("create", _)) => {
                create_config_file().await?;
                return Ok(false);
            }
            Some(("default", _)) => {
                println!("{}", Config::serialize_default(build()));
                return Ok(false);
            }
            Some(("path", _)) => {
                println!("{}", Config::default(ConfigKey::ConfigFile));
                return Ok(false);
            }
            _ => {
                subcommand_config().print_long_help()?;
                return Ok(false);
            }
        },
        Some(("sessions", subcmd_matches)) => match subcmd_matches.subcommand() {
            Some(("list", list_matches)) => {
                Config::load(build(), vec![&matches, subcmd_matches, list_matches]).await?;
                print_sessions_list().await?;
                return Ok(false);
            }
            Some(("open", open_matches)) => {
                Config::load(build(), vec![&matches, subcmd_matches, open_matches]).await?;
                if open_matches
                    .get_one::<String>(&ConfigKey::SessionID.to_string())
                    .is_none()
                {
                    return select_session_interactive().await;
                }
            }
            Some(("delete", delete_matches)) => {
                Config::load(build(), vec![&matches, subcmd_matches, delete_matches]).await?;
                delete_session(&required_session_id(delete_matches)?).await?;
                return Ok(false);
            }
            Some(("fork", fork_matches)) => {
                Config::load(build(), vec![&matches, subcmd_matches, fork_matches]).await?;
                let message_id = fork_matches.get_one::<String>("message");
                fork_session(
                    &required_session_id(fork_matches)?,
                    message_id.map(|e| return e.as_str()),
                )
                .await?;
                return Ok(false);
            }
            _ => {
                subcommand_sessions().print_long_help()?;
                return Ok(false);
            }
        },
        Some(("status", status_matches)) => {
            Config::load(build(), vec![&matches, status_matches]).await?;
            print_status().await?;
            return Ok(false);
        }
        _ => {
            Config::load(build(), vec![&matches]).await?;
        }
    }

    return Ok(true);
}
