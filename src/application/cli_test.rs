use anyhow::Result;

use super::build;
use super::validate_number;
use crate::configuration::ConfigKey;

#[test]
fn it_rejects_non_numeric_tuning_values() {
    assert_eq!(validate_number("250").unwrap(), "250");
    assert!(validate_number("soon").is_err());
    assert!(validate_number("-1").is_err());
}

#[test]
fn it_exposes_every_file_setting_as_a_flag() {
    let cmd = build();
    let longs = cmd
        .get_arguments()
        .filter_map(|e| return e.get_long())
        .collect::<Vec<&str>>();

    for key in [
        ConfigKey::Agent,
        ConfigKey::CreateTimeout,
        ConfigKey::HeartbeatInterval,
        ConfigKey::PollInterval,
        ConfigKey::PromptRetries,
        ConfigKey::ReconnectMaxAttempts,
        ConfigKey::RefreshDebounce,
        ConfigKey::ServerUrl,
        ConfigKey::StateFile,
        ConfigKey::Transport,
    ] {
        assert!(longs.contains(&key.to_string().as_str()), "missing --{key}");
    }
}

#[test]
fn it_reads_chat_flags() -> Result<()> {
    let matches = build().try_get_matches_from(vec![
        "parley",
        "--transport",
        "poll",
        "chat",
        "--agent",
        "plan",
        "--id",
        "ses_9",
    ])?;
    let (name, chat_matches) = matches.subcommand().unwrap();
    let get = |key: ConfigKey| {
        return chat_matches
            .get_one::<String>(&key.to_string())
            .cloned()
            .unwrap_or_default();
    };

    assert_eq!(name, "chat");
    assert_eq!(get(ConfigKey::Agent), "plan");
    assert_eq!(get(ConfigKey::SessionID), "ses_9");
    assert_eq!(get(ConfigKey::Transport), "poll");

    return Ok(());
}

#[test]
fn it_refuses_unknown_transports() {
    let res = build().try_get_matches_from(vec!["parley", "--transport", "carrier-pigeon"]);
    assert!(res.is_err());
}
