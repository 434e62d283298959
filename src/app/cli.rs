use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Start,
    Stop,
    Restart,
    Status,
    Logs,
    Send,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "start" => CliVerb::Start,
        "stop" => CliVerb::Stop,
        "restart" => CliVerb::Restart,
        "status" => CliVerb::Status,
        "logs" => CliVerb::Logs,
        "send" => CliVerb::Send,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

/// Arguments left after global flags are removed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub rest: Vec<String>,
}

/// Pulls `--config <path>` (or `--config=<path>`) out of `args`.
pub fn parse_global_flags(args: Vec<String>) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| "`--config` requires a path".to_string())?;
            parsed.config_path = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            if path.trim().is_empty() {
                return Err("`--config` requires a path".to_string());
            }
            parsed.config_path = Some(PathBuf::from(path));
        } else {
            parsed.rest.push(arg);
        }
    }
    Ok(parsed)
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: pocketclaw [--config <path>] <command>".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  run                      Run the daemon in the foreground".to_string(),
        "  start                    Start the daemon in the background".to_string(),
        "  stop                     Stop the running daemon".to_string(),
        "  restart                  Stop, then start the daemon".to_string(),
        "  status                   Show daemon, task and queue status".to_string(),
        "  logs                     Print the last lines of the runtime log".to_string(),
        "  send <to> <message>      Send a message through the transport".to_string(),
        "  help                     Show this help".to_string(),
    ]
}

pub fn help_text() -> String {
    cli_help_lines().join("\n")
}
