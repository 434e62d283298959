use crate::app::cli::{help_text, parse_cli_verb, parse_global_flags, CliVerb};

pub mod daemon;
pub mod send;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let parsed = parse_global_flags(args)?;
    let config = parsed.config_path.as_deref();
    let Some(verb) = parsed.rest.first() else {
        return Ok(help_text());
    };

    match parse_cli_verb(verb) {
        CliVerb::Run => daemon::cmd_run(config),
        CliVerb::Start => daemon::cmd_start(config),
        CliVerb::Stop => daemon::cmd_stop(config),
        CliVerb::Restart => daemon::cmd_restart(config),
        CliVerb::Status => daemon::cmd_status(config),
        CliVerb::Logs => daemon::cmd_logs(config),
        CliVerb::Send => send::cmd_send(config, &parsed.rest[1..]),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{verb}`\n\n{}", help_text())),
    }
}
