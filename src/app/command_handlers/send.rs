use crate::app::command_support::load_settings;
use crate::transport::{send_chunked, TwilioTransport};
use std::path::Path;

pub fn cmd_send(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    if args.len() < 2 {
        return Err("usage: send <to> <message>".to_string());
    }
    let to = args[0].trim();
    let message = args[1..].join(" ");
    if to.is_empty() || message.trim().is_empty() {
        return Err("usage: send <to> <message>".to_string());
    }

    let settings = load_settings(config)?;
    let transport = TwilioTransport::from_config(&settings.transport).map_err(|e| e.to_string())?;
    let chunks = send_chunked(&transport, to, &message).map_err(|e| e.to_string())?;
    Ok(format!("sent\nto={to}\nchunks={chunks}"))
}
