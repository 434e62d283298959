use crate::config::WorkerConfig;
use crate::store::{ConversationRole, ConversationTurn};
use std::path::{Path, PathBuf};

const DEFAULT_SYSTEM_PROMPT: &str = "You are being driven remotely by a single operator over a \
text-message channel. Replies are delivered as chat messages, so keep them concise and use plain \
text rather than heavy markdown.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

pub fn build_invocation(
    config: &WorkerConfig,
    cwd: &Path,
    resume_session_id: Option<&str>,
    context: &str,
) -> WorkerInvocation {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if let Some(model) = config.model.as_deref().filter(|m| !m.trim().is_empty()) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(session_id) = resume_session_id {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }
    args.push("--append-system-prompt".to_string());
    args.push(context.to_string());
    args.extend(config.extra_args.iter().cloned());

    WorkerInvocation {
        binary: config.binary.clone(),
        args,
        cwd: cwd.to_path_buf(),
    }
}

/// System context appended to every run. `history` is oldest first and is
/// only supplied when the worker starts without a resumable conversation.
pub fn build_context_prompt(
    system_prompt: Option<&str>,
    cwd: &Path,
    history: &[ConversationTurn],
) -> String {
    let mut prompt = system_prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .trim()
        .to_string();
    prompt.push_str(&format!("\n\nCurrent working directory: {}", cwd.display()));

    if !history.is_empty() {
        prompt.push_str("\n\nRecent conversation with the operator (oldest first):");
        for turn in history {
            let speaker = match turn.role {
                ConversationRole::User => "operator",
                ConversationRole::Assistant => "assistant",
            };
            prompt.push_str(&format!("\n{speaker}: {}", turn.text.trim()));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_orders_flags_and_appends_extra_args_last() {
        let config = WorkerConfig {
            model: Some("sonnet".to_string()),
            extra_args: vec!["--dangerously-skip-permissions".to_string()],
            ..WorkerConfig::default()
        };
        let invocation = build_invocation(&config, Path::new("/work"), Some("sess-1"), "ctx");

        assert_eq!(invocation.binary, "claude");
        assert_eq!(invocation.cwd, PathBuf::from("/work"));
        assert_eq!(
            invocation.args,
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--model",
                "sonnet",
                "--resume",
                "sess-1",
                "--append-system-prompt",
                "ctx",
                "--dangerously-skip-permissions",
            ]
        );
    }

    #[test]
    fn fresh_invocation_omits_model_and_resume() {
        let invocation =
            build_invocation(&WorkerConfig::default(), Path::new("/work"), None, "ctx");
        assert!(!invocation.args.iter().any(|a| a == "--resume"));
        assert!(!invocation.args.iter().any(|a| a == "--model"));
    }

    #[test]
    fn context_prompt_lists_history_oldest_first() {
        let history = vec![
            ConversationTurn {
                sender: "+1".to_string(),
                role: ConversationRole::User,
                text: "first".to_string(),
                timestamp: 1,
            },
            ConversationTurn {
                sender: "+1".to_string(),
                role: ConversationRole::Assistant,
                text: "second".to_string(),
                timestamp: 2,
            },
        ];
        let prompt = build_context_prompt(Some("Be brief."), Path::new("/repo"), &history);

        assert!(prompt.starts_with("Be brief."));
        assert!(prompt.contains("Current working directory: /repo"));
        let first = prompt.find("operator: first").expect("first turn");
        let second = prompt.find("assistant: second").expect("second turn");
        assert!(first < second);
    }
}
