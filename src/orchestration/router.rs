use crate::config::expand_tilde;
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Help,
    Status,
    QueueView,
    /// `history` alone is `None`; `history N` selects the N-th most recent exchange.
    History(Option<usize>),
    Interrupt,
    Home,
    Reset,
    ChangeDirectory(String),
    ApprovalResponse(bool),
    FreeForm,
}

impl CommandKind {
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::FreeForm | Self::ApprovalResponse(_))
    }
}

const HELP_TOKENS: &[&str] = &["help", "?"];
const STATUS_TOKENS: &[&str] = &["status"];
const QUEUE_TOKENS: &[&str] = &["queue", "q"];
const INTERRUPT_TOKENS: &[&str] = &["interrupt", "stop", "cancel"];
const HOME_TOKENS: &[&str] = &["home"];
const RESET_TOKENS: &[&str] = &["reset", "fresh"];
const AFFIRMATIVE_TOKENS: &[&str] = &["yes", "y", "approve", "approved", "ok", "okay", "confirm"];
const NEGATIVE_TOKENS: &[&str] = &["no", "n", "reject", "deny", "denied"];

/// Classifies inbound text. Matching is case-insensitive on the trimmed text
/// and follows a fixed priority order; anything unrecognized is free-form.
pub fn classify(text: &str) -> CommandKind {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    let normalized = lower.trim_end_matches(['.', '!']);

    if HELP_TOKENS.contains(&normalized) {
        return CommandKind::Help;
    }
    if STATUS_TOKENS.contains(&normalized) {
        return CommandKind::Status;
    }
    if QUEUE_TOKENS.contains(&normalized) {
        return CommandKind::QueueView;
    }
    if let Some(history) = parse_history(normalized) {
        return history;
    }
    if INTERRUPT_TOKENS.contains(&normalized) {
        return CommandKind::Interrupt;
    }
    if HOME_TOKENS.contains(&normalized) {
        return CommandKind::Home;
    }
    if RESET_TOKENS.contains(&normalized) {
        return CommandKind::Reset;
    }
    if lower == "cd" {
        return CommandKind::ChangeDirectory("~".to_string());
    }
    if let Some(path) = change_directory_target(trimmed) {
        return CommandKind::ChangeDirectory(path.to_string());
    }
    if let Some(approved) = approval_response(normalized) {
        return CommandKind::ApprovalResponse(approved);
    }
    CommandKind::FreeForm
}

/// Maps yes/no vocabulary to an approval decision.
pub fn approval_response(text: &str) -> Option<bool> {
    let lower = text.trim().to_lowercase();
    let normalized = lower.trim_end_matches(['.', '!']);
    if AFFIRMATIVE_TOKENS.contains(&normalized) {
        Some(true)
    } else if NEGATIVE_TOKENS.contains(&normalized) {
        Some(false)
    } else {
        None
    }
}

/// `cd` followed by any whitespace and a path. The path keeps its case.
fn change_directory_target(trimmed: &str) -> Option<&str> {
    let (head, rest) = trimmed.split_once(char::is_whitespace)?;
    if !head.eq_ignore_ascii_case("cd") {
        return None;
    }
    Some(rest.trim()).filter(|path| !path.is_empty())
}

fn parse_history(normalized: &str) -> Option<CommandKind> {
    if normalized == "history" {
        return Some(CommandKind::History(None));
    }
    let rest = normalized.strip_prefix("history ")?.trim();
    match rest.parse::<usize>() {
        Ok(index) if index >= 1 => Some(CommandKind::History(Some(index))),
        _ => None,
    }
}

fn digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// Compares addresses by their digits only, so `whatsapp:+1 (555) 123-4567`
/// matches a whitelist entry of `+15551234567`.
pub fn is_whitelisted(sender: &str, whitelist: &[String]) -> bool {
    let sender = digits(sender);
    if sender.is_empty() {
        return false;
    }
    whitelist.iter().any(|entry| {
        let entry = digits(entry);
        !entry.is_empty() && entry == sender
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("no such directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("{0} is outside the allowed directories")]
    OutsideAllowedRoots(String),
    #[error("cannot resolve {path}: {reason}")]
    Unresolvable { path: String, reason: String },
}

/// Resolves a `cd` target against `current`. The result is canonical, exists,
/// is a directory, and lies under one of `allowed_roots`.
pub fn resolve_directory(
    current: &Path,
    requested: &str,
    home: &Path,
    allowed_roots: &[PathBuf],
) -> Result<PathBuf, DirectoryError> {
    let requested = requested.trim();
    let expanded = expand_tilde(Path::new(requested), home);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        current.join(expanded)
    };
    let normalized = normalize_lexically(&joined);
    let display = normalized.display().to_string();

    let metadata = match fs::metadata(&normalized) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(DirectoryError::NotFound(display))
        }
        Err(err) => {
            return Err(DirectoryError::Unresolvable {
                path: display,
                reason: err.to_string(),
            })
        }
    };
    if !metadata.is_dir() {
        return Err(DirectoryError::NotADirectory(display));
    }

    let canonical = fs::canonicalize(&normalized).map_err(|err| DirectoryError::Unresolvable {
        path: display.clone(),
        reason: err.to_string(),
    })?;
    let allowed = allowed_roots
        .iter()
        .filter_map(|root| fs::canonicalize(root).ok())
        .any(|root| canonical.starts_with(&root));
    if !allowed {
        return Err(DirectoryError::OutsideAllowedRoots(
            canonical.display().to_string(),
        ));
    }
    Ok(canonical)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn classify_control_tokens_case_insensitively() {
        assert_eq!(classify("  HELP "), CommandKind::Help);
        assert_eq!(classify("?"), CommandKind::Help);
        assert_eq!(classify("Status"), CommandKind::Status);
        assert_eq!(classify("q"), CommandKind::QueueView);
        assert_eq!(classify("history"), CommandKind::History(None));
        assert_eq!(classify("history 3"), CommandKind::History(Some(3)));
        assert_eq!(classify("cancel"), CommandKind::Interrupt);
        assert_eq!(classify("stop"), CommandKind::Interrupt);
        assert_eq!(classify("home"), CommandKind::Home);
        assert_eq!(classify("fresh"), CommandKind::Reset);
        assert_eq!(
            classify("cd ~/Projects/App"),
            CommandKind::ChangeDirectory("~/Projects/App".to_string())
        );
        assert_eq!(classify("cd"), CommandKind::ChangeDirectory("~".to_string()));
        assert_eq!(
            classify("CD\t/srv/My App"),
            CommandKind::ChangeDirectory("/srv/My App".to_string())
        );
        assert_eq!(classify("cdrom"), CommandKind::FreeForm);
        assert_eq!(classify("Yes!"), CommandKind::ApprovalResponse(true));
        assert_eq!(classify("n"), CommandKind::ApprovalResponse(false));
    }

    #[test]
    fn near_misses_are_free_form() {
        assert_eq!(classify("history zero"), CommandKind::FreeForm);
        assert_eq!(classify("history 0"), CommandKind::FreeForm);
        assert_eq!(classify("status of the build?"), CommandKind::FreeForm);
        assert_eq!(classify("cdrom info"), CommandKind::FreeForm);
        assert_eq!(classify("yes please refactor"), CommandKind::FreeForm);
        assert_eq!(classify(""), CommandKind::FreeForm);
    }

    #[test]
    fn whitelist_compares_digits_only() {
        let whitelist = vec!["+1 (555) 123-4567".to_string(), "---".to_string()];
        assert!(is_whitelisted("whatsapp:+15551234567", &whitelist));
        assert!(!is_whitelisted("+15550000000", &whitelist));
        assert!(!is_whitelisted("whatsapp:", &whitelist));
    }

    #[test]
    fn resolve_directory_handles_relative_parent_and_tilde() {
        let home = tempdir().expect("home");
        let project = home.path().join("projects/app");
        fs::create_dir_all(&project).expect("mkdir");
        let roots = vec![home.path().to_path_buf()];

        let resolved = resolve_directory(&project, "../", home.path(), &roots).expect("parent");
        assert_eq!(
            resolved,
            fs::canonicalize(home.path().join("projects")).expect("canonical")
        );

        let resolved =
            resolve_directory(Path::new("/"), "~/projects/./app", home.path(), &roots)
                .expect("tilde");
        assert_eq!(resolved, fs::canonicalize(&project).expect("canonical"));
    }

    #[test]
    fn resolve_directory_rejects_missing_files_and_outside_roots() {
        let home = tempdir().expect("home");
        let outside = tempdir().expect("outside");
        fs::write(home.path().join("file.txt"), "x").expect("write");
        let roots = vec![home.path().to_path_buf()];

        assert!(matches!(
            resolve_directory(home.path(), "missing", home.path(), &roots),
            Err(DirectoryError::NotFound(_))
        ));
        assert!(matches!(
            resolve_directory(home.path(), "file.txt", home.path(), &roots),
            Err(DirectoryError::NotADirectory(_))
        ));
        assert!(matches!(
            resolve_directory(
                home.path(),
                &outside.path().display().to_string(),
                home.path(),
                &roots
            ),
            Err(DirectoryError::OutsideAllowedRoots(_))
        ));
    }
}
