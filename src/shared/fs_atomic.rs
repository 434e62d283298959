use std::fs;
use std::io::Write;
use std::path::Path;

/// Replaces `path` with `content` via a same-directory temp file and rename,
/// so readers observe either the old or the new bytes, never a torn write.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;
    let tmp_path = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("state"),
        std::process::id(),
        super::time::now_millis(),
    ));

    let written = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tmp_path)
        .and_then(|mut file| {
            file.write_all(content)?;
            file.sync_all()
        });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    fs::rename(&tmp_path, path)
}

/// Reads a file that may legitimately be absent.
pub fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("daemon/pocketclaw.lock");
        atomic_write_file(&path, b"1").expect("first write");
        atomic_write_file(&path, b"42").expect("second write");

        assert_eq!(read_optional(&path).expect("read"), Some("42".to_string()));
        let names = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["pocketclaw.lock".to_string()]);
    }

    #[test]
    fn read_optional_maps_missing_to_none() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(read_optional(&dir.path().join("nope")).expect("read"), None);
    }
}
