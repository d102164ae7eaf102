//! `fs.*` methods: small file-system helpers for front-ends.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use super::HandlerContext;
use super::HandlerResult;
use super::required_str;
use super::success;
use super::to_json;
use crate::error::HandlerError;

/// Largest file `fs.read` will return.
pub const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct DirEntry {
    name: String,
    is_directory: bool,
    size: u64,
    /// Seconds since the Unix epoch.
    mtime: i64,
}

fn expand_home(path: &str) -> PathBuf {
    let home = || std::env::var_os("HOME").filter(|h| !h.is_empty());
    if path == "~" {
        if let Some(home) = home() {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home() {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn not_found(path: &Path) -> HandlerError {
    HandlerError::NotFound(format!("Path not found: {}", path.display()))
}

fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `fs.list`: directory entries, directories first, then by name.
pub fn list(_ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let path = expand_home(required_str(params, "path")?);
    if !path.exists() {
        return Err(not_found(&path));
    }
    if !path.is_dir() {
        return Err(HandlerError::Failed(format!(
            "Not a directory: {}",
            path.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&path)? {
        let entry = entry?;
        // Follows symlinks; dangling links fall back to the link itself.
        let meta = match fs::metadata(entry.path()) {
            Ok(m) => m,
            Err(_) => entry.metadata()?,
        };
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_directory: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime: mtime_secs(&meta),
        });
    }
    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.cmp(&b.name))
    });
    to_json(&entries)
}

/// `fs.read`: the contents of a regular file as text.
pub fn read(_ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let path = expand_home(required_str(params, "path")?);
    let meta = fs::metadata(&path).map_err(|_| not_found(&path))?;
    if !meta.is_file() {
        return Err(HandlerError::Failed(format!(
            "Not a regular file: {}",
            path.display()
        )));
    }
    if meta.len() > MAX_READ_BYTES {
        return Err(HandlerError::Failed(format!(
            "File too large: {} bytes (max {})",
            meta.len(),
            MAX_READ_BYTES
        )));
    }

    let bytes = fs::read(&path)?;
    Ok(json!({ "content": String::from_utf8_lossy(&bytes) }))
}

/// `fs.write`: replace a file's contents.
pub fn write(_ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let path = expand_home(required_str(params, "path")?);
    let content = params
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::missing_param("content"))?;
    fs::write(&path, content)?;
    success()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::TestContext;

    #[test]
    fn test_list_sorts_directories_first() {
        let t = TestContext::new();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "bb").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("zdir")).unwrap();

        let listed = list(&t.ctx, &json!({"path": dir.path()})).unwrap();
        let names: Vec<&str> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["zdir", "a.txt", "b.txt"]);
        assert_eq!(listed[0]["is_directory"], true);
        assert_eq!(listed[2]["size"], 2);
        assert!(listed[1]["mtime"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_list_rejects_files_and_missing_paths() {
        let t = TestContext::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();

        assert!(matches!(
            list(&t.ctx, &json!({"path": file})).unwrap_err(),
            HandlerError::Failed(_)
        ));
        assert!(matches!(
            list(&t.ctx, &json!({"path": dir.path().join("missing")})).unwrap_err(),
            HandlerError::NotFound(_)
        ));
    }

    #[test]
    fn test_write_then_read() {
        let t = TestContext::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("note.txt");

        write(&t.ctx, &json!({"path": file, "content": "héllo"})).unwrap();
        let read_back = read(&t.ctx, &json!({"path": file})).unwrap();
        assert_eq!(read_back["content"], "héllo");
    }

    #[test]
    fn test_read_rejects_directories_and_large_files() {
        let t = TestContext::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(read(&t.ctx, &json!({"path": dir.path()})).is_err());

        let big = dir.path().join("big.bin");
        let file = fs::File::create(&big).unwrap();
        file.set_len(MAX_READ_BYTES + 1).unwrap();
        let err = read(&t.ctx, &json!({"path": big})).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_expand_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        if !home.is_empty() {
            assert_eq!(expand_home("~"), PathBuf::from(&home));
            assert_eq!(expand_home("~/x"), PathBuf::from(&home).join("x"));
        }
        assert_eq!(expand_home("/abs"), PathBuf::from("/abs"));
    }
}
