//! Filesystem service
//!
//! Read/write/list/glob/stat over policy-resolved absolute paths. Callers
//! (the dispatcher) are responsible for resolving every externally supplied
//! path before it reaches this service.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::{Error, Result};

/// Suffix of the temporary file used for atomic writes.
const ATOMIC_TMP_SUFFIX: &str = ".rexd.tmp";

/// Filesystem operations clamped to a configured read ceiling.
#[derive(Debug, Clone)]
pub struct FsService {
    max_read_bytes: u64,
}

impl FsService {
    #[must_use]
    pub fn new(max_read_bytes: u64) -> Self {
        Self { max_read_bytes }
    }

    /// Read at most `min(length if > 0, max_file_read_bytes)` bytes starting
    /// at `offset`. Content is returned as utf8 text (lossy) or standard
    /// base64.
    pub async fn read(
        &self,
        path: &Path,
        encoding: &str,
        offset: u64,
        length: u64,
    ) -> Result<Value> {
        let mut file = tokio::fs::File::open(path).await?;
        let meta = file.metadata().await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let mut limit = self.max_read_bytes;
        if length > 0 && (limit == 0 || length < limit) {
            limit = length;
        }
        if limit == 0 {
            limit = meta.len();
        }
        let mut buf = Vec::new();
        file.take(limit).read_to_end(&mut buf).await?;
        let read = buf.len() as u64;
        let (content, encoding) = if encoding == "base64" {
            (BASE64.encode(&buf), "base64")
        } else {
            (String::from_utf8_lossy(&buf).into_owned(), "utf8")
        };
        Ok(json!({
            "path": path_str(path),
            "size": meta.len(),
            "mtime_ms": mtime_ms(&meta),
            "encoding": encoding,
            "content": content,
            "truncated": read < meta.len().saturating_sub(offset),
        }))
    }

    /// Write `data` with the requested mode. When `expected_mtime > 0` and
    /// the file exists with a different mtime, the write is refused and the
    /// file left untouched. Atomic mode stages into `<path>.rexd.tmp` and
    /// renames over the target.
    pub async fn write(
        &self,
        path: &Path,
        data: &[u8],
        mode: &str,
        mkdir_parents: bool,
        atomic: bool,
        expected_mtime: i64,
    ) -> Result<Value> {
        if mkdir_parents {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let existed = match tokio::fs::metadata(path).await {
            Ok(meta) => {
                if expected_mtime > 0 && mtime_ms(&meta) != expected_mtime {
                    return Err(Error::Conflict);
                }
                true
            }
            Err(_) => false,
        };
        if mode == "create" && existed {
            return Err(Error::InvalidParams(format!(
                "path already exists: {}",
                path_str(path)
            )));
        }
        if atomic && mode != "append" {
            let tmp = PathBuf::from(format!("{}{ATOMIC_TMP_SUFFIX}", path_str(path)));
            tokio::fs::write(&tmp, data).await?;
            tokio::fs::rename(&tmp, path).await?;
        } else {
            use tokio::io::AsyncWriteExt;
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create(true);
            match mode {
                "append" => {
                    options.append(true);
                }
                "create" => {
                    options.create_new(true);
                }
                _ => {
                    options.truncate(true);
                }
            }
            let mut file = options.open(path).await?;
            file.write_all(data).await?;
            file.flush().await?;
        }
        let meta = tokio::fs::metadata(path).await?;
        Ok(json!({
            "path": path_str(path),
            "bytes_written": data.len(),
            "mtime_ms": mtime_ms(&meta),
            "created": !existed,
        }))
    }

    /// List a directory. Recursive listing is a pre-order depth-first walk,
    /// truncated at `max_entries` when non-zero. The root itself is not
    /// part of the result.
    pub async fn list(&self, path: &Path, recursive: bool, max_entries: usize) -> Result<Value> {
        let mut entries = Vec::new();
        if recursive {
            walk_dir(path, max_entries, &mut entries)?;
        } else {
            for child in sorted_dir(path)? {
                push_entry(&child, &mut entries);
                if max_entries > 0 && entries.len() >= max_entries {
                    break;
                }
            }
        }
        Ok(json!({
            "path": path_str(path),
            "entries": entries,
        }))
    }

    /// Expand a glob pattern, truncated to `max_matches` when non-zero.
    /// Unreadable paths are skipped.
    pub fn glob(&self, pattern: &str, max_matches: usize) -> Result<Vec<String>> {
        let paths = glob::glob(pattern)
            .map_err(|err| Error::InvalidParams(format!("invalid glob pattern: {err}")))?;
        let mut matches = Vec::new();
        for entry in paths.flatten() {
            matches.push(entry.to_string_lossy().into_owned());
            if max_matches > 0 && matches.len() >= max_matches {
                break;
            }
        }
        Ok(matches)
    }

    /// lstat the path without following symlinks. A missing path is a
    /// successful `{exists: false}` result, not an error.
    pub async fn stat(&self, path: &Path) -> Result<Value> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(json!({"path": path_str(path), "exists": false}));
            }
            Err(err) => return Err(err.into()),
        };
        let kind = file_kind(&meta.file_type());
        let mut out = json!({
            "path": path_str(path),
            "exists": true,
            "type": kind,
            "size": meta.len(),
            "mtime_ms": mtime_ms(&meta),
            "mode": format_mode(&meta),
        });
        if kind == "symlink" {
            if let Ok(target) = tokio::fs::read_link(path).await {
                out["symlink_target"] = json!(target.to_string_lossy());
            }
        }
        Ok(out)
    }
}

/// Decode request content according to its declared encoding.
pub fn decode_content(content: &str, encoding: &str) -> Result<Vec<u8>> {
    if encoding == "base64" {
        BASE64
            .decode(content)
            .map_err(|err| Error::InvalidParams(format!("invalid base64 content: {err}")))
    } else {
        Ok(content.as_bytes().to_vec())
    }
}

struct DirChild {
    path: PathBuf,
    name: String,
    meta: std::fs::Metadata,
}

fn sorted_dir(dir: &Path) -> Result<Vec<DirChild>> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        children.push(DirChild {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            meta,
        });
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

fn push_entry(child: &DirChild, entries: &mut Vec<Value>) {
    let kind = file_kind(&child.meta.file_type());
    entries.push(json!({
        "name": child.name,
        "path": child.path.to_string_lossy(),
        "type": kind,
        "size": if kind == "dir" { Value::Null } else { json!(child.meta.len()) },
        "mtime_ms": mtime_ms(&child.meta),
    }));
}

fn walk_dir(dir: &Path, max_entries: usize, entries: &mut Vec<Value>) -> Result<bool> {
    for child in sorted_dir(dir)? {
        push_entry(&child, entries);
        if max_entries > 0 && entries.len() >= max_entries {
            return Ok(false);
        }
        if child.meta.is_dir() && !walk_dir(&child.path, max_entries, entries)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn file_kind(file_type: &std::fs::FileType) -> &'static str {
    if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_dir() {
        "dir"
    } else if file_type.is_file() {
        "file"
    } else {
        "other"
    }
}

fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .map(|modified| DateTime::<Utc>::from(modified).timestamp_millis())
        .unwrap_or(0)
}

fn format_mode(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:04o}", meta.permissions().mode() & 0o7777)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> FsService {
        FsService::new(1_048_576)
    }

    #[tokio::test]
    async fn test_write_read_round_trip_utf8() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        let out = service()
            .write(&path, b"hello\n", "replace", false, true, 0)
            .await
            .unwrap();
        assert_eq!(out["bytes_written"], 6);
        assert_eq!(out["created"], true);

        let read = service().read(&path, "utf8", 0, 0).await.unwrap();
        assert_eq!(read["content"], "hello\n");
        assert_eq!(read["encoding"], "utf8");
        assert_eq!(read["truncated"], false);
    }

    #[tokio::test]
    async fn test_write_read_round_trip_base64() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob.bin");
        let payload: Vec<u8> = (0u8..=255).collect();
        let encoded = BASE64.encode(&payload);
        let data = decode_content(&encoded, "base64").unwrap();
        assert_eq!(data, payload);
        service()
            .write(&path, &data, "replace", false, true, 0)
            .await
            .unwrap();
        let read = service().read(&path, "base64", 0, 0).await.unwrap();
        assert_eq!(read["content"], encoded);
        assert_eq!(read["encoding"], "base64");
    }

    #[tokio::test]
    async fn test_read_offset_and_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        service()
            .write(&path, b"0123456789", "replace", false, true, 0)
            .await
            .unwrap();
        let read = service().read(&path, "utf8", 2, 4).await.unwrap();
        assert_eq!(read["content"], "2345");
        assert_eq!(read["truncated"], true);
    }

    #[tokio::test]
    async fn test_read_clamped_to_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.txt");
        let svc = FsService::new(4);
        svc.write(&path, b"abcdefgh", "replace", false, true, 0)
            .await
            .unwrap();
        let read = svc.read(&path, "utf8", 0, 0).await.unwrap();
        assert_eq!(read["content"], "abcd");
        assert_eq!(read["truncated"], true);
    }

    #[tokio::test]
    async fn test_mtime_guard_conflict_leaves_file_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guarded.txt");
        let first = service()
            .write(&path, b"A", "replace", false, true, 0)
            .await
            .unwrap();
        let mtime = first["mtime_ms"].as_i64().unwrap();

        // matching mtime succeeds
        service()
            .write(&path, b"B", "replace", false, true, mtime)
            .await
            .unwrap();

        // stale mtime is refused and the content stays B
        let err = service()
            .write(&path, b"C", "replace", false, true, mtime)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict));
        let read = service().read(&path, "utf8", 0, 0).await.unwrap();
        assert_eq!(read["content"], "B");
    }

    #[tokio::test]
    async fn test_write_modes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("modes.txt");
        service()
            .write(&path, b"one", "replace", false, true, 0)
            .await
            .unwrap();
        service()
            .write(&path, b"-two", "append", false, true, 0)
            .await
            .unwrap();
        let read = service().read(&path, "utf8", 0, 0).await.unwrap();
        assert_eq!(read["content"], "one-two");

        let err = service()
            .write(&path, b"x", "create", false, true, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_write_mkdir_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c.txt");
        let out = service()
            .write(&path, b"deep", "replace", true, true, 0)
            .await
            .unwrap();
        assert_eq!(out["created"], true);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_tmp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("atomic.txt");
        service()
            .write(&path, b"data", "replace", false, true, 0)
            .await
            .unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["atomic.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_list_excludes_root_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let out = service().list(dir.path(), false, 0).await.unwrap();
        let entries = out["entries"].as_array().unwrap();
        let names: Vec<&str> = entries
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(entries[2]["type"], "dir");
        assert!(entries[2]["size"].is_null());
    }

    #[tokio::test]
    async fn test_list_recursive_with_cap() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner.txt"), "x").unwrap();
        std::fs::write(dir.path().join("top.txt"), "y").unwrap();

        let out = service().list(dir.path(), true, 0).await.unwrap();
        let names: Vec<&str> = out["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["sub", "inner.txt", "top.txt"]);

        let capped = service().list(dir.path(), true, 2).await.unwrap();
        assert_eq!(capped["entries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_glob_truncates() {
        let dir = TempDir::new().unwrap();
        for name in ["x1.log", "x2.log", "x3.log", "y.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let pattern = format!("{}/*.log", dir.path().display());
        let all = service().glob(&pattern, 0).unwrap();
        assert_eq!(all.len(), 3);
        let capped = service().glob(&pattern, 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_stat_missing_is_success() {
        let dir = TempDir::new().unwrap();
        let out = service().stat(&dir.path().join("nope")).await.unwrap();
        assert_eq!(out["exists"], false);
        assert!(out.get("type").is_none());
    }

    #[tokio::test]
    async fn test_stat_symlink_not_followed() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.txt");
        std::fs::write(&target, "t").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let out = service().stat(&link).await.unwrap();
        assert_eq!(out["type"], "symlink");
        assert_eq!(
            out["symlink_target"],
            target.to_string_lossy().into_owned()
        );
    }
}
