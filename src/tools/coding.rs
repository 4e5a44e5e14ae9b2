//! Coding profile: shell, file, and patch tools.
//!
//! Every path an input names is canonicalised and checked against the
//! allowed roots before any filesystem access. Sandbox builds additionally
//! pin the shell to a fixed working directory with an empty `PATH`.

use std::path::Path;
use std::time::Duration;

use super::{optional_str, require_str, Tool, ToolContext};

/// Output ceiling for shell and search results.
const MAX_TOOL_OUTPUT: usize = 256 * 1024;
/// Output ceiling for `patch`.
const MAX_PATCH_OUTPUT: usize = 64 * 1024;
/// Read ceiling for `read_file`.
const MAX_READ_SIZE: u64 = 64 * 1024;
/// Recursion depth for `search` and `list_files`.
const MAX_WALK_DEPTH: usize = 10;
const MAX_SEARCH_MATCHES: usize = 100;
const MAX_LIST_FILES: usize = 200;
/// Bytes sniffed for a NUL to skip binary files.
const BINARY_SNIFF_BYTES: usize = 512;
const COMMAND_TIMEOUT_SECS: u64 = 120;

pub fn tools() -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(BashTool),
        Box::new(ReadFileTool),
        Box::new(WriteFileTool),
        Box::new(EditFileTool),
        Box::new(SearchTool),
        Box::new(ListFilesTool),
        Box::new(ApplyPatchTool),
    ]
}

fn cap_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut end = limit;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... output truncated at {limit} bytes", &output[..end])
}

/// One capped transcript for a child process, with stderr labelled when
/// both streams produced something.
fn merge_streams(stdout: &[u8], stderr: &[u8], limit: usize) -> String {
    let out = String::from_utf8_lossy(stdout);
    let err = String::from_utf8_lossy(stderr);
    let (out, err) = (out.trim_end(), err.trim_end());
    let transcript = match (out.is_empty(), err.is_empty()) {
        (_, true) => out.to_string(),
        (true, false) => format!("[stderr]\n{err}"),
        (false, false) => format!("{out}\n[stderr]\n{err}"),
    };
    cap_output(&transcript, limit)
}

/// Skip directories that only hold build output.
fn is_build_dir(name: &str) -> bool {
    matches!(name, "target" | "node_modules" | "build" | "dist" | "__pycache__")
}

fn looks_binary(path: &Path) -> bool {
    let Ok(bytes) = std::fs::read(path) else {
        return true;
    };
    let sniff = bytes.len().min(BINARY_SNIFF_BYTES);
    bytes[..sniff].contains(&0)
}

// ---------------------------------------------------------------------
// bash
// ---------------------------------------------------------------------

struct BashTool;

#[async_trait::async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its combined stdout and stderr."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"command":{"type":"string","description":"Shell command to execute"}},"required":["command"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let command = require_str(input_raw, "command")?;
        if command.trim().is_empty() {
            return Err("Command cannot be empty".to_string());
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.current_dir(ctx.paths.workspace());
        if cfg!(feature = "sandbox") {
            cmd.env("PATH", "");
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| format!("Failed to spawn command: {e}"))?;
        let output = tokio::time::timeout(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| format!("Command timed out after {COMMAND_TIMEOUT_SECS}s"))?
        .map_err(|e| format!("Command execution failed: {e}"))?;

        let transcript = merge_streams(&output.stdout, &output.stderr, MAX_TOOL_OUTPUT);
        if output.status.success() {
            Ok(if transcript.is_empty() {
                "(no output)".to_string()
            } else {
                transcript
            })
        } else {
            Err(format!(
                "Exit code {}\n{}",
                output.status.code().unwrap_or(-1),
                if transcript.is_empty() {
                    "(no output)".to_string()
                } else {
                    transcript
                }
            ))
        }
    }
}

// ---------------------------------------------------------------------
// read_file / write_file / edit_file
// ---------------------------------------------------------------------

struct ReadFileTool;

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file (up to 64 KiB)."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"path":{"type":"string","description":"File to read"}},"required":["path"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let path_arg = require_str(input_raw, "path")?;
        let path = ctx.paths.resolve_existing(&path_arg)?;

        let metadata = std::fs::metadata(&path).map_err(|e| e.to_string())?;
        if metadata.len() > MAX_READ_SIZE {
            return Err(format!(
                "File too large: {} bytes (max {MAX_READ_SIZE})",
                metadata.len()
            ));
        }
        let bytes = std::fs::read(&path).map_err(|e| e.to_string())?;
        let sniff = bytes.len().min(BINARY_SNIFF_BYTES);
        if bytes[..sniff].contains(&0) {
            return Err("Binary file".to_string());
        }
        String::from_utf8(bytes).map_err(|_| "File is not valid UTF-8".to_string())
    }
}

struct WriteFileTool;

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file, creating parent directories as needed."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"path":{"type":"string","description":"File to write"},"content":{"type":"string","description":"New file contents"}},"required":["path","content"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let path_arg = require_str(input_raw, "path")?;
        let content = require_str(input_raw, "content")?;
        let path = ctx.paths.resolve_for_write(&path_arg)?;
        std::fs::write(&path, &content).map_err(|e| e.to_string())?;
        Ok(format!("Wrote {} bytes to {path_arg}", content.len()))
    }
}

struct EditFileTool;

#[async_trait::async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace exactly one occurrence of old_string with new_string. \
         The match must be unique; include enough surrounding context."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"path":{"type":"string","description":"File to edit"},"old_string":{"type":"string","description":"Exact text to replace"},"new_string":{"type":"string","description":"Replacement text"}},"required":["path","old_string","new_string"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let path_arg = require_str(input_raw, "path")?;
        let old_string = require_str(input_raw, "old_string")?;
        let new_string = require_str(input_raw, "new_string")?;
        if old_string.is_empty() {
            return Err("old_string cannot be empty".to_string());
        }
        let path = ctx.paths.resolve_existing(&path_arg)?;
        let content = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;

        let matches = content.matches(&old_string).count();
        if matches == 0 {
            return Err(format!(
                "old_string not found in {path_arg}; it must match exactly, including whitespace"
            ));
        }
        if matches > 1 {
            return Err(format!(
                "old_string has {matches} matches in {path_arg}; add context to make it unique"
            ));
        }
        let new_content = content.replacen(&old_string, &new_string, 1);
        std::fs::write(&path, &new_content).map_err(|e| e.to_string())?;
        Ok(format!("Edited {path_arg}"))
    }
}

// ---------------------------------------------------------------------
// search / list_files
// ---------------------------------------------------------------------

struct SearchTool;

#[async_trait::async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search files recursively for a substring. Returns path:line:text matches."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"query":{"type":"string","description":"Substring to search for"},"path":{"type":"string","description":"Directory to search (default: workspace)"}},"required":["query"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let query = require_str(input_raw, "query")?;
        if query.is_empty() {
            return Err("query cannot be empty".to_string());
        }
        let root = match optional_str(input_raw, "path") {
            Some(path) => ctx.paths.resolve_existing(&path)?,
            None => ctx.paths.workspace().to_path_buf(),
        };

        let mut matches = Vec::new();
        let walker = ignore::WalkBuilder::new(&root)
            .max_depth(Some(MAX_WALK_DEPTH))
            .hidden(true)
            .git_ignore(false)
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !is_build_dir(name))
                    .unwrap_or(true)
            })
            .build();
        'outer: for entry in walker.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            if looks_binary(path) {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(path) else {
                continue;
            };
            let shown = path.strip_prefix(&root).unwrap_or(path);
            for (line_no, line) in text.lines().enumerate() {
                if line.contains(&query) {
                    matches.push(format!("{}:{}:{}", shown.display(), line_no + 1, line));
                    if matches.len() >= MAX_SEARCH_MATCHES {
                        matches.push(format!("... capped at {MAX_SEARCH_MATCHES} matches"));
                        break 'outer;
                    }
                }
            }
        }

        if matches.is_empty() {
            Ok("No matches found.".to_string())
        } else {
            Ok(cap_output(&matches.join("\n"), MAX_TOOL_OUTPUT))
        }
    }
}

/// Match a name against an optional leading- or trailing-`*` glob.
fn glob_match(name: &str, pattern: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(suffix), _) if !pattern.ends_with('*') || pattern.len() == 1 => {
            name.ends_with(suffix)
        }
        (Some(_), Some(_)) => {
            // Both ends starred: substring match.
            name.contains(pattern.trim_matches('*'))
        }
        (None, Some(prefix)) => name.starts_with(prefix),
        (None, None) => name == pattern,
        _ => false,
    }
}

struct ListFilesTool;

#[async_trait::async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files recursively. An optional pattern like '*.rs' or 'test*' filters names."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"path":{"type":"string","description":"Directory to list (default: workspace)"},"pattern":{"type":"string","description":"Leading- or trailing-* name filter"}}}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let root = match optional_str(input_raw, "path") {
            Some(path) => ctx.paths.resolve_existing(&path)?,
            None => ctx.paths.workspace().to_path_buf(),
        };
        let pattern = optional_str(input_raw, "pattern");

        let mut files = Vec::new();
        let walker = ignore::WalkBuilder::new(&root)
            .max_depth(Some(MAX_WALK_DEPTH))
            .hidden(true)
            .git_ignore(false)
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !is_build_dir(name))
                    .unwrap_or(true)
            })
            .build();
        for entry in walker.flatten() {
            if files.len() >= MAX_LIST_FILES {
                files.push(format!("... capped at {MAX_LIST_FILES} files"));
                break;
            }
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            if let Some(pattern) = &pattern {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                if !glob_match(name, pattern) {
                    continue;
                }
            }
            let shown = path.strip_prefix(&root).unwrap_or(path);
            files.push(shown.display().to_string());
        }

        if files.is_empty() {
            Ok("No files found.".to_string())
        } else {
            files.sort();
            Ok(files.join("\n"))
        }
    }
}

// ---------------------------------------------------------------------
// apply_patch
// ---------------------------------------------------------------------

struct ApplyPatchTool;

#[async_trait::async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to the workspace with patch -p0."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"patch":{"type":"string","description":"Unified diff text"}},"required":["patch"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let patch = require_str(input_raw, "patch")?;
        if patch.trim().is_empty() {
            return Err("patch cannot be empty".to_string());
        }

        let nonce = chrono::Local::now().format("%Y%m%d%H%M%S%f");
        let temp_path = std::env::temp_dir().join(format!("krillclaw_patch_{nonce}.diff"));
        std::fs::write(&temp_path, &patch)
            .map_err(|e| format!("Cannot write patch file: {e}"))?;

        let result = tokio::process::Command::new("patch")
            .args(["-p0", "-i"])
            .arg(&temp_path)
            .current_dir(ctx.paths.workspace())
            .output()
            .await;
        let _ = std::fs::remove_file(&temp_path);

        let output = result.map_err(|e| format!("Failed to run patch: {e}"))?;
        let transcript = merge_streams(&output.stdout, &output.stderr, MAX_PATCH_OUTPUT);
        if output.status.success() {
            Ok(if transcript.is_empty() {
                "Patch applied.".to_string()
            } else {
                transcript
            })
        } else {
            Err(format!(
                "patch exited with {}\n{transcript}",
                output.status.code().unwrap_or(-1)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::for_tests(dir.path().to_path_buf());
        (dir, ctx)
    }

    #[test]
    fn merged_transcripts_label_stderr() {
        assert_eq!(merge_streams(b"out\n", b"", 1024), "out");
        assert_eq!(merge_streams(b"", b"oops\n", 1024), "[stderr]\noops");
        assert_eq!(merge_streams(b"out", b"oops", 1024), "out\n[stderr]\noops");
        assert_eq!(merge_streams(b"", b"", 1024), "");
        let capped = merge_streams(&[b'x'; 64], b"", 16);
        assert!(capped.contains("truncated at 16 bytes"));
    }

    #[tokio::test]
    async fn bash_combines_streams_and_reports_exit() {
        let (_dir, ctx) = ctx();
        let out = BashTool
            .execute(r#"{"command": "echo out; echo err 1>&2"}"#, &ctx)
            .await
            .unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
        assert!(out.contains("[stderr]"));

        let err = BashTool
            .execute(r#"{"command": "exit 3"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("Exit code 3"));

        let err = BashTool.execute("{}", &ctx).await.unwrap_err();
        assert!(err.contains("Missing 'command'"));
    }

    #[tokio::test]
    async fn read_write_round_trip_and_caps() {
        let (dir, ctx) = ctx();
        WriteFileTool
            .execute(r#"{"path": "notes/a.txt", "content": "hello\nworld"}"#, &ctx)
            .await
            .unwrap();
        let text = ReadFileTool
            .execute(r#"{"path": "notes/a.txt"}"#, &ctx)
            .await
            .unwrap();
        // The escaped newline was decoded before the write.
        assert_eq!(text, "hello\nworld");

        std::fs::write(dir.path().join("big.bin"), vec![b'x'; 70 * 1024]).unwrap();
        let err = ReadFileTool
            .execute(r#"{"path": "big.bin"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("too large"));
    }

    #[tokio::test]
    async fn read_escape_rejected_without_touching_file() {
        let (_dir, ctx) = ctx();
        let err = ReadFileTool
            .execute(r#"{"path": "../../etc/passwd"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("Path not allowed"), "{err}");
    }

    #[tokio::test]
    async fn edit_requires_unique_match() {
        let (dir, ctx) = ctx();
        std::fs::write(dir.path().join("one.txt"), "hello world").unwrap();
        EditFileTool
            .execute(
                r#"{"path": "one.txt", "old_string": "hello", "new_string": "goodbye"}"#,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("one.txt")).unwrap(),
            "goodbye world"
        );

        std::fs::write(dir.path().join("two.txt"), "foo bar foo").unwrap();
        let err = EditFileTool
            .execute(
                r#"{"path": "two.txt", "old_string": "foo", "new_string": "baz"}"#,
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.contains("2 matches"), "{err}");
        // The file is untouched on failure.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("two.txt")).unwrap(),
            "foo bar foo"
        );

        let err = EditFileTool
            .execute(
                r#"{"path": "two.txt", "old_string": "absent", "new_string": "x"}"#,
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn search_finds_substrings_and_skips_binaries() {
        let (dir, ctx) = ctx();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn needle() {}\n").unwrap();
        std::fs::write(dir.path().join("blob.bin"), b"needle\0needle").unwrap();
        std::fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join(".hidden/h.txt"), "needle").unwrap();

        let out = SearchTool
            .execute(r#"{"query": "needle"}"#, &ctx)
            .await
            .unwrap();
        assert!(out.contains("lib.rs:1:fn needle"), "{out}");
        assert!(!out.contains("blob.bin"), "{out}");
        assert!(!out.contains("h.txt"), "{out}");
    }

    #[tokio::test]
    async fn list_files_honors_simple_globs() {
        let (dir, ctx) = ctx();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let out = ListFilesTool
            .execute(r#"{"pattern": "*.rs"}"#, &ctx)
            .await
            .unwrap();
        assert!(out.contains("main.rs"));
        assert!(out.contains("lib.rs"));
        assert!(!out.contains("README.md"));

        let out = ListFilesTool
            .execute(r#"{"pattern": "READ*"}"#, &ctx)
            .await
            .unwrap();
        assert_eq!(out, "README.md");
    }

    #[test]
    fn glob_edges() {
        assert!(glob_match("main.rs", "*.rs"));
        assert!(!glob_match("main.rs", "*.md"));
        assert!(glob_match("test_one", "test*"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("other", "exact"));
        assert!(glob_match("abcde", "*cd*"));
    }

    #[tokio::test]
    async fn apply_patch_applies_a_unified_diff() {
        let (dir, ctx) = ctx();
        std::fs::write(dir.path().join("greet.txt"), "hello\n").unwrap();
        let input = r#"{"patch": "--- greet.txt\n+++ greet.txt\n@@ -1 +1 @@\n-hello\n+goodbye\n"}"#;
        let result = ApplyPatchTool.execute(input, &ctx).await;
        match result {
            Ok(_) => assert_eq!(
                std::fs::read_to_string(dir.path().join("greet.txt")).unwrap(),
                "goodbye\n"
            ),
            // Environments without patch(1) still surface a clean error.
            Err(e) => assert!(e.contains("patch"), "{e}"),
        }
    }
}
