//! SSH client configuration documents.
//!
//! A document is a preamble followed by host blocks. A block starts at a
//! `Host <patterns>` line and runs until the next `Host` line or the end of
//! the file. Parsing and rendering an untouched document is byte-identical,
//! so edits to one block never disturb the others.
//!
//! [`SshConfigStore`] applies edits to a file with a full read-modify-write
//! per mutation. Edits from other processes are not merged: the last writer
//! wins.

use crate::error::{CoreError, Result};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Indentation used for directives this crate writes.
const INDENT: &str = "    ";

/// Placeholder path for documents that were not read from a file.
const IN_MEMORY: &str = "<memory>";

/// One `Host` block: its patterns and its raw lines, `Host` line first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBlock {
    patterns: Vec<String>,
    lines: Vec<String>,
}

impl HostBlock {
    /// Build a fresh block for `hostname` with `directives` in order.
    pub fn new<K, V>(hostname: &str, directives: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut lines = vec![format!("Host {hostname}")];
        lines.extend(
            directives
                .iter()
                .map(|(k, v)| format!("{INDENT}{} {}", k.as_ref(), v.as_ref())),
        );
        Self {
            patterns: vec![hostname.to_string()],
            lines,
        }
    }

    /// Patterns listed on the `Host` line.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Raw lines of the block, `Host` line included.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether this block is keyed by `hostname`.
    pub fn matches(&self, hostname: &str) -> bool {
        self.patterns.iter().any(|p| p == hostname)
    }

    /// Value of the first `key` directive in this block.
    pub fn directive(&self, key: &str) -> Option<&str> {
        self.lines[1..]
            .iter()
            .filter_map(|l| split_directive(l))
            .find(|d| d.keyword.eq_ignore_ascii_case(key))
            .map(|d| d.value)
    }

    /// Replace the first `key` directive of this block, or add it after the
    /// last non-blank line when absent.
    pub fn set_directive(&mut self, key: &str, value: &str) {
        let found = self.lines.iter().enumerate().skip(1).find_map(|(i, l)| {
            split_directive(l)
                .filter(|d| d.keyword.eq_ignore_ascii_case(key))
                .map(|d| (i, format!("{}{} {}{}", d.indent, d.keyword, value, d.eol)))
        });

        match found {
            Some((i, line)) => self.lines[i] = line,
            None => {
                let indent = self.lines[1..]
                    .iter()
                    .find_map(|l| split_directive(l).map(|d| d.indent.to_string()))
                    .unwrap_or_else(|| INDENT.to_string());
                let at = self
                    .lines
                    .iter()
                    .rposition(|l| !l.trim().is_empty())
                    .map_or(1, |i| i + 1);
                self.lines.insert(at, format!("{indent}{key} {value}"));
            }
        }
    }
}

/// A parsed SSH client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshConfigDocument {
    preamble: Vec<String>,
    blocks: Vec<HostBlock>,
    trailing_newline: bool,
}

impl SshConfigDocument {
    /// Parse document text.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_from(text, Path::new(IN_MEMORY))
    }

    /// Parse document text read from `path` (used in error reports).
    pub fn parse_from(text: &str, path: &Path) -> Result<Self> {
        let mut doc = Self::default();
        if text.is_empty() {
            return Ok(doc);
        }

        let mut lines: Vec<&str> = text.split('\n').collect();
        if text.ends_with('\n') {
            lines.pop();
            doc.trailing_newline = true;
        }

        for (n, line) in lines.into_iter().enumerate() {
            match host_patterns(line) {
                Some(patterns) if patterns.is_empty() => {
                    return Err(CoreError::ConfigCorruption {
                        path: path.to_path_buf(),
                        reason: format!("line {}: Host without a pattern", n + 1),
                    });
                }
                Some(patterns) => doc.blocks.push(HostBlock {
                    patterns,
                    lines: vec![line.to_string()],
                }),
                None => match doc.blocks.last_mut() {
                    Some(block) => block.lines.push(line.to_string()),
                    None => doc.preamble.push(line.to_string()),
                },
            }
        }
        Ok(doc)
    }

    /// Render the document back to text.
    pub fn render(&self) -> String {
        let mut out = self
            .preamble
            .iter()
            .chain(self.blocks.iter().flat_map(|b| b.lines.iter()))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }

    /// Whether the document has no content at all.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.preamble.iter().all(|l| l.trim().is_empty())
    }

    /// Host blocks in document order.
    pub fn blocks(&self) -> &[HostBlock] {
        &self.blocks
    }

    /// Every host pattern, in document order.
    pub fn hosts(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .flat_map(|b| b.patterns.iter().map(String::as_str))
            .collect()
    }

    /// Whether a block keyed by `hostname` exists.
    pub fn exists(&self, hostname: &str) -> bool {
        self.find(hostname).is_some()
    }

    /// First unused name of `base`, `base-1`, `base-2`, ...
    pub fn next_available_hostname(&self, base: &str) -> String {
        if !self.exists(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}-{i}"))
            .find(|candidate| !self.exists(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Append a new block after a blank-line separator.
    pub fn append<K, V>(&mut self, hostname: &str, directives: &[(K, V)]) -> Result<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        validate_hostname(hostname)?;
        if self.exists(hostname) {
            return Err(CoreError::HostExists(hostname.to_string()));
        }

        self.trim_trailing_blank_lines();
        if !self.is_empty() {
            self.last_lines_mut().push(String::new());
        }
        self.blocks.push(HostBlock::new(hostname, directives));
        self.trailing_newline = true;
        Ok(())
    }

    /// Remove the block keyed by `hostname`, leaving every other block as is.
    pub fn remove(&mut self, hostname: &str) -> Result<()> {
        let index = self
            .find(hostname)
            .ok_or_else(|| CoreError::HostNotFound(hostname.to_string()))?;
        self.blocks.remove(index);
        self.trim_trailing_blank_lines();
        self.trailing_newline = !self.is_empty();
        Ok(())
    }

    /// Set `key` to `value` inside the block keyed by `hostname` only.
    pub fn update_directive(&mut self, hostname: &str, key: &str, value: &str) -> Result<()> {
        self.transform_block(hostname, |block| block.set_directive(key, value))
    }

    /// Value of `key` inside the block keyed by `hostname`.
    pub fn get_directive(&self, hostname: &str, key: &str) -> Option<&str> {
        self.find(hostname)
            .and_then(|i| self.blocks[i].directive(key))
    }

    /// Locate the block keyed by `hostname` and apply `f` to it.
    pub fn transform_block<R>(
        &mut self,
        hostname: &str,
        f: impl FnOnce(&mut HostBlock) -> R,
    ) -> Result<R> {
        let index = self
            .find(hostname)
            .ok_or_else(|| CoreError::HostNotFound(hostname.to_string()))?;
        Ok(f(&mut self.blocks[index]))
    }

    fn find(&self, hostname: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.matches(hostname))
    }

    fn last_lines_mut(&mut self) -> &mut Vec<String> {
        match self.blocks.last_mut() {
            Some(block) => &mut block.lines,
            None => &mut self.preamble,
        }
    }

    fn trim_trailing_blank_lines(&mut self) {
        let lines = self.last_lines_mut();
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
    }
}

/// Patterns of a `Host` line, or `None` if the line is something else.
fn host_patterns(line: &str) -> Option<Vec<String>> {
    let directive = split_directive(line)?;
    if !directive.keyword.eq_ignore_ascii_case("host") {
        return None;
    }
    Some(
        directive
            .value
            .split_whitespace()
            .map(|p| p.trim_matches('"').to_string())
            .filter(|p| !p.is_empty())
            .collect(),
    )
}

struct Directive<'a> {
    indent: &'a str,
    keyword: &'a str,
    value: &'a str,
    eol: &'a str,
}

/// Split `  Keyword value` / `Keyword=value` lines. Blank and comment lines
/// yield `None`.
fn split_directive(line: &str) -> Option<Directive<'_>> {
    let (body, eol) = match line.strip_suffix('\r') {
        Some(body) => (body, "\r"),
        None => (line, ""),
    };
    let trimmed = body.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let indent = &body[..body.len() - trimmed.len()];
    let end = trimmed
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(trimmed.len());
    let keyword = &trimmed[..end];
    let rest = trimmed[end..].trim_start();
    let value = rest.strip_prefix('=').unwrap_or(rest).trim();
    Some(Directive {
        indent,
        keyword,
        value,
        eol,
    })
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.chars().any(|c| c.is_whitespace() || c == '#') {
        return Err(CoreError::InvalidConfig(format!(
            "invalid SSH host name: {hostname:?}"
        )));
    }
    Ok(())
}

/// File-backed SSH config with serialized read-modify-write mutations.
pub struct SshConfigStore {
    path: PathBuf,
    private: bool,
    lock: Mutex<()>,
}

impl SshConfigStore {
    /// Store for a shared config file (e.g. `~/.ssh/config`).
    ///
    /// Existing file permissions are kept; new files are created 0600.
    pub fn shared(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            private: false,
            lock: Mutex::new(()),
        }
    }

    /// Store for a private file holding key paths or passwords.
    ///
    /// The file is always written 0600 and removed once it has no blocks.
    pub fn private(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            private: true,
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this store holds secrets.
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Read and parse the file. A missing file is an empty document.
    pub async fn load(&self) -> Result<SshConfigDocument> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::trace!(path = %self.path.display(), "SSH config missing, starting empty");
                return Ok(SshConfigDocument::default());
            }
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8(bytes).map_err(|_| CoreError::ConfigCorruption {
            path: self.path.clone(),
            reason: "not valid UTF-8".to_string(),
        })?;
        SshConfigDocument::parse_from(&text, &self.path)
    }

    /// Whether `hostname` has a block.
    pub async fn exists(&self, hostname: &str) -> Result<bool> {
        Ok(self.load().await?.exists(hostname))
    }

    /// Every host pattern in the file.
    pub async fn hosts(&self) -> Result<Vec<String>> {
        Ok(self
            .load()
            .await?
            .hosts()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// First unused name of `base`, `base-1`, `base-2`, ...
    pub async fn next_available_hostname(&self, base: &str) -> Result<String> {
        Ok(self.load().await?.next_available_hostname(base))
    }

    /// Value of `key` in the block for `hostname`.
    pub async fn get_directive(&self, hostname: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .load()
            .await?
            .get_directive(hostname, key)
            .map(str::to_string))
    }

    /// Append a block for `hostname`.
    pub async fn append<K, V>(&self, hostname: &str, directives: &[(K, V)]) -> Result<()>
    where
        K: AsRef<str> + Sync,
        V: AsRef<str> + Sync,
    {
        self.modify(|doc| doc.append(hostname, directives)).await?;
        tracing::info!(path = %self.path.display(), host = %hostname, "SSH host added");
        Ok(())
    }

    /// Pick the next free name derived from `base` and append a block for
    /// it in one locked step. Returns the chosen name.
    pub async fn append_unique<K, V>(&self, base: &str, directives: &[(K, V)]) -> Result<String>
    where
        K: AsRef<str> + Sync,
        V: AsRef<str> + Sync,
    {
        let hostname = self
            .modify(|doc| {
                let hostname = doc.next_available_hostname(base);
                doc.append(&hostname, directives)?;
                Ok(hostname)
            })
            .await?;
        tracing::info!(path = %self.path.display(), host = %hostname, "SSH host added");
        Ok(hostname)
    }

    /// Remove the block for `hostname`.
    pub async fn remove(&self, hostname: &str) -> Result<()> {
        self.modify(|doc| doc.remove(hostname)).await?;
        tracing::info!(path = %self.path.display(), host = %hostname, "SSH host removed");
        Ok(())
    }

    /// Set `key` to `value` in the block for `hostname` only.
    pub async fn update_directive(&self, hostname: &str, key: &str, value: &str) -> Result<()> {
        self.modify(|doc| doc.update_directive(hostname, key, value))
            .await?;
        tracing::debug!(host = %hostname, key = %key, "SSH directive updated");
        Ok(())
    }

    async fn modify<R>(&self, f: impl FnOnce(&mut SshConfigDocument) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let result = f(&mut doc)?;
        self.store(&doc).await?;
        Ok(result)
    }

    async fn store(&self, doc: &SshConfigDocument) -> Result<()> {
        let target = self.resolve_target().await?;

        if self.private && doc.is_empty() {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(path = %target.display(), "Removed empty private SSH config");
            return Ok(());
        }

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            if tokio::fs::metadata(parent).await.is_err() {
                tokio::fs::create_dir_all(parent).await?;
                set_mode(parent, 0o700).await?;
            }
        }

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string());
        let tmp = target.with_file_name(format!(".{file_name}.sandlink-tmp"));

        let existing_mode = existing_mode(&target).await;
        tokio::fs::write(&tmp, doc.render()).await?;
        let mode = match (self.private, existing_mode) {
            (false, Some(mode)) => mode,
            _ => 0o600,
        };
        if let Err(e) = set_mode(&tmp, mode).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::trace!(path = %target.display(), "SSH config written");
        Ok(())
    }

    /// Write through symlinks instead of replacing them.
    async fn resolve_target(&self) -> Result<PathBuf> {
        match tokio::fs::symlink_metadata(&self.path).await {
            Ok(meta) if meta.file_type().is_symlink() => Ok(tokio::fs::canonicalize(&self.path).await?),
            _ => Ok(self.path.clone()),
        }
    }
}

#[cfg(unix)]
async fn existing_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path)
        .await
        .ok()
        .map(|m| m.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
async fn existing_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_HOSTS: &str = "\
# managed by hand
Host alpha
    HostName alpha.example.com
    User deploy

Host beta
    HostName beta.example.com
    User deploy
";

    fn directives() -> Vec<(&'static str, &'static str)> {
        vec![("HostName", "127.0.0.1"), ("User", "root"), ("Port", "2222")]
    }

    #[test]
    fn test_roundtrip_is_byte_identical() {
        for text in [
            "",
            "\n",
            TWO_HOSTS,
            "Host a\r\n  User x\r\n",
            "Host a\n\tUser x",
            "Include ~/.ssh/extra\n\n\nHost *\n  ServerAliveInterval 30\n\n",
        ] {
            let doc = SshConfigDocument::parse(text).unwrap();
            assert_eq!(doc.render(), text);
        }
    }

    #[test]
    fn test_parse_blocks() {
        let doc = SshConfigDocument::parse(TWO_HOSTS).unwrap();
        assert_eq!(doc.hosts(), vec!["alpha", "beta"]);
        assert_eq!(doc.blocks()[0].lines().len(), 4);
        assert_eq!(doc.get_directive("beta", "hostname"), Some("beta.example.com"));
    }

    #[test]
    fn test_host_keyword_variants() {
        let doc = SshConfigDocument::parse("host one two\nHost=three\n  HostName x\n").unwrap();
        assert_eq!(doc.hosts(), vec!["one", "two", "three"]);
        assert!(doc.exists("two"));
        assert!(!doc.exists("x"));
    }

    #[test]
    fn test_host_without_pattern_is_corruption() {
        let err = SshConfigDocument::parse("Host alpha\nHost\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigCorruption { .. }));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_next_available_hostname() {
        let doc = SshConfigDocument::parse("Host sandbox\nHost sandbox-1\n").unwrap();
        assert_eq!(doc.next_available_hostname("sandbox"), "sandbox-2");
        assert_eq!(doc.next_available_hostname("other"), "other");
    }

    #[test]
    fn test_append_adds_separated_block() {
        let mut doc = SshConfigDocument::parse(TWO_HOSTS).unwrap();
        doc.append("gamma", &directives()).unwrap();
        let expected = format!(
            "{TWO_HOSTS}\nHost gamma\n    HostName 127.0.0.1\n    User root\n    Port 2222\n"
        );
        assert_eq!(doc.render(), expected);
        assert_eq!(doc.hosts(), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_append_to_empty_document() {
        let mut doc = SshConfigDocument::default();
        doc.append("solo", &[("User", "me")]).unwrap();
        assert_eq!(doc.render(), "Host solo\n    User me\n");
    }

    #[test]
    fn test_append_duplicate_fails() {
        let mut doc = SshConfigDocument::parse(TWO_HOSTS).unwrap();
        assert!(matches!(
            doc.append("alpha", &directives()),
            Err(CoreError::HostExists(_))
        ));
    }

    #[test]
    fn test_remove_then_append_is_idempotent() {
        let mut once = SshConfigDocument::parse(TWO_HOSTS).unwrap();
        once.append("gamma", &directives()).unwrap();
        let expected = once.render();

        let mut again = SshConfigDocument::parse(&expected).unwrap();
        again.remove("gamma").unwrap();
        assert_eq!(again.render(), TWO_HOSTS);
        again.append("gamma", &directives()).unwrap();
        assert_eq!(again.render(), expected);
    }

    #[test]
    fn test_remove_middle_block_keeps_others() {
        let text = "Host a\n  User 1\n\nHost b\n  User 2\n\nHost c\n  User 3\n";
        let mut doc = SshConfigDocument::parse(text).unwrap();
        doc.remove("b").unwrap();
        assert_eq!(doc.render(), "Host a\n  User 1\n\nHost c\n  User 3\n");
    }

    #[test]
    fn test_remove_normalizes_trailing_whitespace() {
        let text = "Host a\n  User 1\n\n\nHost b\n  User 2\n\n\n";
        let mut doc = SshConfigDocument::parse(text).unwrap();
        doc.remove("b").unwrap();
        assert_eq!(doc.render(), "Host a\n  User 1\n");

        doc.remove("a").unwrap();
        assert_eq!(doc.render(), "");
        assert!(doc.is_empty());
    }

    #[test]
    fn test_remove_missing_host() {
        let mut doc = SshConfigDocument::parse(TWO_HOSTS).unwrap();
        assert!(matches!(doc.remove("zeta"), Err(CoreError::HostNotFound(_))));
        assert_eq!(doc.render(), TWO_HOSTS);
    }

    #[test]
    fn test_update_directive_is_block_scoped() {
        let mut doc = SshConfigDocument::parse(TWO_HOSTS).unwrap();
        doc.update_directive("beta", "User", "admin").unwrap();

        let expected = TWO_HOSTS.replacen(
            "beta.example.com\n    User deploy",
            "beta.example.com\n    User admin",
            1,
        );
        assert_eq!(doc.render(), expected);
        assert_eq!(doc.get_directive("alpha", "User"), Some("deploy"));
        assert_eq!(doc.get_directive("beta", "User"), Some("admin"));
    }

    #[test]
    fn test_update_directive_preserves_indent_and_crlf() {
        let mut doc = SshConfigDocument::parse("Host a\r\n\tuser=old\r\n").unwrap();
        doc.update_directive("a", "User", "new").unwrap();
        assert_eq!(doc.render(), "Host a\r\n\tuser new\r\n");
    }

    #[test]
    fn test_update_directive_adds_missing_key() {
        let mut doc = SshConfigDocument::parse(TWO_HOSTS).unwrap();
        doc.update_directive("alpha", "Port", "2200").unwrap();
        assert!(doc
            .render()
            .contains("    User deploy\n    Port 2200\n\nHost beta"));
    }

    #[test]
    fn test_update_missing_host() {
        let mut doc = SshConfigDocument::parse(TWO_HOSTS).unwrap();
        assert!(matches!(
            doc.update_directive("zeta", "User", "x"),
            Err(CoreError::HostNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_hostname_rejected() {
        let mut doc = SshConfigDocument::default();
        assert!(doc.append("two words", &directives()).is_err());
        assert!(doc.append("", &directives()).is_err());
    }

    mod store {
        use super::*;
        use tempfile::TempDir;

        #[tokio::test]
        async fn test_missing_file_is_empty() {
            let dir = TempDir::new().unwrap();
            let store = SshConfigStore::shared(dir.path().join("config"));
            assert!(store.hosts().await.unwrap().is_empty());
            assert!(!store.exists("alpha").await.unwrap());
        }

        #[tokio::test]
        async fn test_mutations_persist() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("config");
            tokio::fs::write(&path, TWO_HOSTS).await.unwrap();
            let store = SshConfigStore::shared(&path);

            let name = store.append_unique("alpha", &directives()).await.unwrap();
            assert_eq!(name, "alpha-1");
            store.update_directive("alpha-1", "User", "ubuntu").await.unwrap();
            assert_eq!(
                store.get_directive("alpha-1", "User").await.unwrap().as_deref(),
                Some("ubuntu")
            );
            assert_eq!(
                store.get_directive("alpha", "User").await.unwrap().as_deref(),
                Some("deploy")
            );

            store.remove("alpha-1").await.unwrap();
            assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), TWO_HOSTS);
        }

        #[tokio::test]
        async fn test_non_utf8_is_corruption() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("config");
            tokio::fs::write(&path, [0xff, 0xfe, b'\n']).await.unwrap();
            let store = SshConfigStore::shared(&path);
            assert!(matches!(
                store.load().await,
                Err(CoreError::ConfigCorruption { .. })
            ));
        }

        #[tokio::test]
        async fn test_concurrent_appends_in_process() {
            let dir = TempDir::new().unwrap();
            let store = std::sync::Arc::new(SshConfigStore::shared(dir.path().join("config")));

            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let store = std::sync::Arc::clone(&store);
                    tokio::spawn(async move {
                        store.append_unique("sandbox", &[("User", "root")]).await
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap().unwrap();
            }

            let hosts = store.hosts().await.unwrap();
            assert_eq!(hosts.len(), 8);
            assert!(hosts.contains(&"sandbox".to_string()));
            assert!(hosts.contains(&"sandbox-7".to_string()));
        }

        #[cfg(unix)]
        #[tokio::test]
        async fn test_private_store_permissions_and_cleanup() {
            use std::os::unix::fs::PermissionsExt;

            let dir = TempDir::new().unwrap();
            let path = dir.path().join("private").join("sb-1.conf");
            let store = SshConfigStore::private(&path);

            store
                .append("sb-1", &[("IdentityFile", "/keys/sb-1")])
                .await
                .unwrap();
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
            let dir_mode = std::fs::metadata(path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(dir_mode, 0o700);

            store.remove("sb-1").await.unwrap();
            assert!(!path.exists());
        }

        #[cfg(unix)]
        #[tokio::test]
        async fn test_shared_store_keeps_existing_mode() {
            use std::os::unix::fs::PermissionsExt;

            let dir = TempDir::new().unwrap();
            let path = dir.path().join("config");
            std::fs::write(&path, TWO_HOSTS).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

            let store = SshConfigStore::shared(&path);
            store.append("gamma", &directives()).await.unwrap();
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o644);
        }

        #[cfg(unix)]
        #[tokio::test]
        async fn test_writes_through_symlink() {
            let dir = TempDir::new().unwrap();
            let real = dir.path().join("dotfiles-config");
            let link = dir.path().join("config");
            std::fs::write(&real, TWO_HOSTS).unwrap();
            std::os::unix::fs::symlink(&real, &link).unwrap();

            let store = SshConfigStore::shared(&link);
            store.append("gamma", &directives()).await.unwrap();

            assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
            assert!(std::fs::read_to_string(&real).unwrap().contains("Host gamma"));
        }
    }
}
