use crate::error::{HomeError, Result};
use crate::lock::DirLock;
use crate::paths::GrimoireHome;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static ENV_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Z_][A-Z0-9_]*$").expect("env key regex"));

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{([A-Z_][A-Z0-9_]*)\}$").expect("placeholder regex"));

#[must_use]
pub fn is_valid_env_key(key: &str) -> bool {
    ENV_KEY_RE.is_match(key)
}

/// Key under which spell tooling stores a secret, e.g.
/// `PROJECT_MANAGER__API_PASSWORD` for spell `project-manager`.
#[must_use]
pub fn namespaced_key(spell_name: &str, purpose: &str) -> String {
    let prefix: String = spell_name
        .chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect();
    format!("{prefix}__{purpose}")
}

/// If `value` is exactly one `${VAR}` reference, return `VAR`.
#[must_use]
pub fn placeholder_name(value: &str) -> Option<&str> {
    PLACEHOLDER_RE
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Expand every `${VAR}` reference in `input`, consulting the process
/// environment first and the shared env file second. The error for a
/// reference that resolves nowhere carries the variable *name* only.
pub fn resolve_placeholders(input: &str, env_file: &EnvFile) -> Result<String> {
    static ANY_PLACEHOLDER_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("placeholder regex"));

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in ANY_PLACEHOLDER_RE.captures_iter(input) {
        let whole = caps.get(0).expect("capture 0");
        let name = caps.get(1).expect("capture 1").as_str();
        out.push_str(&input[last..whole.start()]);
        let value = std::env::var(name)
            .ok()
            .or_else(|| env_file.get(name).map(str::to_string))
            .ok_or_else(|| HomeError::UnresolvedPlaceholder(name.to_string()))?;
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Parsed view of the shared `.env` file.
///
/// Lines are `KEY=VALUE` or `# comment`; blanks are skipped. Values are
/// raw: no quoting and no expansion on read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvFile {
    entries: BTreeMap<String, String>,
}

impl EnvFile {
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                log::warn!("ignoring malformed env line (no '=')");
                continue;
            };
            let key = key.trim();
            if !is_valid_env_key(key) {
                log::warn!("ignoring env entry with invalid key '{key}'");
                continue;
            }
            entries.insert(key.to_string(), value.to_string());
        }
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if !is_valid_env_key(key) {
            return Err(HomeError::InvalidKey(key.to_string()));
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialise back to file form. One `KEY=VALUE` line per entry, sorted
    /// by key, so writing the same logical content is byte-stable.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Disk-backed `.env` operations. Reads are lock-free; every write takes
/// the sentinel lock and rewrites the file whole.
#[derive(Clone, Debug)]
pub struct EnvStore {
    home: GrimoireHome,
}

impl EnvStore {
    #[must_use]
    pub fn new(home: GrimoireHome) -> Self {
        Self { home }
    }

    pub async fn load(&self) -> Result<EnvFile> {
        match tokio::fs::read_to_string(self.home.env_path()).await {
            Ok(text) => Ok(EnvFile::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(EnvFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load().await?.get(key).map(str::to_string))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        if !is_valid_env_key(key) {
            return Err(HomeError::InvalidKey(key.to_string()));
        }
        self.home.ensure_dir()?;
        let _lock = DirLock::acquire(self.home.env_lock_path()).await?;
        let mut file = self.load().await?;
        file.set(key, value)?;
        self.write_whole(&file).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.home.ensure_dir()?;
        let _lock = DirLock::acquire(self.home.env_lock_path()).await?;
        let mut file = self.load().await?;
        if file.remove(key).is_none() {
            return Ok(());
        }
        self.write_whole(&file).await
    }

    async fn write_whole(&self, file: &EnvFile) -> Result<()> {
        let path = self.home.env_path();
        tokio::fs::write(&path, file.render()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms).await?;
        }
        Ok(())
    }
}
