//! Client configuration.
//!
//! Built once at startup and handed to the client by reference. A config file
//! only needs the keys it overrides. Paths it leaves out follow `base_dir`,
//! except the gpg and mixmaster ones, which live in the home directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::kdf::Role;
use crate::transport::OutputMethod;

/// Name of the config file inside the base directory.
pub const CONFIG_FILE_NAME: &str = "nymphemeral.toml";

/// Newsgroup the retrieval collaborator polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewsgroupConfig {
    pub group: String,
    pub server: String,
    pub port: u16,
    /// File holding the NEWNEWS cursor.
    pub newnews: PathBuf,
}

impl NewsgroupConfig {
    fn for_base(base_dir: &Path) -> Self {
        Self {
            group: "alt.anonymous.messages".to_string(),
            server: "localhost".to_string(),
            port: 119,
            newnews: base_dir.join(".newnews"),
        }
    }
}

impl Default for NewsgroupConfig {
    fn default() -> Self {
        Self::for_base(&default_base_dir())
    }
}

/// Paths and switches of the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub base_dir: PathBuf,
    pub db_dir: PathBuf,
    pub read_dir: PathBuf,
    pub unread_dir: PathBuf,
    pub hsub_file: PathBuf,
    pub encrypted_hsub_file: PathBuf,
    pub gpg_dir: PathBuf,
    pub debug: bool,
    pub output_method: OutputMethod,
    pub mix_binary: PathBuf,
    pub mix_cfg: PathBuf,
    pub newsgroup: NewsgroupConfig,
    /// Side of the ratchet this installation plays against the nym server.
    pub ratchet_role: Role,
}

/// The keys a config file actually set.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    base_dir: Option<PathBuf>,
    db_dir: Option<PathBuf>,
    read_dir: Option<PathBuf>,
    unread_dir: Option<PathBuf>,
    hsub_file: Option<PathBuf>,
    encrypted_hsub_file: Option<PathBuf>,
    gpg_dir: Option<PathBuf>,
    debug: Option<bool>,
    output_method: Option<OutputMethod>,
    mix_binary: Option<PathBuf>,
    mix_cfg: Option<PathBuf>,
    newsgroup: NewsgroupFile,
    ratchet_role: Option<Role>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NewsgroupFile {
    group: Option<String>,
    server: Option<String>,
    port: Option<u16>,
    newnews: Option<PathBuf>,
}

impl ConfigFile {
    /// resolve lays unset paths out under the chosen base directory
    fn resolve(self) -> Config {
        let home = Config::default();
        let base = match &self.base_dir {
            Some(base_dir) => Config::with_base_dir(base_dir),
            None => home.clone(),
        };
        let newsgroup = self.newsgroup;
        Config {
            db_dir: self.db_dir.unwrap_or(base.db_dir),
            read_dir: self.read_dir.unwrap_or(base.read_dir),
            unread_dir: self.unread_dir.unwrap_or(base.unread_dir),
            hsub_file: self.hsub_file.unwrap_or(base.hsub_file),
            encrypted_hsub_file: self.encrypted_hsub_file.unwrap_or(base.encrypted_hsub_file),
            gpg_dir: self.gpg_dir.unwrap_or(home.gpg_dir),
            debug: self.debug.unwrap_or(home.debug),
            output_method: self.output_method.unwrap_or(home.output_method),
            mix_binary: self.mix_binary.unwrap_or(home.mix_binary),
            mix_cfg: self.mix_cfg.unwrap_or(home.mix_cfg),
            newsgroup: NewsgroupConfig {
                group: newsgroup.group.unwrap_or(base.newsgroup.group),
                server: newsgroup.server.unwrap_or(base.newsgroup.server),
                port: newsgroup.port.unwrap_or(base.newsgroup.port),
                newnews: newsgroup.newnews.unwrap_or(base.newsgroup.newnews),
            },
            ratchet_role: self.ratchet_role.unwrap_or(home.ratchet_role),
            base_dir: base.base_dir,
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

fn default_base_dir() -> PathBuf {
    home_dir().join(".config").join("nymphemeral")
}

impl Default for Config {
    fn default() -> Self {
        let home = home_dir();
        let mut config = Self::with_base_dir(&default_base_dir());
        config.gpg_dir = home.join(".gnupg");
        config.mix_binary = home.join("Mix").join("mixmaster");
        config.mix_cfg = home.join("Mix").join("mix.cfg");
        config
    }
}

impl Config {
    /// with_base_dir lays every client path out under `base_dir`
    pub fn with_base_dir(base_dir: &Path) -> Self {
        let messages = base_dir.join("messages");
        Self {
            base_dir: base_dir.to_path_buf(),
            db_dir: base_dir.join("db"),
            read_dir: messages.join("read"),
            unread_dir: messages.join("unread"),
            hsub_file: base_dir.join("hsubs.txt"),
            encrypted_hsub_file: base_dir.join("encrypted_hsubs.txt"),
            gpg_dir: base_dir.join("gnupg"),
            debug: false,
            output_method: OutputMethod::Manual,
            mix_binary: base_dir.join("Mix").join("mixmaster"),
            mix_cfg: base_dir.join("Mix").join("mix.cfg"),
            newsgroup: NewsgroupConfig::for_base(base_dir),
            ratchet_role: Role::Initiator,
        }
    }

    /// load reads `path` over the defaults; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)?;
        Ok(file.resolve())
    }

    /// save writes the full configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// ensure_directories creates the db and message directories
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.base_dir, &self.db_dir, &self.read_dir, &self.unread_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// mix_chain reads the remailer chain from the mixmaster config, if any
    pub fn mix_chain(&self) -> Option<String> {
        let content = match fs::read_to_string(&self.mix_cfg) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %self.mix_cfg.display(), error = %e, "mixmaster config unreadable");
                return None;
            }
        };
        content
            .lines()
            .find_map(|line| line.split_once("CHAIN ").map(|(_, chain)| chain.trim().to_string()))
    }
}

/* ------------------------------------------------------------------------- */

// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_under_base_dir() {
        let config = Config::with_base_dir(Path::new("/tmp/nym"));
        assert_eq!(config.db_dir, Path::new("/tmp/nym/db"));
        assert_eq!(config.unread_dir, Path::new("/tmp/nym/messages/unread"));
        assert_eq!(config.hsub_file, Path::new("/tmp/nym/hsubs.txt"));
        assert_eq!(config.newsgroup.group, "alt.anonymous.messages");
        assert_eq!(config.newsgroup.port, 119);
        assert_eq!(config.output_method, OutputMethod::Manual);
        assert_eq!(config.ratchet_role, Role::Initiator);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "output_method = \"sendmail\"\ndebug = true\n[newsgroup]\nport = 563\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.output_method, OutputMethod::Sendmail);
        assert!(config.debug);
        assert_eq!(config.newsgroup.port, 563);
        assert_eq!(config.newsgroup.group, "alt.anonymous.messages");
    }

    #[test]
    fn base_dir_moves_unset_paths() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("nb");
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, format!("base_dir = {:?}\nhsub_file = \"/srv/hsubs.txt\"\n", base.display().to_string())).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.base_dir, base);
        assert_eq!(config.db_dir, base.join("db"));
        assert_eq!(config.read_dir, base.join("messages").join("read"));
        assert_eq!(config.unread_dir, base.join("messages").join("unread"));
        assert_eq!(config.encrypted_hsub_file, base.join("encrypted_hsubs.txt"));
        assert_eq!(config.newsgroup.newnews, base.join(".newnews"));
        assert_eq!(config.hsub_file, Path::new("/srv/hsubs.txt"));
        assert_eq!(config.gpg_dir, Config::default().gpg_dir);
        assert_eq!(config.mix_binary, Config::default().mix_binary);
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let mut config = Config::with_base_dir(dir.path());
        config.ratchet_role = Role::Responder;
        let path = dir.path().join(CONFIG_FILE_NAME);
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn reads_mix_chain() {
        let dir = tempdir().unwrap();
        let mut config = Config::with_base_dir(dir.path());
        assert_eq!(config.mix_chain(), None);
        config.mix_cfg = dir.path().join("mix.cfg");
        fs::write(&config.mix_cfg, "REMAIL n\nCHAIN *,*,*\n").unwrap();
        assert_eq!(config.mix_chain().as_deref(), Some("*,*,*"));
    }

    #[test]
    fn ensure_directories_creates_tree() {
        let dir = tempdir().unwrap();
        let config = Config::with_base_dir(&dir.path().join("base"));
        config.ensure_directories().unwrap();
        assert!(config.db_dir.is_dir());
        assert!(config.read_dir.is_dir());
        assert!(config.unread_dir.is_dir());
    }
}
