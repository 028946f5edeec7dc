//! Finding config files and stacking them into one [`Config`].
//!
//! Layers, lowest precedence first: the embedded `defaults.toml`, the user
//! file, the workspace file. `ARBOR_*` variables then fill whatever no file
//! set, `${VAR}` references are expanded, and the result is deserialized and
//! validated.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env;
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, Layered};
use crate::types::Config;
use crate::validate;

const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Directory holding `config.toml`, under the home dir or a workspace root.
const CONFIG_DIR: &str = ".arbor";
const CONFIG_FILE: &str = "config.toml";

/// Files larger than this are refused rather than parsed.
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// A loaded configuration and its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The validated configuration.
    pub config: Config,
    /// Which layer set each leaf field.
    pub field_sources: FieldSources,
    /// Files that contributed, lowest precedence first.
    pub loaded_files: Vec<PathBuf>,
}

impl ResolvedConfig {
    /// Layer that set `field` (dotted path), if any.
    #[must_use]
    pub fn source_of(&self, field: &str) -> Option<ConfigLayer> {
        self.field_sources.get(field).copied()
    }
}

/// Load the full layer stack for `workspace_root`.
///
/// `user_dir` replaces `~/.arbor` when given.
///
/// # Errors
///
/// Fails if no home directory can be found (and `user_dir` is `None`), if a
/// present file cannot be read or parsed, or if the merged result does not
/// validate.
pub fn load(workspace_root: Option<&Path>, user_dir: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let user_dir = match user_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_user_dir()?,
    };
    load_layers(workspace_root, Some(&user_dir), &env::collect_env_vars())
}

/// [`load`] with every input explicit.
///
/// # Errors
///
/// Same as [`load`], minus the home directory lookup.
pub fn load_layers<S: BuildHasher>(
    workspace_root: Option<&Path>,
    user_dir: Option<&Path>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<ResolvedConfig> {
    let mut layered = Layered::new(
        parse(DEFAULTS_TOML, "<embedded defaults>")?,
        ConfigLayer::Defaults,
    );

    let candidates = [
        (ConfigLayer::User, user_dir.map(|dir| dir.join(CONFIG_FILE))),
        (ConfigLayer::Workspace, workspace_root.map(workspace_config_path)),
    ];
    let mut loaded_files = Vec::new();
    for (layer, path) in candidates {
        let Some(path) = path else {
            continue;
        };
        let Some(overlay) = read_layer(&path)? else {
            continue;
        };
        info!(%layer, path = %path.display(), "config layer loaded");
        layered.apply(overlay, layer);
        loaded_files.push(path);
    }

    let filled = env::apply_env_fallbacks(&mut layered, env_vars);
    if filled > 0 {
        debug!(filled, "config fields filled from environment");
    }

    let (mut tree, field_sources) = layered.into_parts();
    env::expand_references(&mut tree, env_vars);
    let config = build(tree, "<merged config>")?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Load one file on its own. Fields it leaves out take their defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] if the file is missing or unreadable, and
/// the parse and validation errors of [`load`] otherwise.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let tree = read_layer(path)?.ok_or_else(|| ConfigError::Read {
        path: path.to_path_buf(),
        source: io::ErrorKind::NotFound.into(),
    })?;
    build(tree, &path.display().to_string())
}

/// `{root}/.arbor/config.toml`.
#[must_use]
pub fn workspace_config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR).join(CONFIG_FILE)
}

fn default_user_dir() -> ConfigResult<PathBuf> {
    let base = directories::BaseDirs::new().ok_or(ConfigError::NoHomeDir)?;
    Ok(base.home_dir().join(CONFIG_DIR))
}

fn parse(text: &str, origin: &str) -> ConfigResult<toml::Value> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        origin: origin.to_owned(),
        source,
    })
}

fn build(tree: toml::Value, origin: &str) -> ConfigResult<Config> {
    let config: Config = tree.try_into().map_err(|source| ConfigError::Parse {
        origin: origin.to_owned(),
        source,
    })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Read and parse one layer. A missing file is `Ok(None)`.
fn read_layer(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file");
            return Ok(None);
        },
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        },
    };

    let size = u64::try_from(text.len()).unwrap_or(u64::MAX);
    if size > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::TooLarge {
            path: path.to_path_buf(),
            size,
            limit: MAX_CONFIG_FILE_SIZE,
        });
    }

    parse(&text, &path.display().to_string()).map(Some)
}
