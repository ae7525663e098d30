use std::path::PathBuf;

/// Overrides supplied by the embedding process. They win over file and
/// environment configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra config file, loaded after the default locations
    pub cfg_name: Option<String>,

    /// Data directory override
    pub data_dir: Option<PathBuf>,
}
