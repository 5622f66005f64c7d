use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "idvault";
pub const APP_NAME: &str = "idvault";

pub const DATA_DIR_ENV: &str = "IDVAULT_DATA_DIR";
pub const STORE_FILE_NAME: &str = "datastore";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn default_store_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join(STORE_FILE_NAME))
}
