use resistnet::config::{default_data_dir, ResistConfig};
use std::path::Path;

/// Write a default config file to `path`.
pub fn execute(path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    let data_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(default_data_dir);
    ResistConfig::create_default(path, &data_dir)?;
    println!("Created {}", path.display());
    println!("Set PASSPORT_API_KEY and PASSPORT_SCORER_ID, or edit [passport].");
    Ok(())
}
