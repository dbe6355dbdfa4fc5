//! Builds the cloud-init NoCloud seed: a small vfat image labelled
//! `CIDATA` holding `meta-data`, `user-data` and optionally
//! `network-config`, attached to the guest as a read-only drive.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use vmop_types::CloudInit;

/// Writes the seed documents into `dir` and returns the written paths.
pub(crate) fn write_seed_files(dir: &Path, cloud_init: &CloudInit) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create seed dir {:?}", dir))?;
    let mut files = Vec::new();

    let meta = cloud_init
        .meta_data
        .clone()
        .unwrap_or_else(|| serde_json::json!({}));
    let path = dir.join("meta-data");
    std::fs::write(&path, serde_yaml::to_string(&meta)?)?;
    files.push(path);

    if let Some(user_data) = &cloud_init.user_data {
        let path = dir.join("user-data");
        let text = match user_data {
            // A plain string is passed through untouched (it may be a
            // shell script or an already rendered document).
            serde_json::Value::String(raw) => raw.clone(),
            other => format!("#cloud-config\n{}", serde_yaml::to_string(other)?),
        };
        std::fs::write(&path, text)?;
        files.push(path);
    }

    if let Some(network_config) = &cloud_init.network_config {
        let path = dir.join("network-config");
        std::fs::write(&path, serde_yaml::to_string(network_config)?)?;
        files.push(path);
    }

    Ok(files)
}

/// Formats the image and copies the seed files in. `mkfs.vfat` and
/// `mcopy` ship with the runner image.
pub(crate) async fn build_image(image: &Path, files: &[PathBuf]) -> Result<()> {
    let file = std::fs::File::create(image)
        .with_context(|| format!("Failed to create seed image {:?}", image))?;
    file.set_len(2 * 1024 * 1024)?;
    drop(file);

    run(Command::new("mkfs.vfat").args(["-n", "CIDATA"]).arg(image)).await?;
    for seed in files {
        run(Command::new("mcopy")
            .arg("-o")
            .arg("-i")
            .arg(image)
            .arg(seed)
            .arg("::"))
        .await?;
    }
    Ok(())
}

async fn run(command: &mut Command) -> Result<()> {
    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to run {:?}", command))?;
    if !output.status.success() {
        bail!(
            "{:?} failed with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
