//! `ferryman update`: replace the current binary with the latest release.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt as _;
use std::process::Command;

use anyhow::Context as _;

const RELEASE_BASE: &str = "https://github.com/ferryman-relay/ferryman/releases/latest/download";

fn release_suffix() -> anyhow::Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("x64"),
        "x86" => Ok("x86"),
        "aarch64" => Ok("arm64"),
        "arm" => Ok("arm"),
        other => anyhow::bail!("unsupported CPU architecture: {other}"),
    }
}

pub async fn update() -> anyhow::Result<()> {
    let url = format!("{RELEASE_BASE}/ferryman_linux_{}", release_suffix()?);
    info!(%url, "downloading the latest binary");

    let response = reqwest::get(&url).await.context("download latest binary")?;
    anyhow::ensure!(
        response.status().is_success(),
        "bad status: {}",
        response.status()
    );
    let payload = response.bytes().await.context("read release body")?;

    let current = std::env::current_exe().context("locate current binary")?;
    let mut staged = tempfile::NamedTempFile::new_in(
        current.parent().context("current binary has no parent directory")?,
    )
    .context("create staging file")?;
    staged.write_all(&payload).context("write staging file")?;
    staged
        .as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o755))
        .context("mark staging file executable")?;

    // Atomic swap on the same filesystem.
    staged.persist(&current).context("replace current binary")?;
    info!(path = %current.display(), "update completed");

    let _ = Command::new(&current).arg("--version").status();
    info!("if you use systemd, run: systemctl restart ferryman.service");
    Ok(())
}
