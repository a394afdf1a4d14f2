//! Tunnel binary bootstrap: find `cloudflared` on PATH or download the
//! release asset for this platform, validate it, and verify it runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ServiceError;

const RELEASE_BASE: &str =
    "https://github.com/cloudflare/cloudflared/releases/latest/download";
const VERSION_PROBE_TIMEOUT_SECS: u64 = 5;

/// Locate a working tunnel binary, downloading one if necessary.
///
/// Resolution order: `cloudflared` on PATH, a previously installed copy
/// under the data dir, then a fresh download (with one alternate-arch
/// retry when the asset does not look like an executable).
pub async fn ensure_binary(data_dir: &Path) -> Result<PathBuf> {
    let on_path = PathBuf::from("cloudflared");
    if verify(&on_path).await {
        return Ok(on_path);
    }

    let installed = install_path(data_dir);
    if installed.exists() && verify(&installed).await {
        return Ok(installed);
    }

    download_and_install(data_dir).await
}

fn install_path(data_dir: &Path) -> PathBuf {
    let name = if cfg!(windows) { "cloudflared.exe" } else { "cloudflared" };
    data_dir.join("bin").join(name)
}

/// Run `<bin> version` and require a clean exit within the probe timeout.
async fn verify(binary: &Path) -> bool {
    let probe = Command::new(binary)
        .arg("version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    matches!(
        tokio::time::timeout(Duration::from_secs(VERSION_PROBE_TIMEOUT_SECS), probe).await,
        Ok(Ok(status)) if status.success()
    )
}

/// The release asset names for this platform: `(primary, alternate_arch)`.
fn asset_names() -> (String, String) {
    let (os, ext) = if cfg!(windows) {
        ("windows", ".exe")
    } else if cfg!(target_os = "macos") {
        ("darwin", "")
    } else {
        ("linux", "")
    };

    let arm = if cfg!(windows) {
        // On Windows a 32-bit process sees the emulated architecture in
        // PROCESSOR_ARCHITECTURE; PROCESSOR_ARCHITEW6432 carries the real
        // one. Check both for ARM64.
        let native = std::env::var("PROCESSOR_ARCHITECTURE").unwrap_or_default();
        let wow = std::env::var("PROCESSOR_ARCHITEW6432").unwrap_or_default();
        native.eq_ignore_ascii_case("arm64") || wow.eq_ignore_ascii_case("arm64")
    } else {
        std::env::consts::ARCH == "aarch64"
    };

    let (primary, alternate) = if arm { ("arm64", "amd64") } else { ("amd64", "arm64") };
    (
        format!("cloudflared-{os}-{primary}{ext}"),
        format!("cloudflared-{os}-{alternate}{ext}"),
    )
}

async fn download_and_install(data_dir: &Path) -> Result<PathBuf> {
    let (primary, alternate) = asset_names();

    let bytes = match fetch_asset(&primary).await {
        Ok(bytes) => bytes,
        Err(e) => {
            // One retry against the other architecture — arch detection can
            // be wrong under emulation.
            warn!(asset = %primary, err = %e, "download failed — trying alternate arch");
            fetch_asset(&alternate).await.map_err(|e| {
                ServiceError::Upstream(format!("tunnel binary unavailable: {e}"))
            })?
        }
    };

    let target = install_path(data_dir);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, &bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&target).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&target, perms).await?;
    }

    if !verify(&target).await {
        let _ = tokio::fs::remove_file(&target).await;
        return Err(ServiceError::Upstream(
            "downloaded tunnel binary failed its version probe".into(),
        )
        .into());
    }

    info!(path = %target.display(), "tunnel binary installed");
    Ok(target)
}

async fn fetch_asset(asset: &str) -> Result<Vec<u8>> {
    let url = format!("{RELEASE_BASE}/{asset}");
    info!(url = %url, "downloading tunnel binary");

    let client = reqwest::Client::builder()
        .user_agent(concat!("otgd/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let response = client.get(&url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?.to_vec();

    if bytes.is_empty() {
        anyhow::bail!("empty asset");
    }
    if !looks_like_executable(&bytes) {
        anyhow::bail!("asset does not look like a {} executable", std::env::consts::OS);
    }
    Ok(bytes)
}

/// Platform-appropriate header check on the downloaded bytes.
fn looks_like_executable(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    if cfg!(windows) {
        // PE: "MZ" at offset 0.
        return bytes.starts_with(b"MZ");
    }
    if cfg!(target_os = "macos") {
        // Mach-O thin or universal magic.
        return matches!(
            &bytes[..4],
            [0xcf, 0xfa, 0xed, 0xfe] | [0xfe, 0xed, 0xfa, 0xcf] | [0xca, 0xfe, 0xba, 0xbe]
        );
    }
    bytes.starts_with(&[0x7f, b'E', b'L', b'F'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_names_pair_architectures() {
        let (primary, alternate) = asset_names();
        assert_ne!(primary, alternate);
        assert!(primary.starts_with("cloudflared-"));
        let archs = ["amd64", "arm64"];
        assert!(archs.iter().any(|a| primary.contains(a)));
        assert!(archs.iter().any(|a| alternate.contains(a)));
    }

    #[test]
    fn executable_header_checks() {
        assert!(!looks_like_executable(b""));
        assert!(!looks_like_executable(b"<html>not found</html>"));
        #[cfg(all(unix, not(target_os = "macos")))]
        assert!(looks_like_executable(&[0x7f, b'E', b'L', b'F', 0, 0]));
        #[cfg(windows)]
        assert!(looks_like_executable(b"MZ\x90\x00"));
    }

    #[tokio::test]
    async fn verify_fails_for_missing_binary() {
        assert!(!verify(Path::new("/definitely/not/a/binary")).await);
    }
}
