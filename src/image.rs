//! Base image preparation: download into the per-user cache, and one-shot
//! format conversion with `qemu-img`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, VmforkError};
use crate::process;

/// Disk formats the providers consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Virtualization.framework wants a raw image.
    Raw,
    Qcow2,
    Vhdx,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhdx => "vhdx",
        }
    }

    /// Guess from a file extension (`.img` counts as raw).
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "raw" | "img" => Some(ImageFormat::Raw),
            "qcow2" => Some(ImageFormat::Qcow2),
            "vhdx" => Some(ImageFormat::Vhdx),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = VmforkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            "vhdx" => Ok(ImageFormat::Vhdx),
            other => Err(VmforkError::Validation {
                message: format!("unknown image format '{other}' (expected raw, qcow2 or vhdx)"),
            }),
        }
    }
}

/// Cache file name for `url`: its last path segment, query stripped.
pub fn file_name_for(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "image.img".to_string(),
    }
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Download a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(path: &Path, response: reqwest::Response, pb: &ProgressBar) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VmforkError::io(format!("creating {}", path.display()), e))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VmforkError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| VmforkError::io("writing image data", e))?;
        pb.inc(chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|e| VmforkError::io("flushing image file", e))
}

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => tracing::debug!(error = %e, "progress template rejected"),
    }
    pb
}

/// Make `source` available locally. Local paths must exist; URLs are
/// downloaded into `cache_dir` once and reused afterwards.
pub async fn fetch(source: &str, cache_dir: &Path) -> Result<PathBuf> {
    if !is_url(source) {
        let path = PathBuf::from(source);
        if !path.is_file() {
            return Err(VmforkError::Validation {
                message: format!("base image {} does not exist", path.display()),
            });
        }
        return Ok(path);
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| VmforkError::io(format!("creating cache dir {}", cache_dir.display()), e))?;

    let dest = cache_dir.join(file_name_for(source));
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached base image");
        return Ok(dest);
    }

    tracing::info!(url = %source, "downloading base image");
    let response = reqwest::get(source)
        .await
        .map_err(|e| VmforkError::ImageDownload {
            message: format!("request to {source} failed"),
            source: Box::new(e),
        })?;
    if !response.status().is_success() {
        return Err(VmforkError::ImageDownload {
            message: format!("HTTP {} from {source}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let pb = progress_bar(response.content_length().unwrap_or(0));
    let partial = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&partial).await;

    if let Err(e) = download_to_file(&partial, response, &pb).await {
        let _ = tokio::fs::remove_file(&partial).await;
        pb.abandon();
        return Err(e);
    }
    tokio::fs::rename(&partial, &dest)
        .await
        .map_err(|e| VmforkError::io(format!("renaming {}", partial.display()), e))?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "base image cached");
    Ok(dest)
}

pub fn convert_args(src: &Path, dst: &Path, format: ImageFormat) -> Vec<String> {
    vec![
        "convert".into(),
        "-O".into(),
        format.as_str().into(),
        src.display().to_string(),
        dst.display().to_string(),
    ]
}

/// Convert `src` into `dst`. Without an explicit format, the destination's
/// extension decides.
pub async fn convert(src: &Path, dst: &Path, format: Option<ImageFormat>) -> Result<PathBuf> {
    let format = match format.or_else(|| ImageFormat::from_path(dst)) {
        Some(f) => f,
        None => {
            return Err(VmforkError::Validation {
                message: format!(
                    "cannot tell the format of {} from its extension; pass --format",
                    dst.display()
                ),
            });
        }
    };
    if !src.is_file() {
        return Err(VmforkError::Validation {
            message: format!("source image {} does not exist", src.display()),
        });
    }

    let partial = dst.with_extension(format!("{format}.part"));
    let _ = tokio::fs::remove_file(&partial).await;
    tracing::info!(src = %src.display(), dst = %dst.display(), %format, "converting image");
    if let Err(e) = process::run("qemu-img", convert_args(src, &partial, format)).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, dst)
        .await
        .map_err(|e| VmforkError::io(format!("renaming {}", partial.display()), e))?;
    Ok(dst.to_path_buf())
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_names_come_from_the_url_path() {
        assert_eq!(
            file_name_for("https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"),
            "noble-server-cloudimg-amd64.img"
        );
        assert_eq!(file_name_for("https://example.com/a.qcow2?sig=abc"), "a.qcow2");
        assert_eq!(file_name_for("https://example.com/"), "image.img");
    }

    #[test]
    fn formats_from_extensions() {
        assert_eq!(ImageFormat::from_path(Path::new("a.img")), Some(ImageFormat::Raw));
        assert_eq!(ImageFormat::from_path(Path::new("a.QCOW2")), Some(ImageFormat::Qcow2));
        assert_eq!(ImageFormat::from_path(Path::new("a.vhdx")), Some(ImageFormat::Vhdx));
        assert_eq!(ImageFormat::from_path(Path::new("a.iso")), None);
        assert!("vmdk".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn convert_invocation() {
        let args = convert_args(Path::new("/c/base.img"), Path::new("/c/base.vhdx"), ImageFormat::Vhdx);
        assert_eq!(args, vec!["convert", "-O", "vhdx", "/c/base.img", "/c/base.vhdx"]);
    }

    #[tokio::test]
    async fn local_paths_are_used_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let img = tmp.path().join("base.img");
        std::fs::write(&img, "x").unwrap();
        let got = fetch(img.to_str().unwrap(), &tmp.path().join("cache")).await.unwrap();
        assert_eq!(got, img);
        assert!(!tmp.path().join("cache").exists());

        assert!(fetch("/no/such/image.img", tmp.path()).await.is_err());
    }

    #[tokio::test]
    async fn convert_needs_a_known_format() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("base.img");
        std::fs::write(&src, "x").unwrap();
        let err = convert(&src, &tmp.path().join("out.bin"), None).await.unwrap_err();
        assert!(matches!(err, VmforkError::Validation { .. }));
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
