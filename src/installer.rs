//! Downloads distributions into `bin/<module>/<version>/` on a background task.
//!
//! The worker reports through a one-way channel of [`InstallEvent`]s and checks
//! its [`CancellationToken`] between chunks and around extraction. A write in
//! flight is never interrupted; the version being installed when cancellation
//! is noticed is removed.

use flate2::read::GzDecoder;
use futures_util::StreamExt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tar::Archive;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

use crate::catalog::Catalog;
use crate::error::{PanelError, Result};
use crate::module::{InstallRef, ModuleKind};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub kind: ModuleKind,
    pub version: String,
    /// `http(s)://`, `file://` or a plain filesystem path.
    pub url: String,
    /// Expected size, used for progress when the server sends no length.
    pub size: u64,
}

impl InstallRequest {
    pub fn new(kind: ModuleKind, version: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind,
            version: version.into(),
            url: url.into(),
            size: 0,
        }
    }

    /// Look the download up in the catalog.
    pub fn from_catalog(catalog: &Catalog, kind: ModuleKind, version: &str) -> Result<Self> {
        let entry = catalog.require(kind, version)?;
        Ok(Self {
            kind,
            version: version.to_string(),
            url: entry.url.clone(),
            size: entry.size,
        })
    }

    fn label(&self) -> String {
        format!("{} {}", self.kind, self.version)
    }
}

#[derive(Debug)]
pub enum InstallEvent {
    Status(String),
    /// Overall percentage across every requested version.
    Progress(u8),
    Finished(Result<Vec<InstallRef>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    fn detect(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".zip") {
            Some(Self::Zip)
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }

    fn temp_name(&self) -> &'static str {
        match self {
            Self::Zip => "temp.zip",
            Self::TarGz => "temp.tar.gz",
        }
    }
}

/// Percentage reached after `fraction` of version `index` out of `total`.
pub fn weighted_progress(index: usize, total: usize, fraction: f64) -> u8 {
    if total == 0 {
        return 100;
    }
    let fraction = fraction.clamp(0.0, 1.0);
    let percent = (index as f64 + fraction) / total as f64 * 100.0;
    percent.floor().min(100.0) as u8
}

/// A spawned installation: its event stream and task handle.
pub struct InstallTask {
    pub events: mpsc::Receiver<InstallEvent>,
    pub handle: JoinHandle<()>,
}

pub struct InstallWorker {
    bin_dir: PathBuf,
    cancel: CancellationToken,
}

impl InstallWorker {
    pub fn new(bin_dir: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            cancel,
        }
    }

    pub fn spawn(self, requests: Vec<InstallRequest>) -> InstallTask {
        let (tx, events) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            let result = self.run(&requests, &tx).await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Installation ended with an error");
            }
            let _ = tx.send(InstallEvent::Finished(result)).await;
        });
        InstallTask { events, handle }
    }

    async fn run(
        &self,
        requests: &[InstallRequest],
        tx: &mpsc::Sender<InstallEvent>,
    ) -> Result<Vec<InstallRef>> {
        tokio::fs::create_dir_all(&self.bin_dir).await?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("peresvet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PanelError::InstallationFailed {
                component: "installer".to_string(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        let total = requests.len();
        let mut installed = Vec::with_capacity(total);
        for (index, request) in requests.iter().enumerate() {
            let version_dir = self
                .bin_dir
                .join(request.kind.as_str())
                .join(&request.version);

            if has_entries(&version_dir) {
                send(tx, InstallEvent::Status(format!("{} is already installed", request.label()))).await;
                installed.push(InstallRef::new(
                    request.version.clone(),
                    request.kind.install_root(&version_dir, &request.version),
                ));
                send(tx, InstallEvent::Progress(weighted_progress(index + 1, total, 0.0))).await;
                continue;
            }

            match self
                .install_one(&client, request, &version_dir, index, total, tx)
                .await
            {
                Ok(install) => {
                    tracing::info!(module = %request.kind, version = %request.version, "Installed");
                    installed.push(install);
                }
                Err(e) => {
                    if let Err(cleanup) = remove_dir_if_exists(&version_dir).await {
                        tracing::warn!(path = %version_dir.display(), error = %cleanup, "Failed to clean up");
                    }
                    return Err(e);
                }
            }
        }

        send(tx, InstallEvent::Progress(100)).await;
        Ok(installed)
    }

    async fn install_one(
        &self,
        client: &reqwest::Client,
        request: &InstallRequest,
        version_dir: &Path,
        index: usize,
        total: usize,
        tx: &mpsc::Sender<InstallEvent>,
    ) -> Result<InstallRef> {
        let format =
            ArchiveFormat::detect(&request.url).ok_or_else(|| PanelError::InstallationFailed {
                component: request.label(),
                reason: format!("unsupported archive type: {}", request.url),
            })?;

        tokio::fs::create_dir_all(version_dir).await?;
        let archive = version_dir.join(format.temp_name());

        send(tx, InstallEvent::Status(format!("Downloading {}...", request.label()))).await;
        self.download(client, request, &archive, |fraction| {
            // downloading is the first 90% of a version's share
            weighted_progress(index, total, fraction * 0.9)
        }, tx)
        .await?;
        self.check_cancelled()?;

        send(tx, InstallEvent::Status(format!("Extracting {}...", request.label()))).await;
        let (from, into) = (archive.clone(), version_dir.to_path_buf());
        tokio::task::spawn_blocking(move || extract(format, &from, &into))
            .await
            .map_err(|e| PanelError::InstallationFailed {
                component: request.label(),
                reason: format!("extraction task failed: {}", e),
            })?
            .map_err(|e| PanelError::InstallationFailed {
                component: request.label(),
                reason: format!("failed to extract archive: {}", e),
            })?;
        self.check_cancelled()?;

        tokio::fs::remove_file(&archive).await?;
        send(tx, InstallEvent::Progress(weighted_progress(index + 1, total, 0.0))).await;

        Ok(InstallRef::new(
            request.version.clone(),
            request.kind.install_root(version_dir, &request.version),
        ))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PanelError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn download(
        &self,
        client: &reqwest::Client,
        request: &InstallRequest,
        dest: &Path,
        progress: impl Fn(f64) -> u8,
        tx: &mpsc::Sender<InstallEvent>,
    ) -> Result<()> {
        self.check_cancelled()?;
        let failed = |reason: String| PanelError::InstallationFailed {
            component: request.label(),
            reason,
        };

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        let mut last_percent = None;
        let mut report = |written: u64, total: u64| {
            if total == 0 {
                return None;
            }
            let percent = progress(written as f64 / total as f64);
            if last_percent == Some(percent) {
                return None;
            }
            last_percent = Some(percent);
            Some(percent)
        };

        if let Some(source) = local_source(&request.url) {
            let mut input = tokio::fs::File::open(&source)
                .await
                .map_err(|e| failed(format!("cannot open {}: {}", source.display(), e)))?;
            let total = input.metadata().await.map(|m| m.len()).unwrap_or(request.size);
            let mut buffer = vec![0u8; CHUNK_SIZE];
            loop {
                self.check_cancelled()?;
                let read = input.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                file.write_all(&buffer[..read]).await?;
                written += read as u64;
                if let Some(percent) = report(written, total) {
                    send(tx, InstallEvent::Progress(percent)).await;
                }
            }
        } else {
            let response = client
                .get(&request.url)
                .send()
                .await
                .map_err(|e| failed(format!("download failed: {}", e)))?;
            if !response.status().is_success() {
                return Err(failed(format!("server returned {}", response.status())));
            }

            let total = response.content_length().unwrap_or(request.size);
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                self.check_cancelled()?;
                let chunk = chunk.map_err(|e| failed(format!("error reading download: {}", e)))?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
                if let Some(percent) = report(written, total) {
                    send(tx, InstallEvent::Progress(percent)).await;
                }
            }
        }

        file.flush().await?;
        tracing::debug!(url = %request.url, bytes = written, "Download complete");
        Ok(())
    }
}

async fn send(tx: &mpsc::Sender<InstallEvent>, event: InstallEvent) {
    // the receiver may have gone away; the install still completes
    let _ = tx.send(event).await;
}

fn local_source(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return None;
    }
    Some(PathBuf::from(url))
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

async fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn extract(format: ArchiveFormat, archive: &Path, dest: &Path) -> io::Result<()> {
    let file = File::open(archive)?;
    match format {
        ArchiveFormat::TarGz => Archive::new(GzDecoder::new(file)).unpack(dest),
        ArchiveFormat::Zip => extract_zip(file, dest),
    }
}

fn extract_zip(file: File, dest: &Path) -> io::Result<()> {
    let mut archive = ZipArchive::new(file).map_err(io::Error::other)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(io::Error::other)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(name = entry.name(), "Skipping zip entry outside the target");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn zip_fixture(path: &Path, files: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in files {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn tar_gz_fixture(path: &Path, files: &[(&str, &str)]) {
        let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    async fn drain(mut task: InstallTask) -> (Vec<String>, Vec<u8>, Result<Vec<InstallRef>>) {
        let mut statuses = Vec::new();
        let mut progress = Vec::new();
        while let Some(event) = task.events.recv().await {
            match event {
                InstallEvent::Status(s) => statuses.push(s),
                InstallEvent::Progress(p) => progress.push(p),
                InstallEvent::Finished(result) => {
                    task.handle.await.unwrap();
                    return (statuses, progress, result);
                }
            }
        }
        panic!("worker exited without a Finished event");
    }

    #[test]
    fn progress_is_weighted_per_version() {
        assert_eq!(weighted_progress(0, 4, 0.0), 0);
        assert_eq!(weighted_progress(0, 4, 0.5), 12);
        assert_eq!(weighted_progress(1, 4, 0.0), 25);
        assert_eq!(weighted_progress(3, 4, 1.0), 100);
        assert_eq!(weighted_progress(2, 2, 3.0), 100);
        assert_eq!(weighted_progress(0, 0, 0.0), 100);
    }

    #[test]
    fn archive_format_follows_url_suffix() {
        assert_eq!(ArchiveFormat::detect("https://x/php-8.2.12.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect("https://x/redis.tar.gz?dl=1"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect("/tmp/nginx.TGZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect("https://x/setup.msi"), None);
    }

    #[tokio::test]
    async fn installs_zip_and_tarball_and_removes_archives() {
        let dir = tempfile::tempdir().unwrap();
        let php_zip = dir.path().join("php.zip");
        zip_fixture(&php_zip, &[("php-cgi.exe", "bin"), ("ext/php_pdo.dll", "ext")]);
        let nginx_tgz = dir.path().join("nginx.tar.gz");
        tar_gz_fixture(&nginx_tgz, &[("nginx-1.24.0/conf/nginx.conf", "events {}")]);

        let bin = dir.path().join("bin");
        let requests = vec![
            InstallRequest::new(ModuleKind::Php, "8.2.12", php_zip.display().to_string()),
            InstallRequest::new(
                ModuleKind::Nginx,
                "1.24.0",
                format!("file://{}", nginx_tgz.display()),
            ),
        ];
        let task = InstallWorker::new(&bin, CancellationToken::new()).spawn(requests);
        let (statuses, progress, result) = drain(task).await;

        let installed = result.unwrap();
        assert_eq!(installed.len(), 2);
        assert_eq!(installed[1].root, bin.join("nginx/1.24.0/nginx-1.24.0"));

        assert!(bin.join("php/8.2.12/ext/php_pdo.dll").is_file());
        assert!(bin.join("nginx/1.24.0/nginx-1.24.0/conf/nginx.conf").is_file());
        assert!(!bin.join("php/8.2.12/temp.zip").exists());
        assert!(!bin.join("nginx/1.24.0/temp.tar.gz").exists());

        assert_eq!(statuses[0], "Downloading php 8.2.12...");
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100));
    }

    #[tokio::test]
    async fn cancellation_removes_the_version_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("redis.zip");
        zip_fixture(&archive, &[("redis-server.exe", "bin")]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let bin = dir.path().join("bin");
        let task = InstallWorker::new(&bin, cancel).spawn(vec![InstallRequest::new(
            ModuleKind::Redis,
            "5.0.14",
            archive.display().to_string(),
        )]);
        let (_, _, result) = drain(task).await;

        assert!(matches!(result, Err(PanelError::Cancelled)));
        assert!(!bin.join("redis/5.0.14").exists());
    }

    #[tokio::test]
    async fn existing_install_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(bin.join("mysql/8.0.36/bin")).unwrap();

        let task = InstallWorker::new(&bin, CancellationToken::new()).spawn(vec![
            InstallRequest::new(ModuleKind::Mysql, "8.0.36", "/does/not/exist.zip"),
        ]);
        let (statuses, _, result) = drain(task).await;

        assert_eq!(result.unwrap()[0].version, "8.0.36");
        assert_eq!(statuses, vec!["mysql 8.0.36 is already installed".to_string()]);
    }

    #[tokio::test]
    async fn failures_leave_no_partial_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let bogus = dir.path().join("broken.zip");
        std::fs::write(&bogus, b"not a zip").unwrap();

        let task = InstallWorker::new(&bin, CancellationToken::new()).spawn(vec![
            InstallRequest::new(ModuleKind::Php, "8.3.4", bogus.display().to_string()),
        ]);
        let (_, _, result) = drain(task).await;

        assert!(matches!(result, Err(PanelError::InstallationFailed { .. })));
        assert!(!bin.join("php/8.3.4").exists());

        let task = InstallWorker::new(&bin, CancellationToken::new()).spawn(vec![
            InstallRequest::new(ModuleKind::Php, "8.3.4", "https://example.test/php.msi"),
        ]);
        let (_, _, result) = drain(task).await;
        assert!(result.unwrap_err().to_string().contains("unsupported archive type"));
    }
}
