//! Local administrative channel.
//!
//! Length-delimited frames carrying bincode `AdminCommand`s, answered with
//! one `AdminResponse` each. Bound to loopback only.

use crate::config::AdminConfig;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use harvester_persistence::{JobStore, NewJob, StoreStats};
use harvester_protocol::{AdminCommand, AdminResponse, StatusReport};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};
use zip::write::FileOptions;
use zip::{AesMode, CompressionMethod, ZipWriter};

pub struct AdminServer {
    store: Arc<JobStore>,
    listener: TcpListener,
}

impl AdminServer {
    /// Bind the listener and publish its port in the port file
    pub async fn bind(store: Arc<JobStore>, config: &AdminConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
        let port = listener.local_addr()?.port();

        if let Some(parent) = config.port_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&config.port_file, port.to_string())?;

        info!("Admin channel listening on 127.0.0.1:{}", port);
        Ok(AdminServer { store, listener })
    }

    pub fn port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            debug!("Admin connection from {}", peer);

            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, store).await {
                    warn!("Admin connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection(socket: TcpStream, store: Arc<JobStore>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match AdminCommand::from_bytes(&frame) {
            Ok(command) => execute(&store, command).await,
            Err(e) => AdminResponse::Failed {
                command: "unknown".to_string(),
                message: format!("malformed command: {}", e),
            },
        };

        framed.send(Bytes::from(response.to_bytes()?)).await?;
    }

    Ok(())
}

/// Run one command against the store
pub async fn execute(store: &Arc<JobStore>, command: AdminCommand) -> AdminResponse {
    let name = command.name().to_string();

    let result = match command {
        AdminCommand::Status => store
            .stats()
            .map(|stats| AdminResponse::Status(status_report(stats)))
            .map_err(|e| e.to_string()),
        AdminCommand::Upload { keys } => upload(store, keys),
        AdminCommand::Download { filename, password } => {
            let store = store.clone();
            let password = password.filter(|p| !p.is_empty());
            tokio::task::spawn_blocking(move || {
                write_archive(&store, Path::new(&filename), password.as_deref())
            })
            .await
            .map_err(|e| e.to_string())
            .and_then(|written| written)
            .map(|affected| AdminResponse::Done {
                command: name.clone(),
                affected,
            })
        }
    };

    match result {
        Ok(response) => response,
        Err(message) => {
            error!(command = %name, "Admin command failed: {}", message);
            AdminResponse::Failed {
                command: name,
                message,
            }
        }
    }
}

fn upload(store: &JobStore, keys: Vec<String>) -> Result<AdminResponse, String> {
    let items: Vec<NewJob> = keys
        .iter()
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .map(NewJob::local)
        .collect();

    let inserted = store.insert_tasks(&items).map_err(|e| e.to_string())?;
    info!(received = keys.len(), inserted, "Uploaded keys");

    Ok(AdminResponse::Done {
        command: "upload".to_string(),
        affected: inserted as u64,
    })
}

/// Write every stored payload into a zip archive as `<key>.png`, AES-256
/// encrypted when a password is given
fn write_archive(store: &JobStore, path: &Path, password: Option<&str>) -> Result<u64, String> {
    let jobs = store.jobs_with_payload().map_err(|e| e.to_string())?;

    let file = File::create(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    let mut zip = ZipWriter::new(file);

    let mut options = FileOptions::<()>::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    if let Some(password) = password {
        options = options.with_aes_encryption(AesMode::Aes256, password);
    }

    let mut written = 0;
    for job in &jobs {
        let Some(payload) = &job.payload else {
            continue;
        };

        let entry = format!("{}.png", job.key);
        zip.start_file(entry.as_str(), options)
            .map_err(|e| format!("cannot add {}: {}", entry, e))?;
        zip.write_all(payload)
            .map_err(|e| format!("cannot write {}: {}", entry, e))?;
        written += 1;
    }

    zip.finish().map_err(|e| e.to_string())?;

    info!(
        archive = %path.display(),
        files = written,
        encrypted = password.is_some(),
        "Archive written"
    );
    Ok(written)
}

fn status_report(stats: StoreStats) -> StatusReport {
    StatusReport {
        total: stats.total,
        local: stats.local,
        remote: stats.remote,
        created: stats.created,
        in_work: stats.in_work,
        completed: stats.completed,
        second_check: stats.second_check,
        error: stats.error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_core::JobOutcome;
    use harvester_persistence::JobStoreConfig;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn open_store(dir: &TempDir) -> Arc<JobStore> {
        Arc::new(
            JobStore::open(JobStoreConfig {
                data_dir: dir.path().join("data"),
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_upload_and_status() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let response = execute(
            &store,
            AdminCommand::Upload {
                keys: vec!["79990001122\n".to_string(), "79990001122".to_string(), "".to_string()],
            },
        )
        .await;
        assert_eq!(
            response,
            AdminResponse::Done {
                command: "upload".to_string(),
                affected: 1
            }
        );

        match execute(&store, AdminCommand::Status).await {
            AdminResponse::Status(report) => {
                assert_eq!(report.total, 1);
                assert_eq!(report.local, 1);
                assert_eq!(report.created, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    fn store_with_result(dir: &TempDir) -> Arc<JobStore> {
        let store = open_store(dir);
        store.insert_tasks(&[NewJob::local("79990001122"), NewJob::local("2")]).unwrap();
        store.mark_in_work("79990001122").unwrap();
        store
            .mark_outcome("79990001122", JobOutcome::success(Some(b"png-bytes".to_vec())))
            .unwrap();
        store
    }

    async fn download(store: &Arc<JobStore>, archive: &Path, password: Option<&str>) -> AdminResponse {
        execute(
            store,
            AdminCommand::Download {
                filename: archive.to_string_lossy().to_string(),
                password: password.map(str::to_string),
            },
        )
        .await
    }

    #[tokio::test]
    async fn test_download_archive() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_result(&temp_dir);

        let archive = temp_dir.path().join("out.zip");
        assert_eq!(
            download(&store, &archive, None).await,
            AdminResponse::Done {
                command: "download".to_string(),
                affected: 1
            }
        );

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);

        let mut entry = zip.by_name("79990001122.png").unwrap();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"png-bytes".to_vec());
    }

    #[tokio::test]
    async fn test_download_with_password_is_encrypted() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_result(&temp_dir);

        let archive = temp_dir.path().join("secret.zip");
        assert!(matches!(
            download(&store, &archive, Some("s3cret")).await,
            AdminResponse::Done { affected: 1, .. }
        ));

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert!(zip.by_name("79990001122.png").is_err());

        let mut entry = zip.by_name_decrypt("79990001122.png", b"s3cret").unwrap();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"png-bytes".to_vec());
    }

    #[tokio::test]
    async fn test_empty_password_writes_plain_archive() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_result(&temp_dir);

        let archive = temp_dir.path().join("plain.zip");
        download(&store, &archive, Some("")).await;

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert!(zip.by_name("79990001122.png").is_ok());
    }

    #[tokio::test]
    async fn test_unwritable_archive_fails() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_result(&temp_dir);

        let archive = temp_dir.path().join("missing").join("out.zip");
        assert!(matches!(
            download(&store, &archive, None).await,
            AdminResponse::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_server_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let config = AdminConfig {
            enabled: true,
            port: 0,
            port_file: temp_dir.path().join("comm").join("port"),
        };

        let server = AdminServer::bind(store, &config).await.unwrap();
        let port = server.port().unwrap();
        assert_eq!(
            std::fs::read_to_string(&config.port_file).unwrap(),
            port.to_string()
        );
        tokio::spawn(server.run());

        let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut framed = Framed::new(socket, LengthDelimitedCodec::new());

        framed
            .send(Bytes::from(AdminCommand::Status.to_bytes().unwrap()))
            .await
            .unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        let response = AdminResponse::from_bytes(&frame).unwrap();
        assert_eq!(response, AdminResponse::Status(StatusReport::default()));

        framed.send(Bytes::from_static(b"\xff\xff")).await.unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        assert!(matches!(
            AdminResponse::from_bytes(&frame).unwrap(),
            AdminResponse::Failed { .. }
        ));
    }
}
