//! File transfer on top of presence, signaling and handshakes
//!
//! Sending: hand-shake with the chosen peer, then frame and send each file on
//! the returned channel. A failing file is reported without stopping the rest.
//!
//! Receiving: decode each inbound frame, stage it next to the download
//! directory, ask the prompt, and either keep or discard it.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, RetryConfig};
use crate::error::{OrchestratorError, SignalingError, TransferError};
use crate::framing::{DecodedFile, FileFramer, FileMetadata};
use crate::presence::PresenceDirectory;
use crate::webrtc::{
    Connector, CoordinatorPool, HandshakeCoordinator, Peer, ReliableChannel, SessionEvent,
    SignalingChannel, SignalingTransport, DEFAULT_OPEN_TIMEOUT,
};

const MAX_NAME_ATTEMPTS: usize = 1000;

/// How long a send waits for queued frames to leave the channel
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Where an outgoing file's content comes from
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Bytes(Bytes),
}

/// A file selected for sending
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub content_type: Option<String>,
    pub source: FileSource,
}

impl OutgoingFile {
    /// File on disk; the type is derived from the extension when known
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        Self {
            content_type: crate::mime::content_type_for(&name).map(String::from),
            name,
            source: FileSource::Path(path),
        }
    }

    pub fn from_bytes(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let name = name.into();
        Self {
            content_type: crate::mime::content_type_for(&name).map(String::from),
            name,
            source: FileSource::Bytes(content.into()),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    async fn read(&self) -> io::Result<Bytes> {
        match &self.source {
            FileSource::Path(path) => tokio::fs::read(path).await.map(Bytes::from),
            FileSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Outcome of sending a batch
#[derive(Debug, Default)]
pub struct SendReport {
    pub sent: Vec<String>,
    pub failed: Vec<(String, TransferError)>,
}

impl SendReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Hand-shake with `peer` and send `files` over the resulting channel
pub async fn send_files(
    coordinator: &HandshakeCoordinator,
    framer: &FileFramer,
    peer: &Peer,
    files: &[OutgoingFile],
) -> Result<SendReport, TransferError> {
    let channel = coordinator.handshake(peer).await?;
    let report = send_over(&channel, framer, files).await;
    if !report.sent.is_empty() && !channel.drained(DRAIN_TIMEOUT).await {
        warn!(
            "Data for {} still queued after {:?}",
            peer.name, DRAIN_TIMEOUT
        );
    }
    Ok(report)
}

/// Send each file as one frame. Per-file failures are collected.
pub async fn send_over(
    channel: &ReliableChannel,
    framer: &FileFramer,
    files: &[OutgoingFile],
) -> SendReport {
    let mut report = SendReport::default();
    for file in files {
        match send_one(channel, framer, file).await {
            Ok(len) => {
                info!(
                    "Sent {} ({} byte frame) to {}",
                    file.name,
                    len,
                    channel.peer().name
                );
                report.sent.push(file.name.clone());
            }
            Err(e) => {
                warn!("{}", e);
                report.failed.push((file.name.clone(), e));
            }
        }
    }
    report
}

async fn send_one(
    channel: &ReliableChannel,
    framer: &FileFramer,
    file: &OutgoingFile,
) -> Result<usize, TransferError> {
    let content = file.read().await.map_err(|source| TransferError::Read {
        name: file.name.clone(),
        source,
    })?;
    let frame = framer
        .encode_file(
            &file.name,
            content.len() as u64,
            file.content_type.as_deref(),
            &content,
        )
        .map_err(|source| TransferError::Frame {
            name: file.name.clone(),
            source,
        })?;

    let len = frame.len();
    channel
        .send(Bytes::from(frame))
        .await
        .map_err(|source| TransferError::Send {
            name: file.name.clone(),
            source,
        })?;
    Ok(len)
}

/// Asks the user whether to keep an incoming file
#[async_trait]
pub trait ReceivePrompt: Send + Sync {
    async fn confirm(&self, from: Option<&Peer>, metadata: &FileMetadata) -> bool;
}

pub struct AcceptAll;

#[async_trait]
impl ReceivePrompt for AcceptAll {
    async fn confirm(&self, _from: Option<&Peer>, _metadata: &FileMetadata) -> bool {
        true
    }
}

pub struct DeclineAll;

#[async_trait]
impl ReceivePrompt for DeclineAll {
    async fn confirm(&self, _from: Option<&Peer>, _metadata: &FileMetadata) -> bool {
        false
    }
}

/// Strip directories and characters unsafe in file names
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `name`, or `stem (n).ext` for n > 0
fn numbered(name: &str, n: usize) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", name, n),
    }
}

fn persist_unique(mut staged: NamedTempFile, dir: &Path, name: &str) -> io::Result<PathBuf> {
    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = dir.join(numbered(name, n));
        if candidate.exists() {
            continue;
        }
        match staged.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => staged = e.file,
            Err(e) => return Err(e.error),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}", name),
    ))
}

/// Download directory that stages, confirms and saves incoming files
#[derive(Debug, Clone)]
pub struct DownloadDir {
    dir: PathBuf,
}

impl DownloadDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Stage `file`, ask `prompt`, and keep it if accepted. The staged copy is
    /// always released. Returns the saved path, or `None` when declined.
    pub async fn receive(
        &self,
        from: Option<&Peer>,
        file: DecodedFile,
        prompt: &dyn ReceivePrompt,
    ) -> Result<Option<PathBuf>, TransferError> {
        let name = file.metadata.name.clone();
        let save_err = |source: io::Error| TransferError::Save {
            name: name.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(save_err)?;

        let dir = self.dir.clone();
        let content = file.content.clone();
        let staged = tokio::task::spawn_blocking(move || -> io::Result<NamedTempFile> {
            let mut tmp = tempfile::Builder::new()
                .prefix(".peerdrop-")
                .suffix(".part")
                .tempfile_in(&dir)?;
            tmp.write_all(&content)?;
            tmp.flush()?;
            Ok(tmp)
        })
        .await
        .map_err(|e| save_err(io::Error::other(e)))?
        .map_err(save_err)?;
        debug!("Staged {} at {}", name, staged.path().display());

        if !prompt.confirm(from, &file.metadata).await {
            info!("Declined {}", name);
            drop(staged);
            return Ok(None);
        }

        let dir = self.dir.clone();
        let target_name = sanitize_file_name(&name);
        let saved = tokio::task::spawn_blocking(move || persist_unique(staged, &dir, &target_name))
            .await
            .map_err(|e| save_err(io::Error::other(e)))?
            .map_err(save_err)?;

        info!("Saved {} to {}", name, saved.display());
        Ok(Some(saved))
    }
}

/// Transfer outcomes published by the orchestrator
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Received {
        from: Option<Peer>,
        metadata: FileMetadata,
        path: PathBuf,
    },
    Declined {
        from: Option<Peer>,
        metadata: FileMetadata,
    },
    /// Frame could not be decoded or saved
    Rejected { from: Option<Peer>, reason: String },
    SessionFailed { peer: Option<Peer>, error: String },
}

/// Orchestrator tunables
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub framer: FileFramer,
    pub download_dir: PathBuf,
    pub open_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            framer: FileFramer::default(),
            download_dir: Config::default().download_dir(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            framer: FileFramer::new(config.transfer.max_frame_bytes),
            download_dir: config.download_dir(),
            open_timeout: config.open_timeout(),
            retry: config.retry.clone(),
        }
    }
}

/// Brings a peer online and moves files in both directions
pub struct TransferOrchestrator {
    local: Peer,
    presence: Arc<PresenceDirectory>,
    signaling: Arc<SignalingTransport>,
    sessions: Arc<CoordinatorPool>,
    framer: FileFramer,
    downloads: Arc<DownloadDir>,
    prompt: Arc<dyn ReceivePrompt>,
    retry: RetryConfig,
    events: broadcast::Sender<TransferEvent>,
    session_events: Arc<Mutex<mpsc::UnboundedReceiver<SessionEvent>>>,
    inbound: Mutex<Option<JoinHandle<()>>>,
    departures: Mutex<Option<JoinHandle<()>>>,
}

impl TransferOrchestrator {
    pub fn new(
        local: Peer,
        presence: PresenceDirectory,
        signaling: Arc<dyn SignalingChannel>,
        connector: Arc<dyn Connector>,
        settings: TransferSettings,
        prompt: Arc<dyn ReceivePrompt>,
    ) -> Self {
        let signaling = Arc::new(SignalingTransport::new(local.clone(), signaling));
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(CoordinatorPool::new(
            signaling.clone(),
            connector,
            session_tx,
            settings.open_timeout,
        ));
        let (events, _) = broadcast::channel(64);

        Self {
            local,
            presence: Arc::new(presence),
            signaling,
            sessions,
            framer: settings.framer,
            downloads: Arc::new(DownloadDir::new(settings.download_dir)),
            prompt,
            retry: settings.retry,
            events,
            session_events: Arc::new(Mutex::new(session_rx)),
            inbound: Mutex::new(None),
            departures: Mutex::new(None),
        }
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    pub fn presence(&self) -> &PresenceDirectory {
        &self.presence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Join presence, then open our signaling inbox
    pub async fn connect(&self) -> Result<(), OrchestratorError> {
        self.presence.join(&self.local).await?;

        self.signaling.set_handler(self.sessions.clone()).await;
        if let Err(e) = self.connect_signaling().await {
            self.signaling.clear_handler().await;
            self.presence.leave().await;
            return Err(e.into());
        }

        let mut inbound = self.inbound.lock().await;
        if inbound.is_none() {
            *inbound = Some(tokio::spawn(run_inbound(
                self.session_events.clone(),
                self.sessions.clone(),
                self.framer,
                self.downloads.clone(),
                self.prompt.clone(),
                self.events.clone(),
            )));
        }
        drop(inbound);

        let mut departures = self.departures.lock().await;
        if departures.is_none() {
            *departures = Some(tokio::spawn(run_departures(
                self.presence.clone(),
                self.presence.departures(),
                self.sessions.clone(),
            )));
        }

        info!("{} is online", self.local.name);
        Ok(())
    }

    async fn connect_signaling(&self) -> Result<(), SignalingError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.signaling.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Signaling attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Leave presence, release signaling and close every session
    pub async fn disconnect(&self) {
        self.presence.leave().await;
        self.signaling.disconnect().await;
        self.signaling.clear_handler().await;
        self.sessions.close_all().await;
        if let Some(task) = self.departures.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.inbound.lock().await.take() {
            task.abort();
        }
        info!("{} is offline", self.local.name);
    }

    /// Online peers other than ourselves
    pub async fn peers(&self) -> Vec<Peer> {
        self.presence
            .members()
            .await
            .into_iter()
            .filter(|p| p.name != self.local.name)
            .collect()
    }

    pub async fn find_peer(&self, name: &str) -> Option<Peer> {
        self.presence.get(name).await
    }

    /// Peers we currently hold a handshake session with
    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    pub async fn send_files(
        &self,
        peer: &Peer,
        files: &[OutgoingFile],
    ) -> Result<SendReport, TransferError> {
        let coordinator = self.sessions.coordinator_for(&peer.name).await?;
        send_files(&coordinator, &self.framer, peer, files).await
    }
}

async fn run_inbound(
    session_events: Arc<Mutex<mpsc::UnboundedReceiver<SessionEvent>>>,
    sessions: Arc<CoordinatorPool>,
    framer: FileFramer,
    downloads: Arc<DownloadDir>,
    prompt: Arc<dyn ReceivePrompt>,
    events: broadcast::Sender<TransferEvent>,
) {
    let mut session_events = session_events.lock().await;
    while let Some(event) = session_events.recv().await {
        let outcome = match event {
            SessionEvent::Message { from, data } => {
                receive_frame(&framer, &downloads, prompt.as_ref(), from, &data).await
            }
            SessionEvent::Failed {
                peer,
                session,
                error,
            } => {
                if let Some(peer) = &peer {
                    sessions.release(&peer.name, session).await;
                }
                TransferEvent::SessionFailed { peer, error }
            }
            SessionEvent::Closed { peer, session } => {
                if let Some(peer) = &peer {
                    sessions.release(&peer.name, session).await;
                }
                continue;
            }
        };
        let _ = events.send(outcome);
    }
}

/// Drop the session of every peer that left presence
async fn run_departures(
    presence: Arc<PresenceDirectory>,
    mut departures: broadcast::Receiver<Vec<Peer>>,
    sessions: Arc<CoordinatorPool>,
) {
    loop {
        let departed = match departures.recv().await {
            Ok(departed) => departed,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} presence departure batch(es)", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        for peer in departed {
            // A rejoin may have landed in the meantime
            if presence.get(&peer.name).await.is_none() {
                debug!("{} left, closing its session", peer.name);
                sessions.remove(&peer.name).await;
            }
        }
    }
}

async fn receive_frame(
    framer: &FileFramer,
    downloads: &DownloadDir,
    prompt: &dyn ReceivePrompt,
    from: Option<Peer>,
    data: &[u8],
) -> TransferEvent {
    let sender = from
        .as_ref()
        .map(|p| p.name.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let file = match framer.decode(data) {
        Ok(file) => file,
        Err(e) => {
            warn!("Rejected frame from {}: {}", sender, e);
            return TransferEvent::Rejected {
                from,
                reason: e.to_string(),
            };
        }
    };
    info!(
        "Incoming {} ({} bytes, {}) from {}",
        file.metadata.name,
        file.metadata.size,
        file.metadata.content_type(),
        sender
    );

    let metadata = file.metadata.clone();
    match downloads.receive(from.as_ref(), file, prompt).await {
        Ok(Some(path)) => TransferEvent::Received {
            from,
            metadata,
            path,
        },
        Ok(None) => TransferEvent::Declined { from, metadata },
        Err(e) => {
            warn!("{}", e);
            TransferEvent::Rejected {
                from,
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn decoded(name: &str, content: &[u8]) -> DecodedFile {
        DecodedFile {
            metadata: FileMetadata::new(name, content.len() as u64, None),
            content: Bytes::copy_from_slice(content),
        }
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("notes.txt"), "notes.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name("what?.txt"), "what_.txt");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name("  "), "download");
    }

    #[test]
    fn test_numbered_names() {
        assert_eq!(numbered("notes.txt", 0), "notes.txt");
        assert_eq!(numbered("notes.txt", 2), "notes (2).txt");
        assert_eq!(numbered("Makefile", 1), "Makefile (1)");
        assert_eq!(numbered(".bashrc", 1), ".bashrc (1)");
    }

    #[test]
    fn test_outgoing_type_from_extension() {
        assert_eq!(
            OutgoingFile::from_path("/tmp/photo.png").content_type.as_deref(),
            Some("image/png")
        );
        assert_eq!(OutgoingFile::from_path("/tmp/photo.png").name, "photo.png");
        assert!(OutgoingFile::from_bytes("blob", vec![1u8]).content_type.is_none());
    }

    #[test]
    fn test_default_settings_match_default_config() {
        let defaults = TransferSettings::default();
        let from_config = TransferSettings::from_config(&Config::default());
        assert_eq!(defaults.open_timeout, DEFAULT_OPEN_TIMEOUT);
        assert_eq!(from_config.open_timeout, DEFAULT_OPEN_TIMEOUT);
        assert_eq!(defaults.download_dir, from_config.download_dir);
        assert_eq!(
            defaults.framer.max_frame_len(),
            from_config.framer.max_frame_len()
        );
        assert_eq!(defaults.retry.attempts, from_config.retry.attempts);
    }

    #[tokio::test]
    async fn test_accepted_file_saved_without_clobbering() {
        let temp = TempDir::new().unwrap();
        let downloads = DownloadDir::new(temp.path());

        let first = downloads
            .receive(None, decoded("notes.txt", b"one"), &AcceptAll)
            .await
            .unwrap()
            .unwrap();
        let second = downloads
            .receive(None, decoded("notes.txt", b"two"), &AcceptAll)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first, temp.path().join("notes.txt"));
        assert_eq!(second, temp.path().join("notes (1).txt"));
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
        assert_eq!(entries(temp.path()), vec!["notes (1).txt", "notes.txt"]);
    }

    #[tokio::test]
    async fn test_declined_file_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let downloads = DownloadDir::new(temp.path());

        let saved = downloads
            .receive(None, decoded("secret.bin", b"xyz"), &DeclineAll)
            .await
            .unwrap();
        assert!(saved.is_none());
        assert!(entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_hostile_name_stays_in_download_dir() {
        let temp = TempDir::new().unwrap();
        let downloads = DownloadDir::new(temp.path().join("in"));

        let saved = downloads
            .receive(None, decoded("../escape.txt", b"x"), &AcceptAll)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved, temp.path().join("in").join("escape.txt"));
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_bad_frame_is_rejected_event() {
        let temp = TempDir::new().unwrap();
        let downloads = DownloadDir::new(temp.path());
        let event = receive_frame(
            &FileFramer::default(),
            &downloads,
            &AcceptAll,
            Some(Peer::new("bob")),
            &[1, 2],
        )
        .await;
        assert!(matches!(event, TransferEvent::Rejected { .. }));
        assert!(entries(temp.path()).is_empty());
    }
}
