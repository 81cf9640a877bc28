/// mpv-backed media capability: one paused mpv process per track.
///
/// Architecture:
///
/// ```text
///   MpvBackend::open(track, sink)
///         │
///         └── drive_track task (owns MpvDriver → mpv child, killed on drop)
///                 ├── writer_task   ← MpvRequest via mpsc, serialised → socket
///                 ├── reader_task   ← JSON lines from socket
///                 │                      ├── response (request_id) → oneshot
///                 │                      └── event / property-change → LoadWatch
///                 └── LoadWatch     → TrackEvent → TrackSink
/// ```
///
/// Every track gets `loadfile` right away so a whole break buffers in
/// parallel; `play` only unpauses.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use crate::media::{MediaBackend, TrackControl, TrackEvent, TrackSink};
use katko_proto::config::MpvConfig;
use katko_proto::platform;
use katko_proto::protocol::TrackDescriptor;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Socket suffix; never reused within a daemon run so a reload cannot
/// collide with a process that is still exiting.
static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(0);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_TIME_POS: u64 = 1;
pub const OBS_DURATION: u64 = 2;
/// `demuxer-cache-idle`: the cache holds what was asked for and is not reading.
pub const OBS_CACHE_IDLE: u64 = 3;

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Must be called before `load` so no early change is missed.
    pub async fn observe_track_properties(&self) -> anyhow::Result<()> {
        let props = [
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
            (OBS_CACHE_IDLE, "demuxer-cache-idle"),
        ];
        for (id, name) in props {
            self.send(json!(["observe_property", id, name])).await?;
            debug!("mpv: observe_property id={} name={}", id, name);
        }
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns one mpv child process.  The process is killed when the driver drops.
pub struct MpvDriver {
    binary: PathBuf,
    volume: f32,
    instance: usize,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new(binary: PathBuf, volume: f32, instance: usize) -> Self {
        Self {
            binary,
            volume,
            instance,
            process: None,
        }
    }

    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(platform::mpv_socket_name(self.instance)).await;
        }

        debug!("mpv[{}]: spawning {}", self.instance, self.binary.display());
        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let child = tokio::process::Command::new(&self.binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--pause")
            .arg("--cache=yes")
            .arg("--cache-secs=3600")
            .arg(platform::mpv_socket_arg(self.instance))
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);

        self.connect(event_tx).await
    }

    #[cfg(unix)]
    async fn connect(&self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        let socket_path = PathBuf::from(platform::mpv_socket_name(self.instance));
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        debug!("mpv[{}]: connected to IPC socket", self.instance);
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    async fn connect(&self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        let pipe_path = format!(r"\\.\pipe\{}", platform::mpv_socket_name(self.instance));
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                debug!("mpv[{}]: connected to named pipe", self.instance);
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

impl Drop for MpvDriver {
    fn drop(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
        }
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(platform::mpv_socket_name(self.instance));
        }
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel, shared between writer (inserts) and reader (resolves)
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── mpv events → track events ─────────────────────────────────────────────────

/// Turns raw mpv events into `TrackEvent`s.  Can-play-through is announced
/// once, after the file is loaded and the demuxer cache has gone idle.
#[derive(Debug, Default)]
pub struct LoadWatch {
    file_loaded: bool,
    cache_idle: bool,
    announced: bool,
}

impl LoadWatch {
    pub fn translate(&mut self, event: &MpvEvent) -> Vec<TrackEvent> {
        let mut out = Vec::new();
        if let Some((id, data)) = event.as_property_change() {
            match id {
                OBS_DURATION => {
                    if let Some(secs) = data.as_f64() {
                        out.push(TrackEvent::DurationKnown(secs));
                    }
                }
                OBS_TIME_POS => {
                    if let Some(secs) = data.as_f64() {
                        out.push(TrackEvent::TimeAdvanced(secs));
                    }
                }
                OBS_CACHE_IDLE => {
                    self.cache_idle = data.as_bool().unwrap_or(false);
                }
                _ => {}
            }
        } else {
            match event.event_name() {
                Some("file-loaded") => self.file_loaded = true,
                Some("end-file") => match event.raw["reason"].as_str() {
                    Some("eof") => out.push(TrackEvent::Ended),
                    Some("error") => {
                        let reason = event.raw["file_error"]
                            .as_str()
                            .unwrap_or("playback error")
                            .to_string();
                        out.push(TrackEvent::Failed(reason));
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        if self.file_loaded && self.cache_idle && !self.announced {
            self.announced = true;
            out.push(TrackEvent::CanPlayThrough);
        }
        out
    }
}

// ── backend ───────────────────────────────────────────────────────────────────

pub struct MpvBackend {
    binary: PathBuf,
    volume: f32,
}

impl MpvBackend {
    pub fn new(config: &MpvConfig) -> anyhow::Result<Self> {
        let binary = config
            .binary
            .clone()
            .or_else(platform::find_mpv_binary)
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: using {}", binary.display());
        Ok(Self {
            binary,
            volume: config.volume,
        })
    }
}

enum TrackCommand {
    Play,
}

impl MediaBackend for MpvBackend {
    fn open(
        &self,
        track: &TrackDescriptor,
        sink: TrackSink,
    ) -> anyhow::Result<Box<dyn TrackControl>> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let driver = MpvDriver::new(
            self.binary.clone(),
            self.volume,
            NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        );
        let task = tokio::spawn(drive_track(driver, track.url.clone(), sink, cmd_rx));
        Ok(Box::new(MpvTrack { cmd_tx, task }))
    }
}

struct MpvTrack {
    cmd_tx: mpsc::UnboundedSender<TrackCommand>,
    task: JoinHandle<()>,
}

impl TrackControl for MpvTrack {
    fn play(&mut self) -> anyhow::Result<()> {
        self.cmd_tx
            .send(TrackCommand::Play)
            .map_err(|_| anyhow::anyhow!("mpv track task gone"))
    }

    fn close(&mut self) {
        // dropping the task's future drops the driver, which kills mpv
        self.task.abort();
    }
}

async fn drive_track(
    mut driver: MpvDriver,
    url: String,
    sink: TrackSink,
    mut cmd_rx: mpsc::UnboundedReceiver<TrackCommand>,
) {
    let index = sink.index();
    if let Err(e) = run_track(&mut driver, &url, &sink, &mut cmd_rx).await {
        warn!("mpv[{}]: track {} failed: {:#}", driver.instance, index, e);
        sink.emit(TrackEvent::Failed(format!("{:#}", e)));
    }
}

async fn run_track(
    driver: &mut MpvDriver,
    url: &str,
    sink: &TrackSink,
    cmd_rx: &mut mpsc::UnboundedReceiver<TrackCommand>,
) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let handle = driver.spawn_and_connect(event_tx).await?;
    handle.observe_track_properties().await?;
    handle.load(url).await?;
    debug!("mpv[{}]: loading {}", driver.instance, url);

    let mut watch = LoadWatch::default();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(TrackCommand::Play) => handle.set_pause(false).await?,
                None => return Ok(()),
            },
            event = event_rx.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("mpv IPC connection closed");
                };
                for out in watch.translate(&event) {
                    let last = matches!(out, TrackEvent::Ended | TrackEvent::Failed(_));
                    if !sink.emit(out) || last {
                        return Ok(());
                    }
                }
            }
        }
    }
}
