#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use vidflow_core::config::StorageBackend;
use vidflow_core::storage::LocalObjectStore;
use vidflow_core::{CommandExecutor, RuntimeOverrides, Vidflow, VidflowConfig};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

pub const PUBLIC_BASE: &str = "https://cdn.test";

#[derive(Debug, Clone)]
struct ProbeReply {
    duration: String,
    size: Option<(u32, u32)>,
}

/// Stands in for ffmpeg/ffprobe: records every invocation, answers probes
/// with a canned payload and writes the files ffmpeg would have produced.
#[derive(Clone)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<Vec<String>>>>,
    probe: Arc<Mutex<ProbeReply>>,
    fail_on: Arc<Mutex<Option<String>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl RecordingExecutor {
    pub fn new(duration: &str, width: u32, height: u32) -> Self {
        Self {
            calls: Arc::default(),
            probe: Arc::new(Mutex::new(ProbeReply {
                duration: duration.to_string(),
                size: Some((width, height)),
            })),
            fail_on: Arc::default(),
            delay: Arc::default(),
        }
    }

    pub fn set_probe(&self, duration: &str, size: Option<(u32, u32)>) {
        *self.probe.lock().unwrap() = ProbeReply {
            duration: duration.to_string(),
            size,
        };
    }

    /// Any ffmpeg call carrying `arg` exits with status 1.
    pub fn fail_on(&self, arg: &str) {
        *self.fail_on.lock().unwrap() = Some(arg.to_string());
    }

    pub fn delay(&self, value: Duration) {
        *self.delay.lock().unwrap() = Some(value);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ffmpeg_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| call.first().map(|p| p.ends_with("ffmpeg")).unwrap_or(false))
            .collect()
    }

    /// Value following `flag` in the first call that carries it.
    pub fn arg_after(&self, flag: &str) -> Option<String> {
        self.calls().into_iter().find_map(|call| {
            call.iter()
                .position(|arg| arg == flag)
                .and_then(|index| call.get(index + 1).cloned())
        })
    }

    fn probe_payload(&self) -> Vec<u8> {
        let reply = self.probe.lock().unwrap().clone();
        let mut streams = vec![serde_json::json!({"codec_type": "audio"})];
        if let Some((width, height)) = reply.size {
            streams.push(serde_json::json!({
                "codec_type": "video",
                "width": width,
                "height": height,
            }));
        }
        serde_json::to_vec(&serde_json::json!({
            "streams": streams,
            "format": {"duration": reply.duration},
        }))
        .unwrap()
    }
}

fn write_fake(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, b"fake").unwrap();
}

fn expand_pattern(pattern: &str, index: usize) -> PathBuf {
    PathBuf::from(pattern.replace("%03d", &format!("{index:03}")))
}

#[async_trait::async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        let std = command.as_std();
        let mut call = vec![std.get_program().to_string_lossy().into_owned()];
        call.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
        self.calls.lock().unwrap().push(call.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if call[0].ends_with("ffprobe") {
            return Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: self.probe_payload(),
                stderr: Vec::new(),
            });
        }

        let failing = self.fail_on.lock().unwrap().clone();
        if let Some(marker) = failing {
            if call.iter().any(|arg| arg == &marker) {
                return Ok(Output {
                    status: ExitStatus::from_raw(1 << 8),
                    stdout: Vec::new(),
                    stderr: b"simulated ffmpeg failure".to_vec(),
                });
            }
        }

        let output = call.last().cloned().unwrap_or_default();
        if let Some(index) = call.iter().position(|arg| arg == "-hls_segment_filename") {
            let pattern = &call[index + 1];
            write_fake(&expand_pattern(pattern, 0));
            write_fake(&expand_pattern(pattern, 1));
            write_fake(Path::new(&output));
        } else if output.contains("%03d") {
            for index in 1..=3 {
                write_fake(&expand_pattern(&output, index));
            }
        } else {
            write_fake(Path::new(&output));
        }

        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub app: Vidflow,
    pub executor: RecordingExecutor,
}

impl Harness {
    pub fn objects_root(&self) -> PathBuf {
        self.dir.path().join("objects")
    }

    pub fn staging_root(&self) -> PathBuf {
        self.app.config.staging_dir()
    }

    pub fn staging_entries(&self) -> usize {
        std::fs::read_dir(self.staging_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn test_config(dir: &Path) -> VidflowConfig {
    let mut config = VidflowConfig::default();
    config.paths.base_dir = dir.display().to_string();
    config.worker.poll_interval_ms = 10;
    config.storage.backend = StorageBackend::Local;
    config
}

async fn open_app(dir: &Path, executor: &RecordingExecutor) -> Vidflow {
    let storage = LocalObjectStore::new(dir.join("objects")).with_public_base(PUBLIC_BASE);
    Vidflow::open_with(
        test_config(dir),
        RuntimeOverrides {
            executor: Some(Arc::new(executor.clone())),
            storage: Some(Arc::new(storage)),
        },
    )
    .await
    .unwrap()
}

pub async fn harness(executor: RecordingExecutor) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let app = open_app(dir.path(), &executor).await;
    Harness { dir, app, executor }
}

impl Harness {
    /// A second runtime over the same data directory, as another process
    /// started against the same config would see it.
    pub async fn reopen(&self) -> Vidflow {
        open_app(self.dir.path(), &self.executor).await
    }
}
