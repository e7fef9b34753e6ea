/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use videocall_session::{FrameSink, RemoteMedia};

/// Renders remote media into the log: one line per bind and a periodic
/// frame count while video is flowing.
pub struct LoggingSink {
    label: String,
    frames: Arc<AtomicU64>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl LoggingSink {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            frames: Arc::new(AtomicU64::new(0)),
            watcher: Mutex::new(None),
        })
    }

    /// Frames observed since the sink was created.
    pub fn frames_seen(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn replace_watcher(&self, next: Option<JoinHandle<()>>) {
        let mut watcher = match self.watcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = std::mem::replace(&mut *watcher, next) {
            previous.abort();
        }
    }
}

impl FrameSink for LoggingSink {
    fn bind(&self, remote: Option<RemoteMedia>) {
        let Some(remote) = remote else {
            info!("[{}] remote media cleared", self.label);
            self.replace_watcher(None);
            return;
        };
        info!(
            "[{}] rendering {} from {} tier ({:?})",
            self.label, remote.id, remote.tier, remote.kinds
        );
        let label = self.label.clone();
        let frames = self.frames.clone();
        let mut rx = remote.frames.clone();
        self.replace_watcher(Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let seen = frames.fetch_add(1, Ordering::Relaxed) + 1;
                if seen % 50 == 0 {
                    if let Some(frame) = rx.borrow().as_ref() {
                        debug!("[{label}] {seen} frames, latest {}x{}", frame.width, frame.height);
                    }
                }
            }
        })));
    }
}

impl Drop for LoggingSink {
    fn drop(&mut self) {
        self.replace_watcher(None);
    }
}
