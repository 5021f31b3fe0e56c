// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Background fsync for the `interval_ms` policy.
//!
//! ```text
//! ┌──────────────┐  append (dirty=true)  ┌──────────────┐
//! │   offer()    │ ────────────────────► │ Active seg.  │
//! └──────────────┘                       └──────────────┘
//!                                               ▲
//! ┌──────────────┐  every interval, if dirty    │
//! │   Flusher    │ ─────────── sync ────────────┘
//! │  (bg thread) │
//! └──────────────┘
//! ```
//!
//! The thread parks on a crossbeam channel with `recv_timeout`. Dropping the
//! sender disconnects the channel, which is the shutdown signal.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::{Result, queue::Shared};

pub(crate) struct Flusher {
    shutdown_tx: Option<Sender<()>>,
    handle:      Option<JoinHandle<()>>,
}

impl Flusher {
    pub fn spawn(shared: Arc<Shared>, interval: Duration) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("queue-flusher".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis(), "Flusher starting");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = shared.sync_if_dirty() {
                                error!(error = ?e, "Background fsync failed");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Flusher stopped");
            })?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle:      Some(handle),
        })
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        drop(self.shutdown_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Flusher thread panicked");
            } else {
                debug!("Flusher joined");
            }
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) { self.stop(); }
}
