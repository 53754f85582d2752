/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Remote light bridge.
//!
//! One persistent TCP connection carries length prefixed MsgPack data
//! frames to the DMX peer. Sends from the render loop never block: frames
//! go into a small ring that drops oldest first when the peer cannot keep
//! up, and the bridge reconnects with exponential backoff when the
//! connection is lost.

pub mod color;
pub mod fader;
pub mod fx;
pub mod msg;

use crate::{
    app::{spawn_child_app, wait_for_start},
    config::RemoteConfig,
    desk::msg::DataFrame,
    error::PierreInternalResult,
    monitoring::{Metric, Monitoring},
};
use crossbeam::queue::ArrayQueue;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{io::AsyncWriteExt, net::TcpStream, select, sync::Notify, time::sleep};
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUT_QUEUE_DEPTH: usize = 64;

const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Where the render loop hands off finished data frames. A seam so tests
/// can capture dispatches without a TCP peer.
pub trait DataSink: Send + Sync + 'static {
    fn send(&self, frame: DataFrame);
}

#[derive(Debug, Clone)]
pub struct DeskHandle {
    queue: Arc<ArrayQueue<DataFrame>>,
    notify: Arc<Notify>,
    connected: Arc<AtomicBool>,
    monitoring: Monitoring,
}

impl DeskHandle {
    fn new(monitoring: Monitoring) -> Self {
        DeskHandle {
            queue: Arc::new(ArrayQueue::new(OUT_QUEUE_DEPTH)),
            notify: Arc::new(Notify::new()),
            connected: Arc::new(AtomicBool::new(false)),
            monitoring,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl DataSink for DeskHandle {
    fn send(&self, frame: DataFrame) {
        if !self.is_connected() {
            self.monitoring.count(Metric::RemoteDmxQrf);
        }

        if self.queue.force_push(frame).is_some() {
            // ring was full, the oldest frame was displaced
            self.monitoring.count(Metric::RemoteDmxQsf);
        }

        self.notify.notify_one();
    }
}

/// Starts the bridge child app and returns the send handle.
pub async fn start_desk(
    config: RemoteConfig,
    monitoring: Monitoring,
    shutdown_token: CancellationToken,
) -> PierreInternalResult<DeskHandle> {
    let handle = DeskHandle::new(monitoring.clone());
    let bridge_handle = handle.clone();

    let subsystem_name = "desk".to_owned();
    let subsystem = async move |s: &mut SubsystemHandle| {
        Bridge {
            subsys: s,
            config,
            handle: bridge_handle,
            monitoring,
        }
        .run()
        .await;
        Ok::<(), std::convert::Infallible>(())
    };

    let mut app = spawn_child_app(subsystem_name.clone(), subsystem, shutdown_token)?;
    wait_for_start(subsystem_name, &mut app).await?;

    Ok(handle)
}

struct Bridge<'a> {
    subsys: &'a mut SubsystemHandle,
    config: RemoteConfig,
    handle: DeskHandle,
    monitoring: Monitoring,
}

impl<'a> Bridge<'a> {
    async fn run(mut self) {
        let endpoint = format!("{}:{}", self.config.host, self.config.port);
        info!("Desk bridge started for {endpoint}.");

        let mut backoff = BACKOFF_START;

        loop {
            let stream = select! {
                it = TcpStream::connect(&endpoint) => it,
                _ = self.subsys.on_shutdown_requested() => break,
            };

            match stream {
                Ok(stream) => {
                    info!("Connected to light bridge at {endpoint}.");
                    backoff = BACKOFF_START;
                    self.handle.connected.store(true, Ordering::Relaxed);

                    let disconnect = self.drain(stream).await;
                    self.handle.connected.store(false, Ordering::Relaxed);

                    if !disconnect {
                        break;
                    }
                    warn!("Lost connection to light bridge at {endpoint}.");
                }
                Err(e) => {
                    debug!("Could not reach light bridge at {endpoint}: {e}");
                    self.monitoring.count(Metric::NoConn);

                    select! {
                        _ = sleep(backoff) => (),
                        _ = self.subsys.on_shutdown_requested() => break,
                    }

                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }

        info!("Desk bridge stopped.");
    }

    /// Writes queued frames until the connection drops (true) or shutdown
    /// is requested (false).
    async fn drain(&mut self, mut stream: TcpStream) -> bool {
        loop {
            while let Some(frame) = self.handle.queue.pop() {
                let wire = match msg::encode(&frame) {
                    Ok(it) => it,
                    Err(e) => {
                        warn!("Could not encode data frame: {e}");
                        continue;
                    }
                };

                if let Err(e) = stream.write_all(&wire).await {
                    debug!("Write to light bridge failed: {e}");
                    return true;
                }
            }

            select! {
                _ = self.handle.notify.notified() => (),
                _ = self.subsys.on_shutdown_requested() => return false,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    #[test]
    fn ring_overflow_drops_oldest_first() {
        let handle = DeskHandle::new(Monitoring::noop());
        handle.connected.store(true, Ordering::Relaxed);

        for seq in 0..(OUT_QUEUE_DEPTH as u64 + 2) {
            handle.send(DataFrame::new(seq));
        }

        // frames 0 and 1 were displaced
        let first = handle.queue.pop().expect("frame");
        assert_eq!(2, first.seq_num);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn frames_reach_the_peer_with_sentinel_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let shutdown_token = CancellationToken::new();
        let handle = start_desk(
            RemoteConfig {
                host: "127.0.0.1".to_owned(),
                port,
            },
            Monitoring::noop(),
            shutdown_token.clone(),
        )
        .await
        .expect("desk started");

        let (mut peer, _) = listener.accept().await.expect("accept");

        handle.send(DataFrame::new(99));

        let mut len_buf = [0u8; 2];
        peer.read_exact(&mut len_buf).await.expect("length prefix");
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut body = vec![0u8; len];
        peer.read_exact(&mut body).await.expect("body");
        assert_eq!(
            msg::SENTINEL_SUFFIX,
            body[body.len() - msg::SENTINEL_SUFFIX.len()..]
        );

        shutdown_token.cancel();
    }
}
