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

//! Session ingress.
//!
//! One spooler owns one RTSP audio session socket. It splits the stream
//! into length prefixed packets, runs them through the session cipher and
//! decoder, fans decoded frames out to the DSP pool and racks them in rtp
//! order once their peaks are in. DSP may finish out of order; a frame
//! waits in the work-in-progress queue for its predecessors, but only up
//! to a bounded timeout. When the rack is above its high-water mark the
//! spooler stops reading from the socket until the render loop has drained
//! it below the low-water mark.

use crate::{
    app::{spawn_child_app, wait_for_start},
    cipher::SessionCipher,
    config::RackConfig,
    decoder::AudioDecoder,
    error::{SessionInternalError, SessionInternalResult},
    frame::{FlushRequest, Frame, dsp::Dsp, rack::Rack, reel::Reel, state::FrameState},
    monitoring::{Metric, Monitoring},
};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
    time::{Instant, interval, sleep_until},
};
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const READ_CHUNK: usize = 16 * 1024;
const COMPLETION_QUEUE_DEPTH: usize = 1024;

/// Wall clock boundary at which a partially filled reel is committed.
const REEL_COMMIT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum SpoolerApiMessage {
    Flush(FlushRequest, oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct SpoolerApi {
    api_tx: mpsc::Sender<SpoolerApiMessage>,
}

impl SpoolerApi {
    pub async fn flush(&self, flush: FlushRequest) -> SessionInternalResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx.send(SpoolerApiMessage::Flush(flush, tx)).await.ok();
        Ok(rx.await?)
    }

    pub async fn stop(&self) -> SessionInternalResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx.send(SpoolerApiMessage::Stop(tx)).await.ok();
        Ok(rx.await?)
    }
}

#[instrument(skip(stream, key, rack, dsp, monitoring, shutdown_token))]
pub async fn start_spooler(
    id: String,
    stream: TcpStream,
    key: [u8; 32],
    rack: Arc<Rack>,
    dsp: Arc<Dsp>,
    rack_config: RackConfig,
    monitoring: Monitoring,
    shutdown_token: CancellationToken,
) -> SessionInternalResult<SpoolerApi> {
    let session_id = id.clone();
    let (api_tx, api_rx) = mpsc::channel(16);
    let (done_tx, done_rx) = mpsc::channel(COMPLETION_QUEUE_DEPTH);

    let cipher = SessionCipher::new(&key);
    let decoder = AudioDecoder::new().map_err(SessionInternalError::from)?;
    let spool = Spool::new(rack, rack_config.clone(), monitoring.clone());

    let subsystem_name = id.clone();
    let subsystem = async move |s: SubsystemHandle| {
        Spooler {
            id,
            subsys: &s,
            stream,
            cipher,
            decoder,
            dsp,
            spool,
            buf: Vec::with_capacity(2 * READ_CHUNK),
            api_rx,
            done_tx,
            done_rx,
            monitoring,
            wip_timeout: Duration::from_millis(rack_config.wip_timeout_ms),
        }
        .run()
        .await
    };

    let mut app = spawn_child_app(subsystem_name.clone(), subsystem, shutdown_token)?;
    wait_for_start(subsystem_name, &mut app).await?;

    info!("Session '{session_id}' spooler started.");
    Ok(SpoolerApi { api_tx })
}

struct Spooler<'a> {
    id: String,
    subsys: &'a SubsystemHandle,
    stream: TcpStream,
    cipher: SessionCipher,
    decoder: AudioDecoder,
    dsp: Arc<Dsp>,
    spool: Spool,
    buf: Vec<u8>,
    api_rx: mpsc::Receiver<SpoolerApiMessage>,
    done_tx: mpsc::Sender<u32>,
    done_rx: mpsc::Receiver<u32>,
    monitoring: Monitoring,
    wip_timeout: Duration,
}

impl<'a> Spooler<'a> {
    async fn run(mut self) -> SessionInternalResult<()> {
        info!("Session '{}' reading audio packets.", self.id);

        let mut chunk = vec![0u8; READ_CHUNK];
        let mut commit_timer = interval(REEL_COMMIT_INTERVAL);

        loop {
            // back-pressure: above high-water the next read is simply not
            // issued until the render loop drains the rack
            let can_read = !self.spool.rack.above_high_water();
            let wip_deadline = self
                .spool
                .wip_queued_at()
                .map(|queued_at| queued_at + self.wip_timeout);

            select! {
                read = self.stream.read(&mut chunk), if can_read => {
                    match read {
                        Ok(0) => {
                            info!("Session '{}' closed by peer.", self.id);
                            break;
                        }
                        Ok(n) => {
                            self.buf.extend_from_slice(&chunk[..n]);
                            for packet in split_packets(&mut self.buf) {
                                self.ingest_packet(&packet);
                            }
                        }
                        Err(e) => {
                            warn!("Session '{}' read failed: {e}", self.id);
                            break;
                        }
                    }
                },
                _ = self.spool.rack.wait_below_low_water(), if !can_read => (),
                Some(rtp_ts) = self.done_rx.recv() => {
                    debug!("DSP complete for frame {rtp_ts}.");
                    self.spool.promote();
                },
                _ = sleep_until(wip_deadline.unwrap_or_else(Instant::now)),
                    if wip_deadline.is_some() =>
                {
                    self.spool.expire_stalled_head();
                    self.spool.promote();
                },
                _ = commit_timer.tick() => self.spool.commit_partial(),
                Some(api_msg) = self.api_rx.recv() => {
                    if self.handle_api_message(api_msg).await? {
                        break;
                    }
                },
                _ = self.subsys.on_shutdown_requested() => {
                    info!("Shutdown of session '{}' requested.", self.id);
                    break;
                },
                else => break,
            }
        }

        self.spool.abandon();
        info!("Session '{}' spooler stopped.", self.id);

        Ok(())
    }

    async fn handle_api_message(
        &mut self,
        api_msg: SpoolerApiMessage,
    ) -> SessionInternalResult<bool> {
        match api_msg {
            SpoolerApiMessage::Flush(flush, tx) => {
                self.spool.flush(&flush);
                tx.send(()).ok();
                Ok(false)
            }
            SpoolerApiMessage::Stop(tx) => {
                self.subsys.request_local_shutdown();
                self.subsys.wait_for_children().await;
                tx.send(()).ok();
                Ok(true)
            }
        }
    }

    /// One ciphered packet: decrypt, parse, decode, fan out to DSP.
    /// Per-packet failures drop the packet and keep the session.
    fn ingest_packet(&mut self, packet: &[u8]) {
        let cleartext = match self.cipher.decrypt_packet(packet) {
            Ok(it) => it,
            Err(e) => {
                debug!("Dropping packet: {e}");
                self.report_decipher_fail();
                return;
            }
        };

        let frame = match Frame::from_packet(&cleartext) {
            Ok(it) => Arc::new(it),
            Err(e) => {
                debug!("Dropping unparseable packet: {e:?}");
                self.report_parse_fail();
                return;
            }
        };

        let Some(payload) = frame.take_payload() else {
            self.report_parse_fail();
            return;
        };

        let pcm = match self.decoder.decode(&payload) {
            Ok(it) => it,
            Err(e) => {
                debug!("Dropping undecodable frame {}: {e}", frame.rtp_ts);
                frame.set_state(FrameState::DecodeFail);
                self.report_decode_fail();
                return;
            }
        };

        frame.set_pcm(pcm);
        if frame.transition(FrameState::Deciphered, FrameState::DspInProgress) {
            self.dsp.process(frame.clone(), self.done_tx.clone());
            self.spool.push(frame);
        }
    }
}

/// Splits complete `[len: u16 BE][payload]` packets off the front of the
/// stream buffer, leaving any incomplete tail in place.
fn split_packets(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut consumed = 0;

    loop {
        let rest = &buf[consumed..];
        if rest.len() < 2 {
            break;
        }

        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if rest.len() < 2 + len {
            break;
        }

        packets.push(rest[2..2 + len].to_vec());
        consumed += 2 + len;
    }

    buf.drain(..consumed);
    packets
}

/// Work-in-progress ordering and reel management, separated from the
/// socket plumbing.
struct Spool {
    rack: Arc<Rack>,
    reel: Reel,
    wip: VecDeque<WipEntry>,
    max_frames_per_reel: usize,
    monitoring: Monitoring,
}

struct WipEntry {
    frame: Arc<Frame>,
    queued_at: Instant,
}

impl Spool {
    fn new(rack: Arc<Rack>, config: RackConfig, monitoring: Monitoring) -> Self {
        Spool {
            rack,
            reel: Reel::new(config.max_frames_per_reel),
            wip: VecDeque::new(),
            max_frames_per_reel: config.max_frames_per_reel,
            monitoring,
        }
    }

    fn push(&mut self, frame: Arc<Frame>) {
        self.wip.push_back(WipEntry {
            frame,
            queued_at: Instant::now(),
        });
        self.promote();
    }

    fn wip_queued_at(&self) -> Option<Instant> {
        self.wip.front().map(|entry| entry.queued_at)
    }

    /// Moves completed head frames into the reel, in rtp order. A head
    /// whose DSP has not finished blocks its successors.
    fn promote(&mut self) {
        while let Some(entry) = self.wip.front() {
            match entry.frame.state() {
                FrameState::DspComplete => {
                    if let Some(entry) = self.wip.pop_front() {
                        self.rack_frame(entry.frame);
                    }
                }
                FrameState::DspInProgress => break,
                state => {
                    // flushed, outdated or failed while queued
                    debug!(
                        "Dropping frame {} from WIP in state {state}.",
                        entry.frame.rtp_ts
                    );
                    self.monitoring.count(Metric::RackWipIncomplete);
                    self.wip.pop_front();
                }
            }
        }
    }

    /// Drops a head frame whose DSP did not finish within the timeout so
    /// the frames behind it are not starved.
    fn expire_stalled_head(&mut self) {
        let Some(entry) = self.wip.front() else {
            return;
        };

        if entry.frame.state() == FrameState::DspInProgress {
            warn!(
                "Frame {} stalled in DSP, dropping it.",
                entry.frame.rtp_ts
            );
            entry.frame.set_state(FrameState::Outdated);
            self.monitoring.count(Metric::RackWipTimeout);
            self.wip.pop_front();
        }
    }

    fn rack_frame(&mut self, frame: Arc<Frame>) {
        if self.reel.add(frame.clone()) {
            if self.reel.full() {
                self.commit();
            }
            return;
        }

        // reel full or timestamp gap, start a fresh reel
        self.commit();
        if !self.reel.add(frame) {
            // an empty reel accepts any frame
            warn!("Could not rack frame, dropping it.");
        }
    }

    fn commit(&mut self) {
        if self.reel.empty() {
            return;
        }
        let reel = std::mem::replace(&mut self.reel, Reel::new(self.max_frames_per_reel));
        self.rack.commit(reel);
    }

    /// Commits a partially filled reel after a wall clock boundary so slow
    /// trickles of audio still reach the render loop.
    fn commit_partial(&mut self) {
        self.commit();
    }

    fn flush(&mut self, flush: &FlushRequest) {
        let before = self.wip.len();
        self.wip.retain(|entry| {
            if flush.matches(entry.frame.rtp_ts) {
                entry.frame.set_state(FrameState::Flushed);
                false
            } else {
                true
            }
        });
        let wip_flushed = before - self.wip.len();
        if wip_flushed > 0 {
            self.monitoring.add(Metric::Flushed, wip_flushed as u64);
        }

        self.reel.flush(flush);
        self.rack.flush(flush);
    }

    /// Teardown: everything still in flight is flushed and dropped.
    fn abandon(&mut self) {
        for entry in self.wip.drain(..) {
            entry.frame.set_state(FrameState::Flushed);
        }
        self.commit();
    }
}

mod monitoring {
    use super::*;

    impl<'a> Spooler<'a> {
        pub(crate) fn report_decipher_fail(&mut self) {
            self.monitoring.count(Metric::DecipherFail);
        }

        pub(crate) fn report_parse_fail(&mut self) {
            self.monitoring.count(Metric::ParseFail);
        }

        pub(crate) fn report_decode_fail(&mut self) {
            self.monitoring.count(Metric::DecodeFail);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RackConfig;

    #[test]
    fn packets_split_on_length_prefix_across_reads() {
        let mut buf = Vec::new();

        // first read: one whole packet and half of the next
        buf.extend_from_slice(&[0, 3, 0xaa, 0xbb, 0xcc]);
        buf.extend_from_slice(&[0, 4, 0x01]);
        let packets = split_packets(&mut buf);
        assert_eq!(vec![vec![0xaa, 0xbb, 0xcc]], packets);
        assert_eq!(3, buf.len());

        // second read completes the packet
        buf.extend_from_slice(&[0x02, 0x03, 0x04]);
        let packets = split_packets(&mut buf);
        assert_eq!(vec![vec![0x01, 0x02, 0x03, 0x04]], packets);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_length_prefix_is_an_empty_packet() {
        let mut buf = vec![0, 0, 0, 1, 0x42];
        let packets = split_packets(&mut buf);
        assert_eq!(vec![Vec::<u8>::new(), vec![0x42]], packets);
    }

    fn spool() -> Spool {
        let config = RackConfig {
            max_frames_per_reel: 4,
            ..RackConfig::default()
        };
        let rack = Rack::new(&config, Monitoring::noop());
        Spool::new(rack, config, Monitoring::noop())
    }

    fn wip_frame(spool: &mut Spool, rtp_ts: u32, state: FrameState) -> Arc<Frame> {
        let frame = Arc::new(Frame::for_test(rtp_ts, rtp_ts / 1024));
        frame.set_state(state);
        spool.push(frame.clone());
        frame
    }

    #[tokio::test]
    async fn frames_rack_in_rtp_order_even_when_dsp_finishes_late() {
        let mut spool = spool();

        let first = wip_frame(&mut spool, 0, FrameState::DspInProgress);
        wip_frame(&mut spool, 1024, FrameState::DspComplete);
        wip_frame(&mut spool, 2048, FrameState::DspComplete);

        // completed successors wait for the head
        spool.promote();
        assert_eq!(0, spool.rack.frames());

        first.transition(FrameState::DspInProgress, FrameState::DspComplete);
        spool.promote();
        spool.commit_partial();

        assert_eq!(3, spool.rack.frames());
        let head = spool.rack.head_frame().expect("head");
        assert_eq!(0, head.rtp_ts);
    }

    #[tokio::test]
    async fn full_reels_commit_automatically() {
        let mut spool = spool();
        for n in 0..4u32 {
            wip_frame(&mut spool, n * 1024, FrameState::DspComplete);
        }
        // reel size is 4, the reel went to the rack without commit_partial
        assert_eq!(4, spool.rack.frames());
    }

    #[tokio::test]
    async fn stalled_head_is_expired_and_reported() {
        let mut spool = spool();
        let stalled = wip_frame(&mut spool, 0, FrameState::DspInProgress);
        wip_frame(&mut spool, 1024, FrameState::DspComplete);

        spool.expire_stalled_head();
        spool.promote();
        spool.commit_partial();

        assert_eq!(FrameState::Outdated, stalled.state());
        // the successor made it to the rack
        assert_eq!(1, spool.rack.frames());
        assert_eq!(1024, spool.rack.head_frame().expect("head").rtp_ts);
    }

    #[tokio::test]
    async fn flush_covers_wip_reel_and_rack() {
        let mut spool = spool();
        for n in 0..6u32 {
            wip_frame(&mut spool, n * 1024, FrameState::DspComplete);
        }
        // 4 went to the rack as a full reel, 2 sit in the open reel
        assert_eq!(4, spool.rack.frames());

        let in_wip = wip_frame(&mut spool, 6 * 1024, FrameState::DspInProgress);

        spool.flush(&FlushRequest::All);

        assert_eq!(0, spool.rack.frames());
        assert_eq!(FrameState::Flushed, in_wip.state());
        assert!(spool.wip.is_empty());
    }

    #[tokio::test]
    async fn timestamp_gaps_start_a_fresh_reel() {
        let mut spool = spool();
        wip_frame(&mut spool, 0, FrameState::DspComplete);
        wip_frame(&mut spool, 1024, FrameState::DspComplete);
        // gap
        wip_frame(&mut spool, 5 * 1024, FrameState::DspComplete);
        spool.commit_partial();

        assert_eq!(3, spool.rack.frames());
    }
}
