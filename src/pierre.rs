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

//! Pipeline composition.
//!
//! [`PierreApi`] is the surface the RTSP control plane talks to: it hands
//! over audio session sockets after SETUP, forwards anchor announcements
//! and flush requests, and maintains the PTP timing peer list. Behind the
//! API one actor owns the shared pipeline pieces and the per-session
//! spoolers. Teardown runs top down: session intake stops first, then the
//! DSP pool drains, then the render loop and the light bridge go away.

use crate::{
    anchor::{Anchor, AnchorUpdate},
    app::{propagate_exit, spawn_child_app, wait_for_start},
    clock::{self, MasterClock},
    config::Config,
    desk::{DeskHandle, fx::ActiveFx, start_desk},
    error::{
        ClockResult, PierreApiResult, PierreInternalError, PierreInternalResult,
        SessionInternalError, SessionInternalResult, ToBoxedResult,
    },
    frame::{FlushRequest, dsp::Dsp, rack::Rack},
    monitoring::{Monitoring, start_stats},
    render::start_render,
    spooler::{SpoolerApi, start_spooler},
};
use std::{collections::HashMap, net::IpAddr, sync::Arc};
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
};
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type ApiMessageSender = mpsc::Sender<PierreApiMessage>;

enum PierreApiMessage {
    AttachSession(TcpStream, oneshot::Sender<SessionInternalResult<u32>>),
    DetachSession(u32, oneshot::Sender<SessionInternalResult<()>>),
    SaveAnchor(AnchorUpdate, oneshot::Sender<()>),
    Flush(FlushRequest, oneshot::Sender<()>),
    SetPeers(Vec<IpAddr>, oneshot::Sender<ClockResult<()>>),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct PierreApi {
    api_tx: ApiMessageSender,
}

impl PierreApi {
    pub async fn new(config: Config, shutdown_token: CancellationToken) -> PierreApiResult<Self> {
        Ok(PierreApi::try_new(config, shutdown_token).await.boxed()?)
    }

    async fn try_new(
        config: Config,
        shutdown_token: CancellationToken,
    ) -> PierreInternalResult<Self> {
        let api_tx = PierreApi::create_pipeline(config, shutdown_token).await?;
        Ok(PierreApi { api_tx })
    }

    async fn create_pipeline(
        config: Config,
        shutdown_token: CancellationToken,
    ) -> PierreInternalResult<ApiMessageSender> {
        let (api_tx, api_rx) = mpsc::channel(1024);

        let monitoring = start_stats(config.stats.clone(), shutdown_token.clone()).await?;

        let anchor = Arc::new(Anchor::new());
        let rack = Rack::new(&config.frame.rack, monitoring.clone());
        let dsp = Arc::new(Dsp::new(&config.frame.dsp));

        let desk_token = shutdown_token.child_token();
        let desk = start_desk(config.remote.clone(), monitoring.clone(), desk_token.clone()).await?;

        let render_token = shutdown_token.child_token();
        let clock = MasterClock::new(config.clock.shm_name());
        start_render(
            clock,
            anchor.clone(),
            rack.clone(),
            desk.clone(),
            Box::new(ActiveFx::new()),
            config.frame.render.clone(),
            monitoring.clone(),
            render_token.clone(),
        )
        .await?;

        let sessions_token = shutdown_token.child_token();

        let subsystem_name = "pierre".to_owned();
        let subsystem = async move |s: &mut SubsystemHandle| {
            Pierre {
                subsys: s,
                config,
                api_rx,
                anchor,
                rack,
                dsp: Some(dsp),
                _desk: desk,
                monitoring,
                sessions: HashMap::new(),
                next_session_id: 0,
                sessions_token,
                render_token,
                desk_token,
            }
            .run()
            .await;
            Ok::<(), PierreInternalError>(())
        };

        let mut app = spawn_child_app(subsystem_name.clone(), subsystem, shutdown_token.clone())?;
        wait_for_start(subsystem_name, &mut app).await?;
        propagate_exit(app, shutdown_token);

        Ok(api_tx)
    }

    /// Hands an audio session socket, fresh out of SETUP, to the pipeline.
    pub async fn attach_session(&self, stream: TcpStream) -> PierreApiResult<u32> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(PierreApiMessage::AttachSession(stream, tx))
            .await
            .ok();
        Ok(rx.await.map_err(SessionInternalError::from)??)
    }

    pub async fn detach_session(&self, id: u32) -> PierreApiResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(PierreApiMessage::DetachSession(id, tx))
            .await
            .ok();
        Ok(rx.await.map_err(SessionInternalError::from)??)
    }

    /// Forwards a sender anchor announcement.
    pub async fn save_anchor(&self, update: AnchorUpdate) -> PierreApiResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(PierreApiMessage::SaveAnchor(update, tx))
            .await
            .ok();
        Ok(rx.await?)
    }

    pub async fn flush(&self, flush: FlushRequest) -> PierreApiResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(PierreApiMessage::Flush(flush, tx))
            .await
            .ok();
        Ok(rx.await?)
    }

    /// Replaces the PTP daemon's timing peer list.
    pub async fn set_peers(&self, peers: Vec<IpAddr>) -> PierreApiResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(PierreApiMessage::SetPeers(peers, tx))
            .await
            .ok();
        rx.await?.map_err(PierreInternalError::from)?;
        Ok(())
    }

    pub async fn teardown(&self) -> PierreApiResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx.send(PierreApiMessage::Stop(tx)).await.ok();
        Ok(rx.await?)
    }
}

struct Pierre<'a> {
    subsys: &'a mut SubsystemHandle,
    config: Config,
    api_rx: mpsc::Receiver<PierreApiMessage>,
    anchor: Arc<Anchor>,
    rack: Arc<Rack>,
    dsp: Option<Arc<Dsp>>,
    _desk: DeskHandle,
    monitoring: Monitoring,
    sessions: HashMap<u32, SpoolerApi>,
    next_session_id: u32,
    sessions_token: CancellationToken,
    render_token: CancellationToken,
    desk_token: CancellationToken,
}

impl<'a> Pierre<'a> {
    async fn run(mut self) {
        info!("Pipeline started.");

        loop {
            select! {
                Some(api_msg) = self.api_rx.recv() => {
                    if self.handle_api_message(api_msg).await {
                        break;
                    }
                },
                _ = self.subsys.on_shutdown_requested() => break,
                else => break,
            }
        }

        self.teardown().await;
        info!("Pipeline stopped.");
    }

    async fn handle_api_message(&mut self, api_msg: PierreApiMessage) -> bool {
        match api_msg {
            PierreApiMessage::AttachSession(stream, tx) => {
                tx.send(self.attach_session(stream).await).ok();
            }
            PierreApiMessage::DetachSession(id, tx) => {
                tx.send(self.detach_session(id).await).ok();
            }
            PierreApiMessage::SaveAnchor(update, tx) => {
                self.anchor.save(update);
                tx.send(()).ok();
            }
            PierreApiMessage::Flush(flush, tx) => {
                self.flush(&flush).await;
                tx.send(()).ok();
            }
            PierreApiMessage::SetPeers(peers, tx) => {
                let shm_name = self.config.clock.shm_name();
                tx.send(clock::set_peers(&shm_name, &peers).await).ok();
            }
            PierreApiMessage::Stop(tx) => {
                self.subsys.request_local_shutdown();
                tx.send(()).ok();
                return true;
            }
        }
        false
    }

    async fn attach_session(&mut self, stream: TcpStream) -> SessionInternalResult<u32> {
        let Some(key) = self.config.session.shared_key()? else {
            return Err(SessionInternalError::NoSharedKey);
        };
        let Some(dsp) = &self.dsp else {
            return Err(SessionInternalError::SessionClosed);
        };

        self.next_session_id += 1;
        let id = self.next_session_id;

        let api = start_spooler(
            format!("session-{id}"),
            stream,
            key,
            self.rack.clone(),
            dsp.clone(),
            self.config.frame.rack.clone(),
            self.monitoring.clone(),
            self.sessions_token.clone(),
        )
        .await?;

        self.sessions.insert(id, api);
        Ok(id)
    }

    async fn detach_session(&mut self, id: u32) -> SessionInternalResult<()> {
        if let Some(session) = self.sessions.remove(&id) {
            session.stop().await?;
        } else {
            warn!("No session with id {id}.");
        }
        Ok(())
    }

    async fn flush(&mut self, flush: &FlushRequest) {
        if self.sessions.is_empty() {
            self.rack.flush(flush);
            return;
        }

        for session in self.sessions.values() {
            session.flush(*flush).await.ok();
        }
    }

    /// Top down teardown: no new intake, sessions stop, the DSP pool
    /// drains, then rendering and the bridge go away.
    async fn teardown(&mut self) {
        for (id, session) in self.sessions.drain() {
            info!("Stopping session {id}.");
            session.stop().await.ok();
        }
        self.sessions_token.cancel();

        // workers exit once every session's handle to the job queue is gone
        self.dsp.take();

        self.render_token.cancel();
        self.desk_token.cancel();
    }
}
