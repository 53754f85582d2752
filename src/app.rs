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

use crate::error::{ChildAppError, ChildAppResult};
use std::{error::Error, future::Future, thread, time::Duration};
use tokio::{runtime, spawn, sync::mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub enum AppState {
    Started,
    TerminatedNormally,
    Crashed(Box<dyn Error + Send + Sync>),
}

/// Spawns a subsystem on its own named thread with a dedicated
/// current-thread runtime, tied to the given shutdown token.
pub fn spawn_child_app<Err, Fut, Subsys>(
    name: String,
    subsystem: Subsys,
    shutdown_token: CancellationToken,
) -> ChildAppResult<mpsc::Receiver<AppState>>
where
    Subsys: 'static
        + FnOnce(SubsystemHandle<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Fut
        + Send,
    Fut: 'static + Future<Output = Result<(), Err>> + Send,
    Err: std::error::Error + Send + Sync + 'static,
{
    let (state_tx, state_rx) = mpsc::channel(1);

    let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(it) => it,
        Err(e) => {
            return Err(ChildAppError(name, e.to_string()));
        }
    };

    let n = name.clone();
    if let Err(e) = thread::Builder::new()
        .name(name.clone())
        .spawn(move || start_child_app_runtime(n, subsystem, runtime, state_tx, shutdown_token))
    {
        return Err(ChildAppError(name, e.to_string()));
    }

    Ok(state_rx)
}

fn start_child_app_runtime<Err, Fut, Subsys>(
    name: String,
    subsystem: Subsys,
    runtime: tokio::runtime::Runtime,
    state_tx: mpsc::Sender<AppState>,
    shutdown_token: CancellationToken,
) where
    Subsys: 'static
        + FnOnce(SubsystemHandle<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Fut
        + Send,
    Fut: 'static + Future<Output = Result<(), Err>> + Send,
    Err: std::error::Error + Send + Sync + 'static,
{
    runtime.block_on(async move {
        let n = name.clone();
        let tx = state_tx.clone();
        if let Err(e) = Toplevel::new_with_shutdown_token(
            async move |s: SubsystemHandle| {
                s.start(SubsystemBuilder::new(
                    n,
                    async move |s: SubsystemHandle| {
                        info!("Child app '{}' starting …", name);
                        tx.send(AppState::Started).await.ok();
                        let res = subsystem(s).await;
                        info!("Child app '{}' stopped.", name);
                        tx.send(AppState::TerminatedNormally).await.ok();
                        res
                    },
                ));
            },
            shutdown_token.clone(),
        )
        .handle_shutdown_requests(Duration::from_secs(1))
        .await
        {
            state_tx.send(AppState::Crashed(Box::new(e))).await.ok();
        }
    });
}

pub async fn wait_for_start(
    name: String,
    app: &mut mpsc::Receiver<AppState>,
) -> ChildAppResult<()> {
    match app.recv().await {
        Some(AppState::Started) => Ok(()),
        None | Some(AppState::TerminatedNormally) => {
            let msg = format!("{name} terminated immediately after start.");
            Err(ChildAppError(name, msg))
        }
        Some(AppState::Crashed(e)) => Err(ChildAppError(name, e.to_string())),
    }
}

pub fn propagate_exit(mut app: mpsc::Receiver<AppState>, shutdown_token: CancellationToken) {
    spawn(async move {
        while let Some(state) = app.recv().await {
            match state {
                AppState::Started => (),
                AppState::TerminatedNormally => {
                    shutdown_token.cancel();
                    break;
                }
                AppState::Crashed(err) => {
                    error!("Child app crashed with error: {err}");
                    shutdown_token.cancel();
                    break;
                }
            }
        }
    });
}
