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

use miette::Result;
use pierre::{
    config::Config,
    error::{PierreError, ToBoxed},
    pierre::PierreApi,
    telemetry,
};
use std::time::Duration;
use tokio::{net::TcpListener, select};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    telemetry::init();

    let config = Config::load().await?;

    info!(
        "Starting pierre, clock segment {}, bridge {}:{}.",
        config.clock.shm_name(),
        config.remote.host,
        config.remote.port
    );

    let shutdown_token = CancellationToken::new();

    Toplevel::new_with_shutdown_token(
        async move |s: &mut SubsystemHandle| {
            s.start(SubsystemBuilder::new(
                "pierre",
                async move |s: &mut SubsystemHandle| {
                    let listen_port = config.session.listen_port;
                    let api = PierreApi::new(config, s.create_cancellation_token())
                        .await
                        .map_err(|e| PierreError::from(e.boxed()))?;

                    let listener = TcpListener::bind(("0.0.0.0", listen_port))
                        .await
                        .map_err(|e| PierreError::from(e.boxed()))?;
                    info!("Audio sessions accepted on port {listen_port}.");

                    loop {
                        select! {
                            accepted = listener.accept() => {
                                match accepted {
                                    Ok((stream, addr)) => {
                                        info!("Audio session from {addr}.");
                                        if let Err(e) = api.attach_session(stream).await {
                                            warn!("Could not attach session: {e}");
                                        }
                                    }
                                    Err(e) => warn!("Accept failed: {e}"),
                                }
                            },
                            _ = s.on_shutdown_requested() => break,
                        }
                    }

                    api.teardown().await.ok();

                    Ok::<(), PierreError>(())
                },
            ));
        },
        shutdown_token,
    )
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(2))
    .await?;

    Ok(())
}
