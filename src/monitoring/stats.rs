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

use crate::{
    app::{spawn_child_app, wait_for_start},
    config::StatsConfig,
    error::PierreInternalResult,
    monitoring::{Metric, Monitoring, MonitoringEvent},
};
use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{select, sync::mpsc, time::interval};
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_QUEUE_DEPTH: usize = 4096;
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Starts the stats subsystem and returns the monitoring handle the rest of
/// the pipeline reports through.
pub async fn start_stats(
    config: StatsConfig,
    shutdown_token: CancellationToken,
) -> PierreInternalResult<Monitoring> {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let subsystem_name = "stats".to_owned();
    let subsystem = async move |s: SubsystemHandle| {
        StatsActor::new(&s, config, rx).run().await;
        Ok::<(), std::convert::Infallible>(())
    };

    let mut app = spawn_child_app(subsystem_name.clone(), subsystem, shutdown_token)?;
    wait_for_start(subsystem_name, &mut app).await?;

    Ok(Monitoring::new(tx))
}

struct StatsActor<'a> {
    subsys: &'a SubsystemHandle,
    config: StatsConfig,
    rx: mpsc::Receiver<MonitoringEvent>,
    counters: HashMap<Metric, u64>,
    batch: Vec<String>,
    client: reqwest::Client,
}

impl<'a> StatsActor<'a> {
    fn new(
        subsys: &'a SubsystemHandle,
        config: StatsConfig,
        rx: mpsc::Receiver<MonitoringEvent>,
    ) -> Self {
        Self {
            subsys,
            config,
            rx,
            counters: HashMap::new(),
            batch: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    async fn run(mut self) {
        info!(
            "Stats subsystem started (sink {}).",
            if self.config.enabled {
                self.config.db_uri.as_str()
            } else {
                "disabled"
            }
        );

        let mut flush_timer = interval(FLUSH_INTERVAL);

        loop {
            select! {
                Some(evt) = self.rx.recv() => self.process_event(evt).await,
                _ = flush_timer.tick() => self.flush().await,
                _ = self.subsys.on_shutdown_requested() => break,
                else => break,
            }
        }

        self.flush().await;
        info!("Stats subsystem stopped.");
    }

    async fn process_event(&mut self, evt: MonitoringEvent) {
        let (metric, value) = match evt {
            MonitoringEvent::Count(metric, value) => {
                *self.counters.entry(metric).or_default() += value;
                (metric, value)
            }
            MonitoringEvent::Duration(metric, nanos) => (metric, nanos),
        };

        if self.config.enabled {
            self.push_point(metric, value);
            if self.batch.len() >= self.config.batch_of {
                self.flush().await;
            }
        }
    }

    fn push_point(&mut self, metric: Metric, value: u64) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        self.batch.push(format!(
            "pierre,metric={},type={} val={value}i {ts}",
            metric.name(),
            metric.kind().name(),
        ));
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let lines = self.batch.join("\n");
        let count = self.batch.len();
        self.batch.clear();

        match self
            .client
            .post(&self.config.db_uri)
            .body(lines)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!("Flushed {count} stats points.");
            }
            Ok(resp) => {
                warn!("Stats sink rejected batch: {}", resp.status());
            }
            Err(e) => {
                warn!("Could not flush stats batch: {e}");
            }
        }
    }
}
