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

//! Master clock access.
//!
//! An external PTP daemon publishes the currently elected master clock in a
//! named shared memory segment. [`MasterClock`] maps that segment on demand
//! and copies out an immutable [`ClockInfo`] snapshot under the POSIX mutex
//! embedded at the start of the segment. The daemon's timing peer list is
//! maintained through a UDP control datagram on localhost.

use crate::error::{ClockError, ClockResult};
use shared_memory::{Shmem, ShmemConf};
use std::{io, net::IpAddr};
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Samples older than this are considered stale and unusable for rendering.
pub const SAMPLE_MAX_AGE_NS: u64 = 10 * NANOS_PER_SEC;

const SHM_VERSION: u16 = 7;
const MUTEX_SPIN_LIMIT: u32 = 64;

const CTRL_ADDR: &str = "127.0.0.1:9000";

/// Immutable snapshot of the shared memory clock segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClockInfo {
    pub master_id: u64,
    pub master_ip: String,
    /// Local monotonic time at which the daemon sampled the master.
    pub sample_time_ns: u64,
    pub offset_local_to_master_ns: i64,
    pub mastership_start_ns: u64,
}

impl ClockInfo {
    pub fn ok(&self) -> bool {
        self.master_id != 0
    }

    pub fn is_stale(&self, now_ns: u64) -> bool {
        now_ns.saturating_sub(self.sample_time_ns) > SAMPLE_MAX_AGE_NS
    }

    /// Maps an instant on the master timeline to the local monotonic timeline.
    pub fn master_to_local_ns(&self, master_ns: u64) -> i64 {
        master_ns as i64 - self.offset_local_to_master_ns
    }
}

/// Layout of the daemon's shared memory segment. The mutex must stay at
/// offset 0, it is locked by daemon and clients alike.
#[repr(C)]
struct ShmSegment {
    mutex: libc::pthread_mutex_t,
    version: u16,
    master_clock_id: u64,
    master_clock_ip: [u8; 64],
    local_time: u64,
    local_to_master_time_offset: i64,
    master_clock_start_time: u64,
}

/// Reads the current time of the local monotonic raw clock, the timeline the
/// PTP daemon samples `local_time` on.
pub fn now_monotonic_ns() -> u64 {
    let mut tp = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime on CLOCK_MONOTONIC_RAW cannot fail with a valid timespec
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut tp) };
    tp.tv_sec as u64 * NANOS_PER_SEC + tp.tv_nsec as u64
}

/// Source of master clock snapshots. The render loop is generic over this
/// seam so tests can inject fabricated snapshots.
pub trait ClockSource: Send + 'static {
    fn info_no_wait(&mut self) -> ClockResult<ClockInfo>;
}

struct Mapping(Shmem);

// The mapping handle is only ever used from the thread that owns the
// MasterClock; access to the segment itself is guarded by the embedded
// POSIX mutex.
unsafe impl Send for Mapping {}

pub struct MasterClock {
    shm_name: String,
    mapped: Option<Mapping>,
}

impl MasterClock {
    pub fn new(shm_name: String) -> Self {
        MasterClock {
            shm_name,
            mapped: None,
        }
    }

    fn map_shared_mem(&mut self) -> ClockResult<&Mapping> {
        if self.mapped.is_none() {
            let shmem = ShmemConf::new()
                .os_id(&self.shm_name)
                .open()
                .map_err(|e| ClockError::SharedMemoryError(e.to_string()))?;

            if shmem.len() < size_of::<ShmSegment>() {
                return Err(ClockError::NotMapped(self.shm_name.clone()));
            }

            info!("Mapped clock segment {}.", self.shm_name);
            self.mapped = Some(Mapping(shmem));
        }

        self.mapped
            .as_ref()
            .ok_or_else(|| ClockError::NotMapped(self.shm_name.clone()))
    }

    fn load_info_from_mapped(&mut self) -> ClockResult<ClockInfo> {
        let mapping = self.map_shared_mem()?;
        let segment = mapping.0.as_ptr() as *mut ShmSegment;

        let mutex = segment as *mut libc::pthread_mutex_t;
        let mut attempts = 0;
        loop {
            let rc = unsafe { libc::pthread_mutex_trylock(mutex) };
            if rc == 0 {
                break;
            }
            if rc != libc::EBUSY {
                return Err(ClockError::IoError(io::Error::from_raw_os_error(rc)));
            }
            attempts += 1;
            if attempts >= MUTEX_SPIN_LIMIT {
                return Err(ClockError::MutexBusy);
            }
            std::thread::yield_now();
        }

        let (version, master_id, ip_raw, sample_time_ns, offset_ns, mastership_start_ns) = unsafe {
            let seg = &*segment;
            (
                seg.version,
                seg.master_clock_id,
                seg.master_clock_ip,
                seg.local_time,
                seg.local_to_master_time_offset,
                seg.master_clock_start_time,
            )
        };

        unsafe { libc::pthread_mutex_unlock(mutex) };

        if version != SHM_VERSION {
            return Err(ClockError::VersionMismatch {
                expected: SHM_VERSION,
                actual: version,
            });
        }

        if master_id == 0 {
            return Err(ClockError::NoMaster);
        }

        let ip_len = ip_raw.iter().position(|b| *b == 0).unwrap_or(ip_raw.len());
        let master_ip = String::from_utf8_lossy(&ip_raw[..ip_len]).into_owned();

        let info = ClockInfo {
            master_id,
            master_ip,
            sample_time_ns,
            offset_local_to_master_ns: offset_ns,
            mastership_start_ns,
        };

        let age = now_monotonic_ns().saturating_sub(info.sample_time_ns);
        if age > SAMPLE_MAX_AGE_NS {
            return Err(ClockError::StaleSample(age));
        }

        Ok(info)
    }

    pub fn teardown(&mut self) {
        if self.mapped.take().is_some() {
            debug!("Unmapped clock segment {}.", self.shm_name);
        }
    }
}

impl ClockSource for MasterClock {
    fn info_no_wait(&mut self) -> ClockResult<ClockInfo> {
        self.load_info_from_mapped()
    }
}

/// Replaces the PTP daemon's timing peer list for our shared memory segment.
///
/// The daemon's control port expects
/// `"<shm_name> T [ip [ip …]]"`, null terminated. An empty peer list clears
/// the current list.
#[instrument]
pub async fn set_peers(shm_name: &str, peers: &[IpAddr]) -> ClockResult<()> {
    let mut msg = format!("{shm_name} T");
    for peer in peers {
        msg.push(' ');
        msg.push_str(&peer.to_string());
    }

    let mut payload = msg.into_bytes();
    payload.push(0x00);

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let sent = socket.send_to(&payload, CTRL_ADDR).await?;

    if sent != payload.len() {
        warn!("Short peer update datagram: sent {sent} of {} bytes", payload.len());
    } else {
        debug!("Updated timing peers ({} peers).", peers.len());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_without_master_is_not_ok() {
        let info = ClockInfo::default();
        assert!(!info.ok());
    }

    #[test]
    fn staleness_boundary_is_ten_seconds() {
        let info = ClockInfo {
            master_id: 1,
            sample_time_ns: 1_000,
            ..ClockInfo::default()
        };
        assert!(!info.is_stale(1_000 + SAMPLE_MAX_AGE_NS));
        assert!(info.is_stale(1_000 + SAMPLE_MAX_AGE_NS + 1));
    }

    #[test]
    fn master_offset_maps_into_local_timeline() {
        let info = ClockInfo {
            master_id: 1,
            offset_local_to_master_ns: 250,
            ..ClockInfo::default()
        };
        assert_eq!(750, info.master_to_local_ns(1_000));

        let negative = ClockInfo {
            master_id: 1,
            offset_local_to_master_ns: -250,
            ..ClockInfo::default()
        };
        assert_eq!(1_250, negative.master_to_local_ns(1_000));
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = now_monotonic_ns();
        let b = now_monotonic_ns();
        assert!(b >= a);
    }
}
