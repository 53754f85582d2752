use pierre::clock::{ClockSource, MasterClock, now_monotonic_ns};
use std::{thread, time::Duration};

fn main() {
    let shm_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("/pierre-{}", gethostname::gethostname().to_string_lossy()));

    let mut clock = MasterClock::new(shm_name.clone());
    eprintln!("polling {shm_name}");

    loop {
        match clock.info_no_wait() {
            Ok(info) => {
                let age_ms = now_monotonic_ns().saturating_sub(info.sample_time_ns) / 1_000_000;
                eprintln!(
                    "master {:#018x} ip {} offset {} ns sample age {} ms",
                    info.master_id, info.master_ip, info.offset_local_to_master_ns, age_ms
                );
            }
            Err(e) => eprintln!("no clock: {e}"),
        }

        thread::sleep(Duration::from_secs(1));
    }
}
