//! Process-wide request activity tracking
//!
//! One entry per service: when it last saw traffic and how many requests are
//! currently being proxied to it. The reaper reads this state to decide what
//! is safe to stop; the front-end writes it around every proxied request.
//!
//! A single mutex guards the whole table. Every operation is a complete
//! read-modify-write under that mutex, and the mutex is never held across
//! `.await` points.

use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ActivityEntry {
    pub last_active: Instant,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
pub struct ActivityRegistry {
    entries: Mutex<HashMap<String, ActivityEntry>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request for `service` entered the proxy.
    pub fn begin_request(&self, service: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(service.to_string()).or_insert(ActivityEntry {
            last_active: now,
            in_flight: 0,
        });
        entry.in_flight += 1;
        entry.last_active = now;
    }

    /// A request for `service` finished (successfully or not).
    pub fn end_request(&self, service: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(service.to_string()).or_insert(ActivityEntry {
            last_active: now,
            in_flight: 0,
        });
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.last_active = now;
    }

    /// Start the idle timer for a newly discovered service. Existing entries
    /// are left untouched. Returns true when a new entry was created.
    pub fn seed(&self, service: &str, at: Instant) -> bool {
        let mut entries = self.entries.lock();
        match entries.entry(service.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(ActivityEntry {
                    last_active: at,
                    in_flight: 0,
                });
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Current in-flight count; zero for untracked services.
    pub fn in_flight(&self, service: &str) -> usize {
        self.entries
            .lock()
            .get(service)
            .map(|entry| entry.in_flight)
            .unwrap_or(0)
    }

    /// Copy of all entries for reaper iteration.
    pub fn snapshot(&self) -> Vec<(String, ActivityEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(service, entry)| (service.clone(), *entry))
            .collect()
    }

    /// Drop the entry for `service`. Only the reaper calls this.
    pub fn forget(&self, service: &str) {
        self.entries.lock().remove(service);
    }
}
