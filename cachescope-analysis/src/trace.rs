//! Allocation trace decoding and live-set replay
//!
//! The preloaded tracker appends fixed-size records; replaying them in
//! log order reconstructs the set of live regions at any point. The log
//! is only ordered per thread, which is good enough for post-hoc
//! containment queries.

use anyhow::Context;
use cachescope_protocol::{AllocEvent, AllocKind, ALLOC_RECORD_SIZE};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Decode every allocation record in the trace file.
///
/// A trailing partial record (the target was killed mid-write) is
/// dropped, not an error.
pub fn read_alloc_events(path: &Path) -> anyhow::Result<Vec<AllocEvent>> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read allocation trace {}", path.display()))?;
    let mut events = Vec::with_capacity(data.len() / ALLOC_RECORD_SIZE);
    for chunk in data.chunks_exact(ALLOC_RECORD_SIZE) {
        let buf: &[u8; ALLOC_RECORD_SIZE] = chunk.try_into().unwrap();
        events.push(AllocEvent::decode(buf));
    }
    let rem = data.len() % ALLOC_RECORD_SIZE;
    if rem != 0 {
        debug!("dropping {} trailing bytes of partial record", rem);
    }
    info!("read {} allocation events from {}", events.len(), path.display());
    Ok(events)
}

/// A live allocation reconstructed from the log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveAllocation {
    pub base: u64,
    pub size: u64,
    pub callsite_ip: u64,
    pub kind: AllocKind,
}

/// The set of regions live after replaying a prefix of the log.
#[derive(Debug, Default)]
pub struct LiveSet {
    regions: BTreeMap<u64, LiveAllocation>,
}

impl LiveSet {
    /// Replay the whole log.
    pub fn replay(events: &[AllocEvent]) -> Self {
        let mut set = LiveSet::default();
        for ev in events {
            set.apply(ev);
        }
        set
    }

    pub fn apply(&mut self, ev: &AllocEvent) {
        if ev.base == 0 {
            return;
        }
        if ev.is_free {
            self.regions.remove(&ev.base);
        } else {
            self.regions.insert(
                ev.base,
                LiveAllocation {
                    base: ev.base,
                    size: ev.size,
                    callsite_ip: ev.callsite_ip,
                    kind: ev.kind,
                },
            );
        }
    }

    /// The live region containing `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<&LiveAllocation> {
        let (_, alloc) = self.regions.range(..=addr).next_back()?;
        (addr < alloc.base + alloc.size).then_some(alloc)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn event(base: u64, size: u64, is_free: bool) -> AllocEvent {
        AllocEvent {
            base,
            size,
            callsite_ip: 0x401000,
            pid: 1,
            kind: AllocKind::Heap,
            is_free,
            ..Default::default()
        }
    }

    #[test]
    fn replay_tracks_insert_and_free() {
        let events = vec![
            event(0x1000, 64, false),
            event(0x2000, 128, false),
            event(0x1000, 0, true),
        ];
        let live = LiveSet::replay(&events);
        assert_eq!(live.len(), 1);
        assert!(live.lookup(0x1000).is_none());
        assert_eq!(live.lookup(0x2040).unwrap().base, 0x2000);
        assert!(live.lookup(0x2080).is_none());
    }

    #[test]
    fn lookup_covers_every_byte_of_a_region() {
        let live = LiveSet::replay(&[event(0x1000, 32, false)]);
        for k in 0..32u64 {
            assert_eq!(live.lookup(0x1000 + k).unwrap().base, 0x1000);
        }
        assert!(live.lookup(0xfff).is_none());
        assert!(live.lookup(0x1020).is_none());
    }

    #[test]
    fn trace_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc.trace");
        let events = vec![event(0x1000, 64, false), event(0x1000, 0, true)];
        {
            let mut f = std::fs::File::create(&path).unwrap();
            for ev in &events {
                f.write_all(&ev.encode()).unwrap();
            }
            // Partial trailing record is ignored.
            f.write_all(&[0u8; 7]).unwrap();
        }
        let read = read_alloc_events(&path).unwrap();
        assert_eq!(read, events);
    }
}
