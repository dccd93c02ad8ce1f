//! Fixed-size allocation and stack trace records
//!
//! The preloaded tracker appends these records to the trace files named by
//! `CACHESCOPE_TRACE` / `CACHESCOPE_STACK_TRACE`; the analyzer decodes them
//! offline. Encoding is explicit little-endian field-by-field so the layout
//! cannot drift with compiler padding decisions.

/// Byte size of one encoded [`AllocEvent`].
pub const ALLOC_RECORD_SIZE: usize = 48;

/// Byte size of one encoded [`StackEvent`].
pub const STACK_RECORD_SIZE: usize = 32;

/// Origin of a tracked region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum AllocKind {
    #[default]
    Heap = 0,
    Mmap = 1,
}

impl AllocKind {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => AllocKind::Mmap,
            _ => AllocKind::Heap,
        }
    }
}

/// One allocation-log record.
///
/// `is_free` distinguishes insertion from removal; the log is append-only
/// and ordered per thread, not globally.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AllocEvent {
    pub base: u64,
    pub size: u64,
    pub callsite_ip: u64,
    pub pid: u32,
    pub reserved: u32,
    pub type_handle: u64,
    pub kind: AllocKind,
    pub is_free: bool,
}

impl AllocEvent {
    pub fn encode(&self) -> [u8; ALLOC_RECORD_SIZE] {
        let mut buf = [0u8; ALLOC_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.base.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.callsite_ip.to_le_bytes());
        buf[24..28].copy_from_slice(&self.pid.to_le_bytes());
        buf[28..32].copy_from_slice(&self.reserved.to_le_bytes());
        buf[32..40].copy_from_slice(&self.type_handle.to_le_bytes());
        buf[40..44].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[44..48].copy_from_slice(&(self.is_free as u32).to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; ALLOC_RECORD_SIZE]) -> Self {
        let u64_at = |i: usize| u64::from_le_bytes(buf[i..i + 8].try_into().unwrap());
        let u32_at = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
        AllocEvent {
            base: u64_at(0),
            size: u64_at(8),
            callsite_ip: u64_at(16),
            pid: u32_at(24),
            reserved: u32_at(28),
            type_handle: u64_at(32),
            kind: AllocKind::from_u32(u32_at(40)),
            is_free: u32_at(44) != 0,
        }
    }
}

/// One runtime stack-entry record, written when `CACHESCOPE_STACK_TRACE`
/// is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StackEvent {
    pub function_ip: u64,
    pub cfa: u64,
    pub callsite: u64,
    pub pid: u32,
    pub tid: u32,
}

impl StackEvent {
    pub fn encode(&self) -> [u8; STACK_RECORD_SIZE] {
        let mut buf = [0u8; STACK_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.function_ip.to_le_bytes());
        buf[8..16].copy_from_slice(&self.cfa.to_le_bytes());
        buf[16..24].copy_from_slice(&self.callsite.to_le_bytes());
        buf[24..28].copy_from_slice(&self.pid.to_le_bytes());
        buf[28..32].copy_from_slice(&self.tid.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; STACK_RECORD_SIZE]) -> Self {
        let u64_at = |i: usize| u64::from_le_bytes(buf[i..i + 8].try_into().unwrap());
        let u32_at = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
        StackEvent {
            function_ip: u64_at(0),
            cfa: u64_at(8),
            callsite: u64_at(16),
            pid: u32_at(24),
            tid: u32_at(28),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_event_round_trip() {
        let ev = AllocEvent {
            base: 0x7f00_dead_0000,
            size: 4096,
            callsite_ip: 0x401234,
            pid: 4242,
            reserved: 0,
            type_handle: 0,
            kind: AllocKind::Mmap,
            is_free: true,
        };
        assert_eq!(AllocEvent::decode(&ev.encode()), ev);
    }

    #[test]
    fn alloc_event_layout_is_stable() {
        let ev = AllocEvent {
            base: 1,
            size: 2,
            callsite_ip: 3,
            pid: 4,
            reserved: 0,
            type_handle: 5,
            kind: AllocKind::Heap,
            is_free: false,
        };
        let buf = ev.encode();
        assert_eq!(&buf[0..8], &1u64.to_le_bytes());
        assert_eq!(&buf[8..16], &2u64.to_le_bytes());
        assert_eq!(&buf[16..24], &3u64.to_le_bytes());
        assert_eq!(&buf[24..28], &4u32.to_le_bytes());
        assert_eq!(&buf[32..40], &5u64.to_le_bytes());
        assert_eq!(&buf[40..44], &0u32.to_le_bytes());
        assert_eq!(&buf[44..48], &0u32.to_le_bytes());
    }

    #[test]
    fn stack_event_round_trip() {
        let ev = StackEvent {
            function_ip: 0x401000,
            cfa: 0x7fff_a010,
            callsite: 0x402000,
            pid: 1,
            tid: 2,
        };
        assert_eq!(StackEvent::decode(&ev.encode()), ev);
    }
}
