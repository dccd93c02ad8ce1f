//! Allocator interposition
//!
//! Every exported hook routes through a lazily resolved pointer to the
//! real function, records the event when tracking is active, and
//! otherwise behaves as a pass-through. A thread-local flag demotes
//! reentrant calls (the real allocator calling another hooked function)
//! to direct pass-through; the flag is set before anything that could
//! allocate and cleared on every exit path by the guard's drop.
//!
//! These exports must be the only symbols of their name in the preloaded
//! object; all internal allocator use goes through the resolved
//! pointers, never back through the hooks.

use crate::log::EventLog;
use crate::maps;
use crate::table::{AllocTable, DEFAULT_CAPACITY};
use cachescope_protocol::{AllocEvent, AllocKind, StackEvent, ENV_ENABLE, ENV_STACK_TRACE, ENV_TRACE};
use libc::{c_char, c_int, c_void, off_t, size_t};
use once_cell::sync::Lazy;
use std::cell::Cell;
use std::mem;
use std::path::PathBuf;

const MAX_CALLSITE_FRAMES: usize = 64;

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Cleared on drop so panics and early returns cannot leave the flag set.
struct HookGuard;

impl HookGuard {
    /// Claim the flag for this thread, or `None` when already inside a
    /// hook (or the thread is being torn down).
    fn enter() -> Option<HookGuard> {
        match IN_HOOK.try_with(|flag| {
            if flag.get() {
                false
            } else {
                flag.set(true);
                true
            }
        }) {
            Ok(true) => Some(HookGuard),
            _ => None,
        }
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

unsafe fn must_dlsym(name: &[u8]) -> usize {
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char);
    sym as usize
}

macro_rules! real_fn {
    ($static_name:ident, $name:literal) => {
        static $static_name: Lazy<usize> = Lazy::new(|| unsafe { must_dlsym($name) });
    };
}

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type MmapFn = unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, size_t) -> c_int;

real_fn!(REAL_MALLOC, b"malloc\0");
real_fn!(REAL_CALLOC, b"calloc\0");
real_fn!(REAL_REALLOC, b"realloc\0");
real_fn!(REAL_FREE, b"free\0");
real_fn!(REAL_MMAP, b"mmap\0");
real_fn!(REAL_MUNMAP, b"munmap\0");
real_fn!(REAL_NEW, b"_Znwm\0");
real_fn!(REAL_NEW_ARRAY, b"_Znam\0");
real_fn!(REAL_DELETE, b"_ZdlPv\0");
real_fn!(REAL_DELETE_ARRAY, b"_ZdaPv\0");

unsafe fn real_malloc(size: size_t) -> *mut c_void {
    let f: MallocFn = mem::transmute(*REAL_MALLOC);
    f(size)
}

unsafe fn real_free(ptr: *mut c_void) {
    let f: FreeFn = mem::transmute(*REAL_FREE);
    f(ptr)
}

/// Process-wide tracker state, constructed on first hook entry.
///
/// Tracking requires both enable and trace-path environment variables at
/// process start; anything short of that leaves the hooks pass-through.
struct Tracker {
    table: AllocTable,
    log: EventLog,
    stack_log: Option<EventLog>,
    exe_ranges: Vec<(u64, u64)>,
    pid: u32,
}

static TRACKER: Lazy<Option<Tracker>> = Lazy::new(Tracker::init);

impl Tracker {
    fn init() -> Option<Tracker> {
        std::env::var_os(ENV_ENABLE)?;
        let trace_path = PathBuf::from(std::env::var_os(ENV_TRACE)?);
        let log = EventLog::open(&trace_path).ok()?;
        let stack_log = std::env::var_os(ENV_STACK_TRACE)
            .map(PathBuf::from)
            .and_then(|p| EventLog::open(&p).ok());

        Some(Tracker {
            table: AllocTable::new(DEFAULT_CAPACITY),
            log,
            stack_log,
            exe_ranges: maps::self_exe_ranges(),
            pid: std::process::id(),
        })
    }

    /// First return address inside the main executable's segments.
    fn capture_callsite(&self) -> Option<u64> {
        if self.exe_ranges.is_empty() {
            return None;
        }
        let mut callsite = None;
        let mut frames = 0usize;
        backtrace::trace(|frame| {
            frames += 1;
            let ip = frame.ip() as u64;
            if maps::contains(&self.exe_ranges, ip) {
                callsite = Some(ip);
                return false;
            }
            frames < MAX_CALLSITE_FRAMES
        });
        callsite
    }

    fn record_alloc(&self, base: u64, size: u64, kind: AllocKind, fd: i32) {
        // No in-target frame means the allocation came from a foreign
        // library's internals; skip the event.
        let callsite = match self.capture_callsite() {
            Some(ip) => ip,
            None => return,
        };
        self.table.insert(base, size, callsite, kind, fd);
        self.log.append_alloc(&AllocEvent {
            base,
            size,
            callsite_ip: callsite,
            pid: self.pid,
            reserved: 0,
            type_handle: 0,
            kind,
            is_free: false,
        });
    }

    fn record_free(&self, base: u64, kind: AllocKind) {
        if !self.table.remove(base) {
            // Freed something we never saw (pre-init allocation); the
            // log entry would only confuse replay.
            return;
        }
        self.log.append_alloc(&AllocEvent {
            base,
            size: 0,
            callsite_ip: 0,
            pid: self.pid,
            reserved: 0,
            type_handle: 0,
            kind,
            is_free: true,
        });
    }
}

/// Teardown hook run by the dynamic linker on process exit.
extern "C" fn flush_at_exit() {
    if let Some(tracker) = TRACKER.as_ref() {
        tracker.log.flush();
        if let Some(stack_log) = &tracker.stack_log {
            stack_log.flush();
        }
    }
}

#[used]
#[link_section = ".fini_array"]
static TEARDOWN: extern "C" fn() = flush_at_exit;

fn track_alloc(base: u64, size: u64, kind: AllocKind, fd: i32) {
    if base < 2 {
        return;
    }
    let _guard = match HookGuard::enter() {
        Some(g) => g,
        None => return,
    };
    if let Some(tracker) = TRACKER.as_ref() {
        tracker.record_alloc(base, size, kind, fd);
    }
}

fn track_free(base: u64, kind: AllocKind) {
    if base < 2 {
        return;
    }
    let _guard = match HookGuard::enter() {
        Some(g) => g,
        None => return,
    };
    if let Some(tracker) = TRACKER.as_ref() {
        tracker.record_free(base, kind);
    }
}

/* ------------------------- C allocator hooks ------------------------- */

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let ptr = real_malloc(size);
    if !ptr.is_null() {
        track_alloc(ptr as u64, size as u64, AllocKind::Heap, -1);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let f: CallocFn = mem::transmute(*REAL_CALLOC);
    let ptr = f(nmemb, size);
    if !ptr.is_null() {
        track_alloc(
            ptr as u64,
            (nmemb as u64).saturating_mul(size as u64),
            AllocKind::Heap,
            -1,
        );
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn realloc(old_ptr: *mut c_void, size: size_t) -> *mut c_void {
    let f: ReallocFn = mem::transmute(*REAL_REALLOC);
    let ptr = f(old_ptr, size);
    if !ptr.is_null() {
        if !old_ptr.is_null() {
            track_free(old_ptr as u64, AllocKind::Heap);
        }
        track_alloc(ptr as u64, size as u64, AllocKind::Heap, -1);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if !ptr.is_null() {
        track_free(ptr as u64, AllocKind::Heap);
    }
    real_free(ptr);
}

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let f: MmapFn = mem::transmute(*REAL_MMAP);
    let ptr = f(addr, length, prot, flags, fd, offset);
    if ptr != libc::MAP_FAILED {
        track_alloc(ptr as u64, length as u64, AllocKind::Mmap, fd);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, length: size_t) -> c_int {
    if !addr.is_null() {
        track_free(addr as u64, AllocKind::Mmap);
    }
    let f: MunmapFn = mem::transmute(*REAL_MUNMAP);
    f(addr, length)
}

/* ---------------------- C++ new/delete hooks ------------------------- */
// Mangled names for operator new(size_t), operator new[](size_t) and the
// delete family. The real symbols live in the C++ runtime; when the
// target never loaded one, the hooks fall back to the C allocator.

#[no_mangle]
pub unsafe extern "C" fn _Znwm(size: size_t) -> *mut c_void {
    let real = *REAL_NEW;
    let ptr = if real != 0 {
        let f: MallocFn = mem::transmute(real);
        f(size)
    } else {
        real_malloc(size)
    };
    if !ptr.is_null() {
        track_alloc(ptr as u64, size as u64, AllocKind::Heap, -1);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn _Znam(size: size_t) -> *mut c_void {
    let real = *REAL_NEW_ARRAY;
    let ptr = if real != 0 {
        let f: MallocFn = mem::transmute(real);
        f(size)
    } else {
        real_malloc(size)
    };
    if !ptr.is_null() {
        track_alloc(ptr as u64, size as u64, AllocKind::Heap, -1);
    }
    ptr
}

unsafe fn delete_impl(ptr: *mut c_void, real: usize) {
    if ptr.is_null() {
        return;
    }
    track_free(ptr as u64, AllocKind::Heap);
    if real != 0 {
        let f: FreeFn = mem::transmute(real);
        f(ptr)
    } else {
        real_free(ptr)
    }
}

#[no_mangle]
pub unsafe extern "C" fn _ZdlPv(ptr: *mut c_void) {
    delete_impl(ptr, *REAL_DELETE);
}

#[no_mangle]
pub unsafe extern "C" fn _ZdaPv(ptr: *mut c_void) {
    delete_impl(ptr, *REAL_DELETE_ARRAY);
}

#[no_mangle]
pub unsafe extern "C" fn _ZdlPvm(ptr: *mut c_void, _size: size_t) {
    delete_impl(ptr, *REAL_DELETE);
}

#[no_mangle]
pub unsafe extern "C" fn _ZdaPvm(ptr: *mut c_void, _size: size_t) {
    delete_impl(ptr, *REAL_DELETE_ARRAY);
}

/* ---------------------- instrumentation hooks ------------------------ */
// Targets built with -finstrument-functions report frame entry here;
// records land in the optional stack trace file.

#[no_mangle]
pub unsafe extern "C" fn __cyg_profile_func_enter(func: *mut c_void, caller: *mut c_void) {
    let _guard = match HookGuard::enter() {
        Some(g) => g,
        None => return,
    };
    let tracker = match TRACKER.as_ref() {
        Some(t) => t,
        None => return,
    };
    let stack_log = match &tracker.stack_log {
        Some(log) => log,
        None => return,
    };
    // The address of a local approximates the frame the compiler
    // established for this call.
    let frame_marker = 0u64;
    stack_log.append_stack(&StackEvent {
        function_ip: func as u64,
        cfa: &frame_marker as *const u64 as u64,
        callsite: caller as u64,
        pid: tracker.pid,
        tid: libc::syscall(libc::SYS_gettid) as u32,
    });
}

#[no_mangle]
pub unsafe extern "C" fn __cyg_profile_func_exit(_func: *mut c_void, _caller: *mut c_void) {}
