//! WASI preview1 syscall bridge
//!
//! Implements the subset of `wasi_snapshot_preview1` an interactive terminal
//! app needs: stdio, argv/environ, a non-blocking `poll_oneoff`, clocks,
//! randomness and process exit. Filesystem calls report that nothing exists.
//!
//! Every call operates on the guest's linear memory passed in as a byte
//! slice, so the bridge itself is independent of the wasm runtime; the
//! runtime glue lives in [`super::guest`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

pub const STDIN_FD: u32 = 0;
pub const STDOUT_FD: u32 = 1;
pub const STDERR_FD: u32 = 2;

const IOVEC_SIZE: u32 = 8;
const SUBSCRIPTION_SIZE: u32 = 48;
const EVENT_SIZE: u32 = 32;
const FDSTAT_SIZE: u32 = 24;

pub const EVENTTYPE_CLOCK: u8 = 0;
pub const EVENTTYPE_FD_READ: u8 = 1;

const FILETYPE_UNKNOWN: u8 = 0;
const FILETYPE_CHARACTER_DEVICE: u8 = 2;

/// WASI errno values returned to the guest
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Success = 0,
    /// Try again: no input queued
    Again = 6,
    /// Bad descriptor, also "no such resource"
    Badf = 8,
    /// Guest pointer out of bounds
    Fault = 21,
    Io = 29,
}

impl Errno {
    pub fn raw(self) -> u32 {
        self as u32
    }
}

fn status(result: Result<(), Errno>) -> Errno {
    match result {
        Ok(()) => Errno::Success,
        Err(errno) => errno,
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("Input queue full: {queued} bytes queued, limit {limit}, rejected {rejected} bytes")]
    Full {
        queued: usize,
        limit: usize,
        rejected: usize,
    },
}

/// FIFO of input chunks with a bound on total queued bytes
#[derive(Debug)]
pub struct InputQueue {
    chunks: VecDeque<Vec<u8>>,
    queued: usize,
    limit: usize,
}

impl InputQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            queued: 0,
            limit,
        }
    }

    /// Append a chunk. Empty chunks are dropped so a read never reports end-of-file.
    pub fn push(&mut self, data: &[u8]) -> Result<(), InputError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.queued + data.len() > self.limit {
            return Err(InputError::Full {
                queued: self.queued,
                limit: self.limit,
                rejected: data.len(),
            });
        }
        self.queued += data.len();
        self.chunks.push_back(data.to_vec());
        Ok(())
    }

    fn pop_front(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.pop_front()?;
        self.queued -= chunk.len();
        Some(chunk)
    }

    // Remainders of a partially consumed chunk go back to the head,
    // regardless of the limit.
    fn requeue_front(&mut self, rest: Vec<u8>) {
        self.queued += rest.len();
        self.chunks.push_front(rest);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued
    }
}

/// Shared handle to a guest's stdin queue
#[derive(Debug, Clone)]
pub struct InputHandle(Arc<Mutex<InputQueue>>);

impl InputHandle {
    pub fn new(limit: usize) -> Self {
        Self(Arc::new(Mutex::new(InputQueue::new(limit))))
    }

    pub fn push(&self, data: &[u8]) -> Result<(), InputError> {
        let result = self.lock().push(data);
        if let Err(e) = &result {
            warn!("{}", e);
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.lock().queued_bytes()
    }

    fn lock(&self) -> MutexGuard<'_, InputQueue> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cooperative cancellation flag shared between a session and its guest
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type OutputSink = Box<dyn FnMut(&[u8]) + Send>;
pub type ExitHook = Box<dyn FnMut(i32) + Send>;

/// Environment with the terminal defaults first; user entries override in place
pub fn build_env<I>(user: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut entries = vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
    ];
    for (key, value) in user {
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }
    entries
}

/// Per-session WASI state
pub struct WasiBridge {
    args: Vec<Vec<u8>>,
    env: Vec<Vec<u8>>,
    input: InputHandle,
    stdout: OutputSink,
    stderr: OutputSink,
    on_exit: ExitHook,
    cancel: CancelToken,
    last_clock_ns: u64,
    exit_code: Option<i32>,
}

impl WasiBridge {
    /// `env` is the user's environment; TERM and COLORTERM defaults are added
    pub fn new<I>(args: Vec<String>, env: I, input: InputHandle) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            args: args.into_iter().map(String::into_bytes).collect(),
            env: build_env(env)
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v).into_bytes())
                .collect(),
            input,
            stdout: Box::new(|_| {}),
            stderr: Box::new(|_| {}),
            on_exit: Box::new(|_| {}),
            cancel: CancelToken::new(),
            last_clock_ns: 0,
            exit_code: None,
        }
    }

    pub fn with_stdout(mut self, sink: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.stdout = Box::new(sink);
        self
    }

    pub fn with_stderr(mut self, sink: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.stderr = Box::new(sink);
        self
    }

    pub fn with_exit_hook(mut self, hook: impl FnMut(i32) + Send + 'static) -> Self {
        self.on_exit = Box::new(hook);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn input(&self) -> &InputHandle {
        &self.input
    }

    /// Queue bytes for the guest's stdin
    pub fn push_input(&self, data: &[u8]) -> Result<(), InputError> {
        self.input.push(data)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Code passed to `proc_exit`, if the guest called it
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn args_sizes_get(&self, mem: &mut [u8], argc_ptr: u32, buf_size_ptr: u32) -> Errno {
        sizes_get(mem, &self.args, argc_ptr, buf_size_ptr)
    }

    pub fn args_get(&self, mem: &mut [u8], argv_ptr: u32, buf_ptr: u32) -> Errno {
        strings_get(mem, &self.args, argv_ptr, buf_ptr)
    }

    pub fn environ_sizes_get(&self, mem: &mut [u8], count_ptr: u32, buf_size_ptr: u32) -> Errno {
        sizes_get(mem, &self.env, count_ptr, buf_size_ptr)
    }

    pub fn environ_get(&self, mem: &mut [u8], environ_ptr: u32, buf_ptr: u32) -> Errno {
        strings_get(mem, &self.env, environ_ptr, buf_ptr)
    }

    /// Concatenate all iovecs and hand them to the stdout or stderr sink
    pub fn fd_write(
        &mut self,
        mem: &mut [u8],
        fd: u32,
        iovs: u32,
        iovs_len: u32,
        nwritten_ptr: u32,
    ) -> Errno {
        let sink = match fd {
            STDOUT_FD => &mut self.stdout,
            STDERR_FD => &mut self.stderr,
            _ => return Errno::Badf,
        };
        status((|| {
            let iovecs = read_iovecs(mem, iovs, iovs_len)?;
            let mut merged = Vec::new();
            for &(ptr, len) in &iovecs {
                merged.extend_from_slice(slice(mem, ptr, len)?);
            }
            let nwritten = u32::try_from(merged.len()).map_err(|_| Errno::Fault)?;
            write_u32(mem, nwritten_ptr, nwritten)?;
            if !merged.is_empty() {
                sink(&merged);
            }
            Ok(())
        })())
    }

    /// Take the head chunk and scatter it across the iovecs.
    ///
    /// A read never spans chunks; whatever does not fit goes back to the head
    /// of the queue. All guest ranges are validated before the queue is touched.
    pub fn fd_read(
        &mut self,
        mem: &mut [u8],
        fd: u32,
        iovs: u32,
        iovs_len: u32,
        nread_ptr: u32,
    ) -> Errno {
        if fd != STDIN_FD {
            return Errno::Badf;
        }
        status((|| {
            let iovecs = read_iovecs(mem, iovs, iovs_len)?;
            for &(ptr, len) in &iovecs {
                slice(mem, ptr, len)?;
            }
            slice(mem, nread_ptr, 4)?;

            let capacity: usize = iovecs.iter().map(|&(_, len)| len as usize).sum();
            let mut queue = self.input.lock();
            if queue.is_empty() {
                return Err(Errno::Again);
            }
            if capacity == 0 {
                return write_u32(mem, nread_ptr, 0);
            }
            let Some(chunk) = queue.pop_front() else {
                return Err(Errno::Again);
            };

            let mut nread = 0usize;
            for &(ptr, len) in &iovecs {
                if nread == chunk.len() {
                    break;
                }
                let n = (len as usize).min(chunk.len() - nread);
                let start = ptr as usize;
                mem[start..start + n].copy_from_slice(&chunk[nread..nread + n]);
                nread += n;
            }
            if nread < chunk.len() {
                queue.requeue_front(chunk[nread..].to_vec());
            }
            drop(queue);
            write_u32(mem, nread_ptr, nread as u32)
        })())
    }

    /// Non-blocking readiness check.
    ///
    /// Only "stdin readable" subscriptions can fire, and only while input is
    /// queued. Clock subscriptions are never reported ready.
    pub fn poll_oneoff(
        &self,
        mem: &mut [u8],
        in_ptr: u32,
        out_ptr: u32,
        nsubscriptions: u32,
        nevents_ptr: u32,
    ) -> Errno {
        status((|| {
            let mut subscriptions = Vec::with_capacity(nsubscriptions.min(64) as usize);
            for i in 0..nsubscriptions {
                let sub = element(in_ptr, i, SUBSCRIPTION_SIZE)?;
                let record = slice(mem, sub, SUBSCRIPTION_SIZE)?;
                let userdata = le_u64(&record[0..8]);
                let tag = record[8];
                let fd = le_u32(&record[16..20]);
                subscriptions.push((userdata, tag, fd));
            }
            slice(mem, nevents_ptr, 4)?;

            let queued = self.input.queued_bytes() as u64;
            let mut nevents = 0u32;
            for (userdata, tag, fd) in subscriptions {
                if tag != EVENTTYPE_FD_READ || fd != STDIN_FD || queued == 0 {
                    continue;
                }
                let ev = element(out_ptr, nevents, EVENT_SIZE)?;
                let event = slice_mut(mem, ev, EVENT_SIZE)?;
                event.fill(0);
                event[0..8].copy_from_slice(&userdata.to_le_bytes());
                event[8..10].copy_from_slice(&(Errno::Success as u16).to_le_bytes());
                event[10] = tag;
                event[16..24].copy_from_slice(&queued.to_le_bytes());
                nevents += 1;
            }
            write_u32(mem, nevents_ptr, nevents)
        })())
    }

    /// Notify the exit hook. The runtime glue then aborts the guest.
    pub fn proc_exit(&mut self, code: i32) {
        info!("Guest called proc_exit({})", code);
        self.exit_code = Some(code);
        (self.on_exit)(code);
    }

    pub fn random_get(&self, mem: &mut [u8], buf: u32, len: u32) -> Errno {
        status((|| {
            let dst = slice_mut(mem, buf, len)?;
            getrandom::getrandom(dst).map_err(|e| {
                warn!("random_get failed: {}", e);
                Errno::Io
            })
        })())
    }

    /// Wall-clock nanoseconds, never decreasing across calls
    pub fn clock_time_get(&mut self, mem: &mut [u8], _id: u32, _precision: u64, time_ptr: u32) -> Errno {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let ns = now.max(self.last_clock_ns);
        match write_u64(mem, time_ptr, ns) {
            Ok(()) => {
                self.last_clock_ns = ns;
                Errno::Success
            }
            Err(errno) => errno,
        }
    }

    pub fn fd_fdstat_get(&self, mem: &mut [u8], fd: u32, ptr: u32) -> Errno {
        status((|| {
            let stat = slice_mut(mem, ptr, FDSTAT_SIZE)?;
            stat.fill(0);
            if fd <= STDERR_FD {
                stat[0] = FILETYPE_CHARACTER_DEVICE;
                stat[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
                stat[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
            } else {
                stat[0] = FILETYPE_UNKNOWN;
            }
            Ok(())
        })())
    }

    pub fn fd_close(&self, fd: u32) -> Errno {
        debug!("fd_close({}) ignored", fd);
        Errno::Success
    }

    pub fn fd_seek(&self) -> Errno {
        Errno::Success
    }

    /// No preopened directories
    pub fn fd_prestat_get(&self) -> Errno {
        Errno::Badf
    }

    pub fn fd_prestat_dir_name(&self) -> Errno {
        Errno::Badf
    }

    pub fn path_open(&self) -> Errno {
        Errno::Badf
    }

    pub fn sched_yield(&self) -> Errno {
        Errno::Success
    }
}

// --- guest memory access ---

fn slice(mem: &[u8], ptr: u32, len: u32) -> Result<&[u8], Errno> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
    mem.get(start..end).ok_or(Errno::Fault)
}

fn slice_mut(mem: &mut [u8], ptr: u32, len: u32) -> Result<&mut [u8], Errno> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
    mem.get_mut(start..end).ok_or(Errno::Fault)
}

fn element(base: u32, index: u32, stride: u32) -> Result<u32, Errno> {
    index
        .checked_mul(stride)
        .and_then(|off| base.checked_add(off))
        .ok_or(Errno::Fault)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn write_u32(mem: &mut [u8], ptr: u32, value: u32) -> Result<(), Errno> {
    slice_mut(mem, ptr, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_u64(mem: &mut [u8], ptr: u32, value: u64) -> Result<(), Errno> {
    slice_mut(mem, ptr, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn read_iovecs(mem: &[u8], iovs: u32, iovs_len: u32) -> Result<Vec<(u32, u32)>, Errno> {
    let table_len = iovs_len.checked_mul(IOVEC_SIZE).ok_or(Errno::Fault)?;
    let table = slice(mem, iovs, table_len)?;
    Ok(table
        .chunks_exact(IOVEC_SIZE as usize)
        .map(|iov| (le_u32(&iov[0..4]), le_u32(&iov[4..8])))
        .collect())
}

fn sizes_get(mem: &mut [u8], strings: &[Vec<u8>], count_ptr: u32, size_ptr: u32) -> Errno {
    let total: usize = strings.iter().map(|s| s.len() + 1).sum();
    status((|| {
        slice(mem, size_ptr, 4)?;
        write_u32(mem, count_ptr, strings.len() as u32)?;
        write_u32(mem, size_ptr, total as u32)
    })())
}

// NUL-terminated strings packed into `buf_ptr`, pointers into `ptrs_ptr`
fn strings_get(mem: &mut [u8], strings: &[Vec<u8>], ptrs_ptr: u32, buf_ptr: u32) -> Errno {
    status((|| {
        let total: usize = strings.iter().map(|s| s.len() + 1).sum();
        slice(mem, buf_ptr, u32::try_from(total).map_err(|_| Errno::Fault)?)?;
        slice(mem, ptrs_ptr, (strings.len() as u32).checked_mul(4).ok_or(Errno::Fault)?)?;

        let mut offset = buf_ptr;
        for (i, s) in strings.iter().enumerate() {
            let dst = slice_mut(mem, offset, s.len() as u32 + 1)?;
            dst[..s.len()].copy_from_slice(s);
            dst[s.len()] = 0;
            write_u32(mem, ptrs_ptr + i as u32 * 4, offset)?;
            offset += s.len() as u32 + 1;
        }
        Ok(())
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::mpsc;

    fn bridge() -> WasiBridge {
        WasiBridge::new(vec!["app.wasm".into()], Vec::new(), InputHandle::new(1 << 20))
    }

    fn put_u32(mem: &mut [u8], at: u32, value: u32) {
        mem[at as usize..at as usize + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn get_u32(mem: &[u8], at: u32) -> u32 {
        le_u32(&mem[at as usize..])
    }

    // One iovec at 0x100 pointing at a buffer at `buf`
    fn read_into(bridge: &mut WasiBridge, mem: &mut [u8], buf: u32, len: u32) -> (Errno, Vec<u8>) {
        put_u32(mem, 0x100, buf);
        put_u32(mem, 0x104, len);
        let errno = bridge.fd_read(mem, STDIN_FD, 0x100, 1, 0x200);
        let n = get_u32(mem, 0x200) as usize;
        (errno, mem[buf as usize..buf as usize + n].to_vec())
    }

    #[test]
    fn test_read_splits_chunk_then_try_again() {
        let mut bridge = bridge();
        let mut mem = vec![0u8; 4096];
        bridge.push_input(b"hello").unwrap();

        let (errno, data) = read_into(&mut bridge, &mut mem, 0x300, 2);
        assert_eq!(errno, Errno::Success);
        assert_eq!(data, b"he");

        let (errno, data) = read_into(&mut bridge, &mut mem, 0x300, 3);
        assert_eq!(errno, Errno::Success);
        assert_eq!(data, b"llo");

        let (errno, _) = read_into(&mut bridge, &mut mem, 0x300, 10);
        assert_eq!(errno, Errno::Again);
    }

    #[test]
    fn test_read_never_spans_chunks() {
        let mut bridge = bridge();
        let mut mem = vec![0u8; 4096];
        bridge.push_input(b"ab").unwrap();
        bridge.push_input(b"cd").unwrap();

        let (_, data) = read_into(&mut bridge, &mut mem, 0x300, 16);
        assert_eq!(data, b"ab");
        let (_, data) = read_into(&mut bridge, &mut mem, 0x300, 16);
        assert_eq!(data, b"cd");
    }

    #[test]
    fn test_read_scatters_across_iovecs() {
        let mut bridge = bridge();
        let mut mem = vec![0u8; 4096];
        bridge.push_input(b"abcdef").unwrap();
        put_u32(&mut mem, 0x100, 0x300);
        put_u32(&mut mem, 0x104, 2);
        put_u32(&mut mem, 0x108, 0x400);
        put_u32(&mut mem, 0x10c, 3);

        assert_eq!(bridge.fd_read(&mut mem, STDIN_FD, 0x100, 2, 0x200), Errno::Success);
        assert_eq!(get_u32(&mem, 0x200), 5);
        assert_eq!(&mem[0x300..0x302], b"ab");
        assert_eq!(&mem[0x400..0x403], b"cde");
        assert_eq!(bridge.input().queued_bytes(), 1);
    }

    #[test]
    fn test_read_out_of_bounds_keeps_input() {
        let mut bridge = bridge();
        let mut mem = vec![0u8; 1024];
        bridge.push_input(b"xyz").unwrap();
        put_u32(&mut mem, 0x100, 4000);
        put_u32(&mut mem, 0x104, 8);

        assert_eq!(bridge.fd_read(&mut mem, STDIN_FD, 0x100, 1, 0x200), Errno::Fault);
        assert_eq!(bridge.input().queued_bytes(), 3);
    }

    #[test]
    fn test_read_wrong_fd() {
        let mut bridge = bridge();
        let mut mem = vec![0u8; 1024];
        assert_eq!(bridge.fd_read(&mut mem, 3, 0x100, 1, 0x200), Errno::Badf);
    }

    #[test]
    fn test_empty_push_is_ignored() {
        let mut bridge = bridge();
        let mut mem = vec![0u8; 4096];
        bridge.push_input(b"").unwrap();
        let (errno, _) = read_into(&mut bridge, &mut mem, 0x300, 4);
        assert_eq!(errno, Errno::Again);
    }

    #[test]
    fn test_input_limit_rejects_without_dropping() {
        let input = InputHandle::new(4);
        input.push(b"abc").unwrap();
        let err = input.push(b"de").unwrap_err();
        assert_eq!(
            err,
            InputError::Full {
                queued: 3,
                limit: 4,
                rejected: 2
            }
        );
        assert_eq!(input.queued_bytes(), 3);
        input.push(b"d").unwrap();
        assert_eq!(input.queued_bytes(), 4);
    }

    #[test]
    fn test_poll_reports_stdin_readable() {
        let bridge = bridge();
        let mut mem = vec![0u8; 4096];
        mem[0x100..0x108].copy_from_slice(&0x0102030405060708u64.to_le_bytes());
        mem[0x108] = EVENTTYPE_FD_READ;

        // nothing queued
        assert_eq!(bridge.poll_oneoff(&mut mem, 0x100, 0x400, 1, 0x500), Errno::Success);
        assert_eq!(get_u32(&mem, 0x500), 0);

        bridge.push_input(b"q").unwrap();
        assert_eq!(bridge.poll_oneoff(&mut mem, 0x100, 0x400, 1, 0x500), Errno::Success);
        assert_eq!(get_u32(&mem, 0x500), 1);
        assert_eq!(le_u64(&mem[0x400..]), 0x0102030405060708);
        assert_eq!(&mem[0x408..0x40a], &[0, 0]);
        assert_eq!(mem[0x40a], EVENTTYPE_FD_READ);
        assert_eq!(le_u64(&mem[0x410..]), 1);
    }

    #[test]
    fn test_poll_clock_never_ready() {
        let bridge = bridge();
        let mut mem = vec![0u8; 4096];
        mem[0x108] = EVENTTYPE_CLOCK;
        mem[0x108 + 48] = EVENTTYPE_FD_READ;
        mem[0x100 + 48] = 9;
        bridge.push_input(b"q").unwrap();

        assert_eq!(bridge.poll_oneoff(&mut mem, 0x100, 0x400, 2, 0x500), Errno::Success);
        assert_eq!(get_u32(&mem, 0x500), 1);
        assert_eq!(mem[0x400], 9);
    }

    #[test]
    fn test_write_concatenates_iovecs() {
        let (tx, rx) = mpsc::channel();
        let mut bridge = bridge().with_stdout(move |data| {
            let _ = tx.send(data.to_vec());
        });
        let mut mem = vec![0u8; 4096];
        mem[0x300..0x303].copy_from_slice(b"foo");
        mem[0x400..0x403].copy_from_slice(b"bar");
        put_u32(&mut mem, 0x100, 0x300);
        put_u32(&mut mem, 0x104, 3);
        put_u32(&mut mem, 0x108, 0x400);
        put_u32(&mut mem, 0x10c, 3);

        assert_eq!(bridge.fd_write(&mut mem, STDOUT_FD, 0x100, 2, 0x200), Errno::Success);
        assert_eq!(get_u32(&mem, 0x200), 6);
        assert_eq!(rx.try_recv().unwrap(), b"foobar");
    }

    #[test]
    fn test_write_routes_stderr_and_rejects_other_fds() {
        let (tx, rx) = mpsc::channel();
        let mut bridge = bridge().with_stderr(move |data| {
            let _ = tx.send(data.to_vec());
        });
        let mut mem = vec![0u8; 4096];
        mem[0x300] = b'!';
        put_u32(&mut mem, 0x100, 0x300);
        put_u32(&mut mem, 0x104, 1);

        assert_eq!(bridge.fd_write(&mut mem, STDERR_FD, 0x100, 1, 0x200), Errno::Success);
        assert_eq!(rx.try_recv().unwrap(), b"!");
        assert_eq!(bridge.fd_write(&mut mem, 5, 0x100, 1, 0x200), Errno::Badf);
    }

    #[test]
    fn test_args_layout() {
        let bridge = WasiBridge::new(
            vec!["app".into(), "-x".into()],
            Vec::new(),
            InputHandle::new(16),
        );
        let mut mem = vec![0u8; 4096];
        assert_eq!(bridge.args_sizes_get(&mut mem, 0x10, 0x14), Errno::Success);
        assert_eq!(get_u32(&mem, 0x10), 2);
        assert_eq!(get_u32(&mem, 0x14), 7);

        assert_eq!(bridge.args_get(&mut mem, 0x100, 0x200), Errno::Success);
        assert_eq!(get_u32(&mem, 0x100), 0x200);
        assert_eq!(get_u32(&mem, 0x104), 0x204);
        assert_eq!(&mem[0x200..0x207], b"app\0-x\0");
    }

    #[test]
    fn test_env_defaults_and_overrides() {
        let env = build_env(vec![
            ("TERM".to_string(), "dumb".to_string()),
            ("LANG".to_string(), "C".to_string()),
        ]);
        assert_eq!(
            env,
            vec![
                ("TERM".to_string(), "dumb".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
                ("LANG".to_string(), "C".to_string()),
            ]
        );

        let bridge = WasiBridge::new(Vec::new(), Vec::new(), InputHandle::new(16));
        let mut mem = vec![0u8; 4096];
        assert_eq!(bridge.environ_sizes_get(&mut mem, 0x10, 0x14), Errno::Success);
        assert_eq!(get_u32(&mem, 0x10), 2);
        assert_eq!(bridge.environ_get(&mut mem, 0x100, 0x200), Errno::Success);
        assert_eq!(&mem[0x200..0x211], b"TERM=xterm-256col");
    }

    #[test]
    fn test_proc_exit_calls_hook() {
        let (tx, rx) = mpsc::channel();
        let mut bridge = bridge().with_exit_hook(move |code| {
            let _ = tx.send(code);
        });
        bridge.proc_exit(3);
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert_eq!(bridge.exit_code(), Some(3));
    }

    #[test]
    fn test_clock_is_monotonic() {
        let mut bridge = bridge();
        let mut mem = vec![0u8; 64];
        assert_eq!(bridge.clock_time_get(&mut mem, 0, 0, 0), Errno::Success);
        let first = le_u64(&mem[0..]);
        assert_eq!(bridge.clock_time_get(&mut mem, 1, 0, 8), Errno::Success);
        let second = le_u64(&mem[8..]);
        assert!(first > 0);
        assert!(second >= first);
    }

    #[test]
    fn test_random_get_fills_buffer() {
        let bridge = bridge();
        let mut mem = vec![0u8; 128];
        assert_eq!(bridge.random_get(&mut mem, 0, 64), Errno::Success);
        assert!(mem[..64].iter().any(|&b| b != 0));
        assert_eq!(bridge.random_get(&mut mem, 100, 64), Errno::Fault);
    }

    #[test]
    fn test_fdstat_and_filesystem_stubs() {
        let bridge = bridge();
        let mut mem = vec![0xffu8; 64];
        assert_eq!(bridge.fd_fdstat_get(&mut mem, 1, 0), Errno::Success);
        assert_eq!(mem[0], FILETYPE_CHARACTER_DEVICE);
        assert_eq!(bridge.fd_fdstat_get(&mut mem, 7, 0), Errno::Success);
        assert_eq!(mem[0], FILETYPE_UNKNOWN);

        assert_eq!(bridge.fd_prestat_get(), Errno::Badf);
        assert_eq!(bridge.fd_prestat_dir_name(), Errno::Badf);
        assert_eq!(bridge.path_open(), Errno::Badf);
        assert_eq!(bridge.fd_close(3), Errno::Success);
        assert_eq!(bridge.fd_seek(), Errno::Success);
        assert_eq!(bridge.sched_yield(), Errno::Success);
    }

    proptest! {
        #[test]
        fn prop_reads_preserve_push_order(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..16),
            sizes in prop::collection::vec(1u32..8, 1..8),
        ) {
            let mut bridge = bridge();
            let mut mem = vec![0u8; 4096];
            for chunk in &chunks {
                bridge.push_input(chunk).unwrap();
            }

            let mut out = Vec::new();
            let mut i = 0;
            loop {
                let size = sizes[i % sizes.len()];
                i += 1;
                let (errno, data) = read_into(&mut bridge, &mut mem, 0x300, size);
                if errno == Errno::Again {
                    break;
                }
                prop_assert_eq!(errno, Errno::Success);
                prop_assert!(!data.is_empty());
                out.extend(data);
            }
            prop_assert_eq!(out, chunks.concat());
        }
    }
}
