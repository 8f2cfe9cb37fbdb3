use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::{Error, Result};

/// Arena chunk size. Power of two; all quotas are expressed in chunks.
pub const CHUNK_SIZE_MB: u64 = 1;
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// An owned 1 MiB buffer. Ownership moves out of the arena on acquire and
/// back on release, so a chunk can never be on the free list and in use.
pub type Chunk = Box<[u8]>;

/// Pipeline modules that draw from the arena, in quota-accounting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Builder = 0,
    Parser = 1,
    Reader = 2,
    Transaction = 3,
}

impl Module {
    pub const COUNT: usize = 4;

    pub fn name(&self) -> &'static str {
        match self {
            Module::Builder => "builder",
            Module::Parser => "parser",
            Module::Reader => "reader",
            Module::Transaction => "transaction",
        }
    }
}

struct ArenaState {
    free: Vec<Chunk>,
    allocated: usize,
    hwm: usize,
    per_module: [usize; Module::COUNT],
    oom_hint: bool,
}

/// Fixed-size chunk allocator with per-module reservations.
///
/// Between `min-mb` and `max-mb` worth of chunks exist at any time; the
/// free pool always leaves room for each module to reach its configured
/// minimum. Callers suspend when nothing can be handed out.
pub struct MemoryArena {
    state: Mutex<ArenaState>,
    released: Notify,
    chunks_min: usize,
    chunks_max: usize,
    chunks_swap: usize,
    read_buffer_min: usize,
    read_buffer_max: usize,
    write_buffer_min: usize,
    write_buffer_max: usize,
    unswap_min: usize,
    shutdown: AtomicBool,
    swapped_out: AtomicU64,
}

impl MemoryArena {
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        let chunks_min = (config.min_mb / CHUNK_SIZE_MB) as usize;
        let chunks_max = (config.max_mb / CHUNK_SIZE_MB) as usize;

        let mut free = Vec::with_capacity(chunks_max);
        for _ in 0..chunks_min {
            free.push(new_chunk());
        }

        debug!(min_mb = config.min_mb, max_mb = config.max_mb, "memory arena initialized");

        Ok(MemoryArena {
            state: Mutex::new(ArenaState {
                free,
                allocated: chunks_min,
                hwm: chunks_min,
                per_module: [0; Module::COUNT],
                oom_hint: false,
            }),
            released: Notify::new(),
            chunks_min,
            chunks_max,
            chunks_swap: (config.swap_mb / CHUNK_SIZE_MB) as usize,
            read_buffer_min: (config.read_buffer_min_mb / CHUNK_SIZE_MB) as usize,
            read_buffer_max: (config.read_buffer_max_mb / CHUNK_SIZE_MB) as usize,
            write_buffer_min: (config.write_buffer_min_mb / CHUNK_SIZE_MB) as usize,
            write_buffer_max: (config.write_buffer_max_mb / CHUNK_SIZE_MB) as usize,
            unswap_min: (config.unswap_buffer_min_mb / CHUNK_SIZE_MB) as usize,
            shutdown: AtomicBool::new(false),
            swapped_out: AtomicU64::new(0),
        })
    }

    /// Hands out a chunk for `module`, suspending until one is available.
    ///
    /// Fails with a runtime error when the parser cannot be served even
    /// after the out-of-memory hint round while the builder already sits
    /// at its minimum, and with `Shutdown` once the arena is shut down.
    pub async fn acquire(&self, module: Module) -> Result<Chunk> {
        self.acquire_inner(module, false).await
    }

    /// Swap-in path: allowed to dip into the unswap reserve, which
    /// exists precisely so replay can page chunks back under pressure.
    pub async fn acquire_unswap(&self) -> Result<Chunk> {
        self.acquire_inner(Module::Transaction, true).await
    }

    async fn acquire_inner(&self, module: Module, unswap: bool) -> Result<Chunk> {
        loop {
            // Register for the release signal before re-checking state,
            // otherwise a release between the check and the await is
            // lost.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = self.state.lock();

                if !self.at_module_cap(&state, module) {
                    let reserved = self.reserved_chunks(&state, module, unswap);
                    if state.free.len() > reserved {
                        if let Some(chunk) = state.free.pop() {
                            state.per_module[module as usize] += 1;
                            state.oom_hint = false;
                            return Ok(chunk);
                        }
                    }
                    if state.allocated < self.chunks_max {
                        state.allocated += 1;
                        if state.allocated > state.hwm {
                            state.hwm = state.allocated;
                        }
                        state.per_module[module as usize] += 1;
                        return Ok(new_chunk());
                    }

                    if module == Module::Parser {
                        if !state.oom_hint {
                            state.oom_hint = true;
                            warn!(
                                module = module.name(),
                                "memory exhausted, waiting for chunks to be released"
                            );
                        } else if state.per_module[Module::Builder as usize] <= self.write_buffer_min {
                            return Err(Error::runtime(
                                10017,
                                format!(
                                    "out of memory for module '{}', allocated: {} MB",
                                    module.name(),
                                    state.allocated as u64 * CHUNK_SIZE_MB
                                ),
                            ));
                        }
                    }
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            released.await;
        }
    }

    /// Returns a chunk to the free pool and wakes any blocked caller.
    pub fn release(&self, module: Module, chunk: Chunk) {
        {
            let mut state = self.state.lock();
            let used = &mut state.per_module[module as usize];
            *used = used.saturating_sub(1);
            if state.free.len() >= self.chunks_min {
                state.allocated -= 1;
                drop(chunk);
            } else {
                state.free.push(chunk);
            }
        }
        self.released.notify_waiters();
    }

    /// True when enough chunks are in use that transactions should start
    /// spilling to disk.
    pub fn swap_needed(&self) -> bool {
        if self.chunks_swap == 0 {
            return false;
        }
        let state = self.state.lock();
        state.allocated - state.free.len() >= self.chunks_swap
    }

    pub fn record_swapped_out(&self) {
        self.swapped_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swapped_out_mb(&self) -> u64 {
        self.swapped_out.load(Ordering::Relaxed) * CHUNK_SIZE_MB
    }

    pub fn free_memory_hint_mb(&self) -> u64 {
        let state = self.state.lock();
        (state.free.len() + (self.chunks_max - state.allocated)) as u64 * CHUNK_SIZE_MB
    }

    pub fn allocated_mb(&self) -> u64 {
        self.state.lock().allocated as u64 * CHUNK_SIZE_MB
    }

    pub fn hwm_mb(&self) -> u64 {
        self.state.lock().hwm as u64 * CHUNK_SIZE_MB
    }

    /// Wakes every blocked caller; subsequent acquires fail with Shutdown.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.released.notify_waiters();
    }

    fn at_module_cap(&self, state: &ArenaState, module: Module) -> bool {
        match module {
            Module::Reader => {
                self.read_buffer_max != 0
                    && state.per_module[Module::Reader as usize] >= self.read_buffer_max
            }
            Module::Builder => {
                self.write_buffer_max != 0
                    && state.per_module[Module::Builder as usize] >= self.write_buffer_max
            }
            _ => false,
        }
    }

    /// Chunks the free pool must retain so other modules can still reach
    /// their minima, plus the unswap reserve.
    fn reserved_chunks(&self, state: &ArenaState, module: Module, unswap: bool) -> usize {
        let mut reserved = if unswap { 0 } else { self.unswap_min };
        if module != Module::Reader {
            reserved += self
                .read_buffer_min
                .saturating_sub(state.per_module[Module::Reader as usize]);
        }
        if module != Module::Builder {
            reserved += self
                .write_buffer_min
                .saturating_sub(state.per_module[Module::Builder as usize]);
        }
        reserved
    }
}

fn new_chunk() -> Chunk {
    vec![0u8; CHUNK_SIZE].into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(min_mb: u64, max_mb: u64) -> MemoryConfig {
        MemoryConfig {
            min_mb,
            max_mb,
            read_buffer_min_mb: 0,
            read_buffer_max_mb: 0,
            write_buffer_min_mb: 0,
            write_buffer_max_mb: 0,
            swap_mb: 0,
            swap_path: std::path::PathBuf::from("."),
            unswap_buffer_min_mb: 0,
        }
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let arena = MemoryArena::new(&test_config(2, 4)).unwrap();
        let a = arena.acquire(Module::Parser).await.unwrap();
        let b = arena.acquire(Module::Transaction).await.unwrap();
        assert_eq!(a.len(), CHUNK_SIZE);
        arena.release(Module::Parser, a);
        arena.release(Module::Transaction, b);
        assert_eq!(arena.allocated_mb(), 2);
    }

    #[tokio::test]
    async fn grows_to_max_then_blocks() {
        let arena = MemoryArena::new(&test_config(1, 2)).unwrap();
        let _a = arena.acquire(Module::Transaction).await.unwrap();
        let _b = arena.acquire(Module::Transaction).await.unwrap();
        assert_eq!(arena.allocated_mb(), 2);
        assert_eq!(arena.free_memory_hint_mb(), 0);

        // A third acquire must suspend until shutdown wakes it.
        arena.shut_down();
        let err = arena.acquire(Module::Transaction).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn respects_reader_cap() {
        let mut config = test_config(1, 8);
        config.read_buffer_max_mb = 1;
        let arena = MemoryArena::new(&config).unwrap();
        let _a = arena.acquire(Module::Reader).await.unwrap();
        arena.shut_down();
        assert!(matches!(
            arena.acquire(Module::Reader).await.unwrap_err(),
            Error::Shutdown
        ));
    }

    #[tokio::test]
    async fn blocked_acquire_wakes_on_release() {
        let arena = std::sync::Arc::new(MemoryArena::new(&test_config(1, 1)).unwrap());
        let held = arena.acquire(Module::Transaction).await.unwrap();

        let arena2 = arena.clone();
        let waiter = tokio::spawn(async move { arena2.acquire(Module::Parser).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        arena.release(Module::Transaction, held);

        let chunk = waiter.await.unwrap().unwrap();
        assert_eq!(chunk.len(), CHUNK_SIZE);
    }

    #[tokio::test]
    async fn swap_threshold() {
        let mut config = test_config(1, 4);
        config.swap_mb = 2;
        let arena = MemoryArena::new(&config).unwrap();
        assert!(!arena.swap_needed());
        let _a = arena.acquire(Module::Transaction).await.unwrap();
        let _b = arena.acquire(Module::Transaction).await.unwrap();
        assert!(arena.swap_needed());
    }
}
