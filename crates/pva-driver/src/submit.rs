//! Command submission with post-fence completion.
//!
//! ```text
//! submit_sync(stream)
//!   ├─ lock(submission)                       ← covers fence reservation + enqueue
//!   │    ├─ reclaim chunks of completed submissions
//!   │    ├─ split stream at command boundaries → chunks (pool lock inside)
//!   │    │     chunk 0: cmds… LinkChunk → chunk 1: cmds… CapturePostFence(n)
//!   │    └─ push queue entry for chunk 0
//!   ├─ unlock
//!   ├─ ring doorbell (CCQ)
//!   └─ poll fence ≥ n  → Ok | FirmwareAborted | Timeout
//! ```
//!
//! Lock order is submission lock → chunk-pool lock. Chunks stay on loan
//! until the fence passes their submission's value.

use crate::ccq::{push_message, CommandFifo};
use crate::chunk::{Chunk, ChunkPool};
use crate::dma::DmaHandle;
use crate::error::{PvaError, Result};
use crate::health::DeviceHealth;
use crate::queue::SubmissionQueue;
use pva_chip::ccq::CcqMessage;
use pva_chip::cmd::{self, Command, Opcode, CHUNK_TRAILER_BYTES};
use pva_chip::layout::QueueEntry;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Whether fence value `current` has reached `target`, allowing for wrap.
pub const fn fence_reached(current: u32, target: u32) -> bool {
    // Reinterpreting the wrapped difference as signed is the comparison.
    #[allow(clippy::cast_possible_wrap)]
    let ahead = current.wrapping_sub(target) as i32;
    ahead >= 0
}

/// Where firmware writes the post-fence.
#[derive(Debug, Clone)]
pub struct FenceSlot {
    /// View of the fence resource.
    pub handle: DmaHandle,
    /// Resource id firmware knows the fence memory by.
    pub resource_id: u32,
    /// Offset of the fence word inside the resource.
    pub offset: usize,
}

/// Fence value a submission completes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "a ticket must be waited on to observe completion"]
pub struct FenceTicket(u32);

impl FenceTicket {
    /// Target fence value.
    pub const fn value(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
struct InFlight {
    fence: u32,
    chunks: Vec<Chunk>,
}

#[derive(Debug)]
struct SubmitState {
    queue: SubmissionQueue,
    next_fence: u32,
    in_flight: VecDeque<InFlight>,
}

/// Releases acquired chunks unless the chain is handed to the in-flight list.
struct ChunkChain<'a> {
    pool: &'a ChunkPool,
    chunks: Vec<Chunk>,
}

impl ChunkChain<'_> {
    fn into_chunks(mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.chunks)
    }
}

impl Drop for ChunkChain<'_> {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.pool.release(chunk);
        }
    }
}

/// Submitter bound to one queue.
#[derive(Debug)]
pub struct Submitter {
    state: Mutex<SubmitState>,
    pool: ChunkPool,
    fence: FenceSlot,
    fifo: Arc<dyn CommandFifo>,
    health: Arc<DeviceHealth>,
    privileged: bool,
    poll_interval: Duration,
    timeout: Duration,
}

impl Submitter {
    /// Assemble a submitter.
    ///
    /// `privileged` submitters (the device queue) may carry privileged
    /// opcodes; context submitters reject them before they reach firmware.
    pub fn new(
        queue: SubmissionQueue,
        pool: ChunkPool,
        fence: FenceSlot,
        fifo: Arc<dyn CommandFifo>,
        health: Arc<DeviceHealth>,
        privileged: bool,
    ) -> Self {
        let current = fence.handle.read_u32(fence.offset);
        Self {
            state: Mutex::new(SubmitState {
                queue,
                next_fence: current.wrapping_add(1),
                in_flight: VecDeque::new(),
            }),
            pool,
            fence,
            fifo,
            health,
            privileged,
            poll_interval: Duration::from_micros(100),
            timeout: Duration::from_secs(1),
        }
    }

    /// Defaults used by [`Submitter::submit`].
    #[must_use]
    pub fn with_wait(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SubmitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last fence value firmware wrote.
    pub fn fence_value(&self) -> u32 {
        self.fence.handle.read_u32(self.fence.offset)
    }

    /// Submit with the configured poll interval and timeout.
    ///
    /// # Errors
    ///
    /// See [`Submitter::submit_sync`].
    pub fn submit(&self, commands: &[u8]) -> Result<()> {
        self.submit_sync(commands, self.poll_interval, self.timeout)
    }

    /// Submit `commands` and wait until firmware has executed them.
    ///
    /// # Errors
    ///
    /// - `FirmwareAborted` if the device is (or becomes) aborted
    /// - `InvalidFormat` for a malformed stream, `InvalidArgument` for
    ///   reserved or (on context queues) privileged opcodes, or a stream
    ///   that needs more chunks than the pool has
    /// - `OutOfResources` if the chunk pool is exhausted
    /// - `ResourceBusy` if the queue is full
    /// - `Timeout` if the fence does not arrive within `timeout`
    pub fn submit_sync(
        &self,
        commands: &[u8],
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let ticket = self.submit_async(commands)?;
        self.wait_fence(ticket.value(), poll_interval, timeout)
    }

    /// Enqueue `commands` and ring the doorbell without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`Submitter::submit_sync`] minus `Timeout`.
    pub fn submit_async(&self, commands: &[u8]) -> Result<FenceTicket> {
        if self.health.is_aborted() {
            return Err(PvaError::FirmwareAborted);
        }
        let segments = self.split(commands)?;

        let (fence, queue_id) = {
            let mut state = self.lock();
            self.reclaim(&mut state);

            let mut chain = ChunkChain {
                pool: &self.pool,
                chunks: Vec::with_capacity(segments.len()),
            };
            for _ in 0..segments.len() {
                chain.chunks.push(self.pool.acquire()?);
            }

            let fence = state.next_fence;
            self.fill_chain(&chain.chunks, &segments, commands, fence);

            #[allow(clippy::cast_possible_truncation)] // bounded by chunk size
            let entry = QueueEntry {
                resource_id: self.pool.resource_id(),
                size: (segments[0].len() + CHUNK_TRAILER_BYTES) as u32,
                offset: chain.chunks[0].offset() as u64,
            };
            state.queue.push(&entry)?;

            state.next_fence = fence.wrapping_add(1);
            state.in_flight.push_back(InFlight {
                fence,
                chunks: chain.into_chunks(),
            });
            (fence, state.queue.queue_id())
        };

        tracing::debug!(
            "Queue {queue_id}: submitted {} bytes in {} chunk(s), fence {fence}",
            commands.len(),
            segments.len()
        );
        push_message(self.fifo.as_ref(), queue_id, &CcqMessage::Doorbell { queue_id })?;
        Ok(FenceTicket(fence))
    }

    /// Poll until the fence reaches `target`.
    ///
    /// Returns immediately when the target has already been reached.
    ///
    /// # Errors
    ///
    /// Returns `FirmwareAborted` if the device aborts while waiting and
    /// `Timeout` once `timeout` has elapsed.
    pub fn wait_fence(&self, target: u32, poll_interval: Duration, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.health.is_aborted() {
                return Err(PvaError::FirmwareAborted);
            }
            if fence_reached(self.fence_value(), target) {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::warn!("Fence {target} not reached after {timeout:?}");
                return Err(PvaError::timeout(timeout));
            }
            std::thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }

    /// Whether the submission behind `ticket` has completed.
    pub fn is_complete(&self, ticket: FenceTicket) -> bool {
        fence_reached(self.fence_value(), ticket.value())
    }

    fn reclaim(&self, state: &mut SubmitState) {
        let current = self.fence_value();
        while state
            .in_flight
            .front()
            .is_some_and(|f| fence_reached(current, f.fence))
        {
            if let Some(done) = state.in_flight.pop_front() {
                for chunk in done.chunks {
                    self.pool.release(chunk);
                }
            }
        }
    }

    /// Split `commands` into per-chunk byte ranges at command boundaries.
    fn split(&self, commands: &[u8]) -> Result<Vec<Range<usize>>> {
        let usable = self.pool.chunk_size() - CHUNK_TRAILER_BYTES;
        let mut segments = Vec::new();
        let mut start = 0;
        let mut pos = 0;

        while pos < commands.len() {
            let (opcode, len) = cmd::peek(&commands[pos..]).map_err(|e| {
                PvaError::invalid_format(format!("command at byte {pos}: {e}"))
            })?;
            if matches!(opcode, Opcode::LinkChunk | Opcode::CapturePostFence) {
                return Err(PvaError::invalid_argument(format!(
                    "{opcode:?} is reserved for the submitter"
                )));
            }
            if opcode.is_privileged() && !self.privileged {
                return Err(PvaError::invalid_argument(format!(
                    "{opcode:?} is only accepted on the device queue"
                )));
            }
            if pos + len - start > usable {
                segments.push(start..pos);
                start = pos;
            }
            pos += len;
        }
        segments.push(start..pos);

        if segments.len() > self.pool.capacity() {
            return Err(PvaError::invalid_argument(format!(
                "{} bytes need {} chunks, pool has {}",
                commands.len(),
                segments.len(),
                self.pool.capacity()
            )));
        }
        Ok(segments)
    }

    #[allow(clippy::cast_possible_truncation)] // chunk sizes are far below 4 GiB
    fn fill_chain(&self, chunks: &[Chunk], segments: &[Range<usize>], commands: &[u8], fence: u32) {
        for (i, (chunk, segment)) in chunks.iter().zip(segments).enumerate() {
            self.pool.write(chunk, 0, &commands[segment.clone()]);
            let trailer = match (chunks.get(i + 1), segments.get(i + 1)) {
                (Some(next), Some(next_segment)) => Command::LinkChunk {
                    resource_id: self.pool.resource_id(),
                    offset: next.offset() as u64,
                    size: (next_segment.len() + CHUNK_TRAILER_BYTES) as u32,
                },
                _ => Command::CapturePostFence {
                    resource_id: self.fence.resource_id,
                    offset: self.fence.offset as u64,
                    value: fence,
                },
            };
            self.pool.write(chunk, segment.len(), &trailer.encode());
        }
    }

    /// Reset the queue after a firmware (re)boot.
    ///
    /// Outstanding submissions can no longer complete; their chunks are
    /// returned and the fence word is advanced past them.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.queue.reset();
        let abandoned = state.in_flight.len();
        for done in state.in_flight.drain(..) {
            for chunk in done.chunks {
                self.pool.release(chunk);
            }
        }
        let last = state.next_fence.wrapping_sub(1);
        self.fence.handle.write_u32(self.fence.offset, last);
        if abandoned > 0 {
            tracing::warn!("Queue reset abandoned {abandoned} submission(s)");
        }
    }

    /// Submissions whose chunks are still on loan.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Chunks currently on loan.
    pub fn outstanding_chunks(&self) -> usize {
        self.pool.outstanding()
    }

    /// Queue id this submitter feeds.
    pub fn queue_id(&self) -> u8 {
        self.lock().queue.queue_id()
    }

    /// Device address of the queue.
    pub fn queue_iova(&self) -> u64 {
        self.lock().queue.iova()
    }

    /// Queue capacity.
    pub fn queue_capacity(&self) -> u32 {
        self.lock().queue.capacity()
    }

    /// Default poll interval.
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Default timeout.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}
