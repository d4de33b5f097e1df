use crate::buffer::{BufferHandle, InterfaceType};
use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Compile-time capacity of each per-priority queue. The configured depth
/// is a runtime bound below this.
pub const MAX_QUEUE_DEPTH: usize = 64;
pub const MAX_PRIORITY_QUEUES: usize = 8;
pub const DEFAULT_PRIORITY_QUEUES: usize = 3;
pub const DEFAULT_QUEUE_DEPTH: usize = 20;

// Default queue layout: serial/control, BT, everything else.
pub const PRIO_Q_SERIAL: u8 = 0;
pub const PRIO_Q_BT: u8 = 1;
pub const PRIO_Q_OTHERS: u8 = 2;

const_assert!(DEFAULT_PRIORITY_QUEUES <= MAX_PRIORITY_QUEUES);
const_assert!(DEFAULT_QUEUE_DEPTH <= MAX_QUEUE_DEPTH);
const_assert!((PRIO_Q_OTHERS as usize) < DEFAULT_PRIORITY_QUEUES);

type PriorityQueue = Deque<BufferHandle, MAX_QUEUE_DEPTH>;

/// Traffic priority. `0` is the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);

    pub const fn new(level: u8) -> Self {
        Priority(level)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Default queue for an interface, clamped to the number of queues in use.
    pub fn for_interface(if_type: InterfaceType, priorities: usize) -> Self {
        let level = match if_type {
            InterfaceType::Serial | InterfaceType::Priv => PRIO_Q_SERIAL,
            InterfaceType::Hci => PRIO_Q_BT,
            InterfaceType::Sta | InterfaceType::Ap | InterfaceType::Test => PRIO_Q_OTHERS,
        };
        let lowest = priorities.saturating_sub(1).min(u8::MAX as usize) as u8;
        Priority(level.min(lowest))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Enqueue failures. The rejected handle is handed back untouched so the
/// caller decides between dropping it and retrying.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{bank} queue {priority} is full ({depth} entries)")]
    Full {
        bank: &'static str,
        priority: Priority,
        depth: usize,
        handle: BufferHandle,
    },
    #[error("{bank} has no queue for {priority}")]
    InvalidPriority {
        bank: &'static str,
        priority: Priority,
        handle: BufferHandle,
    },
}

impl QueueError {
    pub fn into_handle(self) -> BufferHandle {
        match self {
            QueueError::Full { handle, .. } | QueueError::InvalidPriority { handle, .. } => handle,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, QueueError::Full { .. })
    }
}

/// Outcome of waiting on a bank's wake signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signalled,
    TimedOut,
    Closed,
}

/// N independent FIFO queues, one per priority, sharing one counting wake
/// signal. Every successful enqueue posts exactly one count.
pub struct PriorityBank {
    name: &'static str,
    queues: Vec<Mutex<PriorityQueue>>,
    depth: usize,
    signal: Semaphore,
}

impl PriorityBank {
    pub fn new(name: &'static str, priorities: usize, depth: usize) -> Self {
        let priorities = priorities.clamp(1, MAX_PRIORITY_QUEUES);
        let depth = depth.clamp(1, MAX_QUEUE_DEPTH);

        Self {
            name,
            queues: (0..priorities).map(|_| Mutex::new(Deque::new())).collect(),
            depth,
            signal: Semaphore::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priorities(&self) -> usize {
        self.queues.len()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn queue(&self, index: usize) -> MutexGuard<'_, PriorityQueue> {
        self.queues[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the tail of `priority`'s queue. Never blocks.
    pub fn enqueue(&self, priority: Priority, handle: BufferHandle) -> Result<(), QueueError> {
        self.insert(priority, handle, false)
    }

    /// Put a handle back at the head of its queue, ahead of anything queued
    /// since it was taken.
    pub(crate) fn requeue_front(
        &self,
        priority: Priority,
        handle: BufferHandle,
    ) -> Result<(), QueueError> {
        self.insert(priority, handle, true)
    }

    fn insert(&self, priority: Priority, handle: BufferHandle, front: bool) -> Result<(), QueueError> {
        if priority.index() >= self.queues.len() {
            return Err(QueueError::InvalidPriority {
                bank: self.name,
                priority,
                handle,
            });
        }

        {
            let mut queue = self.queue(priority.index());
            if queue.len() >= self.depth {
                return Err(QueueError::Full {
                    bank: self.name,
                    priority,
                    depth: self.depth,
                    handle,
                });
            }
            let pushed = if front {
                queue.push_front(handle)
            } else {
                queue.push_back(handle)
            };
            if let Err(handle) = pushed {
                return Err(QueueError::Full {
                    bank: self.name,
                    priority,
                    depth: self.depth,
                    handle,
                });
            }
        }

        self.signal.add_permits(1);
        Ok(())
    }

    pub fn try_dequeue(&self, priority: Priority) -> Option<BufferHandle> {
        if priority.index() >= self.queues.len() {
            return None;
        }
        self.queue(priority.index()).pop_front()
    }

    /// Head of the highest non-empty priority.
    pub fn try_dequeue_highest(&self) -> Option<(Priority, BufferHandle)> {
        (0..self.queues.len()).find_map(|index| {
            let priority = Priority(index as u8);
            self.try_dequeue(priority).map(|handle| (priority, handle))
        })
    }

    /// Block until a count is available, the optional timeout elapses, or
    /// the bank is closed. Consumes one count on success.
    pub async fn wait(&self, timeout: Option<std::time::Duration>) -> Wake {
        let acquire = self.signal.acquire();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(result) => result,
                Err(_) => return Wake::TimedOut,
            },
            None => acquire.await,
        };

        match result {
            Ok(permit) => {
                permit.forget();
                Wake::Signalled
            }
            Err(_) => Wake::Closed,
        }
    }

    /// After a pass that drained `drained` items on one wake, absorb the
    /// counts posted for the extra items so they do not cause empty wakes.
    pub fn settle(&self, drained: usize) {
        for _ in 1..drained {
            match self.signal.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }
        }
    }

    pub fn pending_signals(&self) -> usize {
        self.signal.available_permits()
    }

    pub fn len(&self) -> usize {
        (0..self.queues.len()).map(|index| self.queue(index).len()).sum()
    }

    pub fn len_at(&self, priority: Priority) -> usize {
        if priority.index() >= self.queues.len() {
            return 0;
        }
        self.queue(priority.index()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and release everything still queued. Returns how many handles
    /// were released.
    pub fn drain_all(&self) -> usize {
        let mut drained = Vec::new();
        for index in 0..self.queues.len() {
            let mut queue = self.queue(index);
            while let Some(handle) = queue.pop_front() {
                drained.push(handle);
            }
        }

        // Release outside the queue locks; callbacks may call back into us.
        let count = drained.len();
        drop(drained);
        count
    }

    /// Wake every waiter with [`Wake::Closed`].
    pub fn close(&self) {
        self.signal.close();
    }
}

impl fmt::Debug for PriorityBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityBank")
            .field("name", &self.name)
            .field("priorities", &self.queues.len())
            .field("depth", &self.depth)
            .field("queued", &self.len())
            .finish()
    }
}
