use crate::buffer::{BufferHandle, InterfaceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Upper-layer consumer of inbound traffic for one interface type.
///
/// The receiver takes ownership of the handle; dropping it releases it.
/// A receiver must not deregister its own channel from inside `receive`:
/// deregistration waits for running deliveries and would never return.
pub trait ChannelReceiver: Send + Sync {
    fn receive(&self, handle: BufferHandle);
}

impl<F> ChannelReceiver for F
where
    F: Fn(BufferHandle) + Send + Sync,
{
    fn receive(&self, handle: BufferHandle) {
        self(handle)
    }
}

/// Identifies one registration. A stale id from an earlier registration of
/// the same interface type never matches a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub if_type: InterfaceType,
    generation: u64,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.if_type, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("a channel is already registered for {0}")]
    AlreadyRegistered(InterfaceType),
    #[error("channel {0} is not registered")]
    NotFound(ChannelId),
    #[error("interface {0} is reserved for the link layer")]
    Reserved(InterfaceType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// No channel registered; the buffer was released.
    NoChannel,
    /// Link-layer interface; never delivered to a channel.
    Reserved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub secure: bool,
    pub delivered: u64,
}

struct Channel {
    id: ChannelId,
    secure: bool,
    receiver: Arc<dyn ChannelReceiver>,
    delivered: AtomicU64,
    // Held shared while a delivery runs. Closing takes it exclusively.
    open: RwLock<bool>,
}

impl Channel {
    fn deliver(&self, handle: BufferHandle) -> bool {
        let open = self.open.read().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            return false;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.receiver.receive(handle);
        true
    }

    /// Blocks until no delivery is running. None starts afterwards.
    fn close(&self) {
        *self.open.write().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Interface type to channel map. Register and deregister take the map's
/// write lock; dispatch only holds the read lock long enough to clone the
/// entry, then delivers under the channel's own gate. Deregister returns
/// only after any delivery to that channel has finished.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<InterfaceType, Arc<Channel>>>,
    next_generation: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn register(
        &self,
        if_type: InterfaceType,
        secure: bool,
        receiver: Arc<dyn ChannelReceiver>,
    ) -> Result<ChannelId, ChannelError> {
        if if_type.is_reserved() {
            return Err(ChannelError::Reserved(if_type));
        }

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels.contains_key(&if_type) {
            return Err(ChannelError::AlreadyRegistered(if_type));
        }

        let id = ChannelId {
            if_type,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };
        channels.insert(
            if_type,
            Arc::new(Channel {
                id,
                secure,
                receiver,
                delivered: AtomicU64::new(0),
                open: RwLock::new(true),
            }),
        );
        debug!(channel = %id, secure, "channel registered");
        Ok(id)
    }

    pub fn deregister(&self, id: ChannelId) -> Result<(), ChannelError> {
        let removed = {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            match channels.get(&id.if_type) {
                Some(channel) if channel.id == id => channels.remove(&id.if_type),
                _ => None,
            }
        };
        let channel = removed.ok_or(ChannelError::NotFound(id))?;
        channel.close();
        debug!(channel = %id, "channel deregistered");
        Ok(())
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id.if_type)
            .map_or(false, |channel| channel.id == id)
    }

    pub fn is_registered(&self, if_type: InterfaceType) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&if_type)
    }

    /// Hand an inbound buffer to its channel. Every outcome consumes the
    /// handle.
    pub fn dispatch_inbound(&self, handle: BufferHandle) -> DispatchOutcome {
        let if_type = handle.if_type();
        if if_type.is_reserved() {
            warn!(%if_type, "reserved interface reached channel dispatch");
            return DispatchOutcome::Reserved;
        }

        let channel = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&if_type)
            .cloned();

        if let Some(channel) = channel {
            trace!(channel = %channel.id, len = handle.len(), "dispatching inbound buffer");
            // A closed channel drops the handle, which releases it.
            if channel.deliver(handle) {
                return DispatchOutcome::Delivered;
            }
        }
        debug!(%if_type, "no channel registered, dropping buffer");
        DispatchOutcome::NoChannel
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|channel| ChannelInfo {
                id: channel.id,
                secure: channel.secure,
                delivered: channel.delivered.load(Ordering::Relaxed),
            })
            .collect();
        infos.sort_by_key(|info| info.id.if_type.code());
        infos
    }

    pub fn len(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let removed: Vec<Arc<Channel>> = {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in &removed {
            channel.close();
        }
        removed.len()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn recording() -> (Arc<Mutex<Vec<Vec<u8>>>>, Arc<dyn ChannelReceiver>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receiver: Arc<dyn ChannelReceiver> = Arc::new(move |handle: BufferHandle| {
            sink.lock().unwrap().push(handle.payload().to_vec());
        });
        (seen, receiver)
    }

    #[test]
    fn test_register_and_dispatch() {
        let registry = ChannelRegistry::new();
        let (seen, receiver) = recording();
        registry.register(InterfaceType::Sta, false, receiver).unwrap();

        let handle = BufferHandle::copy_owned(InterfaceType::Sta, 0, vec![1, 2]);
        assert_eq!(registry.dispatch_inbound(handle), DispatchOutcome::Delivered);
        assert_eq!(seen.lock().unwrap().as_slice(), &[vec![1, 2]]);
        assert_eq!(registry.channels()[0].delivered, 1);
    }

    #[test]
    fn test_double_registration_rejected() {
        let registry = ChannelRegistry::new();
        let (_, receiver) = recording();
        registry.register(InterfaceType::Hci, true, Arc::clone(&receiver)).unwrap();
        assert_eq!(
            registry.register(InterfaceType::Hci, true, receiver),
            Err(ChannelError::AlreadyRegistered(InterfaceType::Hci))
        );
    }

    #[test]
    fn test_reserved_interfaces_cannot_register() {
        let registry = ChannelRegistry::new();
        let (_, receiver) = recording();
        assert_eq!(
            registry.register(InterfaceType::Priv, false, receiver),
            Err(ChannelError::Reserved(InterfaceType::Priv))
        );
    }

    #[test]
    fn test_stale_id_is_not_found() {
        let registry = ChannelRegistry::new();
        let (_, receiver) = recording();
        let first = registry.register(InterfaceType::Ap, false, Arc::clone(&receiver)).unwrap();
        registry.deregister(first).unwrap();
        let second = registry.register(InterfaceType::Ap, false, receiver).unwrap();

        assert_eq!(registry.deregister(first), Err(ChannelError::NotFound(first)));
        assert!(registry.contains(second));
    }

    #[test]
    fn test_no_channel_releases_and_counts() {
        let registry = ChannelRegistry::new();
        let released = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&released);
        let handle = BufferHandle::copy_owned(InterfaceType::Serial, 0, vec![0]).on_release(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.dispatch_inbound(handle), DispatchOutcome::NoChannel);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_receiver_may_reenter_registry() {
        let registry = Arc::new(ChannelRegistry::new());
        let inner = Arc::clone(&registry);
        let receiver: Arc<dyn ChannelReceiver> = Arc::new(move |_handle: BufferHandle| {
            assert!(inner.is_registered(InterfaceType::Sta));
        });
        registry.register(InterfaceType::Sta, false, receiver).unwrap();

        let handle = BufferHandle::copy_owned(InterfaceType::Sta, 0, vec![]);
        assert_eq!(registry.dispatch_inbound(handle), DispatchOutcome::Delivered);
    }

    #[test]
    fn test_deregister_waits_for_running_receiver() {
        let registry = Arc::new(ChannelRegistry::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let resume_rx = Mutex::new(resume_rx);
        let receiver: Arc<dyn ChannelReceiver> = Arc::new(move |_handle: BufferHandle| {
            entered_tx.lock().unwrap().send(()).unwrap();
            resume_rx.lock().unwrap().recv().unwrap();
        });
        let id = registry.register(InterfaceType::Sta, false, receiver).unwrap();

        let dispatcher = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                registry.dispatch_inbound(BufferHandle::copy_owned(InterfaceType::Sta, 0, vec![1]))
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let remover = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let result = registry.deregister(id);
                done_tx.send(()).unwrap();
                result
            })
        };
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        resume_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(remover.join().unwrap(), Ok(()));
        assert_eq!(dispatcher.join().unwrap(), DispatchOutcome::Delivered);

        let late = BufferHandle::copy_owned(InterfaceType::Sta, 0, vec![2]);
        assert_eq!(registry.dispatch_inbound(late), DispatchOutcome::NoChannel);
    }

    #[test]
    fn test_closed_channel_refuses_delivery_and_releases() {
        let registry = ChannelRegistry::new();
        let (seen, receiver) = recording();
        registry.register(InterfaceType::Ap, false, receiver).unwrap();
        let channel = registry.channels.read().unwrap().get(&InterfaceType::Ap).cloned().unwrap();
        assert_eq!(registry.clear(), 1);

        let released = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&released);
        let handle = BufferHandle::copy_owned(InterfaceType::Ap, 0, vec![9]).on_release(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!channel.deliver(handle));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().is_empty());
    }
}
