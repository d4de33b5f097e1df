use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Logical interface a buffer travels on.
///
/// The discriminants are the 4-bit interface codes carried in the frame
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceType {
    Sta,
    Ap,
    Serial,
    Hci,
    Priv,
    Test,
}

impl InterfaceType {
    pub const ALL: [InterfaceType; 6] = [
        InterfaceType::Sta,
        InterfaceType::Ap,
        InterfaceType::Serial,
        InterfaceType::Hci,
        InterfaceType::Priv,
        InterfaceType::Test,
    ];

    pub fn code(self) -> u8 {
        match self {
            InterfaceType::Sta => 0,
            InterfaceType::Ap => 1,
            InterfaceType::Serial => 2,
            InterfaceType::Hci => 3,
            InterfaceType::Priv => 4,
            InterfaceType::Test => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Bulk data traffic that the slave may throttle.
    pub fn is_data(self) -> bool {
        matches!(self, InterfaceType::Sta | InterfaceType::Ap | InterfaceType::Test)
    }

    /// Interfaces owned by the link layer itself; never registered as channels.
    pub fn is_reserved(self) -> bool {
        matches!(self, InterfaceType::Priv | InterfaceType::Test)
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterfaceType::Sta => "sta",
            InterfaceType::Ap => "ap",
            InterfaceType::Serial => "serial",
            InterfaceType::Hci => "hci",
            InterfaceType::Priv => "priv",
            InterfaceType::Test => "test",
        };
        f.write_str(name)
    }
}

/// Opaque value handed back to the owner when its buffer is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OwnerToken(pub u64);

pub type ReleaseFn = Box<dyn FnOnce(OwnerToken) + Send + Sync + 'static>;

struct Release {
    token: OwnerToken,
    func: ReleaseFn,
}

/// Payload storage of a [`BufferHandle`].
pub enum Payload {
    /// Memory allocated by the link layer.
    Owned(Vec<u8>),
    /// Caller memory shared with the link layer until release.
    ZeroCopy(Arc<[u8]>),
}

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Owned(v) => v,
            Payload::ZeroCopy(a) => a,
        }
    }
}

/// One in-flight payload plus its release contract.
///
/// A handle is move-only. Its release callback runs exactly once: either
/// through [`BufferHandle::release`], [`BufferHandle::into_payload`], or
/// when the handle is dropped by whichever path consumed it last.
pub struct BufferHandle {
    if_type: InterfaceType,
    if_num: u8,
    payload: Payload,
    release: Option<Release>,
    pub(crate) throttle_retries: u32,
}

impl BufferHandle {
    /// Link-layer owned buffer. Release frees the memory.
    pub fn copy_owned(if_type: InterfaceType, if_num: u8, data: Vec<u8>) -> Self {
        Self {
            if_type,
            if_num,
            payload: Payload::Owned(data),
            release: None,
            throttle_retries: 0,
        }
    }

    /// Buffer aliasing caller memory. `release` is invoked with `token` once
    /// the link layer is done with it.
    pub fn zero_copy<F>(
        if_type: InterfaceType,
        if_num: u8,
        data: Arc<[u8]>,
        token: OwnerToken,
        release: F,
    ) -> Self
    where
        F: FnOnce(OwnerToken) + Send + Sync + 'static,
    {
        Self {
            if_type,
            if_num,
            payload: Payload::ZeroCopy(data),
            release: Some(Release {
                token,
                func: Box::new(release),
            }),
            throttle_retries: 0,
        }
    }

    /// Attach a release hook to a handle, chaining after any existing one.
    pub fn on_release<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(OwnerToken) + Send + Sync + 'static,
    {
        self.release = Some(match self.release.take() {
            Some(existing) => {
                let Release { token, func } = existing;
                Release {
                    token,
                    func: Box::new(move |t| {
                        func(t);
                        hook(t);
                    }),
                }
            }
            None => Release {
                token: OwnerToken::default(),
                func: Box::new(hook),
            },
        });
        self
    }

    pub fn if_type(&self) -> InterfaceType {
        self.if_type
    }

    pub fn if_num(&self) -> u8 {
        self.if_num
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn len(&self) -> usize {
        self.payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self.payload, Payload::ZeroCopy(_))
    }

    /// Consume the handle, running its release path now.
    pub fn release(self) {
        drop(self);
    }

    /// Take the payload out and release the handle.
    ///
    /// For zero-copy buffers the returned `Arc` keeps the bytes alive, but
    /// the owner has already been told the link layer is done.
    pub fn into_payload(mut self) -> Payload {
        let payload = std::mem::replace(&mut self.payload, Payload::Owned(Vec::new()));
        drop(self);
        payload
    }

    fn fire_release(&mut self) {
        if let Some(Release { token, func }) = self.release.take() {
            func(token);
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.fire_release();
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("if_type", &self.if_type)
            .field("if_num", &self.if_num)
            .field("len", &self.len())
            .field("zero_copy", &self.is_zero_copy())
            .field("has_release", &self.release.is_some())
            .finish()
    }
}
