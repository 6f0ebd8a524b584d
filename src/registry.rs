//! Callback registry keyed by [`PacketKey`].
//!
//! Each key maps to an immutable, reference-counted list of entries. Writers
//! replace the list under the write lock; the dispatcher clones the `Arc`
//! under the read lock and iterates without holding it, so registration and
//! removal during dispatch never disturb an iteration in progress.
//!
//! Unregistering clears the entry's `active` flag before the entry leaves
//! the list, and the dispatcher checks the flag right before each call.
//! `unregister` then waits for an invocation of that entry already in
//! progress, so once it returns the callback never runs again. Called from
//! inside a callback it does not wait, since the dispatcher thread is the one
//! that would have to finish.

use parking_lot::RwLock;
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::SdkError;
use crate::packet::{
    ChannelEvent, ChannelInfo, Comment, GroupInfo, LogMessage, PacketBody, PacketHeader, PacketKey,
    ProcInfo, ProtocolMonitor, SampleGroup, SysInfo, TypedPacket,
};

/// Subscriber callback. Errors and panics are contained by the dispatcher.
pub type Callback = Arc<dyn Fn(&TypedPacket) -> anyhow::Result<()> + Send + Sync>;

/// Returned by registration; pass to `unregister` to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    id: u64,
    key: PacketKey,
}

impl CallbackHandle {
    pub fn key(&self) -> PacketKey {
        self.key
    }
}

struct Entry {
    id: u64,
    active: AtomicBool,
    /// Held shared for the duration of each call
    running: RwLock<()>,
    callback: Callback,
}

thread_local! {
    static INVOKING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running callbacks until dropped.
struct InvokeScope {
    outer: bool,
}

impl InvokeScope {
    fn enter() -> Self {
        Self { outer: INVOKING.with(|flag| flag.replace(true)) }
    }
}

impl Drop for InvokeScope {
    fn drop(&mut self) {
        INVOKING.with(|flag| flag.set(self.outer));
    }
}

type EntryList = Arc<[Arc<Entry>]>;

#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    table: RwLock<HashMap<PacketKey, EntryList>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `callback` to the list for `key`.
    pub fn register<F>(&self, key: PacketKey, callback: F) -> CallbackHandle
    where
        F: Fn(&TypedPacket) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            running: RwLock::new(()),
            callback: Arc::new(callback),
        });

        let mut table = self.table.write();
        let list = table.entry(key).or_insert_with(|| Arc::from(Vec::new()));
        let mut next: Vec<Arc<Entry>> = list.iter().cloned().collect();
        next.push(entry);
        *list = Arc::from(next);

        debug!(%key, id, subscribers = list.len(), "Callback registered");
        CallbackHandle { id, key }
    }

    /// Register a callback that only sees packets carrying variant `T`.
    pub fn register_typed<T, F>(&self, key: PacketKey, callback: F) -> CallbackHandle
    where
        T: PacketVariant,
        F: Fn(&PacketHeader, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(key, move |packet: &TypedPacket| match T::from_packet(packet) {
            Some(variant) => callback(&packet.header, variant),
            None => Ok(()),
        })
    }

    /// Remove a callback. Returns `false` if it was already removed.
    ///
    /// Blocks until a call of this callback already in progress returns,
    /// unless called from inside a callback.
    pub fn unregister(&self, handle: CallbackHandle) -> bool {
        let entry = {
            let mut table = self.table.write();
            let Some(list) = table.get_mut(&handle.key) else {
                return false;
            };
            let Some(entry) = list.iter().find(|e| e.id == handle.id).cloned() else {
                return false;
            };
            entry.active.store(false, Ordering::Release);

            let next: Vec<Arc<Entry>> =
                list.iter().filter(|e| e.id != handle.id).cloned().collect();
            if next.is_empty() {
                table.remove(&handle.key);
            } else {
                *list = Arc::from(next);
            }
            entry
        };

        if !INVOKING.with(Cell::get) {
            drop(entry.running.write());
        }
        debug!(key = %handle.key, id = handle.id, "Callback unregistered");
        true
    }

    pub fn has_subscribers(&self, key: &PacketKey) -> bool {
        self.table.read().contains_key(key)
    }

    pub fn subscriber_count(&self, key: &PacketKey) -> usize {
        self.table.read().get(key).map_or(0, |list| list.len())
    }

    /// Invoke every active callback for `key` in registration order.
    ///
    /// Returns one [`SdkError::Callback`] per failed or panicking callback.
    pub fn invoke(&self, key: &PacketKey, packet: &TypedPacket) -> Vec<SdkError> {
        let Some(list) = self.table.read().get(key).cloned() else {
            return Vec::new();
        };

        let _scope = InvokeScope::enter();
        let mut failures = Vec::new();
        for entry in list.iter() {
            let _running = entry.running.read();
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            let reason = match catch_unwind(AssertUnwindSafe(|| (entry.callback)(packet))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(%key, id = entry.id, reason = %reason, "Callback failed");
            failures.push(SdkError::callback(key.to_string(), reason));
        }
        failures
    }

}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read();
        let mut keys: Vec<_> = table.iter().map(|(k, v)| (k.to_string(), v.len())).collect();
        keys.sort();
        f.debug_struct("CallbackRegistry").field("keys", &keys).finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// A concrete [`PacketBody`] variant a typed callback can subscribe to.
pub trait PacketVariant: Send + Sync + 'static {
    fn from_packet(packet: &TypedPacket) -> Option<&Self>;
}

macro_rules! packet_variant {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl PacketVariant for $ty {
                fn from_packet(packet: &TypedPacket) -> Option<&Self> {
                    match &packet.body {
                        PacketBody::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

packet_variant! {
    ProtocolMonitor => ProtocolMonitor,
    SysInfo => SysInfo,
    ProcInfo => ProcInfo,
    ChannelInfo => ChannelInfo,
    GroupInfo => GroupInfo,
    Log => LogMessage,
    Comment => Comment,
    SampleGroup => SampleGroup,
    Event => ChannelEvent,
}
