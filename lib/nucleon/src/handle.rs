use crate::context::ServiceContext;
use std::sync::{Arc, RwLock};

/// Service address: the low 24 bits identify a service within this node, the
/// high 8 bits carry the node (harbor) prefix. 0 is reserved as "none".
pub type Handle = u32;

pub const HANDLE_MASK: Handle = 0x00ff_ffff;
pub const HANDLE_REMOTE_SHIFT: u32 = 24;

const DEFAULT_SLOT_SIZE: usize = 4;
const MAX_SLOT_SIZE: usize = 1 << 24;

/// Render a handle in the canonical `:%08x` address form.
#[inline]
pub fn to_hex(handle: Handle) -> String {
    format!(":{:08x}", handle)
}

/// Parse a `:hex` address. Returns None for anything else.
#[inline]
pub fn from_hex(addr: &str) -> Option<Handle> {
    let digits = addr.strip_prefix(':')?;
    Handle::from_str_radix(digits, 16).ok()
}

struct Inner {
    slots: Vec<Option<Arc<ServiceContext>>>,
    next_index: u32,
    // Sorted by name; lookups are binary searches.
    names: Vec<(Box<str>, Handle)>,
}

/// Maps handles to live service contexts and registered names to handles.
/// Lookups take the read side of the lock; registration and retirement take
/// the write side.
pub struct HandleRegistry {
    harbor: u32,
    inner: RwLock<Inner>,
}

impl HandleRegistry {
    /// `harbor` is this node's 8 bit prefix, stamped into every handle.
    pub fn new(harbor: u8) -> HandleRegistry {
        HandleRegistry {
            harbor: u32::from(harbor) << HANDLE_REMOTE_SHIFT,
            inner: RwLock::new(Inner {
                slots: vec![None; DEFAULT_SLOT_SIZE],
                next_index: 1,
                names: Vec::new(),
            }),
        }
    }

    /// The shifted harbor prefix of this registry.
    #[inline]
    pub fn harbor_bits(&self) -> u32 {
        self.harbor
    }

    /// True when the handle's prefix names another node.
    #[inline]
    pub fn is_remote(&self, handle: Handle) -> bool {
        let prefix = handle & !HANDLE_MASK;
        prefix != self.harbor && prefix != 0
    }

    /// Allocate a handle and insert the context built by `build` under it.
    /// The context is constructed while the write lock is held, so the
    /// handle is never observable before the context exists.
    pub fn register_with<F>(&self, build: F) -> (Handle, Arc<ServiceContext>)
    where
        F: FnOnce(Handle) -> Arc<ServiceContext>,
    {
        let mut inner = self.inner.write().unwrap();

        loop {
            let size = inner.slots.len();
            for i in 0..size as u32 {
                let index = inner.next_index.wrapping_add(i) & HANDLE_MASK;
                if index == 0 {
                    // 0 is the reserved "none" address
                    continue;
                }
                let hash = index as usize & (size - 1);
                if inner.slots[hash].is_none() {
                    let handle = index | self.harbor;
                    let ctx = build(handle);
                    inner.slots[hash] = Some(ctx.clone());
                    inner.next_index = index + 1;
                    return (handle, ctx);
                }
            }

            // Full scan missed: double and rehash. The id space is 24 bits,
            // running out of it is unrecoverable.
            if size * 2 > MAX_SLOT_SIZE {
                panic!("handle registry exhausted the 24 bit id space");
            }
            let mut new_slots: Vec<Option<Arc<ServiceContext>>> = vec![None; size * 2];
            for slot in inner.slots.drain(..) {
                if let Some(ctx) = slot {
                    let hash = ctx.handle() as usize & (size * 2 - 1);
                    debug_assert!(new_slots[hash].is_none());
                    new_slots[hash] = Some(ctx);
                }
            }
            inner.slots = new_slots;
        }
    }

    /// Clear the slot for `handle` and drop any names bound to it. Returns
    /// true if the handle was live. The registry's reference is released;
    /// the context is destroyed once the remaining grabs are released too.
    pub fn retire(&self, handle: Handle) -> bool {
        let retired = {
            let mut inner = self.inner.write().unwrap();
            let hash = handle as usize & (inner.slots.len() - 1);
            let live = matches!(&inner.slots[hash], Some(ctx) if ctx.handle() == handle);
            if live {
                let ctx = inner.slots[hash].take();
                inner.names.retain(|(_, h)| *h != handle);
                ctx
            } else {
                None
            }
        };

        // Drop outside the lock; the context drop may touch the registry.
        retired.is_some()
    }

    /// Retire every live handle. Sweeps repeatedly because retiring one
    /// service may launch or name others from its drop path.
    pub fn retire_all(&self) {
        loop {
            let mut retired = 0;
            let handles: Vec<Handle> = {
                let inner = self.inner.read().unwrap();
                inner
                    .slots
                    .iter()
                    .flatten()
                    .map(|ctx| ctx.handle())
                    .collect()
            };
            for handle in handles {
                if handle != 0 && self.retire(handle) {
                    retired += 1;
                }
            }
            if retired == 0 {
                return;
            }
        }
    }

    /// Fetch a referenced context. The clone is the caller's reference and
    /// is released by dropping it.
    pub fn grab(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        let inner = self.inner.read().unwrap();
        let hash = handle as usize & (inner.slots.len() - 1);
        match &inner.slots[hash] {
            Some(ctx) if ctx.handle() == handle => Some(ctx.clone()),
            _ => None,
        }
    }

    /// Resolve a registered name.
    pub fn find_name(&self, name: &str) -> Option<Handle> {
        let inner = self.inner.read().unwrap();
        inner
            .names
            .binary_search_by(|(n, _)| n.as_ref().cmp(name))
            .ok()
            .map(|i| inner.names[i].1)
    }

    /// Bind `name` to `handle`. Fails iff the name is already taken; this is
    /// the only failure mode, and it is how callers detect collisions.
    pub fn bind_name(&self, handle: Handle, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.names.binary_search_by(|(n, _)| n.as_ref().cmp(name)) {
            Ok(_) => false,
            Err(at) => {
                inner.names.insert(at, (name.into(), handle));
                true
            }
        }
    }

    /// Number of live services (used by shutdown sweeps and tests).
    pub fn live_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeShared;

    fn registry_with_node() -> (Arc<NodeShared>, Arc<HandleRegistry>) {
        let node = NodeShared::for_test(0);
        let registry = node.registry.clone();
        (node, registry)
    }

    #[test]
    fn test_register_retire_grab() {
        let (node, registry) = registry_with_node();

        let (handle, _ctx) = registry.register_with(|h| ServiceContext::stub(&node, h));
        assert_ne!(handle, 0);
        assert!(registry.grab(handle).is_some());

        assert!(registry.retire(handle));
        assert!(registry.grab(handle).is_none());
        assert!(!registry.retire(handle));
    }

    #[test]
    fn test_handle_not_reused_while_alive() {
        let (node, registry) = registry_with_node();

        let (a, _ca) = registry.register_with(|h| ServiceContext::stub(&node, h));
        let (b, _cb) = registry.register_with(|h| ServiceContext::stub(&node, h));
        assert_ne!(a, b);
    }

    #[test]
    fn test_capacity_doubles() {
        let (node, registry) = registry_with_node();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let (h, _c) = registry.register_with(|h| ServiceContext::stub(&node, h));
            handles.push(h);
        }
        handles.sort_unstable();
        handles.dedup();
        assert_eq!(handles.len(), 64);
        for h in handles {
            assert!(registry.grab(h).is_some());
        }
    }

    #[test]
    fn test_names() {
        let (node, registry) = registry_with_node();

        let (a, _ca) = registry.register_with(|h| ServiceContext::stub(&node, h));
        let (b, _cb) = registry.register_with(|h| ServiceContext::stub(&node, h));

        assert!(registry.bind_name(a, "alpha"));
        assert!(!registry.bind_name(b, "alpha"));
        assert_eq!(registry.find_name("alpha"), Some(a));
        assert_eq!(registry.find_name("beta"), None);

        assert!(registry.bind_name(b, "beta"));
        assert_eq!(registry.find_name("beta"), Some(b));

        // Retiring drops the binding.
        registry.retire(a);
        assert_eq!(registry.find_name("alpha"), None);
        assert_eq!(registry.find_name("beta"), Some(b));
    }

    #[test]
    fn test_harbor_prefix() {
        let node = NodeShared::for_test(7);
        let registry = node.registry.clone();
        let (h, _c) = registry.register_with(|h| ServiceContext::stub(&node, h));

        assert_eq!(h >> HANDLE_REMOTE_SHIFT, 7);
        assert!(!registry.is_remote(h));
        assert!(registry.is_remote(9 << HANDLE_REMOTE_SHIFT | 1));
        assert!(!registry.is_remote(0x0000_0001));
    }

    #[test]
    fn test_hex_roundtrip() {
        assert_eq!(to_hex(0x0100_00ab), ":010000ab");
        assert_eq!(from_hex(":010000ab"), Some(0x0100_00ab));
        assert_eq!(from_hex("garbage"), None);
    }
}
