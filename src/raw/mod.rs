use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::Ordering;

use bitflags::bitflags;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use log::{error, trace};

use crate::InsertError;

// TODO: Iterators (from, into, extend).
// TODO: Rayon support under a feature flag.
// TODO: Some refactoring around the pointer juggling in the expand/compress helpers.
// TODO: Split into multiple files once the compression path grows a second caller.

pub(crate) const LEVEL_BITS: usize = 4;
pub(crate) const NARROW_WIDTH: usize = 4;
pub(crate) const WIDE_WIDTH: usize = 16;

bitflags! {
    /// Flags living in the unused low bits of a slot pointer.
    ///
    /// A slot's normal states (empty, or pointing at a live `Node`) need no tag. The two
    /// terminal *frozen-but-empty* states — a slot that was null at freeze time (`FVN`), and an
    /// `SN.txn` that was `NoTxn` at freeze time (`FSN`) — reuse the null pointer itself, tagged,
    /// rather than allocating a node just to say "nothing, permanently".
    struct SlotFlags: usize {
        const VOID = 0b01;
    }
}

/// One of the states a slot (or an `SN.txn`) may hold. `Array`/`Single` are live structure;
/// `Expand`/`Compress` are restructuring markers any thread landing on them must help complete;
/// `Frozen` wraps an array-node that will never change again. The sixth state, `FVN`/`FSN`, is
/// the tagged-null case and carries no payload, so it's handled via [`SlotFlags::VOID`] on the
/// pointer rather than as a variant here.
pub(crate) enum Node<K, V> {
    Array(ArrayNode<K, V>),
    Single(SingleNode<K, V>),
    Expand(ExpandNode<K, V>),
    Compress(CompressNode<K, V>),
    Frozen(FrozenNode<K, V>),
}

// The parent_slot/narrow/stale/frozen raw pointers below only ever point into nodes owned by
// this same trie and kept alive by the pinning discipline of whatever operation holds them; they
// carry no thread affinity of their own. Without this, Node<K, V> would be !Send/!Sync purely
// because it contains raw pointers, even though K: Send + Sync, V: Send + Sync is exactly the
// bound under which sharing it across threads is sound.
unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for Node<K, V> {}

pub(crate) type Slot<K, V> = Atomic<Node<K, V>>;

/// An array-node: `slots.len()` is always `NARROW_WIDTH` or `WIDE_WIDTH`.
pub(crate) struct ArrayNode<K, V> {
    slots: Box<[Slot<K, V>]>,
}

impl<K, V> ArrayNode<K, V> {
    fn new(width: usize) -> Self {
        let mut slots = Vec::with_capacity(width);
        slots.resize_with(width, Atomic::null);
        ArrayNode {
            slots: slots.into_boxed_slice(),
        }
    }

    fn width(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, hash: u64, level: usize) -> usize {
        let mask = (self.width() - 1) as u64;
        ((hash >> level) & mask) as usize
    }
}

/// A leaf: `hash` is the precomputed hash of `key`. `txn` stages a replacement so a writer can
/// linearize on a single CAS before anyone touches the slot that actually holds this node.
pub(crate) struct SingleNode<K, V> {
    hash: u64,
    key: K,
    value: V,
    txn: Atomic<Node<K, V>>,
}

impl<K, V> SingleNode<K, V> {
    fn new(hash: u64, key: K, value: V) -> Self {
        SingleNode {
            hash,
            key,
            value,
            txn: Atomic::null(),
        }
    }
}

/// An expansion marker: announces that `narrow` (a frozen, full, width-4 array-node) is being
/// replaced by a freshly built width-16 array-node.
///
/// `parent_slot` points at the slot this marker must eventually overwrite with `wide` — valid as
/// long as the array-node containing it is reachable, which it is for the lifetime of this
/// marker (it occupies that very slot until committed).
pub(crate) struct ExpandNode<K, V> {
    parent_slot: *const Slot<K, V>,
    narrow: *const Node<K, V>,
    #[allow(dead_code)]
    hash: u64,
    level: usize,
    wide: Atomic<Node<K, V>>,
}

/// A compression marker: announces that `stale` (a frozen, sparse array-node) is being replaced
/// by its compressed form — a single leaf, a smaller array-node, or nothing at all.
pub(crate) struct CompressNode<K, V> {
    parent_slot: *const Slot<K, V>,
    stale: *const Node<K, V>,
    #[allow(dead_code)]
    hash: u64,
    #[allow(dead_code)]
    level: usize,
}

/// An immutable wrapper marking the array-node it contains as frozen: none of that node's slots
/// will ever transition again.
pub(crate) struct FrozenNode<K, V> {
    frozen: *const Node<K, V>,
}

/// What a slot (or `SN.txn`) currently holds, with the tagged-null case folded in.
enum SlotState<'g, K, V> {
    Empty,
    Void,
    Array(&'g ArrayNode<K, V>),
    Single(&'g SingleNode<K, V>),
    Expand(&'g ExpandNode<K, V>),
    Compress(&'g CompressNode<K, V>),
    Frozen(&'g FrozenNode<K, V>),
}

fn classify<K, V>(node: Shared<'_, Node<K, V>>) -> SlotState<'_, K, V> {
    if node.is_null() {
        if node.tag() & SlotFlags::VOID.bits() != 0 {
            SlotState::Void
        } else {
            SlotState::Empty
        }
    } else {
        match unsafe { node.deref() } {
            Node::Array(an) => SlotState::Array(an),
            Node::Single(sn) => SlotState::Single(sn),
            Node::Expand(en) => SlotState::Expand(en),
            Node::Compress(xn) => SlotState::Compress(xn),
            Node::Frozen(fz) => SlotState::Frozen(fz),
        }
    }
}

fn void_ptr<'g, K, V>() -> Shared<'g, Node<K, V>> {
    Shared::null().with_tag(SlotFlags::VOID.bits())
}

enum InsertOutcome<K, V> {
    Success(Option<V>),
    Collision(K, V),
    Restart,
}

enum RemoveOutcome<V> {
    Done(Option<V>),
    Restart,
}

/// The concurrent engine underlying `ConMap`/`ConSet`. Carries no public API of its own; see
/// `crate::map::ConMap` for the embedder-facing surface.
pub struct Raw<K, V, S> {
    hash_builder: S,
    root: Atomic<Node<K, V>>,
}

impl<K, V, S> Raw<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(hash_builder: S) -> Self {
        Raw {
            hash_builder,
            root: Atomic::new(Node::Array(ArrayNode::new(WIDE_WIDTH))),
        }
    }

    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        let pin = crossbeam_epoch::pin();
        let mut current = self.root_array(&pin);
        let mut level = 0;
        loop {
            let slot = &current.slots[current.index(hash, level)];
            let node = slot.load(Ordering::Acquire, &pin);
            match classify(node) {
                SlotState::Empty | SlotState::Void => return None,
                SlotState::Single(sn) => {
                    return if sn.hash == hash && sn.key.borrow() == key {
                        Some(sn.value.clone())
                    } else {
                        None
                    };
                }
                SlotState::Array(an) => {
                    current = an;
                    level += LEVEL_BITS;
                }
                SlotState::Expand(en) => current = unsafe { &*en.narrow }.as_array(),
                SlotState::Compress(xn) => current = unsafe { &*xn.stale }.as_array(),
                SlotState::Frozen(fz) => current = unsafe { &*fz.frozen }.as_array(),
            }
        }
    }

    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, InsertError<K, V>> {
        let hash = self.hash(&key);
        loop {
            let pin = crossbeam_epoch::pin();
            match self.try_insert(hash, key.clone(), value.clone(), &pin) {
                InsertOutcome::Success(prev) => return Ok(prev),
                InsertOutcome::Collision(key, value) => {
                    return Err(InsertError::HashCollision { key, value })
                }
                InsertOutcome::Restart => continue,
            }
        }
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        loop {
            let pin = crossbeam_epoch::pin();
            match self.try_remove(hash, key, &pin) {
                RemoveOutcome::Done(v) => return v,
                RemoveOutcome::Restart => continue,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let pin = crossbeam_epoch::pin();
        let an = self.root_array(&pin);
        an.slots
            .iter()
            .all(|s| s.load(Ordering::Relaxed, &pin).is_null())
    }

    fn root_array<'g>(&self, pin: &'g Guard) -> &'g ArrayNode<K, V> {
        match unsafe { self.root.load(Ordering::Acquire, pin).deref() } {
            Node::Array(an) => an,
            _ => invariant_violation("root is not an array-node"),
        }
    }

    /// §4.2. Returns `Restart` when it has either helped a protocol to completion or observed a
    /// frozen subtree; the caller is expected to loop and retry from the root.
    fn try_insert<'g>(&self, hash: u64, key: K, value: V, pin: &'g Guard) -> InsertOutcome<K, V> {
        let mut cur = self.root_array(pin);
        let mut cur_ptr = self.root.load(Ordering::Acquire, pin);
        let mut prev: Option<(&'g ArrayNode<K, V>, usize)> = None;
        let mut level = 0;
        loop {
            let pos = cur.index(hash, level);
            let slot = &cur.slots[pos];
            let node = slot.load(Ordering::Acquire, pin);
            match classify(node) {
                SlotState::Empty => {
                    let new = Owned::new(Node::Single(SingleNode::new(
                        hash,
                        key.clone(),
                        value.clone(),
                    )));
                    match slot.compare_exchange_weak(
                        node,
                        new,
                        Ordering::Release,
                        Ordering::Relaxed,
                        pin,
                    ) {
                        Ok(_) => return InsertOutcome::Success(None),
                        Err(_) => continue,
                    }
                }
                SlotState::Array(an) => {
                    prev = Some((cur, pos));
                    cur = an;
                    cur_ptr = node;
                    level += LEVEL_BITS;
                }
                SlotState::Single(sn) => {
                    let txn = sn.txn.load(Ordering::Acquire, pin);
                    match classify(txn) {
                        SlotState::Void => return InsertOutcome::Restart,
                        SlotState::Empty => {
                            if sn.hash == hash && sn.key == key {
                                let replacement = Owned::new(Node::Single(SingleNode::new(
                                    hash,
                                    key.clone(),
                                    value.clone(),
                                )))
                                .into_shared(pin);
                                match sn.txn.compare_exchange(
                                    Shared::null(),
                                    replacement,
                                    Ordering::Release,
                                    Ordering::Relaxed,
                                    pin,
                                ) {
                                    Ok(_) => {
                                        let prior = sn.value.clone();
                                        if slot
                                            .compare_exchange(
                                                node,
                                                replacement,
                                                Ordering::Release,
                                                Ordering::Relaxed,
                                                pin,
                                            )
                                            .is_ok()
                                        {
                                            unsafe { pin.defer_destroy(node) };
                                        }
                                        return InsertOutcome::Success(Some(prior));
                                    }
                                    Err(_) => continue,
                                }
                            } else if cur.width() == NARROW_WIDTH {
                                let (parent, ppos) = prev.unwrap_or_else(|| {
                                    invariant_violation("narrow array-node without a parent slot")
                                });
                                let parent_slot: *const Slot<K, V> = &parent.slots[ppos];
                                let current = parent.slots[ppos].load(Ordering::Acquire, pin);
                                match classify(current) {
                                    SlotState::Array(_)
                                        if current.as_raw() == cur_ptr.as_raw() =>
                                    {
                                        let marker = Owned::new(Node::Expand(ExpandNode {
                                            parent_slot,
                                            narrow: cur_ptr.as_raw(),
                                            hash,
                                            level,
                                            wide: Atomic::null(),
                                        }));
                                        match parent.slots[ppos].compare_exchange(
                                            cur_ptr,
                                            marker,
                                            Ordering::Release,
                                            Ordering::Relaxed,
                                            pin,
                                        ) {
                                            Ok(installed) => {
                                                trace!(
                                                    "installed expansion marker at level {} for hash {:#x}",
                                                    level, hash
                                                );
                                                let en = match unsafe { installed.deref() } {
                                                    Node::Expand(en) => en,
                                                    _ => invariant_violation(
                                                        "just-installed marker is not EN",
                                                    ),
                                                };
                                                complete_expansion(en, pin);
                                                return InsertOutcome::Restart;
                                            }
                                            Err(_) => continue,
                                        }
                                    }
                                    SlotState::Expand(other_en) => {
                                        complete_expansion(other_en, pin);
                                        return InsertOutcome::Restart;
                                    }
                                    SlotState::Compress(other_xn) => {
                                        complete_compression(other_xn, pin);
                                        return InsertOutcome::Restart;
                                    }
                                    // The AN we checked for NARROW_WIDTH has already been
                                    // superseded (by another thread's expansion, a freeze, or a
                                    // collapse) — nothing to CAS from any more, just restart.
                                    _ => return InsertOutcome::Restart,
                                }
                            } else {
                                let staged = create_anode(sn, hash, &key, &value, level + LEVEL_BITS);
                                if let Staging::Collision = staged {
                                    return InsertOutcome::Collision(key, value);
                                }
                                let tiny = materialize(staged, pin);
                                match sn.txn.compare_exchange(
                                    Shared::null(),
                                    tiny,
                                    Ordering::Release,
                                    Ordering::Relaxed,
                                    pin,
                                ) {
                                    Ok(_) => {
                                        if slot
                                            .compare_exchange(
                                                node,
                                                tiny,
                                                Ordering::Release,
                                                Ordering::Relaxed,
                                                pin,
                                            )
                                            .is_ok()
                                        {
                                            unsafe { pin.defer_destroy(node) };
                                        }
                                        return InsertOutcome::Success(None);
                                    }
                                    Err(_) => continue,
                                }
                            }
                        }
                        _ => {
                            commit_staged(slot, node, txn, pin);
                            continue;
                        }
                    }
                }
                SlotState::Expand(en) => {
                    trace!("helping expansion at level {} for hash {:#x}", level, hash);
                    complete_expansion(en, pin);
                    return InsertOutcome::Restart;
                }
                SlotState::Compress(xn) => {
                    trace!("helping compression at level {} for hash {:#x}", level, hash);
                    complete_compression(xn, pin);
                    return InsertOutcome::Restart;
                }
                SlotState::Frozen(_) | SlotState::Void => return InsertOutcome::Restart,
            }
        }
    }

    /// §4.3. Same descent discipline as `try_insert`.
    fn try_remove<'g, Q>(&self, hash: u64, key: &Q, pin: &'g Guard) -> RemoveOutcome<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let mut cur = self.root_array(pin);
        let mut cur_ptr = self.root.load(Ordering::Acquire, pin);
        let mut prev: Option<(&'g ArrayNode<K, V>, usize)> = None;
        let mut level = 0;
        loop {
            let pos = cur.index(hash, level);
            let slot = &cur.slots[pos];
            let node = slot.load(Ordering::Acquire, pin);
            match classify(node) {
                SlotState::Empty | SlotState::Void => return RemoveOutcome::Done(None),
                SlotState::Array(an) => {
                    prev = Some((cur, pos));
                    cur = an;
                    cur_ptr = node;
                    level += LEVEL_BITS;
                }
                SlotState::Single(sn) => {
                    let txn = sn.txn.load(Ordering::Acquire, pin);
                    match classify(txn) {
                        SlotState::Void => return RemoveOutcome::Restart,
                        SlotState::Empty => {
                            if sn.hash != hash || sn.key.borrow() != key {
                                return RemoveOutcome::Done(None);
                            }
                            match sn.txn.compare_exchange(
                                Shared::null(),
                                void_ptr(),
                                Ordering::Release,
                                Ordering::Relaxed,
                                pin,
                            ) {
                                Ok(_) => {
                                    let value = sn.value.clone();
                                    let _ = slot.compare_exchange(
                                        node,
                                        void_ptr(),
                                        Ordering::Release,
                                        Ordering::Relaxed,
                                        pin,
                                    );
                                    unsafe { pin.defer_destroy(node) };
                                    if let Some((parent, ppos)) = prev {
                                        maybe_compress(parent, ppos, cur_ptr, hash, level, pin);
                                    }
                                    return RemoveOutcome::Done(Some(value));
                                }
                                Err(_) => continue,
                            }
                        }
                        _ => {
                            commit_staged(slot, node, txn, pin);
                            continue;
                        }
                    }
                }
                SlotState::Expand(en) => {
                    complete_expansion(en, pin);
                    return RemoveOutcome::Restart;
                }
                SlotState::Compress(xn) => {
                    complete_compression(xn, pin);
                    return RemoveOutcome::Restart;
                }
                SlotState::Frozen(_) => return RemoveOutcome::Done(None),
            }
        }
    }
}

/// A staged replacement (left in `sn.txn` by a writer, possibly crashed before the best-effort
/// slot CAS) can be committed by anyone who observes it.
fn commit_staged<'g, K, V>(
    slot: &Slot<K, V>,
    old: Shared<'g, Node<K, V>>,
    staged: Shared<'g, Node<K, V>>,
    pin: &'g Guard,
) {
    if slot
        .compare_exchange(old, staged, Ordering::Release, Ordering::Relaxed, pin)
        .is_ok()
    {
        unsafe { pin.defer_destroy(old) };
    }
}

/// §4.4: freeze the narrow array-node, transfer its contents into a fresh wide one, publish, then
/// commit into the parent slot that originally held the `EN`. Called both from `try_insert`'s own
/// descent and, via `freeze`, by any thread that helps an `EN` it merely stumbled across.
fn complete_expansion<K, V>(en: &ExpandNode<K, V>, pin: &Guard)
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let narrow_array = unsafe { &*en.narrow }.as_array();
    freeze(narrow_array, pin);

    let wide = ArrayNode::new(WIDE_WIDTH);
    sequential_transfer(narrow_array, &wide, en.level, pin);
    let wide_owned = Owned::new(Node::Array(wide)).into_shared(pin);

    let published = match en.wide.compare_exchange(
        Shared::null(),
        wide_owned,
        Ordering::Release,
        Ordering::Relaxed,
        pin,
    ) {
        Ok(p) => p,
        Err(e) => {
            unsafe { drop(e.new.into_owned()) };
            e.current
        }
    };

    let parent_slot = unsafe { &*en.parent_slot };
    let marker = parent_slot.load(Ordering::Acquire, pin);
    if let SlotState::Expand(current_en) = classify(marker) {
        if std::ptr::eq(current_en, en)
            && parent_slot
                .compare_exchange(marker, published, Ordering::Release, Ordering::Relaxed, pin)
                .is_ok()
        {
            unsafe { retire_expand(en, marker, pin) };
        }
    }
}

/// §4.5: freeze-and-compress the stale array-node, then commit its collapsed form (a single
/// leaf, a smaller array-node, or nothing) into the parent slot.
fn complete_compression<K, V>(xn: &CompressNode<K, V>, pin: &Guard)
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let stale_array = unsafe { &*xn.stale }.as_array();
    let result = freeze_and_compress(stale_array, pin);

    let parent_slot = unsafe { &*xn.parent_slot };
    let marker = parent_slot.load(Ordering::Acquire, pin);
    if let SlotState::Compress(current_xn) = classify(marker) {
        if std::ptr::eq(current_xn, xn)
            && parent_slot
                .compare_exchange(marker, result, Ordering::Release, Ordering::Relaxed, pin)
                .is_ok()
        {
            unsafe { retire_compress(xn, marker, pin) };
        }
    }
}

/// §4.3 closing note: after a successful remove, opportunistically install an `XN` if the
/// array-node we just shrank looks sparse. Purely a reclamation-latency optimization; correctness
/// never depends on it running, so a lost CAS here is simply ignored.
fn maybe_compress<K, V>(
    parent: &ArrayNode<K, V>,
    ppos: usize,
    cur_ptr: Shared<'_, Node<K, V>>,
    hash: u64,
    level: usize,
    pin: &Guard,
) where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let cur = unsafe { cur_ptr.deref() }.as_array();
    let non_null = cur
        .slots
        .iter()
        .filter(|s| !s.load(Ordering::Relaxed, pin).is_null())
        .count();
    if non_null > 1 {
        return;
    }
    let parent_slot: *const Slot<K, V> = &parent.slots[ppos];
    let marker = Owned::new(Node::Compress(CompressNode {
        parent_slot,
        stale: cur_ptr.as_raw(),
        hash,
        level,
    }));
    // CAS from `cur_ptr` itself — the exact AN `stale` claims to reference — not a freshly
    // reloaded value; if the slot has moved on, this simply fails and the optimization is skipped.
    if let Ok(installed) = parent.slots[ppos].compare_exchange(
        cur_ptr,
        marker,
        Ordering::Release,
        Ordering::Relaxed,
        pin,
    ) {
        if let SlotState::Compress(xn) = classify(installed) {
            complete_compression(xn, pin);
        }
    }
}

/// §4.6: drive every slot of `an` to a terminal frozen state ({FVN, SN(FSN), FN}). Idempotent;
/// any thread may call this on any array-node reachable through an `EN`/`XN`.
fn freeze<K, V>(an: &ArrayNode<K, V>, pin: &Guard)
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    for slot in an.slots.iter() {
        loop {
            let node = slot.load(Ordering::Acquire, pin);
            match classify(node) {
                SlotState::Empty => {
                    match slot.compare_exchange_weak(
                        node,
                        void_ptr(),
                        Ordering::Release,
                        Ordering::Relaxed,
                        pin,
                    ) {
                        Ok(_) => break,
                        Err(_) => continue,
                    }
                }
                SlotState::Void | SlotState::Frozen(_) => break,
                SlotState::Single(sn) => {
                    let txn = sn.txn.load(Ordering::Acquire, pin);
                    match classify(txn) {
                        SlotState::Void => break,
                        SlotState::Empty => {
                            match sn.txn.compare_exchange_weak(
                                Shared::null(),
                                void_ptr(),
                                Ordering::Release,
                                Ordering::Relaxed,
                                pin,
                            ) {
                                Ok(_) => break,
                                Err(_) => continue,
                            }
                        }
                        _ => {
                            commit_staged(slot, node, txn, pin);
                            continue;
                        }
                    }
                }
                SlotState::Array(_) => {
                    let wrapped = Owned::new(Node::Frozen(FrozenNode {
                        frozen: node.as_raw(),
                    }));
                    match slot.compare_exchange_weak(
                        node,
                        wrapped,
                        Ordering::Release,
                        Ordering::Relaxed,
                        pin,
                    ) {
                        Ok(_) => break,
                        Err(_) => continue,
                    }
                }
                SlotState::Expand(en) => {
                    complete_expansion(en, pin);
                    continue;
                }
                SlotState::Compress(xn) => {
                    complete_compression(xn, pin);
                    continue;
                }
            }
        }
    }
}

/// §4.4 step 2: copy every frozen leaf of `from` into `to`, rehashed at the wider window; recurse
/// through frozen sub-array-nodes (flattening); skip `FVN`. `from` is read-only by this point
/// (frozen), so every write here targets only the not-yet-published `to`.
fn sequential_transfer<K, V>(from: &ArrayNode<K, V>, to: &ArrayNode<K, V>, level: usize, pin: &Guard)
where
    K: Clone,
    V: Clone,
{
    for slot in from.slots.iter() {
        let node = slot.load(Ordering::Relaxed, pin);
        match classify(node) {
            SlotState::Empty | SlotState::Void => continue,
            SlotState::Single(sn) => {
                let fresh = Owned::new(Node::Single(SingleNode::new(
                    sn.hash,
                    sn.key.clone(),
                    sn.value.clone(),
                )));
                let pos = to.index(sn.hash, level);
                to.slots[pos].store(fresh, Ordering::Relaxed);
            }
            SlotState::Frozen(fz) => {
                sequential_transfer(unsafe { &*fz.frozen }.as_array(), to, level, pin);
            }
            SlotState::Array(_) | SlotState::Expand(_) | SlotState::Compress(_) => {
                invariant_violation("non-frozen slot encountered during sequential_transfer")
            }
        }
    }
}

/// §4.5 step 1: freeze `an` while counting non-`FVN` entries, then collapse accordingly.
fn freeze_and_compress<'g, K, V>(an: &ArrayNode<K, V>, pin: &'g Guard) -> Shared<'g, Node<K, V>>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    freeze(an, pin);

    let mut count = 0usize;
    let mut single: Option<(u64, K, V)> = None;
    let mut any_branch = false;
    for slot in an.slots.iter() {
        match classify(slot.load(Ordering::Relaxed, pin)) {
            SlotState::Void => {}
            SlotState::Single(sn) => {
                count += 1;
                single = Some((sn.hash, sn.key.clone(), sn.value.clone()));
            }
            SlotState::Frozen(_) => {
                count += 1;
                any_branch = true;
            }
            _ => invariant_violation("non-terminal slot after freeze"),
        }
    }

    if count == 0 {
        return void_ptr();
    }
    if count == 1 && !any_branch {
        let (hash, key, value) = single.expect("count == 1 implies a recorded single leaf");
        return Owned::new(Node::Single(SingleNode::new(hash, key, value))).into_shared(pin);
    }

    let compressed = ArrayNode::new(an.width());
    for (idx, slot) in an.slots.iter().enumerate() {
        match classify(slot.load(Ordering::Relaxed, pin)) {
            SlotState::Void => {}
            SlotState::Single(sn) => {
                let fresh = Owned::new(Node::Single(SingleNode::new(
                    sn.hash,
                    sn.key.clone(),
                    sn.value.clone(),
                )));
                compressed.slots[idx].store(fresh, Ordering::Relaxed);
            }
            SlotState::Frozen(fz) => {
                let fresh = Owned::new(Node::Frozen(FrozenNode { frozen: fz.frozen }));
                compressed.slots[idx].store(fresh, Ordering::Relaxed);
            }
            _ => invariant_violation("non-terminal slot after freeze"),
        }
    }
    Owned::new(Node::Array(compressed)).into_shared(pin)
}

/// §4.7: build a tiny array-node holding the frozen leaf `sn` alongside a fresh leaf for
/// `(hash, key, value)`, at `level`. Pure and non-atomic — see [`Staging`].
fn create_anode<K, V>(sn: &SingleNode<K, V>, hash: u64, key: &K, value: &V, level: usize) -> Staging<K, V>
where
    K: Clone,
    V: Clone,
{
    let p1 = (sn.hash >> level) & (NARROW_WIDTH as u64 - 1);
    let p2 = (hash >> level) & (NARROW_WIDTH as u64 - 1);
    if p1 != p2 {
        let mut slots: Vec<Option<Staging<K, V>>> = (0..NARROW_WIDTH).map(|_| None).collect();
        slots[p1 as usize] = Some(Staging::Leaf(sn.hash, sn.key.clone(), sn.value.clone()));
        slots[p2 as usize] = Some(Staging::Leaf(hash, key.clone(), value.clone()));
        return Staging::Branch(slots);
    }
    if sn.hash == hash {
        // Equal full hashes: the one case the language-independent design leaves open. We
        // surface it as a distinguished error at the call site instead of recursing forever.
        return Staging::Collision;
    }
    let mut slots: Vec<Option<Staging<K, V>>> = (0..WIDE_WIDTH).map(|_| None).collect();
    let w1 = (sn.hash >> level) & (WIDE_WIDTH as u64 - 1);
    let w2 = (hash >> level) & (WIDE_WIDTH as u64 - 1);
    if w1 != w2 {
        slots[w1 as usize] = Some(Staging::Leaf(sn.hash, sn.key.clone(), sn.value.clone()));
        slots[w2 as usize] = Some(Staging::Leaf(hash, key.clone(), value.clone()));
    } else {
        slots[w1 as usize] = Some(create_anode(sn, hash, key, value, level + LEVEL_BITS));
    }
    Staging::Branch(slots)
}

/// A pure, non-atomic tree used to stage a brand-new sub-trie before it is published. Building
/// this directly out of `Atomic` slots would mean mutating through a `Shared` reference no other
/// thread can see yet — exactly the aliasing Rust won't paper over. `Staging` gives
/// `create_anode` plain owned values to recurse over; [`materialize`] turns the finished tree
/// into real nodes in one bottom-up pass, right before publishing.
enum Staging<K, V> {
    Leaf(u64, K, V),
    Branch(Vec<Option<Staging<K, V>>>),
    Collision,
}

fn materialize<'g, K, V>(staging: Staging<K, V>, pin: &'g Guard) -> Shared<'g, Node<K, V>> {
    match staging {
        Staging::Collision => invariant_violation("materialize called on an unresolved collision"),
        Staging::Leaf(hash, key, value) => {
            Owned::new(Node::Single(SingleNode::new(hash, key, value))).into_shared(pin)
        }
        Staging::Branch(children) => {
            let an = ArrayNode::new(children.len());
            for (i, child) in children.into_iter().enumerate() {
                if let Some(child) = child {
                    an.slots[i].store(materialize(child, pin), Ordering::Relaxed);
                }
            }
            Owned::new(Node::Array(an)).into_shared(pin)
        }
    }
}

/// Recursively retires a subtree all of whose nodes are conclusively dead: every slot has
/// already been superseded and no concurrent reader can still be walking toward it through a
/// live path. Only ever called on `narrow` (post-expansion) or `stale` (post-compression)
/// subtrees, which are frozen by construction — never on the *new* replacement just installed in
/// their place.
unsafe fn retire_subtree<K, V>(node: Shared<'_, Node<K, V>>, pin: &Guard) {
    if node.is_null() {
        return;
    }
    match node.deref() {
        Node::Array(an) => {
            for slot in an.slots.iter() {
                retire_subtree(slot.load(Ordering::Relaxed, pin), pin);
            }
            pin.defer_destroy(node);
        }
        Node::Single(_) => pin.defer_destroy(node),
        Node::Frozen(fz) => {
            retire_subtree(Shared::from(fz.frozen), pin);
            pin.defer_destroy(node);
        }
        Node::Expand(_) | Node::Compress(_) => {
            invariant_violation("retire_subtree encountered a live restructuring marker")
        }
    }
}

unsafe fn retire_expand<K, V>(en: &ExpandNode<K, V>, marker: Shared<'_, Node<K, V>>, pin: &Guard) {
    retire_subtree(Shared::from(en.narrow), pin);
    pin.defer_destroy(marker);
}

unsafe fn retire_compress<K, V>(xn: &CompressNode<K, V>, marker: Shared<'_, Node<K, V>>, pin: &Guard) {
    retire_subtree(Shared::from(xn.stale), pin);
    pin.defer_destroy(marker);
}

impl<K, V> Node<K, V> {
    fn as_array(&self) -> &ArrayNode<K, V> {
        match self {
            Node::Array(an) => an,
            _ => invariant_violation("as_array called on a non-array node"),
        }
    }
}

fn invariant_violation(msg: &str) -> ! {
    error!("{}", msg);
    panic!("catrie: internal invariant violated: {}", msg);
}

impl<K, V, S> Drop for Raw<K, V, S> {
    fn drop(&mut self) {
        // &mut self: no concurrent access is possible any more, so `unprotected` is sound and
        // `Relaxed` is enough — everything here already happened-before this thread by now.
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            let root = self.root.load(Ordering::Relaxed, pin);
            drop_ptr(root.as_raw());
        }
    }
}

unsafe fn drop_ptr<K, V>(ptr: *const Node<K, V>) {
    if ptr.is_null() {
        return;
    }
    let boxed = Box::from_raw(ptr as *mut Node<K, V>);
    let pin = crossbeam_epoch::unprotected();
    match &*boxed {
        Node::Array(an) => {
            for child in an.slots.iter() {
                drop_ptr(child.load(Ordering::Relaxed, pin).as_raw());
            }
        }
        Node::Single(sn) => drop_ptr(sn.txn.load(Ordering::Relaxed, pin).as_raw()),
        Node::Frozen(fz) => drop_ptr(fz.frozen),
        Node::Expand(en) => {
            drop_ptr(en.narrow);
            drop_ptr(en.wide.load(Ordering::Relaxed, pin).as_raw());
        }
        Node::Compress(xn) => drop_ptr(xn.stale),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct NoHasher;

    impl Hasher for NoHasher {
        fn finish(&self) -> u64 {
            0
        }
        fn write(&mut self, _: &[u8]) {}
    }

    impl BuildHasher for NoHasher {
        type Hasher = NoHasher;
        fn build_hasher(&self) -> NoHasher {
            NoHasher
        }
    }

    #[derive(Clone)]
    pub(crate) struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, _: &[u8]) {
            unimplemented!("IdentityHasher only supports write_u64/write_i32")
        }
        fn write_u64(&mut self, v: u64) {
            self.0 = v;
        }
        fn write_i32(&mut self, v: i32) {
            self.0 = v as u64;
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct IdentityBuildHasher;

    impl BuildHasher for IdentityBuildHasher {
        type Hasher = IdentityHasher;
        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    #[test]
    fn widths_are_powers_of_two() {
        assert_eq!(NARROW_WIDTH, 4);
        assert_eq!(WIDE_WIDTH, 16);
        assert_eq!(LEVEL_BITS, WIDE_WIDTH.trailing_zeros() as usize);
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let raw: Raw<i32, i32, IdentityBuildHasher> = Raw::with_hasher(IdentityBuildHasher);
        assert_eq!(raw.insert(7, 1).unwrap(), None);
        assert_eq!(raw.get(&7), Some(1));
        assert_eq!(raw.remove(&7), Some(1));
        assert_eq!(raw.get(&7), None);
    }

    #[test]
    fn overwrite_returns_previous_value() {
        let raw: Raw<i32, i32, IdentityBuildHasher> = Raw::with_hasher(IdentityBuildHasher);
        raw.insert(7, 1).unwrap();
        assert_eq!(raw.insert(7, 2).unwrap(), Some(1));
        assert_eq!(raw.get(&7), Some(2));
    }

    #[test]
    fn narrow_to_wide_expansion() {
        let raw: Raw<i32, i32, IdentityBuildHasher> = Raw::with_hasher(IdentityBuildHasher);
        for k in [0, 4, 8, 12] {
            raw.insert(k, k).unwrap();
        }
        for k in [0, 4, 8, 12] {
            assert_eq!(raw.get(&k), Some(k));
        }
    }

    #[test]
    fn remove_of_absent_on_empty_map() {
        let raw: Raw<i32, i32, IdentityBuildHasher> = Raw::with_hasher(IdentityBuildHasher);
        assert_eq!(raw.remove(&42), None);
        assert!(raw.is_empty());
    }

    #[test]
    fn remove_then_reinsert() {
        let raw: Raw<i32, i32, IdentityBuildHasher> = Raw::with_hasher(IdentityBuildHasher);
        for k in [0, 4, 1, 15] {
            raw.insert(k, k).unwrap();
        }
        assert_eq!(raw.remove(&15), Some(15));
        assert_eq!(raw.get(&15), None);
        assert_eq!(raw.get(&0), Some(0));
    }

    #[test]
    fn full_hash_collision_returns_distinguished_error() {
        // NoHasher maps every key to the same hash, so the second distinct key is a genuine
        // full-hash collision: create_anode recurses out of levels and must refuse rather than
        // silently dropping either binding.
        let raw: Raw<i32, i32, NoHasher> = Raw::with_hasher(NoHasher);
        raw.insert(1, 1).unwrap();
        match raw.insert(2, 2) {
            Err(InsertError::HashCollision { key, value }) => assert_eq!((key, value), (2, 2)),
            other => panic!("expected HashCollision, got {:?}", other.map(|_| ())),
        }
        assert_eq!(raw.get(&1), Some(1));
    }
}
