//! Persistent HSDir index
//!
//! An AVL tree of relay records stored in a byte-addressed block device,
//! ordered by the per-period HSDir index hash. Each fixed-size slot holds
//! the full relay record plus two independent sets of AVL links, one keyed
//! by the current period's hash and one by the previous period's, so both
//! indices share the same node records.
//!
//! The tree uses explicit parent pointers and balance factors; every node
//! touched during a rebalance is written back to the store. The caller
//! serializes access (one operation holds the device for its duration).

use crate::error::{Result, TorError};
use std::net::Ipv4Addr;

use super::OnionRelay;

/// Byte-addressed storage for fixed-size records.
///
/// Capacity must cover the maximum supported relay count; concurrent
/// access is serialized by the caller.
pub trait BlockStore: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn capacity(&self) -> u64;
}

/// RAM-backed block store for tests and devices without external memory.
pub struct MemoryBlockStore {
    data: Vec<u8>,
}

impl MemoryBlockStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
        }
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(TorError::Storage("block read out of range".into()));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.data.len() {
            return Err(TorError::Storage("block write out of range".into()));
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Index of a slot in the store; `NIL` marks an absent link.
type Slot = u32;
const NIL: Slot = u32::MAX;

/// Record size on the device. The encoded node is 203 bytes; slots are
/// rounded up so records never straddle a page boundary.
pub const SLOT_SIZE: u64 = 256;

/// Which of the two parallel indices an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Current,
    Previous,
}

impl Period {
    fn link_index(self) -> usize {
        match self {
            Period::Current => 0,
            Period::Previous => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct AvlLinks {
    parent: Slot,
    left: Slot,
    right: Slot,
    balance: i8,
}

impl AvlLinks {
    fn detached() -> Self {
        Self {
            parent: NIL,
            left: NIL,
            right: NIL,
            balance: 0,
        }
    }
}

#[derive(Clone)]
struct Node {
    relay: OnionRelay,
    links: [AvlLinks; 2],
}

impl Node {
    fn key(&self, period: Period) -> &[u8; 32] {
        match period {
            Period::Current => &self.relay.id_hash,
            Period::Previous => &self.relay.id_hash_previous,
        }
    }

    fn encode(&self) -> [u8; SLOT_SIZE as usize] {
        let mut buf = [0u8; SLOT_SIZE as usize];
        let r = &self.relay;
        buf[0..20].copy_from_slice(&r.identity);
        buf[20..40].copy_from_slice(&r.digest);
        buf[40..72].copy_from_slice(&r.master_key);
        buf[72..104].copy_from_slice(&r.ntor_onion_key);
        buf[104..108].copy_from_slice(&r.address.octets());
        buf[108..110].copy_from_slice(&r.or_port.to_be_bytes());
        buf[110..112].copy_from_slice(&r.dir_port.to_be_bytes());
        buf[112] = (r.hsdir as u8)
            | (r.dir_cache as u8) << 1
            | (r.suitable as u8) << 2
            | (r.can_guard as u8) << 3
            | (r.can_exit as u8) << 4
            | (r.is_guard as u8) << 5;
        buf[113..145].copy_from_slice(&r.id_hash);
        buf[145..177].copy_from_slice(&r.id_hash_previous);

        let mut pos = 177;
        for links in &self.links {
            buf[pos..pos + 4].copy_from_slice(&links.parent.to_be_bytes());
            buf[pos + 4..pos + 8].copy_from_slice(&links.left.to_be_bytes());
            buf[pos + 8..pos + 12].copy_from_slice(&links.right.to_be_bytes());
            buf[pos + 12] = links.balance as u8;
            pos += 13;
        }
        buf
    }

    fn decode(buf: &[u8; SLOT_SIZE as usize]) -> Self {
        let mut identity = [0u8; 20];
        identity.copy_from_slice(&buf[0..20]);
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&buf[20..40]);
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(&buf[40..72]);
        let mut ntor_onion_key = [0u8; 32];
        ntor_onion_key.copy_from_slice(&buf[72..104]);
        let address = Ipv4Addr::new(buf[104], buf[105], buf[106], buf[107]);
        let flags = buf[112];
        let mut id_hash = [0u8; 32];
        id_hash.copy_from_slice(&buf[113..145]);
        let mut id_hash_previous = [0u8; 32];
        id_hash_previous.copy_from_slice(&buf[145..177]);

        let mut links = [AvlLinks::detached(); 2];
        let mut pos = 177;
        for entry in &mut links {
            entry.parent = Slot::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
            entry.left = Slot::from_be_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
            entry.right = Slot::from_be_bytes(buf[pos + 8..pos + 12].try_into().unwrap());
            entry.balance = buf[pos + 12] as i8;
            pos += 13;
        }

        Node {
            relay: OnionRelay {
                identity,
                digest,
                master_key,
                ntor_onion_key,
                address,
                or_port: u16::from_be_bytes([buf[108], buf[109]]),
                dir_port: u16::from_be_bytes([buf[110], buf[111]]),
                hsdir: flags & 1 != 0,
                dir_cache: flags & 2 != 0,
                suitable: flags & 4 != 0,
                can_guard: flags & 8 != 0,
                can_exit: flags & 16 != 0,
                is_guard: flags & 32 != 0,
                id_hash,
                id_hash_previous,
            },
            links,
        }
    }
}

/// The dual-period HSDir index.
pub struct HsDirIndex<S: BlockStore> {
    store: S,
    count: u32,
    roots: [Slot; 2],
}

impl<S: BlockStore> HsDirIndex<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            count: 0,
            roots: [NIL, NIL],
        }
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Drop both trees. Slots are reused from the bottom.
    pub fn reset(&mut self) {
        self.count = 0;
        self.roots = [NIL, NIL];
    }

    fn read_node(&mut self, slot: Slot) -> Result<Node> {
        let mut buf = [0u8; SLOT_SIZE as usize];
        self.store.read_at(slot as u64 * SLOT_SIZE, &mut buf)?;
        Ok(Node::decode(&buf))
    }

    fn write_node(&mut self, slot: Slot, node: &Node) -> Result<()> {
        self.store.write_at(slot as u64 * SLOT_SIZE, &node.encode())
    }

    fn update_links(&mut self, slot: Slot, period: Period, links: AvlLinks) -> Result<()> {
        let mut node = self.read_node(slot)?;
        node.links[period.link_index()] = links;
        self.write_node(slot, &node)
    }

    fn links_of(&mut self, slot: Slot, period: Period) -> Result<AvlLinks> {
        Ok(self.read_node(slot)?.links[period.link_index()])
    }

    /// Insert a relay into both period indices. Returns the slot used.
    pub fn insert(&mut self, relay: &OnionRelay) -> Result<Slot> {
        let slot = self.count;
        if (slot as u64 + 1) * SLOT_SIZE > self.store.capacity() {
            return Err(TorError::ResourceExhausted("HSDir index full".into()));
        }

        let node = Node {
            relay: relay.clone(),
            links: [AvlLinks::detached(); 2],
        };
        self.write_node(slot, &node)?;
        self.count += 1;

        self.insert_into(slot, Period::Current)?;
        self.insert_into(slot, Period::Previous)?;
        Ok(slot)
    }

    fn insert_into(&mut self, slot: Slot, period: Period) -> Result<()> {
        let p = period.link_index();
        let root = self.roots[p];
        if root == NIL {
            self.roots[p] = slot;
            return Ok(());
        }

        let key = *self.read_node(slot)?.key(period);

        // Descend to the attachment point.
        let mut current = root;
        loop {
            let mut node = self.read_node(current)?;
            let go_left = key < *node.key(period);
            let child = if go_left {
                node.links[p].left
            } else {
                node.links[p].right
            };
            if child == NIL {
                if go_left {
                    node.links[p].left = slot;
                } else {
                    node.links[p].right = slot;
                }
                self.write_node(current, &node)?;

                let mut links = AvlLinks::detached();
                links.parent = current;
                self.update_links(slot, period, links)?;
                break;
            }
            current = child;
        }

        // Retrace towards the root, updating balance factors and rotating
        // at the first node that tips over.
        let mut child = slot;
        let mut parent = self.links_of(child, period)?.parent;
        while parent != NIL {
            let mut parent_node = self.read_node(parent)?;
            let from_left = parent_node.links[p].left == child;
            if from_left {
                parent_node.links[p].balance -= 1;
            } else {
                parent_node.links[p].balance += 1;
            }
            let balance = parent_node.links[p].balance;
            self.write_node(parent, &parent_node)?;

            match balance {
                0 => break,
                -1 | 1 => {
                    child = parent;
                    parent = self.links_of(parent, period)?.parent;
                }
                2 => {
                    let child_balance = self.links_of(child, period)?.balance;
                    if child_balance >= 0 {
                        self.rotate_left(parent, period)?;
                    } else {
                        self.rotate_right(child, period)?;
                        self.rotate_left(parent, period)?;
                    }
                    break;
                }
                _ => {
                    let child_balance = self.links_of(child, period)?.balance;
                    if child_balance <= 0 {
                        self.rotate_right(parent, period)?;
                    } else {
                        self.rotate_left(child, period)?;
                        self.rotate_right(parent, period)?;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Left rotation around `x`. Balance factors follow the general update
    /// rule, which covers both the single (RR) and the inner step of the
    /// double (RL/LR) rotations:
    /// `bf(x)' = bf(x) - 1 - max(bf(y), 0)`,
    /// `bf(y)' = bf(y) - 1 + min(bf(x)', 0)`.
    fn rotate_left(&mut self, x: Slot, period: Period) -> Result<()> {
        let p = period.link_index();
        let mut x_node = self.read_node(x)?;
        let y = x_node.links[p].right;
        let mut y_node = self.read_node(y)?;

        // Move y's left subtree under x.
        let moved = y_node.links[p].left;
        x_node.links[p].right = moved;
        if moved != NIL {
            let mut moved_node = self.read_node(moved)?;
            moved_node.links[p].parent = x;
            self.write_node(moved, &moved_node)?;
        }

        // Hook y where x was.
        let grandparent = x_node.links[p].parent;
        y_node.links[p].parent = grandparent;
        if grandparent == NIL {
            self.roots[p] = y;
        } else {
            let mut gp_node = self.read_node(grandparent)?;
            if gp_node.links[p].left == x {
                gp_node.links[p].left = y;
            } else {
                gp_node.links[p].right = y;
            }
            self.write_node(grandparent, &gp_node)?;
        }

        y_node.links[p].left = x;
        x_node.links[p].parent = y;

        let xb = x_node.links[p].balance;
        let yb = y_node.links[p].balance;
        let new_xb = xb - 1 - yb.max(0);
        x_node.links[p].balance = new_xb;
        y_node.links[p].balance = yb - 1 + new_xb.min(0);

        self.write_node(x, &x_node)?;
        self.write_node(y, &y_node)
    }

    /// Mirror of [`rotate_left`]:
    /// `bf(x)' = bf(x) + 1 - min(bf(y), 0)`,
    /// `bf(y)' = bf(y) + 1 + max(bf(x)', 0)`.
    fn rotate_right(&mut self, x: Slot, period: Period) -> Result<()> {
        let p = period.link_index();
        let mut x_node = self.read_node(x)?;
        let y = x_node.links[p].left;
        let mut y_node = self.read_node(y)?;

        let moved = y_node.links[p].right;
        x_node.links[p].left = moved;
        if moved != NIL {
            let mut moved_node = self.read_node(moved)?;
            moved_node.links[p].parent = x;
            self.write_node(moved, &moved_node)?;
        }

        let grandparent = x_node.links[p].parent;
        y_node.links[p].parent = grandparent;
        if grandparent == NIL {
            self.roots[p] = y;
        } else {
            let mut gp_node = self.read_node(grandparent)?;
            if gp_node.links[p].left == x {
                gp_node.links[p].left = y;
            } else {
                gp_node.links[p].right = y;
            }
            self.write_node(grandparent, &gp_node)?;
        }

        y_node.links[p].right = x;
        x_node.links[p].parent = y;

        let xb = x_node.links[p].balance;
        let yb = y_node.links[p].balance;
        let new_xb = xb + 1 - yb.min(0);
        x_node.links[p].balance = new_xb;
        y_node.links[p].balance = yb + 1 + new_xb.max(0);

        self.write_node(x, &x_node)?;
        self.write_node(y, &y_node)
    }

    fn leftmost_from(&mut self, mut slot: Slot, period: Period) -> Result<Slot> {
        loop {
            let left = self.links_of(slot, period)?.left;
            if left == NIL {
                return Ok(slot);
            }
            slot = left;
        }
    }

    fn successor(&mut self, slot: Slot, period: Period) -> Result<Slot> {
        let links = self.links_of(slot, period)?;
        if links.right != NIL {
            return self.leftmost_from(links.right, period);
        }
        let mut child = slot;
        let mut parent = links.parent;
        while parent != NIL {
            let parent_links = self.links_of(parent, period)?;
            if parent_links.left == child {
                return Ok(parent);
            }
            child = parent;
            parent = parent_links.parent;
        }
        Ok(NIL)
    }

    /// The smallest node whose period hash is >= `target`, or `None` on an
    /// empty tree. Wrapping past the largest hash is the caller's business.
    fn first_at_or_after(&mut self, target: &[u8; 32], period: Period) -> Result<Option<Slot>> {
        let mut best = None;
        let mut current = self.roots[period.link_index()];
        while current != NIL {
            let node = self.read_node(current)?;
            if node.key(period) >= target {
                best = Some(current);
                current = node.links[period.link_index()].left;
            } else {
                current = node.links[period.link_index()].right;
            }
        }
        Ok(best)
    }

    /// The `count` relays responsible for `target`: in-order from the first
    /// node with hash >= target, wrapping to the smallest, skipping
    /// identities in `exclude`.
    pub fn responsible_for(
        &mut self,
        target: &[u8; 32],
        period: Period,
        count: usize,
        exclude: &[[u8; 20]],
    ) -> Result<Vec<OnionRelay>> {
        if self.count == 0 {
            return Err(TorError::NoSuitableRelays("HSDir index is empty".into()));
        }

        let root = self.roots[period.link_index()];
        let start = match self.first_at_or_after(target, period)? {
            Some(slot) => slot,
            None => self.leftmost_from(root, period)?,
        };

        let mut chosen = Vec::with_capacity(count);
        let mut slot = start;
        for _ in 0..self.count {
            let node = self.read_node(slot)?;
            if !exclude.contains(&node.relay.identity) {
                chosen.push(node.relay.clone());
                if chosen.len() == count {
                    break;
                }
            }
            slot = self.successor(slot, period)?;
            if slot == NIL {
                slot = self.leftmost_from(root, period)?;
            }
            if slot == start {
                break;
            }
        }
        Ok(chosen)
    }

    /// In-order walk of one period's hashes (test and audit support).
    pub fn in_order_hashes(&mut self, period: Period) -> Result<Vec<[u8; 32]>> {
        let mut hashes = Vec::with_capacity(self.count as usize);
        let root = self.roots[period.link_index()];
        if root == NIL {
            return Ok(hashes);
        }
        let mut slot = self.leftmost_from(root, period)?;
        while slot != NIL {
            hashes.push(*self.read_node(slot)?.key(period));
            slot = self.successor(slot, period)?;
        }
        Ok(hashes)
    }

    /// Height of one period's tree (test and audit support).
    pub fn height(&mut self, period: Period) -> Result<u32> {
        fn walk<S: BlockStore>(
            index: &mut HsDirIndex<S>,
            slot: Slot,
            period: Period,
        ) -> Result<u32> {
            if slot == NIL {
                return Ok(0);
            }
            let links = index.links_of(slot, period)?;
            let left = walk(index, links.left, period)?;
            let right = walk(index, links.right, period)?;
            Ok(1 + left.max(right))
        }
        let root = self.roots[period.link_index()];
        walk(self, root, period)
    }
}
