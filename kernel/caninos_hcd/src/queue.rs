//! Bookkeeping records of control transfers and the three lists they move
//! through on their way back to the host stack.
//!
//! Records live in a fixed arena of [`QUEUE_POOL_CNT`] slots addressed by
//! generation-checked handles. When the arena is full a record spills to
//! the heap; a spilled record is dropped on release and never migrates into
//! the arena.

use alloc::{boxed::Box, collections::{BTreeMap, VecDeque}, vec::Vec};
use usb_hcd::{UrbError, UrbRef};
use crate::{config::QUEUE_POOL_CNT, ep::EndpointId, ep0::ControlTransfer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueHandle {
    Pooled { index: u16, generation: u32 },
    Spilled(u32),
}

/// The list a record currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueList {
    /// On none of the lists, e.g. while it owns EP0
    Detached,
    /// Accepted, waiting for EP0
    Enqueue,
    /// Cancelled or aborted, waiting to be given back
    Dequeue,
    /// Ended on the bus, waiting to be given back
    Finished,
}

#[derive(Debug)]
pub struct Queue {
    pub urb: UrbRef,
    pub ep: EndpointId,
    pub ctrl: ControlTransfer,
    /// The transfer reached the bus
    pub xfer_started: bool,
    pub status: Option<UrbError>,
    /// Millisecond deadline, armed when the transfer reaches the bus
    pub deadline: Option<u64>,
    list: QueueList,
}

impl Queue {
    pub fn new(urb: UrbRef, ep: EndpointId, ctrl: ControlTransfer) -> Self {
        Queue { urb, ep, ctrl, xfer_started: false, status: None, deadline: None, list: QueueList::Detached }
    }

    pub fn list(&self) -> QueueList {
        self.list
    }
}

#[derive(Debug)]
struct PoolSlot {
    generation: u32,
    queue: Option<Queue>,
}

#[derive(Debug)]
pub struct QueuePool {
    slots: Vec<PoolSlot>,
    spilled: BTreeMap<u32, Box<Queue>>,
    next_spill: u32,
    enqueue: VecDeque<QueueHandle>,
    dequeue: VecDeque<QueueHandle>,
    finished: VecDeque<QueueHandle>,
}

impl Default for QueuePool {
    fn default() -> Self {
        Self::new()
    }
}

impl QueuePool {
    pub fn new() -> Self {
        let slots = (0..QUEUE_POOL_CNT).map(|_| PoolSlot { generation: 0, queue: None }).collect();
        QueuePool {
            slots,
            spilled: BTreeMap::new(),
            next_spill: 0,
            enqueue: VecDeque::new(),
            dequeue: VecDeque::new(),
            finished: VecDeque::new(),
        }
    }

    pub fn alloc(&mut self, queue: Queue) -> QueueHandle {
        if let Some(index) = self.slots.iter().position(|s| s.queue.is_none()) {
            let slot = &mut self.slots[index];
            slot.generation = slot.generation.wrapping_add(1);
            slot.queue = Some(queue);
            return QueueHandle::Pooled { index: index as u16, generation: slot.generation };
        }
        let key = self.next_spill;
        self.next_spill = self.next_spill.wrapping_add(1);
        log::debug!("[CANINOS-HCD] queue pool exhausted, spilling record {}", key);
        self.spilled.insert(key, Box::new(queue));
        QueueHandle::Spilled(key)
    }

    pub fn get(&self, handle: QueueHandle) -> Option<&Queue> {
        match handle {
            QueueHandle::Pooled { index, generation } => self.slots
                .get(index as usize)
                .filter(|s| s.generation == generation)
                .and_then(|s| s.queue.as_ref()),
            QueueHandle::Spilled(key) => self.spilled.get(&key).map(|q| &**q),
        }
    }

    pub fn get_mut(&mut self, handle: QueueHandle) -> Option<&mut Queue> {
        match handle {
            QueueHandle::Pooled { index, generation } => self.slots
                .get_mut(index as usize)
                .filter(|s| s.generation == generation)
                .and_then(|s| s.queue.as_mut()),
            QueueHandle::Spilled(key) => self.spilled.get_mut(&key).map(|q| &mut **q),
        }
    }

    fn list_mut(&mut self, list: QueueList) -> Option<&mut VecDeque<QueueHandle>> {
        match list {
            QueueList::Detached => None,
            QueueList::Enqueue => Some(&mut self.enqueue),
            QueueList::Dequeue => Some(&mut self.dequeue),
            QueueList::Finished => Some(&mut self.finished),
        }
    }

    /// Takes `handle` off whatever list holds it.
    pub fn remove_from_list(&mut self, handle: QueueHandle) {
        let current = match self.get(handle) {
            Some(q) => q.list,
            None => return,
        };
        if let Some(list) = self.list_mut(current) {
            list.retain(|&h| h != handle);
        }
        if let Some(q) = self.get_mut(handle) {
            q.list = QueueList::Detached;
        }
    }

    /// Appends `handle` to `list`, moving it off any other list first.
    pub fn push(&mut self, handle: QueueHandle, list: QueueList) {
        if self.get(handle).is_none() {
            return;
        }
        self.remove_from_list(handle);
        if let Some(l) = self.list_mut(list) {
            l.push_back(handle);
        }
        if let Some(q) = self.get_mut(handle) {
            q.list = list;
        }
    }

    pub fn pop_front(&mut self, list: QueueList) -> Option<QueueHandle> {
        let handle = self.list_mut(list)?.pop_front()?;
        if let Some(q) = self.get_mut(handle) {
            q.list = QueueList::Detached;
        }
        Some(handle)
    }

    pub fn len(&self, list: QueueList) -> usize {
        match list {
            QueueList::Detached => 0,
            QueueList::Enqueue => self.enqueue.len(),
            QueueList::Dequeue => self.dequeue.len(),
            QueueList::Finished => self.finished.len(),
        }
    }

    pub fn is_empty(&self, list: QueueList) -> bool {
        self.len(list) == 0
    }

    /// Handles on `list`, oldest first.
    pub fn handles(&self, list: QueueList) -> Vec<QueueHandle> {
        match list {
            QueueList::Detached => Vec::new(),
            QueueList::Enqueue => self.enqueue.iter().copied().collect(),
            QueueList::Dequeue => self.dequeue.iter().copied().collect(),
            QueueList::Finished => self.finished.iter().copied().collect(),
        }
    }

    /// Frees the record behind `handle`; later lookups with it fail.
    pub fn release(&mut self, handle: QueueHandle) -> Option<Queue> {
        self.remove_from_list(handle);
        match handle {
            QueueHandle::Pooled { index, generation } => {
                let slot = self.slots.get_mut(index as usize).filter(|s| s.generation == generation)?;
                slot.queue.take()
            }
            QueueHandle::Spilled(key) => self.spilled.remove(&key).map(|q| *q),
        }
    }

    pub fn find_by_urb(&self, urb_id: u64) -> Option<QueueHandle> {
        let pooled = self.slots.iter().enumerate().find_map(|(i, s)| match &s.queue {
            Some(q) if q.urb.id() == urb_id => Some(QueueHandle::Pooled { index: i as u16, generation: s.generation }),
            _ => None,
        });
        pooled.or_else(|| self.spilled.iter().find(|(_, q)| q.urb.id() == urb_id).map(|(&k, _)| QueueHandle::Spilled(k)))
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.queue.is_some()).count() + self.spilled.len()
    }

    pub fn spilled(&self) -> usize {
        self.spilled.len()
    }

    /// Handles of every live record, on a list or not.
    pub fn all_handles(&self) -> Vec<QueueHandle> {
        let pooled = self.slots.iter().enumerate().filter(|(_, s)| s.queue.is_some())
            .map(|(i, s)| QueueHandle::Pooled { index: i as u16, generation: s.generation });
        pooled.chain(self.spilled.keys().map(|&k| QueueHandle::Spilled(k))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use rand_chacha::ChaCha8Rng;
    use rand_chacha::rand_core::{RngCore, SeedableRng};
    use usb_hcd::{DeviceInfo, HostEndpoint, RawRequest, Speed, Urb};

    fn queue() -> Queue {
        let ep = HostEndpoint::control(64);
        let dev = DeviceInfo { address: 0, speed: Speed::High, port: 1, tt: None };
        let setup = RawRequest::get_descriptor(1, 0, 18);
        let urb = Urb::control(ep, dev, setup, Vec::new()).into_ref();
        Queue::new(urb, EndpointId::Control(0), ControlTransfer::new(setup, 18, 64, false))
    }

    #[test]
    fn stale_handles_miss() {
        let mut pool = QueuePool::new();
        let a = pool.alloc(queue());
        assert!(pool.release(a).is_some());
        let b = pool.alloc(queue());
        assert_ne!(a, b);
        assert!(pool.get(a).is_none());
        assert!(pool.release(a).is_none());
        assert!(pool.get(b).is_some());
    }

    #[test]
    fn spills_to_the_heap_and_back() {
        let mut pool = QueuePool::new();
        let handles: Vec<_> = (0..QUEUE_POOL_CNT + 3).map(|_| pool.alloc(queue())).collect();
        assert_eq!(pool.spilled(), 3);
        assert!(matches!(handles[QUEUE_POOL_CNT], QueueHandle::Spilled(_)));

        // a pooled slot frees up, but spilled records stay where they are
        pool.release(handles[0]);
        let urb_id = pool.get(handles[QUEUE_POOL_CNT + 1]).unwrap().urb.id();
        assert_eq!(pool.find_by_urb(urb_id), Some(handles[QUEUE_POOL_CNT + 1]));
        assert!(pool.release(handles[QUEUE_POOL_CNT + 1]).is_some());
        assert_eq!(pool.spilled(), 2);
        assert!(matches!(pool.alloc(queue()), QueueHandle::Pooled { index: 0, .. }));
    }

    #[test]
    fn records_sit_on_one_list_at_a_time() {
        let lists = [QueueList::Detached, QueueList::Enqueue, QueueList::Dequeue, QueueList::Finished];
        let mut rng = ChaCha8Rng::seed_from_u64(0x7175_6575);
        let mut pool = QueuePool::new();
        let mut live = Vec::new();

        for _ in 0..3000 {
            match rng.next_u32() % 4 {
                0 => live.push(pool.alloc(queue())),
                1 if !live.is_empty() => {
                    let h = live[rng.next_u32() as usize % live.len()];
                    pool.push(h, lists[rng.next_u32() as usize % lists.len()]);
                }
                2 if !live.is_empty() => {
                    let h = live.swap_remove(rng.next_u32() as usize % live.len());
                    assert!(pool.release(h).is_some());
                }
                _ => {
                    let list = lists[1 + rng.next_u32() as usize % 3];
                    if let Some(h) = pool.pop_front(list) {
                        assert_eq!(pool.get(h).unwrap().list(), QueueList::Detached);
                    }
                }
            }

            for &h in &live {
                let on: usize = lists[1..].iter().map(|&l| pool.handles(l).iter().filter(|&&x| x == h).count()).sum();
                let expected = if pool.get(h).unwrap().list() == QueueList::Detached { 0 } else { 1 };
                assert_eq!(on, expected);
            }
            let listed: usize = lists[1..].iter().map(|&l| pool.len(l)).sum();
            assert!(listed <= live.len());
        }
    }
}
