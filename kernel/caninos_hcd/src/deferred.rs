//! The deferred pass: gives finished and cancelled URBs back to the host
//! stack and starts queued control transfers.
//!
//! Only one context runs the pass at a time. A context that finds it
//! taken asks the platform to schedule it again; after a few misses in a
//! row it instead flags the running pass to go around once more.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use usb_hcd::UrbError;
use crate::{
    config::TRYLOCK_RETRY_MAX,
    hcd::{CaninosHcd, ControllerState},
    queue::QueueList,
    regs::RegisterIo,
    urb::Giveback,
};

#[derive(Debug)]
pub(crate) struct DeferredWork {
    busy: AtomicBool,
    retry: AtomicBool,
    contention: AtomicU32,
}

impl DeferredWork {
    pub const fn new() -> Self {
        DeferredWork {
            busy: AtomicBool::new(false),
            retry: AtomicBool::new(false),
            contention: AtomicU32::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        let acquired = self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok();
        if acquired {
            self.contention.store(0, Ordering::Release);
        }
        acquired
    }

    /// Records a failed [`try_acquire`](Self::try_acquire). Returns the
    /// number of misses in a row once it is high enough that the running
    /// pass was asked to go around again; `None` means reschedule instead.
    fn contend(&self) -> Option<u32> {
        let misses = self.contention.fetch_add(1, Ordering::AcqRel) + 1;
        if misses >= TRYLOCK_RETRY_MAX {
            self.retry.store(true, Ordering::Release);
            Some(misses)
        } else {
            None
        }
    }

    /// Consumes a pending retry request.
    fn take_retry(&self) -> bool {
        self.retry.swap(false, Ordering::AcqRel)
    }

    /// Lets go of the pass. Returns whether a retry was requested after the
    /// holder last looked, in which case the caller has to try again.
    fn release(&self) -> bool {
        self.busy.store(false, Ordering::Release);
        self.take_retry()
    }
}

/// Takes the next URB due for give-back, oldest list first.
fn next_giveback(state: &mut ControllerState) -> Option<Giveback> {
    for list in [QueueList::Dequeue, QueueList::Finished] {
        if let Some(handle) = state.queues.pop_front(list) {
            let q = state.queues.release(handle)?;
            if let Some(stats) = state.endpoints.stats_mut(q.ep) {
                stats.completed += 1;
            }
            return Some(q.into());
        }
        if list == QueueList::Dequeue {
            if let Some(td) = state.orphaned_tds.pop_front() {
                return Some(td.into());
            }
            for ep in state.endpoints.endpoints_mut() {
                if let Some(td) = ep.dering_td_list.pop_front() {
                    ep.stats.completed += 1;
                    return Some(td.into());
                }
            }
        }
    }
    None
}

impl<R: RegisterIo> CaninosHcd<R> {
    /// Entry point of the deferred context.
    pub fn run_deferred(&self) {
        let work = &self.deferred;
        loop {
            if !work.try_acquire() {
                match work.contend() {
                    Some(misses) => log::warn!(
                        "[CANINOS-HCD] controller {}: deferred pass contended {} times", self.id(), misses,
                    ),
                    None => self.platform.schedule_deferred(),
                }
                return;
            }
            loop {
                self.platform.disable_irq();
                self.deferred_pass();
                self.platform.enable_irq();
                if !work.take_retry() {
                    break;
                }
            }
            if !work.release() {
                return;
            }
        }
    }

    fn deferred_pass(&self) {
        loop {
            // one give-back at a time, the host may resubmit from `complete`
            loop {
                let item = next_giveback(&mut self.state.lock());
                match item {
                    Some(item) => self.giveback(item),
                    None => break,
                }
            }

            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.has_givebacks() {
                continue;
            }
            self.check_ep0_progress(state);
            if state.has_givebacks() {
                continue;
            }
            self.start_control(state);
            let again = state.has_givebacks();
            // a busy EP0 reports back through its interrupts; only its
            // deadline and the block counter need a timed look
            let watch_ep0 = state.active_ep0.is_some();
            let pending = !watch_ep0 && !state.queues.is_empty(QueueList::Enqueue);
            drop(guard);

            if again {
                continue;
            }
            if pending {
                self.platform.schedule_deferred();
            } else if watch_ep0 {
                self.platform.schedule_deferred_in(self.config.ep0_block_tick_ms);
            }
            return;
        }
    }

    /// Fails an active control transfer that has held EP0 too long while
    /// other control work waits, or that ran past its deadline. Passes less
    /// than a tick apart count as one.
    fn check_ep0_progress(&self, state: &mut ControllerState) {
        let handle = match state.active_ep0 {
            Some(handle) => handle,
            None => {
                state.ep0_block_count = 0;
                return;
            }
        };
        let now = self.platform.now_ms();
        if !state.queues.is_empty(QueueList::Enqueue)
            && now >= state.ep0_block_mark.saturating_add(self.config.ep0_block_tick_ms)
        {
            state.ep0_block_count += 1;
            state.ep0_block_mark = now;
        }
        let expired = state.queues.get(handle)
            .and_then(|q| q.deadline)
            .map_or(false, |deadline| now >= deadline);
        let blocked = state.ep0_block_count >= self.config.ep0_block_period;
        if blocked || expired {
            log::warn!(
                "[CANINOS-HCD] controller {}: control transfer stuck on EP0 ({} passes blocked, deadline {})",
                self.id(),
                state.ep0_block_count,
                if expired { "expired" } else { "pending" },
            );
            state.ep0_block_count = 0;
            self.fail_active_control(state, UrbError::HardwareTimeout);
        }
    }
}
