//! Hierarchical hashed timer wheel.
//!
//! Up to four levels of rings over one bucket arena. Level 0 resolves one
//! tick; every next level is `wheel_size / level1_div` times coarser. A
//! timer above level 0 is drained with a per-tick work quota so a crowded
//! bucket never stalls the loop, and a timer whose residue (`ticks_left`)
//! is not yet zero is re-inserted instead of fired.
//!
//! With `new(1024, 16, 2)` and a 1 ms tick this covers:
//! level 0: 1 ms - 1 s (res 1 ms), level 1: up to ~67 s (res 64 ms).
//!
//! The intrusive rings are held as u32 prev/next indices into a node arena;
//! bucket heads are sentinel nodes in the same arena. Handles carry a
//! generation so a stale [`TimerId`] is inert.

use std::rc::Rc;

use thiserror::Error;

/// Fired-timer receiver. Implementations capture whatever state they need;
/// the context parameter is supplied by whoever drives the wheel.
pub trait TimerCallback<C> {
    fn on_timer(&self, ctx: &C);
}

/// Handle to a registered timer. Copyable; outdated copies are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    idx: u32,
    gen: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerConfigError {
    #[error("wheel size {0} is not a power of two")]
    SizeNotPow2(u32),
    #[error("level-1 divisor {0} is not a power of two")]
    DivNotPow2(u32),
    #[error("level count {0} outside 1..=4")]
    BadLevels(u8),
}

const MAX_LEVELS: usize = 4;
const NONE: u32 = u32::MAX;

struct Node<C> {
    prev: u32,
    next: u32,
    gen: u32,
    level: u8,
    bucket: u32,
    ticks_left: u32,
    cb: Option<Rc<dyn TimerCallback<C>>>,
}

impl<C> Node<C> {
    fn unlinked(gen: u32) -> Self {
        Node { prev: NONE, next: NONE, gen, level: 0, bucket: 0, ticks_left: 0, cb: None }
    }
}

struct OneWheel {
    sentinels: Vec<u32>,
    counts: Vec<u32>,
    bucket_index: u32,
    ticks: u32,
}

#[derive(Default, Clone, Copy)]
struct LevelEx {
    cnt_state: u32,
    cnt_per_ite: u32,
    cnt_div: u32,
}

/// Multi-level timer wheel, generic over the callback context type.
pub struct TimerWheel<C> {
    nodes: Vec<Node<C>>,
    free_head: u32,
    levels: Vec<OneWheel>,
    wheel_size: u32,
    wheel_mask: u32,
    level1_shift: u32,
    level1_err: u32,
    max_levels: u8,
    active_timers: u64,
    ex: [LevelEx; MAX_LEVELS],
}

impl<C> std::fmt::Debug for TimerWheel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel").finish_non_exhaustive()
    }
}

fn log2_shift(n: u32) -> Option<u32> {
    n.is_power_of_two().then(|| n.trailing_zeros())
}

impl<C> TimerWheel<C> {
    pub fn new(wheel_size: u32, level1_div: u32, levels: u8) -> Result<Self, TimerConfigError> {
        let wheel_shift =
            log2_shift(wheel_size).ok_or(TimerConfigError::SizeNotPow2(wheel_size))?;
        let div_shift = log2_shift(level1_div).ok_or(TimerConfigError::DivNotPow2(level1_div))?;
        if levels == 0 || levels as usize > MAX_LEVELS {
            return Err(TimerConfigError::BadLevels(levels));
        }

        let level1_shift = wheel_shift - div_shift;
        let mut o = TimerWheel {
            nodes: Vec::new(),
            free_head: NONE,
            levels: Vec::new(),
            wheel_size,
            wheel_mask: wheel_size - 1,
            level1_shift,
            level1_err: (1u32 << level1_shift) - 1,
            max_levels: levels,
            active_timers: 0,
            ex: [LevelEx::default(); MAX_LEVELS],
        };

        for _ in 0..levels {
            let mut sentinels = Vec::with_capacity(wheel_size as usize);
            for _ in 0..wheel_size {
                let idx = o.nodes.len() as u32;
                let mut n = Node::unlinked(0);
                n.prev = idx;
                n.next = idx;
                o.nodes.push(n);
                sentinels.push(idx);
            }
            o.levels.push(OneWheel {
                sentinels,
                counts: vec![0; wheel_size as usize],
                bucket_index: 0,
                ticks: 0,
            });
        }

        let mut shift = level1_shift;
        for l in 1..MAX_LEVELS {
            o.ex[l].cnt_div = 1u32 << shift;
            shift += level1_shift;
        }

        Ok(o)
    }

    /// Allocate a timer slot bound to `cb`. The timer starts idle.
    pub fn register(&mut self, cb: Rc<dyn TimerCallback<C>>) -> TimerId {
        let idx = if self.free_head != NONE {
            let idx = self.free_head;
            self.free_head = self.nodes[idx as usize].next;
            self.nodes[idx as usize].next = NONE;
            idx
        } else {
            let idx = self.nodes.len() as u32;
            self.nodes.push(Node::unlinked(0));
            idx
        };
        let node = &mut self.nodes[idx as usize];
        node.cb = Some(cb);
        TimerId { idx, gen: node.gen }
    }

    /// Stop (if needed) and release a timer slot. Stale ids are a no-op.
    pub fn unregister(&mut self, id: TimerId) {
        if !self.id_valid(id) {
            return;
        }
        if self.linked(id.idx) {
            self.detach(id.idx);
            self.active_timers -= 1;
        }
        let node = &mut self.nodes[id.idx as usize];
        node.cb = None;
        node.gen = node.gen.wrapping_add(1);
        node.next = self.free_head;
        node.prev = NONE;
        self.free_head = id.idx;
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.id_valid(id) && self.linked(id.idx)
    }

    /// Arm a timer `ticks` ticks from now. Starting a running timer is a
    /// programmer error and aborts.
    pub fn start(&mut self, id: TimerId, ticks: u32) {
        assert!(self.id_valid(id), "start on an unregistered timer");
        if self.linked(id.idx) {
            panic!("can't start a running timer");
        }
        self.active_timers += 1;
        if ticks < self.wheel_size {
            self.nodes[id.idx as usize].ticks_left = 0;
            self.insert(0, id.idx, ticks);
        } else {
            self.climb(id.idx, ticks);
        }
    }

    /// Disarm a timer. Idempotent; stale ids are a no-op.
    pub fn stop(&mut self, id: TimerId) {
        if self.id_valid(id) && self.linked(id.idx) {
            self.detach(id.idx);
            self.active_timers -= 1;
        }
    }

    pub fn active_timers(&self) -> u64 {
        self.active_timers
    }

    /// Advance one tick. Level 0 drains fully; levels above drain at most
    /// `max(ceil(bucket_count / ratio^L), min_events)` entries per call.
    /// Fired callbacks are pushed onto `expired` for the caller to invoke
    /// once the wheel borrow is gone, so callbacks may re-arm freely.
    pub fn on_tick(&mut self, min_events: u32, expired: &mut Vec<Rc<dyn TimerCallback<C>>>) {
        self.tick_level0(expired);
        for level in 1..self.max_levels {
            self.tick_level(level as usize, min_events, expired);
        }
    }

    fn id_valid(&self, id: TimerId) -> bool {
        (id.idx as usize) < self.nodes.len() && self.nodes[id.idx as usize].gen == id.gen
    }

    // only meaningful for a generation-checked id: free-list nodes are
    // screened out by `id_valid` before this is consulted
    fn linked(&self, idx: u32) -> bool {
        self.nodes[idx as usize].next != NONE
    }

    fn insert(&mut self, level: usize, idx: u32, nticks: u32) {
        let wheel = &self.levels[level];
        let cursor = (wheel.bucket_index + nticks) & self.wheel_mask;
        let sentinel = wheel.sentinels[cursor as usize];

        let last = self.nodes[sentinel as usize].prev;
        {
            let node = &mut self.nodes[idx as usize];
            node.next = sentinel;
            node.prev = last;
            node.level = level as u8;
            node.bucket = cursor;
        }
        self.nodes[last as usize].next = idx;
        self.nodes[sentinel as usize].prev = idx;
        self.levels[level].counts[cursor as usize] += 1;
    }

    fn detach(&mut self, idx: u32) {
        let (prev, next, level, bucket) = {
            let n = &self.nodes[idx as usize];
            (n.prev, n.next, n.level as usize, n.bucket as usize)
        };
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;
        let n = &mut self.nodes[idx as usize];
        n.prev = NONE;
        n.next = NONE;
        let count = &mut self.levels[level].counts[bucket];
        assert!(*count > 0, "bucket count underflow");
        *count -= 1;
    }

    /// Place a long timer on the first level whose span covers it, rounding
    /// up by the per-level error mask. Overflow beyond the top level parks
    /// the residue in `ticks_left` for re-insertion on drain.
    fn climb(&mut self, idx: u32, ticks: u32) {
        let mut level = 1usize;
        let mut level_err = self.level1_err + 1;
        let mut level_shift = self.level1_shift;

        while level < self.max_levels as usize {
            let nticks = (ticks + (level_err - 1)) >> level_shift;
            if nticks < self.wheel_size {
                let nticks = nticks.max(2);
                self.nodes[idx as usize].ticks_left = 0;
                self.insert(level, idx, nticks - 1);
                return;
            }
            level += 1;
            level_err <<= self.level1_shift;
            level_shift += self.level1_shift;
        }
        level_shift -= self.level1_shift;

        let top = self.max_levels as usize - 1;
        self.nodes[idx as usize].ticks_left = ticks - ((self.wheel_size - 1) << level_shift);
        self.insert(top, idx, self.wheel_size - 1);
    }

    fn pop_event(&mut self, level: usize) -> Option<u32> {
        let wheel = &self.levels[level];
        let sentinel = wheel.sentinels[wheel.bucket_index as usize];
        let first = self.nodes[sentinel as usize].next;
        if first == sentinel {
            return None;
        }
        self.detach(first);
        Some(first)
    }

    fn next_tick(&mut self, level: usize) {
        let wheel = &mut self.levels[level];
        wheel.ticks = wheel.ticks.wrapping_add(1);
        wheel.bucket_index = (wheel.bucket_index + 1) & self.wheel_mask;
    }

    fn tick_level0(&mut self, expired: &mut Vec<Rc<dyn TimerCallback<C>>>) {
        while let Some(idx) = self.pop_event(0) {
            self.active_timers -= 1;
            let cb = self.nodes[idx as usize].cb.clone().expect("linked timer without callback");
            expired.push(cb);
        }
        self.next_tick(0);
    }

    fn tick_level_inc(&mut self, level: usize) {
        self.ex[level].cnt_state += 1;
        if self.ex[level].cnt_state == self.ex[level].cnt_div {
            self.next_tick(level);
            self.ex[level].cnt_state = 0;
        }
    }

    fn tick_level(
        &mut self,
        level: usize,
        min_events: u32,
        expired: &mut Vec<Rc<dyn TimerCallback<C>>>,
    ) {
        let wheel = &self.levels[level];
        let left = wheel.counts[wheel.bucket_index as usize];
        if left == 0 {
            self.tick_level_inc(level);
            return;
        }

        if self.ex[level].cnt_state == 0 {
            let div = self.ex[level].cnt_div;
            let steps = left.div_ceil(div);
            self.ex[level].cnt_per_ite = steps.max(min_events);
        }

        let mut cnt = 0u32;
        while let Some(idx) = self.pop_event(level) {
            let ticks_left = self.nodes[idx as usize].ticks_left;
            if ticks_left == 0 {
                self.active_timers -= 1;
                let cb =
                    self.nodes[idx as usize].cb.clone().expect("linked timer without callback");
                expired.push(cb);
            } else {
                // carry down: re-run placement with the residue
                self.climb_or_level0(idx, ticks_left);
            }
            cnt += 1;
            if cnt == self.ex[level].cnt_per_ite {
                break;
            }
        }
        self.tick_level_inc(level);
    }

    fn climb_or_level0(&mut self, idx: u32, ticks: u32) {
        if ticks < self.wheel_size {
            self.nodes[idx as usize].ticks_left = 0;
            self.insert(0, idx, ticks);
        } else {
            self.climb(idx, ticks);
        }
    }

    #[cfg(test)]
    fn bucket_count_sum(&self) -> u64 {
        self.levels.iter().map(|w| w.counts.iter().map(|&c| c as u64).sum::<u64>()).sum()
    }

    #[cfg(test)]
    fn timer_level(&self, id: TimerId) -> Option<u8> {
        (self.is_running(id)).then(|| self.nodes[id.idx as usize].level)
    }
}
