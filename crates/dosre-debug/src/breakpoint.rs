use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakPointType {
    /// Physical CS:IP reached at an instruction boundary.
    Execution,
    /// Cycle counter strictly exceeded the trigger value.
    Cycles,
    MemoryRead,
    MemoryWrite,
    /// Either a read or a write of the trigger address.
    MemoryAccess,
    /// The run loop exited.
    MachineStop,
}

/// Invoked synchronously on the execution thread when a breakpoint fires.
pub type BreakPointCallback = Arc<dyn Fn(&BreakPoint) + Send + Sync>;

static NEXT_BREAKPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// A breakpoint is identified by the id it is given at construction; clones
/// refer to the same breakpoint, so a clone can be used to remove it again.
#[derive(Clone)]
pub struct BreakPoint {
    id: u64,
    kind: BreakPointType,
    trigger: u64,
    remove_on_trigger: bool,
    callback: BreakPointCallback,
}

impl BreakPoint {
    pub fn new(
        kind: BreakPointType,
        trigger: u64,
        remove_on_trigger: bool,
        callback: impl Fn(&BreakPoint) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: NEXT_BREAKPOINT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            trigger,
            remove_on_trigger,
            callback: Arc::new(callback),
        }
    }

    pub fn execution(
        physical_address: u32,
        remove_on_trigger: bool,
        callback: impl Fn(&BreakPoint) + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            BreakPointType::Execution,
            physical_address as u64,
            remove_on_trigger,
            callback,
        )
    }

    pub fn cycles(
        threshold: u64,
        remove_on_trigger: bool,
        callback: impl Fn(&BreakPoint) + Send + Sync + 'static,
    ) -> Self {
        Self::new(BreakPointType::Cycles, threshold, remove_on_trigger, callback)
    }

    pub fn memory(
        kind: BreakPointType,
        physical_address: u32,
        remove_on_trigger: bool,
        callback: impl Fn(&BreakPoint) + Send + Sync + 'static,
    ) -> Self {
        Self::new(kind, physical_address as u64, remove_on_trigger, callback)
    }

    pub fn machine_stop(callback: impl Fn(&BreakPoint) + Send + Sync + 'static) -> Self {
        Self::new(BreakPointType::MachineStop, 0, true, callback)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BreakPointType {
        self.kind
    }

    pub fn trigger(&self) -> u64 {
        self.trigger
    }

    pub fn is_remove_on_trigger(&self) -> bool {
        self.remove_on_trigger
    }

    fn fire(&self) {
        debug!(id = self.id, kind = ?self.kind, trigger = self.trigger, "breakpoint reached");
        (self.callback)(self);
    }
}

impl PartialEq for BreakPoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BreakPoint {}

impl fmt::Debug for BreakPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakPoint")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("trigger", &format_args!("{:#x}", self.trigger))
            .field("remove_on_trigger", &self.remove_on_trigger)
            .finish_non_exhaustive()
    }
}

/// Serializable description of an armed breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakPointSummary {
    pub id: u64,
    pub kind: BreakPointType,
    pub trigger: u64,
    pub remove_on_trigger: bool,
}

impl From<&BreakPoint> for BreakPointSummary {
    fn from(bp: &BreakPoint) -> Self {
        Self {
            id: bp.id,
            kind: bp.kind,
            trigger: bp.trigger,
            remove_on_trigger: bp.remove_on_trigger,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Breakpoints of one kind, keyed by trigger value.
///
/// Callbacks are invoked after the internal lock is released, so a callback may
/// toggle breakpoints (including itself) without deadlocking.
#[derive(Default)]
pub struct BreakPointHolder {
    breakpoints: Mutex<BTreeMap<u64, Vec<BreakPoint>>>,
    len: AtomicUsize,
}

impl BreakPointHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock-free emptiness test for the per-instruction hot path.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Arms (`on == true`) or disarms a breakpoint. Arming twice is a no-op.
    pub fn toggle(&self, breakpoint: BreakPoint, on: bool) {
        let mut map = lock(&self.breakpoints);
        if on {
            let slot = map.entry(breakpoint.trigger).or_default();
            if !slot.contains(&breakpoint) {
                slot.push(breakpoint);
                self.len.fetch_add(1, Ordering::AcqRel);
            }
            return;
        }

        let Some(slot) = map.get_mut(&breakpoint.trigger) else {
            return;
        };
        let before = slot.len();
        slot.retain(|bp| bp != &breakpoint);
        let removed = before - slot.len();
        if slot.is_empty() {
            map.remove(&breakpoint.trigger);
        }
        self.len.fetch_sub(removed, Ordering::AcqRel);
    }

    /// Fires every breakpoint whose trigger equals `trigger`. Returns how many fired.
    pub fn trigger_matching(&self, trigger: u64) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.fire_range(trigger..=trigger)
    }

    /// Fires every breakpoint whose trigger is strictly below `bound`.
    pub fn trigger_below(&self, bound: u64) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.fire_range(..bound)
    }

    pub fn trigger_all(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.fire_range(..)
    }

    pub fn clear(&self) {
        let mut map = lock(&self.breakpoints);
        map.clear();
        self.len.store(0, Ordering::Release);
    }

    pub fn breakpoints(&self) -> Vec<BreakPoint> {
        lock(&self.breakpoints).values().flatten().cloned().collect()
    }

    fn fire_range(&self, range: impl std::ops::RangeBounds<u64>) -> usize {
        let fired: Vec<BreakPoint> = {
            let mut map = lock(&self.breakpoints);
            let mut fired = Vec::new();
            let mut emptied = Vec::new();
            let mut removed = 0;
            for (trigger, slot) in map.range_mut(range) {
                fired.extend(slot.iter().cloned());
                let before = slot.len();
                slot.retain(|bp| !bp.remove_on_trigger);
                removed += before - slot.len();
                if slot.is_empty() {
                    emptied.push(*trigger);
                }
            }
            for trigger in emptied {
                map.remove(&trigger);
            }
            self.len.fetch_sub(removed, Ordering::AcqRel);
            fired
        };

        for bp in &fired {
            bp.fire();
        }
        fired.len()
    }
}

impl fmt::Debug for BreakPointHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.breakpoints()).finish()
    }
}

/// Read/write breakpoints consulted by the memory implementation on every access.
#[derive(Debug, Default)]
pub struct MemoryBreakpoints {
    read: BreakPointHolder,
    write: BreakPointHolder,
    access: BreakPointHolder,
}

impl MemoryBreakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when `breakpoint` is not a memory breakpoint.
    pub fn toggle(&self, breakpoint: BreakPoint, on: bool) -> bool {
        match breakpoint.kind {
            BreakPointType::MemoryRead => self.read.toggle(breakpoint, on),
            BreakPointType::MemoryWrite => self.write.toggle(breakpoint, on),
            BreakPointType::MemoryAccess => self.access.toggle(breakpoint, on),
            _ => return false,
        }
        true
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.access.is_empty()
    }

    #[inline]
    pub fn monitor_read(&self, physical_address: u32) {
        self.read.trigger_matching(physical_address as u64);
        self.access.trigger_matching(physical_address as u64);
    }

    #[inline]
    pub fn monitor_write(&self, physical_address: u32) {
        self.write.trigger_matching(physical_address as u64);
        self.access.trigger_matching(physical_address as u64);
    }

    fn clear(&self) {
        self.read.clear();
        self.write.clear();
        self.access.clear();
    }
}

/// All breakpoints of a machine. Safe to toggle from any thread at any time.
#[derive(Debug)]
pub struct MachineBreakpoints {
    execution: BreakPointHolder,
    cycles: BreakPointHolder,
    machine_stop: BreakPointHolder,
    memory: Arc<MemoryBreakpoints>,
}

impl Default for MachineBreakpoints {
    fn default() -> Self {
        Self::new(Arc::new(MemoryBreakpoints::new()))
    }
}

impl MachineBreakpoints {
    /// `memory` must be the same set the memory implementation monitors.
    pub fn new(memory: Arc<MemoryBreakpoints>) -> Self {
        Self {
            execution: BreakPointHolder::new(),
            cycles: BreakPointHolder::new(),
            machine_stop: BreakPointHolder::new(),
            memory,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryBreakpoints> {
        &self.memory
    }

    pub fn toggle_breakpoint(&self, breakpoint: BreakPoint, on: bool) {
        debug!(?breakpoint, on, "toggling breakpoint");
        match breakpoint.kind {
            BreakPointType::Execution => self.execution.toggle(breakpoint, on),
            BreakPointType::Cycles => self.cycles.toggle(breakpoint, on),
            BreakPointType::MachineStop => self.machine_stop.toggle(breakpoint, on),
            BreakPointType::MemoryRead
            | BreakPointType::MemoryWrite
            | BreakPointType::MemoryAccess => {
                self.memory.toggle(breakpoint, on);
            }
        }
    }

    /// Called once per instruction boundary, before the instruction executes.
    #[inline]
    pub fn check_breakpoints(&self, cycles: u64, ip_physical: u32) {
        if !self.execution.is_empty() {
            self.execution.trigger_matching(ip_physical as u64);
        }
        if !self.cycles.is_empty() {
            self.cycles.trigger_below(cycles);
        }
    }

    pub fn on_machine_stop(&self) {
        self.machine_stop.trigger_all();
    }

    pub fn clear(&self) {
        self.execution.clear();
        self.cycles.clear();
        self.machine_stop.clear();
        self.memory.clear();
    }

    pub fn summaries(&self) -> Vec<BreakPointSummary> {
        let mut out: Vec<BreakPointSummary> = [
            &self.execution,
            &self.cycles,
            &self.machine_stop,
            &self.memory.read,
            &self.memory.write,
            &self.memory.access,
        ]
        .iter()
        .flat_map(|holder| holder.breakpoints())
        .map(|bp| BreakPointSummary::from(&bp))
        .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn export_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.summaries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    fn counter() -> (Arc<AtomicU32>, impl Fn(&BreakPoint) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        (hits, move |_: &BreakPoint| {
            hits2.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn one_shot_execution_breakpoint_fires_once() {
        let bps = MachineBreakpoints::default();
        let (hits, cb) = counter();
        bps.toggle_breakpoint(BreakPoint::execution(0x1_0100, true, cb), true);

        bps.check_breakpoints(0, 0x1_0100);
        bps.check_breakpoints(1, 0x1_0102);
        bps.check_breakpoints(2, 0x1_0100);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(bps.summaries().is_empty());
    }

    #[test]
    fn persistent_execution_breakpoint_stays_armed() {
        let bps = MachineBreakpoints::default();
        let (hits, cb) = counter();
        bps.toggle_breakpoint(BreakPoint::execution(0x500, false, cb), true);

        for cycle in 0..3 {
            bps.check_breakpoints(cycle, 0x500);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cycle_breakpoint_fires_only_after_threshold_is_exceeded() {
        let bps = MachineBreakpoints::default();
        let (hits, cb) = counter();
        bps.toggle_breakpoint(BreakPoint::cycles(10, true, cb), true);

        for cycle in 0..=10 {
            bps.check_breakpoints(cycle, 0);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bps.check_breakpoints(11, 0);
        bps.check_breakpoints(12, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn toggled_off_breakpoint_never_fires() {
        let holder = BreakPointHolder::new();
        let (hits, cb) = counter();
        let bp = BreakPoint::execution(0x42, false, cb);
        holder.toggle(bp.clone(), true);
        holder.toggle(bp.clone(), true);
        assert_eq!(holder.len(), 1);

        holder.toggle(bp, false);
        assert!(holder.is_empty());
        assert_eq!(holder.trigger_matching(0x42), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_remove_its_own_breakpoint() {
        let holder = Arc::new(BreakPointHolder::new());
        let weak = Arc::downgrade(&holder);
        let bp = BreakPoint::execution(0x10, false, move |bp| {
            if let Some(holder) = weak.upgrade() {
                holder.toggle(bp.clone(), false);
            }
        });
        holder.toggle(bp, true);

        assert_eq!(holder.trigger_matching(0x10), 1);
        assert!(holder.is_empty());
    }

    #[test]
    fn memory_access_breakpoint_watches_reads_and_writes() {
        let bps = MachineBreakpoints::default();
        let (hits, cb) = counter();
        bps.toggle_breakpoint(
            BreakPoint::memory(BreakPointType::MemoryAccess, 0x400, false, cb),
            true,
        );

        bps.memory().monitor_read(0x400);
        bps.memory().monitor_write(0x400);
        bps.memory().monitor_write(0x401);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bps.summaries().len(), 1);
    }

    #[test]
    fn one_shot_access_breakpoint_fires_on_the_first_access_only() {
        let bps = MachineBreakpoints::default();
        let (hits, cb) = counter();
        bps.toggle_breakpoint(
            BreakPoint::memory(BreakPointType::MemoryAccess, 0x400, true, cb),
            true,
        );

        bps.memory().monitor_read(0x400);
        bps.memory().monitor_write(0x400);
        bps.memory().monitor_read(0x400);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(bps.memory().is_empty());
        assert!(bps.summaries().is_empty());
    }

    #[test]
    fn machine_stop_breakpoints_fire_on_stop() {
        let bps = MachineBreakpoints::default();
        let (hits, cb) = counter();
        bps.toggle_breakpoint(BreakPoint::machine_stop(cb), true);

        bps.check_breakpoints(100, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bps.on_machine_stop();
        bps.on_machine_stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn export_json_lists_armed_breakpoints() {
        let bps = MachineBreakpoints::default();
        bps.toggle_breakpoint(BreakPoint::cycles(5, false, |_| {}), true);

        let json: serde_json::Value = serde_json::from_slice(&bps.export_json().unwrap()).unwrap();
        assert_eq!(json[0]["kind"], "Cycles");
        assert_eq!(json[0]["trigger"], 5);
    }
}
