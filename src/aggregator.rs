//! The report list and the aggregator passes that walk it.
//!
//! Entries live in a generational arena keyed by [`ReportId`] and are visited
//! in registration order. A pass copies the live entries under the list
//! lock, drains and formats them without it, then relocks once to reclaim
//! what is finished: one-shot reports after they are formatted, transfer
//! channels once they are both drained and detached.

use crate::channel::TransferReport;
use crate::config::ReportStyle;
use crate::reporter::Shared;
use crate::snapshot::{ConnectionSnapshot, SettingsSnapshot, TransferSnapshot};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stable handle of an entry in the report list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReportId {
    index: u32,
    generation: u32,
}

/// Reports printed once and then discarded.
#[derive(Debug)]
pub(crate) enum OneShotKind {
    Settings(SettingsSnapshot),
    Connection(ConnectionSnapshot),
    ServerRelay(ConnectionSnapshot, TransferSnapshot),
}

#[derive(Debug)]
pub(crate) struct OneShot {
    kind: OneShotKind,
    style: ReportStyle,
    formatted: AtomicBool,
}

impl OneShot {
    pub(crate) fn new(kind: OneShotKind, style: ReportStyle) -> Self {
        Self {
            kind,
            style,
            formatted: AtomicBool::new(false),
        }
    }

    fn format(&self, shared: &Shared) {
        if self.formatted.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut formatters = shared.formatters.lock();
        match &self.kind {
            OneShotKind::Settings(settings) => formatters.settings(self.style, settings),
            OneShotKind::Connection(connection) => {
                // Standalone connections have no channel to carry the label.
                let _ = formatters.connection(self.style, connection);
            }
            OneShotKind::ServerRelay(connection, snapshot) => {
                formatters.server_relay(self.style, connection, snapshot)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Report {
    Transfer(Arc<TransferReport>),
    OneShot(Arc<OneShot>),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    report: Option<Report>,
}

/// Report list guarded by the reporter's list monitor.
#[derive(Debug, Default)]
pub(crate) struct ReportList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<ReportId>,
    pub(crate) stopping: bool,
}

impl ReportList {
    pub(crate) fn insert(&mut self, report: Report) -> ReportId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.report = Some(report);
                ReportId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    report: Some(report),
                });
                ReportId { index, generation: 0 }
            }
        };
        self.order.push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: ReportId) -> Option<Report> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let report = slot.report.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.order.retain(|entry| *entry != id);
        Some(report)
    }

    pub(crate) fn contains(&self, id: ReportId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.report.is_some())
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Cheap copies of the live entries in registration order.
    fn entries(&self) -> Vec<(ReportId, Report)> {
        self.order
            .iter()
            .filter_map(|id| {
                self.slots[id.index as usize]
                    .report
                    .as_ref()
                    .map(|report| (*id, report.clone()))
            })
            .collect()
    }
}

/// One walk over the report list. Returns `true` if anything was consumed,
/// printed or reclaimed.
pub(crate) fn run_pass(shared: &Shared) -> bool {
    let entries = shared.list.lock().entries();
    let mut progressed = false;
    let mut finished = Vec::new();

    for (id, report) in &entries {
        match report {
            Report::Transfer(transfer) => {
                if transfer.drain(shared) > 0 {
                    progressed = true;
                }
                if transfer.is_drained() && transfer.is_detached() {
                    finished.push(*id);
                }
            }
            Report::OneShot(one_shot) => {
                one_shot.format(shared);
                finished.push(*id);
            }
        }
    }

    if finished.is_empty() {
        return progressed;
    }
    let removed: Vec<Report> = {
        let mut list = shared.list.lock();
        let removed = finished.iter().filter_map(|id| list.remove(*id)).collect();
        // Wake anyone parked on an empty list, e.g. a waiting shutdown.
        shared.list.broadcast();
        removed
    };
    for report in &removed {
        if let Report::Transfer(transfer) = report {
            reclaim(shared, transfer);
        }
    }
    true
}

/// Final bookkeeping for a transfer that has left the list.
fn reclaim(shared: &Shared, transfer: &TransferReport) {
    debug!("reclaimed transfer {}", transfer.transfer_id());
    let Some(coordinator) = transfer.coordinator() else {
        return;
    };
    if !coordinator.leave() {
        return;
    }
    if let Some(sum) = coordinator.flush_final() {
        debug!(
            "group {} ended with {} of {} streams",
            coordinator.group_id(),
            sum.contributions,
            coordinator.thread_count()
        );
        shared.formatters.lock().combined(transfer.style(), &sum);
    }
}

/// Body of the background reporter thread.
pub(crate) fn run_forever(shared: Arc<Shared>) {
    info!("reporter thread started");
    loop {
        let progressed = run_pass(&shared);

        let mut list = shared.list.lock();
        if list.stopping {
            // From here on posters and producers drain for themselves; the
            // last pass picks up whatever was queued before the flag flipped.
            shared.consumer_running.store(false, Ordering::SeqCst);
            drop(list);
            run_pass(&shared);
            break;
        }
        if list.is_empty() {
            // Parked threads must not hold up join_all.
            shared.registry.exclude_from_join();
            shared.list.wait_while(&mut list, |l| l.is_empty() && !l.stopping);
            shared.registry.include_in_join();
        } else if !progressed {
            shared.sleeping.store(true, Ordering::Release);
            shared.list.wait_for(&mut list, shared.options.idle_wait);
            shared.sleeping.store(false, Ordering::Release);
        }
    }
    info!("reporter thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, Role};

    fn one_shot(port: u16) -> Report {
        let settings = SettingsSnapshot::new(0, Role::Listener, Protocol::Tcp, port);
        Report::OneShot(Arc::new(OneShot::new(
            OneShotKind::Settings(settings),
            ReportStyle::Default,
        )))
    }

    fn port_of(report: &Report) -> u16 {
        match report {
            Report::OneShot(one_shot) => match &one_shot.kind {
                OneShotKind::Settings(settings) => settings.port,
                _ => 0,
            },
            Report::Transfer(_) => 0,
        }
    }

    #[test]
    fn test_entries_keep_registration_order() {
        let mut list = ReportList::default();
        let a = list.insert(one_shot(1));
        list.insert(one_shot(2));
        list.remove(a).unwrap();
        list.insert(one_shot(3));

        let ports: Vec<u16> = list.entries().iter().map(|(_, r)| port_of(r)).collect();
        assert_eq!(ports, vec![2, 3]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_stale_id_does_not_remove_reused_slot() {
        let mut list = ReportList::default();
        let old = list.insert(one_shot(1));
        list.remove(old).unwrap();
        let new = list.insert(one_shot(2));

        assert_eq!(old.index, new.index);
        assert!(!list.contains(old));
        assert!(list.remove(old).is_none());
        assert!(list.contains(new));
        assert_eq!(port_of(&list.remove(new).unwrap()), 2);
        assert!(list.is_empty());
    }
}
