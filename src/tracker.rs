//! Generic service tracker.
//!
//! A [`ServiceTracker`] follows the services matching a filter and keeps one
//! entry per service, produced and consumed by a [`TrackerCustomizer`].
//!
//! Each tracked service goes through `Adding` (customizer running, no map
//! lock held) and `Tracked`. A departure that arrives while the customizer
//! is still adding is remembered and applied as soon as it returns.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Outcome, RegistryResult, TrackerResult};
use crate::filter::Filter;
use crate::properties::ServiceId;
use crate::registry::{ServiceEvent, ServiceListener, ServiceReference, ServiceRegistry, Subscription};

/// Per-service callbacks of a [`ServiceTracker`].
///
/// Callbacks for the same service never overlap. Callbacks for different
/// services may run concurrently on different threads.
pub trait TrackerCustomizer: Send + Sync + 'static {
    /// State kept for every tracked service.
    type Entry: Send + Sync + 'static;

    /// A service started matching. An error leaves the service untracked.
    fn on_arrive(&self, reference: &ServiceReference) -> TrackerResult<Self::Entry>;

    /// A tracked service stopped matching or went away.
    fn on_remove(&self, reference: &ServiceReference, entry: Self::Entry) -> Outcome;
}

enum Slot<E> {
    Adding { departed: bool },
    Tracked(E),
}

struct TrackerCore<C: TrackerCustomizer> {
    filter: Filter,
    customizer: C,
    tracked: DashMap<ServiceId, (ServiceReference, Slot<C::Entry>)>,
}

impl<C: TrackerCustomizer> TrackerCore<C> {
    fn arrive(&self, reference: &ServiceReference) {
        if !self.filter.matches(reference.properties()) {
            return;
        }
        let id = reference.id();
        match self.tracked.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert((reference.clone(), Slot::Adding { departed: false }));
            }
        }
        let mut adding = AddingGuard {
            tracked: &self.tracked,
            id,
            armed: true,
        };

        let entry = match self.customizer.on_arrive(reference) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(service_id = %id, error = %err, "service not tracked");
                return;
            }
        };

        let mut pending = Some(entry);
        if let Some(mut slot) = self.tracked.get_mut(&id) {
            if matches!(slot.1, Slot::Adding { departed: false }) {
                if let Some(entry) = pending.take() {
                    slot.1 = Slot::Tracked(entry);
                    adding.armed = false;
                }
            }
        }
        drop(adding);
        if let Some(entry) = pending {
            debug!(service_id = %id, "service departed while it was being added");
            self.finish_removal(reference, entry);
        }
    }

    fn depart(&self, id: ServiceId) {
        loop {
            let removed = self
                .tracked
                .remove_if(&id, |_, (_, slot)| matches!(slot, Slot::Tracked(_)));
            if let Some((_, (reference, Slot::Tracked(entry)))) = removed {
                self.finish_removal(&reference, entry);
                return;
            }
            match self.tracked.get_mut(&id) {
                Some(mut slot) => match &mut slot.1 {
                    Slot::Adding { departed } => {
                        *departed = true;
                        return;
                    }
                    // became tracked in between, remove it on the next pass
                    Slot::Tracked(_) => continue,
                },
                None => return,
            }
        }
    }

    fn finish_removal(&self, reference: &ServiceReference, entry: C::Entry) {
        let outcome = self.customizer.on_remove(reference, entry);
        if let Some(diagnostic) = outcome.diagnostic() {
            debug!(service_id = %reference.id(), error = %diagnostic, "service removed with faults");
        }
    }
}

/// Drops the `Adding` slot of an arrival that did not reach `Tracked`,
/// including one unwound by a panicking customizer.
struct AddingGuard<'a, E> {
    tracked: &'a DashMap<ServiceId, (ServiceReference, Slot<E>)>,
    id: ServiceId,
    armed: bool,
}

impl<E> Drop for AddingGuard<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            self.tracked.remove(&self.id);
        }
    }
}

impl<C: TrackerCustomizer> ServiceListener for TrackerCore<C> {
    fn service_changed(&self, event: &ServiceEvent) {
        match event {
            ServiceEvent::Registered(reference) | ServiceEvent::Modified(reference) => {
                self.arrive(reference)
            }
            ServiceEvent::ModifiedEndMatch(reference) | ServiceEvent::Unregistering(reference) => {
                self.depart(reference.id())
            }
        }
    }
}

/// Tracks the services of a registry that match a filter.
pub struct ServiceTracker<C: TrackerCustomizer> {
    registry: ServiceRegistry,
    core: Arc<TrackerCore<C>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<C: TrackerCustomizer> ServiceTracker<C> {
    /// Create a closed tracker. Call [`open`](Self::open) to start tracking.
    pub fn new(registry: ServiceRegistry, filter: Filter, customizer: C) -> Self {
        Self {
            registry,
            core: Arc::new(TrackerCore {
                filter,
                customizer,
                tracked: DashMap::new(),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// The filter services must match to be tracked.
    pub fn filter(&self) -> &Filter {
        &self.core.filter
    }

    /// The customizer receiving arrivals and departures.
    pub fn customizer(&self) -> &C {
        &self.core.customizer
    }

    /// Mutable access to the customizer while the tracker is not open.
    pub fn customizer_mut(&mut self) -> Option<&mut C> {
        Arc::get_mut(&mut self.core).map(|core| &mut core.customizer)
    }

    /// Start tracking. Services already present are added before this returns.
    pub fn open(&self) -> RegistryResult<()> {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }
        let listener: Arc<dyn ServiceListener> = self.core.clone();
        let (handle, existing) = self
            .registry
            .subscribe_with_snapshot(self.core.filter.clone(), listener)?;
        *subscription = Some(handle);
        drop(subscription);

        for reference in &existing {
            self.core.arrive(reference);
        }
        Ok(())
    }

    /// Stop tracking and remove every tracked entry.
    pub fn close(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
        let ids: Vec<ServiceId> = self.core.tracked.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.core.depart(id);
        }
    }

    /// Whether the tracker is subscribed to the registry.
    pub fn is_open(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Ids of the services currently tracked, ascending.
    pub fn tracked_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self
            .core
            .tracked
            .iter()
            .filter(|e| matches!(e.value().1, Slot::Tracked(_)))
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Check if the service is tracked.
    pub fn is_tracking(&self, id: ServiceId) -> bool {
        self.core
            .tracked
            .get(&id)
            .map(|e| matches!(e.value().1, Slot::Tracked(_)))
            .unwrap_or(false)
    }

    /// Number of tracked services.
    pub fn len(&self) -> usize {
        self.tracked_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed an arrival directly, bypassing the registry subscription.
    pub fn arrive(&self, reference: &ServiceReference) {
        self.core.arrive(reference);
    }

    /// Feed a departure directly. Unknown services are ignored.
    pub fn depart(&self, reference: &ServiceReference) {
        self.core.depart(reference.id());
    }
}

impl<C: TrackerCustomizer> Drop for ServiceTracker<C> {
    fn drop(&mut self) {
        self.close();
    }
}
