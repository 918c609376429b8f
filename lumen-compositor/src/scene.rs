//! Double-buffered scene state and the transaction protocol.
//!
//! Two snapshots of [`SceneState`] exist at any time. The *current* state
//! lives in the [`SceneHandle`] and is mutated by client requests under a
//! single lock; the *drawing* state is owned by the composition loop and
//! read by nothing else. The only way drawing state changes is a committed
//! transaction: the loop clones the current state wholesale, so a reader
//! of the drawing state can never observe half of a batch of mutations.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use tracing::debug;

use crate::display::{DisplayConfig, DisplayId};
use crate::error::CompositorError;
use crate::layer::{LayerEntry, LayerId, LayerSource};

bitflags! {
    /// What a pending transaction touched, ORed in by every mutator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        /// Layer attributes changed; visible regions must be recomputed.
        const TRAVERSAL = 1 << 0;
        /// Layers were added or removed.
        const LAYER     = 1 << 1;
        /// Display configuration changed.
        const DISPLAY   = 1 << 2;
    }
}

/// A full snapshot of what the compositor should put on screen.
#[derive(Debug, Clone, Default)]
pub struct SceneState {
    pub layers: Vec<LayerEntry>,
    pub displays: HashMap<DisplayId, DisplayConfig>,
}

impl SceneState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible layers of one stack, bottom to top.
    pub fn layers_for_stack(&self, stack: u32) -> Vec<&LayerEntry> {
        let mut layers: Vec<&LayerEntry> = self
            .layers
            .iter()
            .filter(|layer| layer.layer_stack == stack && !layer.hidden)
            .collect();
        layers.sort_by_key(|layer| (layer.z, layer.id));
        layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&LayerEntry> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    fn layer_mut(&mut self, id: LayerId) -> Result<&mut LayerEntry, CompositorError> {
        self.layers
            .iter_mut()
            .find(|layer| layer.id == id)
            .ok_or(CompositorError::UnknownLayer(id))
    }
}

#[derive(Debug, Default)]
struct Pending {
    flags: TransactionFlags,
    /// Layer stacks touched since the last commit; only displays showing
    /// these stacks need recomposition.
    dirty_stacks: HashSet<u32>,
}

/// A committed transaction: the new drawing state plus what changed.
#[derive(Debug)]
pub struct CommittedTransaction {
    pub state: SceneState,
    pub flags: TransactionFlags,
    pub dirty_stacks: HashSet<u32>,
}

type TransactionNotify = Box<dyn Fn() + Send + Sync>;

/// Client-facing entry point for scene mutation.
///
/// Every mutator works on the current state only, records transaction
/// flags, and wakes the composition loop; nothing here touches what is on
/// screen until the loop commits.
pub struct SceneHandle {
    current: Mutex<SceneState>,
    pending: Mutex<Pending>,
    notify: Mutex<Option<TransactionNotify>>,
}

impl SceneHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(SceneState::new()),
            pending: Mutex::new(Pending::default()),
            notify: Mutex::new(None),
        })
    }

    /// Wires the wakeup the loop wants on every recorded transaction.
    pub(crate) fn set_notify<F>(&self, notify: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut guard = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Box::new(notify));
    }

    fn lock_current(&self) -> MutexGuard<'_, SceneState> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, flags: TransactionFlags, stack: Option<u32>) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.flags |= flags;
            if let Some(stack) = stack {
                pending.dirty_stacks.insert(stack);
            }
        }
        let guard = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(notify) = guard.as_ref() {
            notify();
        }
    }

    /// Adds a layer to the scene, initially hidden nowhere and empty until
    /// its first buffer latches.
    pub fn create_layer(
        &self,
        name: impl Into<String>,
        layer_stack: u32,
        z: i32,
        source: Arc<LayerSource>,
    ) -> LayerId {
        let id = LayerId::next();
        let entry = LayerEntry {
            id,
            name: name.into(),
            layer_stack,
            z,
            x: 0,
            y: 0,
            opaque: false,
            hidden: false,
            source,
        };
        self.lock_current().layers.push(entry);
        debug!(?id, layer_stack, z, "layer created");
        self.record(
            TransactionFlags::LAYER | TransactionFlags::TRAVERSAL,
            Some(layer_stack),
        );
        id
    }

    pub fn remove_layer(&self, id: LayerId) -> Result<(), CompositorError> {
        let stack = {
            let mut current = self.lock_current();
            let index = current
                .layers
                .iter()
                .position(|layer| layer.id == id)
                .ok_or(CompositorError::UnknownLayer(id))?;
            current.layers.remove(index).layer_stack
        };
        debug!(?id, "layer removed");
        self.record(
            TransactionFlags::LAYER | TransactionFlags::TRAVERSAL,
            Some(stack),
        );
        Ok(())
    }

    pub fn set_layer_position(&self, id: LayerId, x: i32, y: i32) -> Result<(), CompositorError> {
        let stack = {
            let mut current = self.lock_current();
            let layer = current.layer_mut(id)?;
            layer.x = x;
            layer.y = y;
            layer.layer_stack
        };
        self.record(TransactionFlags::TRAVERSAL, Some(stack));
        Ok(())
    }

    pub fn set_layer_z(&self, id: LayerId, z: i32) -> Result<(), CompositorError> {
        let stack = {
            let mut current = self.lock_current();
            let layer = current.layer_mut(id)?;
            layer.z = z;
            layer.layer_stack
        };
        self.record(TransactionFlags::TRAVERSAL, Some(stack));
        Ok(())
    }

    pub fn set_layer_opaque(&self, id: LayerId, opaque: bool) -> Result<(), CompositorError> {
        let stack = {
            let mut current = self.lock_current();
            let layer = current.layer_mut(id)?;
            layer.opaque = opaque;
            layer.layer_stack
        };
        self.record(TransactionFlags::TRAVERSAL, Some(stack));
        Ok(())
    }

    pub fn set_layer_hidden(&self, id: LayerId, hidden: bool) -> Result<(), CompositorError> {
        let stack = {
            let mut current = self.lock_current();
            let layer = current.layer_mut(id)?;
            layer.hidden = hidden;
            layer.layer_stack
        };
        self.record(TransactionFlags::TRAVERSAL, Some(stack));
        Ok(())
    }

    /// Moves a layer to a different display group.
    pub fn set_layer_stack(&self, id: LayerId, layer_stack: u32) -> Result<(), CompositorError> {
        let old_stack = {
            let mut current = self.lock_current();
            let layer = current.layer_mut(id)?;
            let old = layer.layer_stack;
            layer.layer_stack = layer_stack;
            old
        };
        self.record(TransactionFlags::TRAVERSAL, Some(old_stack));
        self.record(TransactionFlags::TRAVERSAL, Some(layer_stack));
        Ok(())
    }

    pub fn add_display(&self, config: DisplayConfig) {
        let id = config.id;
        self.lock_current().displays.insert(id, config);
        debug!(?id, "display added");
        self.record(TransactionFlags::DISPLAY, None);
    }

    pub fn remove_display(&self, id: DisplayId) -> Result<(), CompositorError> {
        self.lock_current()
            .displays
            .remove(&id)
            .ok_or(CompositorError::UnknownDisplay(id))?;
        debug!(?id, "display removed");
        self.record(TransactionFlags::DISPLAY, None);
        Ok(())
    }

    pub fn set_display_layer_stack(
        &self,
        id: DisplayId,
        layer_stack: u32,
    ) -> Result<(), CompositorError> {
        let mut current = self.lock_current();
        let display = current
            .displays
            .get_mut(&id)
            .ok_or(CompositorError::UnknownDisplay(id))?;
        display.layer_stack = layer_stack;
        drop(current);
        self.record(TransactionFlags::DISPLAY, None);
        Ok(())
    }

    /// Whether a commit would do anything.
    pub fn has_pending_transaction(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        !pending.flags.is_empty()
    }

    /// Takes the pending transaction, if any, snapshotting the current
    /// state. Called exclusively by the composition loop.
    pub(crate) fn commit(&self) -> Option<CommittedTransaction> {
        let taken = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.flags.is_empty() {
                return None;
            }
            std::mem::take(&mut *pending)
        };
        let state = self.lock_current().clone();
        debug!(flags = ?taken.flags, "transaction committed");
        Some(CommittedTransaction {
            state,
            flags: taken.flags,
            dirty_stacks: taken.dirty_stacks,
        })
    }
}

impl std::fmt::Debug for SceneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_buffer_queue::{BufferQueue, CpuAllocator};
    use pretty_assertions::assert_eq;

    fn new_source() -> Arc<LayerSource> {
        LayerSource::new(Arc::new(BufferQueue::new(
            Arc::new(CpuAllocator::new()),
            16,
            16,
        )))
    }

    fn test_display(id: u32, stack: u32) -> DisplayConfig {
        DisplayConfig {
            id: DisplayId(id),
            name: format!("display-{id}"),
            width: 16,
            height: 16,
            layer_stack: stack,
        }
    }

    #[test]
    fn mutations_do_not_touch_a_committed_snapshot() {
        let scene = SceneHandle::new();
        let id = scene.create_layer("status-bar", 0, 1, new_source());
        let committed = scene.commit().unwrap();
        assert_eq!(committed.state.layers.len(), 1);

        scene.set_layer_z(id, 9).unwrap();
        scene.create_layer("wallpaper", 0, 0, new_source());
        // The snapshot taken before the mutations is unaffected.
        assert_eq!(committed.state.layers.len(), 1);
        assert_eq!(committed.state.layer(id).unwrap().z, 1);
    }

    #[test]
    fn commit_is_all_or_nothing() {
        let scene = SceneHandle::new();
        let a = scene.create_layer("a", 0, 0, new_source());
        let b = scene.create_layer("b", 0, 1, new_source());
        scene.set_layer_position(a, 3, 4).unwrap();
        scene.set_layer_z(b, 5).unwrap();

        let committed = scene.commit().unwrap();
        let layer_a = committed.state.layer(a).unwrap();
        let layer_b = committed.state.layer(b).unwrap();
        assert_eq!((layer_a.x, layer_a.y), (3, 4));
        assert_eq!(layer_b.z, 5);

        // Nothing pending after the commit consumed the batch.
        assert!(scene.commit().is_none());
        assert!(!scene.has_pending_transaction());
    }

    #[test]
    fn commit_reports_flags_and_dirty_stacks() {
        let scene = SceneHandle::new();
        let id = scene.create_layer("a", 2, 0, new_source());
        scene.set_layer_position(id, 1, 1).unwrap();
        scene.add_display(test_display(0, 2));

        let committed = scene.commit().unwrap();
        assert!(committed.flags.contains(TransactionFlags::LAYER));
        assert!(committed.flags.contains(TransactionFlags::TRAVERSAL));
        assert!(committed.flags.contains(TransactionFlags::DISPLAY));
        assert!(committed.dirty_stacks.contains(&2));
    }

    #[test]
    fn layers_for_stack_filters_and_orders_by_z() {
        let scene = SceneHandle::new();
        let top = scene.create_layer("top", 0, 10, new_source());
        let bottom = scene.create_layer("bottom", 0, 1, new_source());
        let elsewhere = scene.create_layer("other-display", 1, 5, new_source());
        let hidden = scene.create_layer("hidden", 0, 3, new_source());
        scene.set_layer_hidden(hidden, true).unwrap();

        let committed = scene.commit().unwrap();
        let stack: Vec<LayerId> = committed
            .state
            .layers_for_stack(0)
            .iter()
            .map(|layer| layer.id)
            .collect();
        assert_eq!(stack, vec![bottom, top]);
        assert_eq!(committed.state.layers_for_stack(1).len(), 1);
        assert_eq!(committed.state.layers_for_stack(1)[0].id, elsewhere);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let scene = SceneHandle::new();
        let id = scene.create_layer("a", 0, 0, new_source());
        scene.remove_layer(id).unwrap();
        assert!(matches!(
            scene.set_layer_z(id, 1),
            Err(CompositorError::UnknownLayer(_))
        ));
        assert!(matches!(
            scene.remove_display(DisplayId(9)),
            Err(CompositorError::UnknownDisplay(_))
        ));
    }

    #[test]
    fn notify_fires_on_every_mutation() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let scene = SceneHandle::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        scene.set_notify(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let id = scene.create_layer("a", 0, 0, new_source());
        scene.set_layer_opaque(id, true).unwrap();
        scene.add_display(test_display(0, 0));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
