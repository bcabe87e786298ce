//! Bookkeeping for rendered widgets
//!
//! Maps widget identifiers to the element they were mounted into. The
//! external library owns the widgets themselves; this registry only tracks
//! which ones this process created so cleanup paths know what to remove.

use dashmap::DashMap;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetStatus {
    /// Rendered, no token observed yet (possibly timed out)
    Pending,
    /// Produced at least one token
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetInstance {
    pub widget_id: String,
    pub element_id: String,
    pub status: WidgetStatus,
}

#[derive(Default)]
pub struct WidgetRegistry {
    widgets: DashMap<String, WidgetInstance>,
}

impl WidgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a widget the host created but that has not produced a token
    pub fn track_pending(&self, widget_id: String, element_id: String) {
        debug!("Tracking pending widget '{widget_id}' in element '{element_id}'");
        self.widgets.insert(
            widget_id.clone(),
            WidgetInstance {
                widget_id,
                element_id,
                status: WidgetStatus::Pending,
            },
        );
    }

    /// Mark a tracked widget active. Returns false if it was removed.
    pub fn activate(&self, widget_id: &str) -> bool {
        match self.widgets.get_mut(widget_id) {
            Some(mut instance) => {
                if instance.status == WidgetStatus::Pending {
                    debug!("Widget '{widget_id}' is now active");
                    instance.status = WidgetStatus::Active;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, widget_id: &str) -> Option<WidgetInstance> {
        self.widgets.get(widget_id).map(|entry| entry.value().clone())
    }

    pub fn element_for(&self, widget_id: &str) -> Option<String> {
        self.widgets
            .get(widget_id)
            .map(|entry| entry.element_id.clone())
    }

    pub fn contains(&self, widget_id: &str) -> bool {
        self.widgets.contains_key(widget_id)
    }

    pub fn remove(&self, widget_id: &str) -> Option<WidgetInstance> {
        debug!("Removing widget '{widget_id}' from registry");
        self.widgets.remove(widget_id).map(|(_, instance)| instance)
    }

    /// Copy of all tracked widget ids, safe to iterate while removing
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.widgets.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    pub fn get_stats(&self) -> WidgetStats {
        let active_count = self
            .widgets
            .iter()
            .filter(|entry| entry.status == WidgetStatus::Active)
            .count();
        WidgetStats {
            active_count,
            pending_count: self.widgets.len() - active_count,
        }
    }
}

/// Statistics about registry contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetStats {
    pub active_count: usize,
    pub pending_count: usize,
}
