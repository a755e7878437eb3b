//! Preference data the plugin host reads but does not persist.

use std::collections::BTreeSet;

use parking_lot::RwLock;

/// Source of the daemon classes the user has disabled.
///
/// Queried each time daemons are started, so changes take effect on the
/// next [`reset_daemons`](crate::host::PluginHost::reset_daemons).
pub trait DaemonPreferences: Send + Sync {
    fn inactive_daemons(&self) -> BTreeSet<String>;
}

impl<F> DaemonPreferences for F
where
    F: Fn() -> BTreeSet<String> + Send + Sync,
{
    fn inactive_daemons(&self) -> BTreeSet<String> {
        self()
    }
}

/// In-memory inactive daemon list, seeded from configuration.
#[derive(Debug, Default)]
pub struct InactiveDaemons {
    names: RwLock<BTreeSet<String>>,
}

impl InactiveDaemons {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: RwLock::new(names.into_iter().collect()),
        }
    }

    /// Marks a daemon class as disabled or enabled.
    pub fn set_inactive(&self, class_name: &str, inactive: bool) {
        let mut names = self.names.write();
        if inactive {
            names.insert(class_name.to_string());
        } else {
            names.remove(class_name);
        }
    }

    pub fn is_inactive(&self, class_name: &str) -> bool {
        self.names.read().contains(class_name)
    }
}

impl DaemonPreferences for InactiveDaemons {
    fn inactive_daemons(&self) -> BTreeSet<String> {
        self.names.read().clone()
    }
}
