use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::manager::ManagerShared;
use crate::error::{EngineError, Result};
use crate::native::{NativeBackend, RawHandle};

/// Registry key of a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// Ownership token for one loaded model.
///
/// Cannot be cloned. The native model is destroyed exactly once: through
/// [`ResourceManager::destroy_model`](super::ResourceManager::destroy_model),
/// through manager-wide cleanup, or when the token is dropped, whichever
/// happens first.
#[must_use = "dropping a ModelHandle unloads the model"]
pub struct ModelHandle {
    id: HandleId,
    manager: Weak<ManagerShared>,
    armed: bool,
}

impl ModelHandle {
    pub(crate) fn new(id: HandleId, manager: Weak<ManagerShared>) -> Self {
        Self {
            id,
            manager,
            armed: true,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn manager(&self) -> &Weak<ManagerShared> {
        &self.manager
    }

    /// Backend and native handle for running requests on this model
    pub(crate) fn resolve(&self) -> Result<(Arc<dyn NativeBackend>, RawHandle)> {
        self.manager
            .upgrade()
            .ok_or_else(|| EngineError::invalid_handle(format!("{} outlived its resource manager", self.id)))?
            .lookup(self.id)
    }

    /// Hand responsibility for the model back to the caller of this method.
    pub(crate) fn disarm(mut self) -> HandleId {
        self.armed = false;
        self.id
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // a dropped manager has already unloaded everything it issued
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        match manager.release(self.id) {
            Ok(()) => debug!(handle = %self.id, "Model released on drop"),
            Err(EngineError::InvalidHandle { .. }) => {
                debug!(handle = %self.id, "Model already released")
            }
            Err(e) => warn!(handle = %self.id, error = %e, "Failed to release model on drop"),
        }
    }
}
