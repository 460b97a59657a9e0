use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::handle::{HandleId, ModelHandle};
use crate::{
    config::{ModelConfig, ResourceLimits},
    error::{EngineError, ErrorKind, ResourceType, Result},
    native::{NativeBackend, NativeParams, RawHandle},
    utils::SystemMemory,
};

/// Assumed total memory when the system cannot be read
const FALLBACK_TOTAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

/// Accounts NPU cores and memory across every model loaded through it.
///
/// Cheap to clone; clones share one ledger. Construct one per process at the
/// composition root and hand clones to whatever needs to load models.
#[derive(Clone)]
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
}

pub(crate) struct ManagerShared {
    backend: Arc<dyn NativeBackend>,
    limits: ResourceLimits,
    ledger: Mutex<Ledger>,
    /// Mutated only while `ledger` is held; read freely.
    registry: DashMap<HandleId, ModelInstance>,
    next_handle: AtomicU64,
}

/// Budget counters. Admission check and charge happen under one lock.
#[derive(Debug, Default)]
struct Ledger {
    initialized: bool,
    /// Bumped by every cleanup so stale reservations are never refunded.
    epoch: u64,
    total_memory: u64,
    used_cores: u32,
    used_memory: u64,
}

#[derive(Debug)]
struct ModelInstance {
    raw: RawHandle,
    instance_id: String,
    config: ModelConfig,
    charged_cores: u32,
    charged_memory: u64,
    epoch: u64,
    created_at: Instant,
}

/// Snapshot of budget usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub npu_utilization: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub active_models: usize,
    pub npu_cores_used: u32,
    pub npu_cores_total: u32,
}

/// Public view of a registered model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub handle: HandleId,
    pub instance_id: String,
    pub model_path: PathBuf,
    pub npu_cores: u32,
    pub uptime: std::time::Duration,
}

impl ResourceManager {
    pub fn new(backend: Arc<dyn NativeBackend>, limits: ResourceLimits) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                backend,
                limits,
                ledger: Mutex::new(Ledger::default()),
                registry: DashMap::new(),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Read system memory, zero the counters and start admitting models.
    /// A no-op when already initialized.
    pub fn initialize(&self) -> Result<()> {
        let mut ledger = self.shared.ledger.lock();
        if ledger.initialized {
            debug!("Resource manager already initialized");
            return Ok(());
        }
        self.shared.limits.validate()?;

        let total_memory = match self.shared.limits.total_memory_bytes {
            Some(bytes) => bytes,
            None => match SystemMemory::read() {
                Some(memory) => memory.total_bytes,
                None => {
                    warn!(
                        fallback_bytes = FALLBACK_TOTAL_MEMORY,
                        "Could not read system memory, using fallback"
                    );
                    FALLBACK_TOTAL_MEMORY
                }
            },
        };

        ledger.total_memory = total_memory;
        ledger.used_cores = 0;
        ledger.used_memory = 0;
        ledger.initialized = true;

        info!(
            total_memory,
            total_cores = self.shared.limits.total_npu_cores,
            "Resource manager initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.ledger.lock().initialized
    }

    /// Destroy every registered model and return to the uninitialized state.
    /// Native destroy failures are logged, never raised.
    pub fn cleanup(&self) {
        let drained: Vec<(HandleId, ModelInstance)> = {
            let mut ledger = self.shared.ledger.lock();
            if !ledger.initialized && self.shared.registry.is_empty() {
                return;
            }

            let keys: Vec<HandleId> = self.shared.registry.iter().map(|e| *e.key()).collect();
            let drained = keys
                .into_iter()
                .filter_map(|key| self.shared.registry.remove(&key))
                .collect();

            ledger.used_cores = 0;
            ledger.used_memory = 0;
            ledger.initialized = false;
            ledger.epoch += 1;
            drained
        };

        for (handle, instance) in &drained {
            let code = self.shared.backend.destroy(instance.raw);
            if code != 0 {
                warn!(
                    handle = %handle,
                    model_id = %instance.instance_id,
                    code,
                    "Native destroy failed during cleanup"
                );
            }
        }

        info!(destroyed = drained.len(), "Resource manager cleaned up");
    }

    /// Admit and load a model.
    ///
    /// The budget is reserved before the native init call and refunded if it
    /// fails, so concurrent callers can never jointly overcommit the NPU.
    pub fn create_model(&self, config: &ModelConfig) -> Result<ModelHandle> {
        if !self.is_initialized() {
            return Err(EngineError::InitializationFailed {
                message: "initialize() must be called before create_model()".to_string(),
            });
        }
        config.validate()?;
        if self.shared.limits.model_file_missing(&config.model_path) {
            return Err(EngineError::InvalidConfig {
                violations: vec![format!(
                    "model_path {} does not exist",
                    config.model_path.display()
                )],
            });
        }

        let charged_memory = self.shared.limits.per_model_memory_bytes;
        let epoch = {
            let mut ledger = self.shared.ledger.lock();
            if !ledger.initialized {
                return Err(EngineError::InitializationFailed {
                    message: "resource manager was cleaned up".to_string(),
                });
            }
            self.shared.admit(&ledger, config.npu_core_num)?;
            ledger.used_cores += config.npu_core_num;
            ledger.used_memory += charged_memory;
            ledger.epoch
        };

        let raw = match self.shared.backend.init(&NativeParams::from(config)) {
            Ok(raw) => raw,
            Err(code) => {
                self.shared.refund(epoch, config.npu_core_num, charged_memory);
                warn!(model_path = %config.model_path.display(), code, "Native model init failed");
                return Err(EngineError::ModelLoadFailed { code });
            }
        };

        let id = HandleId(self.shared.next_handle.fetch_add(1, Ordering::SeqCst));
        let instance_id = format!("model_{}", uuid::Uuid::new_v4().simple());

        {
            let ledger = self.shared.ledger.lock();
            if ledger.epoch == epoch {
                self.shared.registry.insert(
                    id,
                    ModelInstance {
                        raw,
                        instance_id: instance_id.clone(),
                        config: config.clone(),
                        charged_cores: config.npu_core_num,
                        charged_memory,
                        epoch,
                        created_at: Instant::now(),
                    },
                );
            } else {
                drop(ledger);
                // Cleaned up while the native init ran; the model never became visible.
                let code = self.shared.backend.destroy(raw);
                if code != 0 {
                    warn!(
                        model_path = %config.model_path.display(),
                        code,
                        "Native destroy failed for a model loaded across cleanup"
                    );
                }
                return Err(EngineError::InitializationFailed {
                    message: "resource manager was cleaned up during model load".to_string(),
                });
            }
        }

        info!(
            handle = %id,
            model_id = %instance_id,
            cores = config.npu_core_num,
            model_path = %config.model_path.display(),
            "Model created"
        );
        Ok(ModelHandle::new(id, Arc::downgrade(&self.shared)))
    }

    /// Unload a model and refund its budget.
    ///
    /// A handle issued by a different manager is rejected; it stays with its
    /// owner, which releases it when the token drops.
    pub fn destroy_model(&self, handle: ModelHandle) -> Result<()> {
        if !Weak::ptr_eq(handle.manager(), &Arc::downgrade(&self.shared)) {
            return Err(EngineError::invalid_handle(format!(
                "{} was issued by a different resource manager",
                handle.id()
            )));
        }
        self.shared.release(handle.disarm())
    }

    pub fn get_model_config(&self, handle: HandleId) -> Result<ModelConfig> {
        self.shared
            .registry
            .get(&handle)
            .map(|instance| instance.config.clone())
            .ok_or_else(|| EngineError::invalid_handle(format!("{} is not registered", handle)))
    }

    pub fn model_info(&self, handle: HandleId) -> Result<ModelInfo> {
        self.shared
            .registry
            .get(&handle)
            .map(|instance| ModelInfo {
                handle,
                instance_id: instance.instance_id.clone(),
                model_path: instance.config.model_path.clone(),
                npu_cores: instance.charged_cores,
                uptime: instance.created_at.elapsed(),
            })
            .ok_or_else(|| EngineError::invalid_handle(format!("{} is not registered", handle)))
    }

    pub fn active_models(&self) -> Vec<HandleId> {
        let mut handles: Vec<HandleId> = self.shared.registry.iter().map(|e| *e.key()).collect();
        handles.sort();
        handles
    }

    pub fn get_resource_stats(&self) -> ResourceStats {
        let ledger = self.shared.ledger.lock();
        let total_cores = self.shared.limits.total_npu_cores;

        ResourceStats {
            npu_utilization: if total_cores > 0 {
                ledger.used_cores as f64 / total_cores as f64 * 100.0
            } else {
                0.0
            },
            memory_used: ledger.used_memory,
            memory_total: ledger.total_memory,
            active_models: self.shared.registry.len(),
            npu_cores_used: ledger.used_cores,
            npu_cores_total: total_cores,
        }
    }

    /// Whether `config` would pass admission right now. No side effects.
    pub fn has_available_resources(&self, config: &ModelConfig) -> bool {
        let ledger = self.shared.ledger.lock();
        ledger.initialized && self.shared.admit(&ledger, config.npu_core_num).is_ok()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.shared.limits
    }

    pub fn validate_config(config: &ModelConfig) -> Result<()> {
        config.validate()
    }

    pub fn default_config() -> ModelConfig {
        ModelConfig::default()
    }

    pub fn optimized_config(model_path: impl Into<PathBuf>) -> ModelConfig {
        ModelConfig::optimized(model_path)
    }

    pub fn error_message(kind: ErrorKind) -> &'static str {
        kind.message()
    }
}

impl ManagerShared {
    /// Native side of a registered model
    pub(crate) fn lookup(&self, handle: HandleId) -> Result<(Arc<dyn NativeBackend>, RawHandle)> {
        self.registry
            .get(&handle)
            .map(|instance| (Arc::clone(&self.backend), instance.raw))
            .ok_or_else(|| EngineError::invalid_handle(format!("{} is not active", handle)))
    }

    fn admit(&self, ledger: &Ledger, requested_cores: u32) -> Result<()> {
        let total_cores = self.limits.total_npu_cores;
        if ledger.used_cores + requested_cores > total_cores {
            return Err(EngineError::ResourceExhausted {
                resource: ResourceType::NpuCores,
                requested: requested_cores as u64,
                available: total_cores.saturating_sub(ledger.used_cores) as u64,
            });
        }

        let budget = self.limits.memory_headroom * ledger.total_memory as f64;
        let requested = self.limits.per_model_memory_bytes;
        if (ledger.used_memory + requested) as f64 > budget {
            return Err(EngineError::ResourceExhausted {
                resource: ResourceType::Memory,
                requested,
                available: (budget as u64).saturating_sub(ledger.used_memory),
            });
        }

        Ok(())
    }

    fn refund(&self, epoch: u64, cores: u32, memory: u64) {
        let mut ledger = self.ledger.lock();
        if ledger.epoch == epoch {
            ledger.used_cores = ledger.used_cores.saturating_sub(cores);
            ledger.used_memory = ledger.used_memory.saturating_sub(memory);
        }
    }

    /// Remove a model from the registry, refund it and destroy it natively.
    pub(crate) fn release(&self, handle: HandleId) -> Result<()> {
        let instance = {
            let mut ledger = self.ledger.lock();
            let (_, instance) = self.registry.remove(&handle).ok_or_else(|| {
                EngineError::invalid_handle(format!(
                    "{} is not registered or already inactive",
                    handle
                ))
            })?;
            if ledger.epoch == instance.epoch {
                ledger.used_cores = ledger.used_cores.saturating_sub(instance.charged_cores);
                ledger.used_memory = ledger.used_memory.saturating_sub(instance.charged_memory);
            }
            instance
        };

        let code = self.backend.destroy(instance.raw);
        if code != 0 {
            warn!(handle = %handle, model_id = %instance.instance_id, code, "Native destroy failed");
            return Err(EngineError::Unknown {
                message: format!("native destroy of {} returned {}", handle, code),
            });
        }

        info!(handle = %handle, model_id = %instance.instance_id, "Model destroyed");
        Ok(())
    }
}

impl Drop for ManagerShared {
    /// Unload whatever is still registered once the last manager clone is
    /// gone; outstanding handles can no longer reach it.
    fn drop(&mut self) {
        let remaining = std::mem::take(&mut self.registry);
        for (handle, instance) in remaining {
            let code = self.backend.destroy(instance.raw);
            if code != 0 {
                warn!(
                    handle = %handle,
                    model_id = %instance.instance_id,
                    code,
                    "Native destroy failed while dropping resource manager"
                );
            } else {
                debug!(handle = %handle, model_id = %instance.instance_id, "Model unloaded with its manager");
            }
        }
    }
}
