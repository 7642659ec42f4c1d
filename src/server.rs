//! The server root object.
//!
//! Owns every component explicitly and passes handles down; there are no
//! process-wide singletons and no hidden init order. The submission methods
//! run on whatever thread the embedding listener uses; the single consumer
//! thread spawned here is the only writer of the coordinator table, which
//! is what keeps "what is applied right now" a function of one serialized
//! work stream.

use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info};
use serde::Serialize;

use crate::client::{ClientDataManager, RawPid};
use crate::coco::{CocoSnapshot, CocoTable};
use crate::config::Config;
use crate::error::TuneError;
use crate::gc::{ClientGarbageCollector, UntuneSink};
use crate::pulse::{proc_liveness_probe, LivenessProbe, PulseMonitor};
use crate::queue::{RequestQueue, WorkItem};
use crate::ratelimit::RateLimiter;
use crate::request::{validate_tune, Handle, Request, RequestPriority, ResourceTuple};
use crate::resource::{PermissionClass, ResourceRegistry};
use crate::target::TargetRegistry;
use crate::timer::TimerService;
use crate::Shutdown;

/// Identity of the submitting client, as established by the listener from
/// the connection's peer credentials.
#[derive(Debug, Clone, Copy)]
pub struct ClientContext {
    pub pid: RawPid,
    pub tid: RawPid,
}

/// Determines the permission class of a newly seen process. The production
/// probe grants System to root-owned processes; tests substitute their own.
pub type PermissionProbe = Arc<dyn Fn(RawPid) -> PermissionClass + Send + Sync>;

pub fn uid_permission_probe() -> PermissionProbe {
    Arc::new(|pid| {
        match std::fs::metadata(format!("/proc/{pid}")) {
            Ok(meta) if meta.uid() == 0 => PermissionClass::System,
            _ => PermissionClass::ThirdParty,
        }
    })
}

#[derive(Debug, Serialize)]
pub struct ServerSnapshot {
    pub active_requests: usize,
    pub tracked_pids: usize,
    pub queued_items: usize,
    pub pending_timers: usize,
    pub coordinator: CocoSnapshot,
}

pub struct Server {
    config: Config,
    registry: Arc<ResourceRegistry>,
    cdm: Arc<ClientDataManager>,
    limiter: Arc<RateLimiter>,
    queue: Arc<RequestQueue>,
    timers: Arc<TimerService>,
    coco: Arc<RwLock<CocoTable>>,
    permission_probe: PermissionProbe,
    consumer: Option<JoinHandle<()>>,
    pulse: PulseMonitor,
    gc: ClientGarbageCollector,
    daemon_shutdown: Arc<Shutdown>,
    next_handle: AtomicI64,
    stopping: AtomicBool,
}

impl Server {
    pub fn new(
        config: Config,
        registry: Arc<ResourceRegistry>,
        targets: Arc<TargetRegistry>,
    ) -> Result<Self> {
        Self::with_probes(
            config,
            registry,
            targets,
            proc_liveness_probe(),
            uid_permission_probe(),
        )
    }

    /// Full constructor with injectable OS probes, used by tests and by
    /// embedders with their own notion of liveness or privilege.
    pub fn with_probes(
        config: Config,
        registry: Arc<ResourceRegistry>,
        targets: Arc<TargetRegistry>,
        liveness: LivenessProbe,
        permission: PermissionProbe,
    ) -> Result<Self> {
        config.validate()?;

        // Snapshot every node's boot-time content before any writer can
        // run; tear hooks restore from this store.
        registry.capture_defaults(&config.sysfs_root, &targets);

        let cdm = Arc::new(ClientDataManager::new());
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&cdm),
            config.rate_limiter_delta_ms,
            config.penalty_factor,
            config.reward_factor,
            config.max_concurrent_requests,
        ));
        let queue = Arc::new(RequestQueue::new(config.request_queue_capacity));

        // Expiry re-enters through the queue rather than mutating the
        // table; the consumer cannot observe a node vanishing mid-request.
        let expiry_queue = Arc::clone(&queue);
        let timers = Arc::new(TimerService::start(move |handle| {
            expiry_queue.push_internal(RequestPriority::SystemHigh, WorkItem::Untune { handle });
        }));

        let coco = Arc::new(RwLock::new(CocoTable::new(
            Arc::clone(&registry),
            Arc::clone(&targets),
            config.sysfs_root.clone(),
        )));

        let consumer = {
            let queue = Arc::clone(&queue);
            let coco = Arc::clone(&coco);
            let timers = Arc::clone(&timers);
            let cdm = Arc::clone(&cdm);
            let limiter = Arc::clone(&limiter);
            std::thread::spawn(move || consumer_loop(&queue, &coco, &timers, &cdm, &limiter))
        };

        let daemon_shutdown = Arc::new(Shutdown::new());
        let (reaper_tx, reaper_rx) = crossbeam::channel::unbounded();
        let pulse = PulseMonitor::start(
            Arc::clone(&cdm),
            reaper_tx,
            Duration::from_millis(config.pulse_duration_ms),
            liveness,
            Arc::clone(&daemon_shutdown),
        );

        let gc_queue = Arc::clone(&queue);
        let untune_sink: UntuneSink = Arc::new(move |handle, priority| {
            gc_queue.push_internal(priority, WorkItem::Untune { handle });
        });
        let gc = ClientGarbageCollector::start(
            Arc::clone(&cdm),
            reaper_rx,
            untune_sink,
            Duration::from_millis(config.garbage_collection_duration_ms),
            config.garbage_collection_batch_cap,
            Arc::clone(&daemon_shutdown),
        );

        info!(
            "Server up: {} resources, {} queue slots, {} concurrent requests max",
            registry.len(),
            config.request_queue_capacity,
            config.max_concurrent_requests
        );

        Ok(Self {
            config,
            registry,
            cdm,
            limiter,
            queue,
            timers,
            coco,
            permission_probe: permission,
            consumer: Some(consumer),
            pulse,
            gc,
            daemon_shutdown,
            next_handle: AtomicI64::new(1),
            stopping: AtomicBool::new(false),
        })
    }

    /// Accepts a Tune: validate, admit, allocate a handle, enqueue. On any
    /// error nothing is left behind; in particular a full queue rolls the
    /// client bookkeeping back before surfacing.
    pub fn submit_tune(
        &self,
        client: ClientContext,
        priority: RequestPriority,
        duration_ms: i64,
        resources: Vec<ResourceTuple>,
    ) -> Result<Handle, TuneError> {
        if self.stopping.load(Ordering::Relaxed) {
            return Err(TuneError::QueueFull);
        }
        validate_tune(&self.config, &self.registry, duration_ms, &resources)?;
        self.ensure_client(client)?;
        self.check_permissions(client, priority, &resources)?;
        self.limiter.admit(client.tid)?;
        self.limiter.admit_global()?;

        let duration_ms = if duration_ms == 0 {
            self.config.default_request_duration_ms
        } else {
            duration_ms
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.cdm.insert_handle(client.tid, handle, priority);
        self.limiter.on_request_accepted();

        let request = Request {
            handle,
            client_pid: client.pid,
            client_tid: client.tid,
            priority,
            duration_ms,
            resources,
        };
        if let Err(err) = self.queue.push(priority, WorkItem::Tune(request)) {
            self.cdm.delete_handle(client.tid, handle);
            self.limiter.on_request_retired();
            return Err(err);
        }
        debug!(
            "Accepted tune {} from {}:{} at {}",
            handle,
            client.pid,
            client.tid,
            priority.label()
        );
        Ok(handle)
    }

    /// Releases an earlier Tune. The handle must belong to the calling
    /// thread; the untune is queued at the tune's own priority so it can
    /// never overtake it.
    pub fn submit_untune(&self, client: ClientContext, handle: Handle) -> Result<(), TuneError> {
        if self.stopping.load(Ordering::Relaxed) {
            return Err(TuneError::QueueFull);
        }
        let priority = self
            .cdm
            .priority_of_handle(client.tid, handle)
            .ok_or(TuneError::UnknownHandle(handle))?;
        self.queue.push(priority, WorkItem::Untune { handle })
    }

    /// Rewrites the duration of an earlier Tune. The expiry restarts at
    /// `now + duration`, whether that extends or shortens the original.
    pub fn submit_retune(
        &self,
        client: ClientContext,
        handle: Handle,
        duration_ms: i64,
    ) -> Result<(), TuneError> {
        if self.stopping.load(Ordering::Relaxed) {
            return Err(TuneError::QueueFull);
        }
        if duration_ms < 0 || duration_ms > self.config.max_request_duration_ms {
            return Err(TuneError::BadDuration(duration_ms));
        }
        let duration_ms = if duration_ms == 0 {
            self.config.default_request_duration_ms
        } else {
            duration_ms
        };
        let priority = self
            .cdm
            .priority_of_handle(client.tid, handle)
            .ok_or(TuneError::UnknownHandle(handle))?;
        self.queue.push(priority, WorkItem::Retune { handle, duration_ms })
    }

    /// Read-only diagnostic dump, safe to take from any thread.
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            active_requests: self.limiter.active_requests(),
            tracked_pids: self.cdm.tracked_pid_count(),
            queued_items: self.queue.len(),
            pending_timers: self.timers.pending(),
            coordinator: self.coco.read().unwrap().snapshot(),
        }
    }

    /// JSON rendering of [`snapshot`](Self::snapshot) for log lines and
    /// external diagnostic tooling.
    pub fn snapshot_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    pub fn active_requests(&self) -> usize {
        self.limiter.active_requests()
    }

    pub fn tracked_pids(&self) -> usize {
        self.cdm.tracked_pid_count()
    }

    /// Drains the queue, tears every live node down to its captured
    /// default and joins all worker threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down: draining queue and restoring defaults");
        self.queue.push_stop();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
        self.timers.stop();
        self.daemon_shutdown.trigger();
        self.pulse.join();
        self.gc.join();
        info!("Shutdown complete");
    }

    fn ensure_client(&self, client: ClientContext) -> Result<(), TuneError> {
        if !self.cdm.client_exists(client.pid, client.tid) {
            let class = (self.permission_probe)(client.pid);
            self.cdm.create_client(client.pid, client.tid, class)?;
        }
        Ok(())
    }

    fn check_permissions(
        &self,
        client: ClientContext,
        priority: RequestPriority,
        resources: &[ResourceTuple],
    ) -> Result<(), TuneError> {
        let class = self
            .cdm
            .permission_of(client.pid)
            .unwrap_or(PermissionClass::ThirdParty);
        if class == PermissionClass::System {
            return Ok(());
        }
        if priority.is_system() {
            return Err(TuneError::PermissionDenied);
        }
        for tuple in resources {
            if self
                .registry
                .lookup(tuple.code)
                .is_some_and(|desc| desc.permissions == PermissionClass::System)
            {
                return Err(TuneError::PermissionDenied);
            }
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sole mutator of the coordinator table. Processes one work item end to
/// end, applier callbacks included, before taking the next.
fn consumer_loop(
    queue: &RequestQueue,
    coco: &RwLock<CocoTable>,
    timers: &TimerService,
    cdm: &ClientDataManager,
    limiter: &RateLimiter,
) {
    loop {
        match queue.pop() {
            WorkItem::Tune(req) => {
                let handle = req.handle;
                let tid = req.client_tid;
                let duration = Duration::from_millis(req.duration_ms.max(0) as u64);
                let linked = coco.write().unwrap().insert_request(req);
                if linked == 0 {
                    // Every triple was skipped or failed its write; there
                    // is nothing to expire later.
                    debug!("Tune {} held no node, retiring immediately", handle);
                    cdm.delete_handle(tid, handle);
                    limiter.on_request_retired();
                } else {
                    timers.arm(handle, duration);
                }
            }
            WorkItem::Untune { handle } => {
                let retired = coco.write().unwrap().remove_request(handle);
                for req in retired {
                    timers.cancel(req.handle);
                    cdm.delete_handle(req.tid, req.handle);
                    limiter.on_request_retired();
                }
            }
            WorkItem::Retune { handle, duration_ms } => {
                if coco.read().unwrap().has_request(handle) {
                    timers.arm(handle, Duration::from_millis(duration_ms.max(0) as u64));
                } else {
                    debug!("Retune for unknown handle {}, ignoring", handle);
                }
            }
            WorkItem::Stop => {
                let torn = coco.write().unwrap().teardown_all();
                info!("Consumer drained; tore down {} slots", torn);
                break;
            }
        }
    }
}
