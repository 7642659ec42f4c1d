//! Concurrency coordinator table.
//!
//! Multiple clients tune the same resource at different priorities; the
//! coordinator decides, per physical sub-target, which value is on the wire
//! right now and which request owns it. Per slot it keeps one doubly linked
//! list per priority, ordered by the resource's policy, plus a scalar
//! recording the priority whose head currently owns the node. All applier
//! and tear hooks run from here, on the single consumer thread that owns
//! this table, so writes to one sub-target are totally ordered.
//!
//! Nodes live in a slab arena and link by index; requests are owned by the
//! table and everything else refers to them by handle. That keeps the
//! request/node/client graph acyclic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::client::RawPid;
use crate::hooks::HookContext;
use crate::request::{Handle, Request, RequestPriority};
use crate::resource::{ApplyType, Policy, ResourceDescriptor, ResourceRegistry};
use crate::target::TargetRegistry;

const NR_PRIORITIES: usize = RequestPriority::COUNT;

/// Bookkeeping for one accepted request applied to one resource sub-target.
#[derive(Debug)]
struct CocoNode {
    handle: Handle,
    /// Resource slot in the coordinator table.
    primary: usize,
    /// Physical sub-target id, as handed to the hooks.
    sub: u32,
    /// Priority index; together with `sub` this selects the list.
    pri: usize,
    /// Post-clamp, post-policy value this node stands for.
    value: i32,
    prev: Option<usize>,
    next: Option<usize>,
}

impl CocoNode {
    fn list_index(&self) -> usize {
        self.sub as usize * NR_PRIORITIES + self.pri
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct NodeList {
    head: Option<usize>,
    tail: Option<usize>,
}

/// Per-resource slot block: one list per (sub-target, priority) pair, with
/// the priority in the low bits, and one applied-priority scalar per
/// sub-target.
struct ResourceSlots {
    lists: Vec<NodeList>,
    applied: Vec<Option<usize>>,
}

struct ActiveRequest {
    request: Request,
    nodes: Vec<usize>,
}

/// A request that no longer holds any node and must be retired by the
/// caller: expiry timer cancelled, handle dropped from the client table,
/// global counter decremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredRequest {
    pub handle: Handle,
    pub tid: RawPid,
}

pub struct CocoTable {
    registry: Arc<ResourceRegistry>,
    targets: Arc<TargetRegistry>,
    sysfs_root: PathBuf,
    slots: Vec<ResourceSlots>,
    nodes: Vec<Option<CocoNode>>,
    free: Vec<usize>,
    requests: HashMap<Handle, ActiveRequest>,
}

impl CocoTable {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        targets: Arc<TargetRegistry>,
        sysfs_root: PathBuf,
    ) -> Self {
        let slots = registry
            .iter()
            .map(|desc| {
                let sub_count = targets.slot_count(desc.apply_type);
                ResourceSlots {
                    lists: vec![NodeList::default(); sub_count * NR_PRIORITIES],
                    applied: vec![None; sub_count],
                }
            })
            .collect();
        Self {
            registry,
            targets,
            sysfs_root,
            slots,
            nodes: Vec::new(),
            free: Vec::new(),
            requests: HashMap::new(),
        }
    }

    /// Inserts every resolvable triple of a Tune request and applies the
    /// heads that win their slot. Returns the number of nodes linked; zero
    /// means nothing stuck (every triple was unresolvable or failed its
    /// write) and the caller should retire the request immediately.
    pub fn insert_request(&mut self, req: Request) -> usize {
        let reg = Arc::clone(&self.registry);
        let targets = Arc::clone(&self.targets);
        let pri = req.priority.index();
        let mut linked = Vec::new();

        for tuple in &req.resources {
            let Some(primary) = reg.table_index(tuple.code) else {
                warn!(
                    "Request {}: unregistered resource {:#010x}, skipping",
                    req.handle, tuple.code
                );
                continue;
            };
            let desc = reg.get(primary);

            let sub = match desc.apply_type {
                ApplyType::Global => 0,
                other => match targets.translate(other, tuple.sub_index) {
                    Some(phys) => phys,
                    None => {
                        warn!(
                            "Request {}: no physical target {} for {}, skipping",
                            req.handle, tuple.sub_index, desc.name
                        );
                        continue;
                    }
                },
            };

            let value = tuple.value.clamp(desc.low, desc.high);
            let idx = self.alloc_node(CocoNode {
                handle: req.handle,
                primary,
                sub,
                pri,
                value,
                prev: None,
                next: None,
            });

            if self.slot_is_idle(primary, sub) {
                // Fast path: no concurrency on this sub-target, skip the
                // policy walk and write immediately.
                self.push_front(idx);
                match self.run_apply(desc, sub, value) {
                    Ok(()) => self.slots[primary].applied[sub as usize] = Some(pri),
                    Err(err) => {
                        warn!("Apply failed for {} sub {}: {:#}", desc.name, sub, err);
                        self.unlink(idx);
                        self.free_node(idx);
                        continue;
                    }
                }
                linked.push(idx);
                continue;
            }

            self.link_by_policy(idx, desc.policy);

            let is_head = self.slots[primary].lists[self.node(idx).list_index()].head == Some(idx);
            let applied = self.slots[primary].applied[sub as usize];
            if is_head && applied.is_none_or(|cur| pri <= cur) {
                match self.run_apply(desc, sub, value) {
                    Ok(()) => self.slots[primary].applied[sub as usize] = Some(pri),
                    Err(err) => {
                        // The previous owner's write is still on the wire;
                        // drop only the failed node.
                        warn!("Apply failed for {} sub {}: {:#}", desc.name, sub, err);
                        self.unlink(idx);
                        self.free_node(idx);
                        continue;
                    }
                }
            }
            linked.push(idx);
        }

        let count = linked.len();
        if count > 0 {
            self.requests.insert(
                req.handle,
                ActiveRequest {
                    request: req,
                    nodes: linked,
                },
            );
        }
        count
    }

    /// Removes every node of a request, promoting successors and restoring
    /// defaults where the request owned the wire. Unknown handles are a
    /// no-op, which makes untune idempotent. The returned list names every
    /// request that ceased to exist: the untuned one first, plus any
    /// collateral requests whose last node was dropped because its write
    /// failed during promotion.
    pub fn remove_request(&mut self, handle: Handle) -> Vec<RetiredRequest> {
        let Some(active) = self.requests.remove(&handle) else {
            debug!("Untune for unknown handle {}, ignoring", handle);
            return Vec::new();
        };
        let mut retired = vec![RetiredRequest {
            handle,
            tid: active.request.client_tid,
        }];

        for idx in active.nodes {
            // Repair of an earlier node may already have dropped this one.
            if self.nodes[idx].as_ref().is_some_and(|n| n.handle == handle) {
                self.remove_node(idx, &mut retired);
            }
        }
        retired
    }

    pub fn has_request(&self, handle: Handle) -> bool {
        self.requests.contains_key(&handle)
    }

    /// Priority a live request was accepted at.
    pub fn request_priority(&self, handle: Handle) -> Option<RequestPriority> {
        self.requests.get(&handle).map(|a| a.request.priority)
    }

    pub fn active_request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Shutdown teardown: restore the captured default of every sub-target
    /// that still has a writer, then drop all bookkeeping. Returns the
    /// number of slots torn.
    pub fn teardown_all(&mut self) -> usize {
        let reg = Arc::clone(&self.registry);
        let mut torn = 0;
        for primary in 0..self.slots.len() {
            let desc = reg.get(primary);
            let sub_count = self.slots[primary].applied.len();
            for sub in 0..sub_count {
                let occupied = (0..NR_PRIORITIES)
                    .any(|p| self.slots[primary].lists[sub * NR_PRIORITIES + p].head.is_some());
                if occupied {
                    if let Err(err) = self.run_tear(desc, sub as u32) {
                        warn!("Teardown of {} sub {} failed: {:#}", desc.name, sub, err);
                    }
                    torn += 1;
                }
                self.slots[primary].applied[sub] = None;
                for p in 0..NR_PRIORITIES {
                    self.slots[primary].lists[sub * NR_PRIORITIES + p] = NodeList::default();
                }
            }
        }
        self.nodes.clear();
        self.free.clear();
        self.requests.clear();
        torn
    }

    pub fn snapshot(&self) -> CocoSnapshot {
        let resources = self
            .registry
            .iter()
            .enumerate()
            .map(|(primary, desc)| {
                let block = &self.slots[primary];
                let mut subs = Vec::new();
                let mut queued_nodes = 0;
                for sub in 0..block.applied.len() {
                    let queued = (0..NR_PRIORITIES)
                        .map(|p| self.list_len(primary, sub * NR_PRIORITIES + p))
                        .sum::<usize>();
                    queued_nodes += queued;
                    if queued > 0 {
                        subs.push(SubTargetSnapshot {
                            sub: sub as u32,
                            applied_priority: block.applied[sub]
                                .and_then(RequestPriority::from_index)
                                .map(|p| p.label()),
                            queued,
                        });
                    }
                }
                ResourceSlotSnapshot {
                    name: desc.name.clone(),
                    code: desc.code,
                    queued_nodes,
                    slots: subs,
                }
            })
            .collect();
        CocoSnapshot { resources }
    }

    fn remove_node(&mut self, idx: usize, retired: &mut Vec<RetiredRequest>) {
        let (primary, sub, pri, was_head) = {
            let node = self.node(idx);
            let was_head =
                self.slots[node.primary].lists[node.list_index()].head == Some(idx);
            (node.primary, node.sub, node.pri, was_head)
        };
        self.unlink(idx);
        self.free_node(idx);

        if was_head && self.slots[primary].applied[sub as usize] == Some(pri) {
            self.repair_slot(primary, sub, retired);
        }
    }

    /// The slot lost its owner: promote the head of the highest non-empty
    /// priority, discarding heads whose writes fail, and fall back to the
    /// tear hook when every list is empty.
    fn repair_slot(&mut self, primary: usize, sub: u32, retired: &mut Vec<RetiredRequest>) {
        let reg = Arc::clone(&self.registry);
        let desc = reg.get(primary);

        for pri in 0..NR_PRIORITIES {
            let list_index = sub as usize * NR_PRIORITIES + pri;
            loop {
                let Some(head) = self.slots[primary].lists[list_index].head else {
                    break;
                };
                let (value, owner) = {
                    let node = self.node(head);
                    (node.value, node.handle)
                };
                match self.run_apply(desc, sub, value) {
                    Ok(()) => {
                        self.slots[primary].applied[sub as usize] = Some(pri);
                        return;
                    }
                    Err(err) => {
                        warn!(
                            "Promotion write failed for {} sub {}: {:#}",
                            desc.name, sub, err
                        );
                        self.unlink(head);
                        self.free_node(head);
                        self.detach_from_request(owner, head, retired);
                    }
                }
            }
        }

        if let Err(err) = self.run_tear(desc, sub) {
            warn!("Tear failed for {} sub {}: {:#}", desc.name, sub, err);
        }
        self.slots[primary].applied[sub as usize] = None;
    }

    /// Drops a node index from the request that owns it; if that was the
    /// request's last node the request itself is retired.
    fn detach_from_request(
        &mut self,
        owner: Handle,
        idx: usize,
        retired: &mut Vec<RetiredRequest>,
    ) {
        let emptied = match self.requests.get_mut(&owner) {
            Some(active) => {
                active.nodes.retain(|&n| n != idx);
                active.nodes.is_empty()
            }
            None => false,
        };
        if emptied {
            if let Some(active) = self.requests.remove(&owner) {
                retired.push(RetiredRequest {
                    handle: owner,
                    tid: active.request.client_tid,
                });
            }
        }
    }

    fn slot_is_idle(&self, primary: usize, sub: u32) -> bool {
        let base = sub as usize * NR_PRIORITIES;
        (0..NR_PRIORITIES).all(|p| self.slots[primary].lists[base + p].head.is_none())
    }

    fn link_by_policy(&mut self, idx: usize, policy: Policy) {
        match policy {
            Policy::InstantApply => self.push_front(idx),
            Policy::LazyApply => self.push_back(idx),
            // Non-increasing by value; equal values keep insertion order so
            // the older writer stays closer to the head.
            Policy::HigherIsBetter => {
                let value = self.node(idx).value;
                self.insert_sorted(idx, |cur| cur >= value);
            }
            // Non-decreasing, same tiebreak.
            Policy::LowerIsBetter => {
                let value = self.node(idx).value;
                self.insert_sorted(idx, |cur| cur <= value);
            }
        }
    }

    /// Walks the list from the head and links `idx` after the last node
    /// satisfying `keep_ahead`.
    fn insert_sorted(&mut self, idx: usize, keep_ahead: impl Fn(i32) -> bool) {
        let (primary, list_index) = {
            let node = self.node(idx);
            (node.primary, node.list_index())
        };
        let mut anchor = None;
        let mut cursor = self.slots[primary].lists[list_index].head;
        while let Some(cur) = cursor {
            let node = self.node(cur);
            if keep_ahead(node.value) {
                anchor = Some(cur);
                cursor = node.next;
            } else {
                break;
            }
        }
        match anchor {
            None => self.push_front(idx),
            Some(pos) => self.insert_after(pos, idx),
        }
    }

    fn push_front(&mut self, idx: usize) {
        let (primary, list_index) = {
            let node = self.node(idx);
            (node.primary, node.list_index())
        };
        let old_head = self.slots[primary].lists[list_index].head;
        self.node_mut(idx).prev = None;
        self.node_mut(idx).next = old_head;
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(idx),
            None => self.slots[primary].lists[list_index].tail = Some(idx),
        }
        self.slots[primary].lists[list_index].head = Some(idx);
    }

    fn push_back(&mut self, idx: usize) {
        let (primary, list_index) = {
            let node = self.node(idx);
            (node.primary, node.list_index())
        };
        let old_tail = self.slots[primary].lists[list_index].tail;
        self.node_mut(idx).next = None;
        self.node_mut(idx).prev = old_tail;
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(idx),
            None => self.slots[primary].lists[list_index].head = Some(idx),
        }
        self.slots[primary].lists[list_index].tail = Some(idx);
    }

    fn insert_after(&mut self, pos: usize, idx: usize) {
        let (primary, list_index, pos_next) = {
            let node = self.node(pos);
            (node.primary, node.list_index(), node.next)
        };
        self.node_mut(idx).prev = Some(pos);
        self.node_mut(idx).next = pos_next;
        self.node_mut(pos).next = Some(idx);
        match pos_next {
            Some(n) => self.node_mut(n).prev = Some(idx),
            None => self.slots[primary].lists[list_index].tail = Some(idx),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (primary, list_index, prev, next) = {
            let node = self.node(idx);
            (node.primary, node.list_index(), node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.slots[primary].lists[list_index].head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.slots[primary].lists[list_index].tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn alloc_node(&mut self, node: CocoNode) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn free_node(&mut self, idx: usize) {
        self.nodes[idx] = None;
        self.free.push(idx);
    }

    fn node(&self, idx: usize) -> &CocoNode {
        self.nodes[idx].as_ref().expect("referenced node is free")
    }

    fn node_mut(&mut self, idx: usize) -> &mut CocoNode {
        self.nodes[idx].as_mut().expect("referenced node is free")
    }

    fn list_len(&self, primary: usize, list_index: usize) -> usize {
        let mut len = 0;
        let mut cursor = self.slots[primary].lists[list_index].head;
        while let Some(cur) = cursor {
            len += 1;
            cursor = self.node(cur).next;
        }
        len
    }

    fn run_apply(&self, desc: &ResourceDescriptor, sub: u32, value: i32) -> anyhow::Result<()> {
        let ctx = HookContext {
            resource: desc,
            sub_index: sub,
            value,
            sysfs_root: &self.sysfs_root,
            defaults: self.registry.defaults(),
        };
        (desc.hooks.apply)(&ctx)
    }

    fn run_tear(&self, desc: &ResourceDescriptor, sub: u32) -> anyhow::Result<()> {
        let ctx = HookContext {
            resource: desc,
            sub_index: sub,
            value: 0,
            sysfs_root: &self.sysfs_root,
            defaults: self.registry.defaults(),
        };
        (desc.hooks.tear)(&ctx)
    }
}

#[derive(Debug, Serialize)]
pub struct CocoSnapshot {
    pub resources: Vec<ResourceSlotSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ResourceSlotSnapshot {
    pub name: String,
    pub code: u32,
    pub queued_nodes: usize,
    pub slots: Vec<SubTargetSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct SubTargetSnapshot {
    pub sub: u32,
    pub applied_priority: Option<&'static str>,
    pub queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookFn, ResourceHooks};
    use crate::resource::ResourceBuilder;
    use std::sync::Mutex;

    const RES_HIB: u32 = 0x0001_0000;
    const RES_INSTANT: u32 = 0x0001_0001;
    const RES_LAZY: u32 = 0x0001_0002;
    const RES_LOW: u32 = 0x0001_0003;
    const RES_CORE: u32 = 0x0002_0000;

    /// Applier/tear pair that records every invocation instead of touching
    /// the filesystem. `fail_value` makes the applier reject one value so
    /// the failure paths can be exercised.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(u32, u32, Option<i32>)>>,
    }

    impl Recorder {
        fn hooks(self: &Arc<Self>, fail_value: Option<i32>) -> ResourceHooks {
            let rec = Arc::clone(self);
            let apply: HookFn = Arc::new(move |ctx: &crate::hooks::HookContext| {
                if fail_value == Some(ctx.value) {
                    anyhow::bail!("injected write failure");
                }
                rec.events
                    .lock()
                    .unwrap()
                    .push((ctx.resource.code, ctx.sub_index, Some(ctx.value)));
                Ok(())
            });
            let rec = Arc::clone(self);
            let tear: HookFn = Arc::new(move |ctx: &crate::hooks::HookContext| {
                rec.events
                    .lock()
                    .unwrap()
                    .push((ctx.resource.code, ctx.sub_index, None));
                Ok(())
            });
            ResourceHooks { apply, tear }
        }

        fn take(&self) -> Vec<(u32, u32, Option<i32>)> {
            std::mem::take(&mut self.events.lock().unwrap())
        }

        fn last_write(&self, code: u32) -> Option<Option<i32>> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(c, _, _)| *c == code)
                .map(|(_, _, v)| *v)
        }
    }

    fn table(fail_value: Option<i32>) -> (Arc<Recorder>, CocoTable) {
        let recorder = Arc::new(Recorder::default());
        let mut registry = ResourceRegistry::new();
        let catalog = [
            (RES_HIB, Policy::HigherIsBetter, ApplyType::Global),
            (RES_INSTANT, Policy::InstantApply, ApplyType::Global),
            (RES_LAZY, Policy::LazyApply, ApplyType::Global),
            (RES_LOW, Policy::LowerIsBetter, ApplyType::Global),
            (RES_CORE, Policy::InstantApply, ApplyType::Core),
        ];
        for (code, policy, apply_type) in catalog {
            registry
                .register(
                    ResourceBuilder::new(format!("res-{code:x}"), code)
                        .bounds(0, 1000)
                        .policy(policy)
                        .apply_type(apply_type)
                        .hooks(recorder.hooks(fail_value))
                        .build()
                        .unwrap(),
                )
                .unwrap();
        }
        let targets = Arc::new(TargetRegistry::with_layout(vec![0, 1], vec![0], vec![]));
        let coco = CocoTable::new(Arc::new(registry), targets, PathBuf::from("/"));
        (recorder, coco)
    }

    fn tune(handle: Handle, priority: RequestPriority, code: u32, value: i32) -> Request {
        tune_sub(handle, priority, code, 0, value)
    }

    fn tune_sub(
        handle: Handle,
        priority: RequestPriority,
        code: u32,
        sub_index: u32,
        value: i32,
    ) -> Request {
        Request {
            handle,
            client_pid: 100,
            client_tid: 100,
            priority,
            duration_ms: 1_000,
            resources: vec![crate::request::ResourceTuple { code, sub_index, value }],
        }
    }

    #[test]
    fn higher_is_better_stacking() {
        let (rec, mut coco) = table(None);

        assert_eq!(coco.insert_request(tune(1, RequestPriority::ThirdPartyHigh, RES_HIB, 400)), 1);
        assert_eq!(rec.last_write(RES_HIB), Some(Some(400)));

        assert_eq!(coco.insert_request(tune(2, RequestPriority::ThirdPartyHigh, RES_HIB, 900)), 1);
        assert_eq!(rec.last_write(RES_HIB), Some(Some(900)));

        // Dropping the stronger writer hands the slot back to the weaker one.
        coco.remove_request(2);
        assert_eq!(rec.last_write(RES_HIB), Some(Some(400)));

        // Last writer gone: tear restores the captured default.
        coco.remove_request(1);
        assert_eq!(rec.last_write(RES_HIB), Some(None));
        assert_eq!(coco.active_request_count(), 0);
        assert_eq!(coco.node_count(), 0);
    }

    #[test]
    fn higher_is_better_tie_keeps_older_writer() {
        let (rec, mut coco) = table(None);
        coco.insert_request(tune(1, RequestPriority::SystemLow, RES_HIB, 500));
        rec.take();
        // Equal value: the older node stays at the head, no rewrite happens.
        coco.insert_request(tune(2, RequestPriority::SystemLow, RES_HIB, 500));
        assert_eq!(rec.take(), vec![]);
    }

    #[test]
    fn priority_overrides_policy() {
        let (rec, mut coco) = table(None);

        coco.insert_request(tune(1, RequestPriority::ThirdPartyHigh, RES_HIB, 900));
        // SystemHigh wins the slot even though its value loses on policy.
        coco.insert_request(tune(2, RequestPriority::SystemHigh, RES_HIB, 100));
        assert_eq!(rec.last_write(RES_HIB), Some(Some(100)));

        coco.remove_request(2);
        assert_eq!(rec.last_write(RES_HIB), Some(Some(900)));

        coco.remove_request(1);
        assert_eq!(rec.last_write(RES_HIB), Some(None));
    }

    #[test]
    fn weaker_priority_never_drives_the_applier() {
        let (rec, mut coco) = table(None);
        coco.insert_request(tune(1, RequestPriority::SystemHigh, RES_HIB, 300));
        rec.take();

        coco.insert_request(tune(2, RequestPriority::ThirdPartyLow, RES_HIB, 999));
        assert_eq!(rec.take(), vec![]);

        // Removing the weak writer leaves the strong owner untouched.
        coco.remove_request(2);
        assert_eq!(rec.take(), vec![]);
    }

    #[test]
    fn instant_apply_latest_head_wins() {
        let (rec, mut coco) = table(None);

        coco.insert_request(tune(1, RequestPriority::ThirdPartyLow, RES_INSTANT, 5));
        coco.insert_request(tune(2, RequestPriority::ThirdPartyLow, RES_INSTANT, 3));
        assert_eq!(rec.last_write(RES_INSTANT), Some(Some(3)));

        coco.remove_request(2);
        assert_eq!(rec.last_write(RES_INSTANT), Some(Some(5)));

        coco.remove_request(1);
        assert_eq!(rec.last_write(RES_INSTANT), Some(None));
    }

    #[test]
    fn lazy_apply_is_fifo() {
        let (rec, mut coco) = table(None);

        coco.insert_request(tune(1, RequestPriority::SystemLow, RES_LAZY, 10));
        coco.insert_request(tune(2, RequestPriority::SystemLow, RES_LAZY, 20));
        coco.insert_request(tune(3, RequestPriority::SystemLow, RES_LAZY, 30));
        // Eldest stays applied until it goes away.
        assert_eq!(rec.last_write(RES_LAZY), Some(Some(10)));

        coco.remove_request(1);
        assert_eq!(rec.last_write(RES_LAZY), Some(Some(20)));
        coco.remove_request(2);
        assert_eq!(rec.last_write(RES_LAZY), Some(Some(30)));
    }

    #[test]
    fn lower_is_better_ordering() {
        let (rec, mut coco) = table(None);

        coco.insert_request(tune(1, RequestPriority::SystemLow, RES_LOW, 70));
        coco.insert_request(tune(2, RequestPriority::SystemLow, RES_LOW, 40));
        assert_eq!(rec.last_write(RES_LOW), Some(Some(40)));

        coco.insert_request(tune(3, RequestPriority::SystemLow, RES_LOW, 55));
        assert_eq!(rec.last_write(RES_LOW), Some(Some(40)));

        coco.remove_request(2);
        assert_eq!(rec.last_write(RES_LOW), Some(Some(55)));
    }

    #[test]
    fn values_are_clamped_to_bounds() {
        let (rec, mut coco) = table(None);
        coco.insert_request(tune(1, RequestPriority::SystemLow, RES_HIB, 5000));
        assert_eq!(rec.last_write(RES_HIB), Some(Some(1000)));
    }

    #[test]
    fn core_level_translation_and_skip() {
        let (rec, mut coco) = table(None);

        // Core 1 exists: applied against its physical id.
        assert_eq!(
            coco.insert_request(tune_sub(1, RequestPriority::SystemLow, RES_CORE, 1, 42)),
            1
        );
        assert_eq!(rec.take(), vec![(RES_CORE, 1, Some(42))]);

        // Core 9 does not: the triple is skipped and nothing sticks.
        assert_eq!(
            coco.insert_request(tune_sub(2, RequestPriority::SystemLow, RES_CORE, 9, 42)),
            0
        );
        assert!(!coco.has_request(2));
    }

    #[test]
    fn untune_is_idempotent() {
        let (rec, mut coco) = table(None);
        coco.insert_request(tune(1, RequestPriority::SystemLow, RES_HIB, 700));

        let first = coco.remove_request(1);
        assert_eq!(first.len(), 1);
        assert_eq!(rec.last_write(RES_HIB), Some(None));

        let again = coco.remove_request(1);
        assert!(again.is_empty());
        assert_eq!(rec.last_write(RES_HIB), Some(None));
    }

    #[test]
    fn failed_insert_write_leaves_previous_owner() {
        let (rec, mut coco) = table(Some(666));

        coco.insert_request(tune(1, RequestPriority::SystemLow, RES_INSTANT, 5));
        assert_eq!(rec.last_write(RES_INSTANT), Some(Some(5)));

        // The new head's write fails: its node is dropped, request 2 holds
        // nothing, and request 1 still owns the wire.
        assert_eq!(coco.insert_request(tune(2, RequestPriority::SystemLow, RES_INSTANT, 666)), 0);
        assert!(!coco.has_request(2));
        assert_eq!(rec.last_write(RES_INSTANT), Some(Some(5)));

        coco.remove_request(1);
        assert_eq!(rec.last_write(RES_INSTANT), Some(None));
    }

    #[test]
    fn failed_promotion_retires_collateral_request() {
        let (rec, mut coco) = table(Some(666));

        // 666 never applies on insert (blocked by the stronger head), so it
        // parks in the list; its write only fails at promotion time.
        coco.insert_request(tune(1, RequestPriority::SystemHigh, RES_HIB, 900));
        coco.insert_request(tune(2, RequestPriority::SystemLow, RES_HIB, 666));
        assert_eq!(rec.last_write(RES_HIB), Some(Some(900)));

        let retired = coco.remove_request(1);
        // Both requests are gone: the untuned one and the collateral whose
        // promotion write failed; the slot fell back to the default.
        assert_eq!(retired.len(), 2);
        assert_eq!(retired[0].handle, 1);
        assert_eq!(retired[1].handle, 2);
        assert!(!coco.has_request(2));
        assert_eq!(rec.last_write(RES_HIB), Some(None));
    }

    #[test]
    fn multi_resource_request_links_each_slot() {
        let (rec, mut coco) = table(None);
        let req = Request {
            handle: 1,
            client_pid: 1,
            client_tid: 1,
            priority: RequestPriority::SystemLow,
            duration_ms: 0,
            resources: vec![
                crate::request::ResourceTuple { code: RES_HIB, sub_index: 0, value: 100 },
                crate::request::ResourceTuple { code: RES_INSTANT, sub_index: 0, value: 7 },
            ],
        };
        assert_eq!(coco.insert_request(req), 2);
        assert_eq!(coco.node_count(), 2);
        assert_eq!(rec.last_write(RES_HIB), Some(Some(100)));
        assert_eq!(rec.last_write(RES_INSTANT), Some(Some(7)));

        let retired = coco.remove_request(1);
        assert_eq!(retired.len(), 1);
        assert_eq!(coco.node_count(), 0);
    }

    #[test]
    fn teardown_tears_each_occupied_slot_once() {
        let (rec, mut coco) = table(None);
        coco.insert_request(tune(1, RequestPriority::SystemLow, RES_HIB, 100));
        coco.insert_request(tune(2, RequestPriority::SystemLow, RES_HIB, 200));
        coco.insert_request(tune(3, RequestPriority::SystemLow, RES_INSTANT, 7));
        rec.take();

        assert_eq!(coco.teardown_all(), 2);
        let tears = rec.take();
        assert_eq!(tears, vec![(RES_HIB, 0, None), (RES_INSTANT, 0, None)]);
        assert_eq!(coco.active_request_count(), 0);
        assert_eq!(coco.node_count(), 0);
    }

    #[test]
    fn snapshot_reports_applied_priority() {
        let (_rec, mut coco) = table(None);
        coco.insert_request(tune(1, RequestPriority::ThirdPartyHigh, RES_HIB, 400));
        coco.insert_request(tune(2, RequestPriority::SystemHigh, RES_HIB, 100));

        let snap = coco.snapshot();
        let res = snap
            .resources
            .iter()
            .find(|r| r.code == RES_HIB)
            .unwrap();
        assert_eq!(res.queued_nodes, 2);
        assert_eq!(res.slots[0].applied_priority, Some("system-high"));
    }
}
