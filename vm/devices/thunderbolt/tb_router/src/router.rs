// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The router tree of a domain.

use crate::DomainConfig;
use crate::Error;
use crate::dispatch::Dispatcher;
use crate::ring::FrameHandler;
use crate::ring::TbRing;
use crate::scheduler::SchedState;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tb_spec::ConfigSpace;
use tb_spec::Pdf;
use tb_spec::Route;
use tb_spec::router_cs;

/// State shared by all routers of a domain.
pub(crate) struct Domain {
    ring: Arc<dyn TbRing>,
    config: DomainConfig,
    // Owns the handler registered with the ring, which only holds a weak
    // reference to it.
    _dispatcher: OnceLock<Arc<Dispatcher>>,
}

/// Identity and geometry read from a router's configuration block when it
/// is attached.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RouterInfo {
    /// Vendor ID.
    pub vendor_id: u16,
    /// Product ID.
    pub product_id: u16,
    /// Revision ID.
    pub revision: u8,
    /// The adapter facing the parent router.
    pub upstream_adapter: u8,
    /// The highest adapter number. Bounds the hops that lead to children.
    pub max_adapter: u8,
    /// The depth the router reports for itself.
    pub depth: u8,
    /// Offset of the first router capability.
    pub first_cap: u8,
    /// The router UUID from `ROUTER_CS_7` and `ROUTER_CS_8`.
    pub uuid: u64,
}

/// A router in the domain tree.
///
/// Nodes are created by [`RouterNode::attach_root`] and
/// [`RouterNode::attach`] and stay reachable from the root until
/// [`RouterNode::detach`]ed. A parent owns its children; children refer back
/// to their parent weakly.
pub struct RouterNode {
    route: Route,
    depth: u8,
    domain: Arc<Domain>,
    parent: Weak<RouterNode>,
    info: OnceLock<RouterInfo>,
    lc_uuid: OnceLock<u128>,
    children: Mutex<Vec<Option<Arc<RouterNode>>>>,
    pub(crate) sched: Mutex<SchedState>,
    // Set with both the `sched` and `children` locks held.
    detached: AtomicBool,
}

impl RouterNode {
    fn new(domain: Arc<Domain>, route: Route, depth: u8, parent: Weak<RouterNode>) -> Self {
        Self {
            route,
            depth,
            domain,
            parent,
            info: OnceLock::new(),
            lc_uuid: OnceLock::new(),
            children: Mutex::new(Vec::new()),
            sched: Mutex::new(SchedState::new()),
            detached: AtomicBool::new(false),
        }
    }

    /// Attaches the root router of a new domain, using the default
    /// [`DomainConfig`].
    pub fn attach_root(ring: Arc<dyn TbRing>, route: Route) -> Result<Arc<Self>, Error> {
        Self::attach_root_with_config(ring, route, DomainConfig::default())
    }

    /// Attaches the root router of a new domain.
    ///
    /// Registers the domain's frame handler with `ring` and reads the root's
    /// configuration block.
    pub fn attach_root_with_config(
        ring: Arc<dyn TbRing>,
        route: Route,
        config: DomainConfig,
    ) -> Result<Arc<Self>, Error> {
        let domain = Arc::new(Domain {
            ring,
            config,
            _dispatcher: OnceLock::new(),
        });
        let root = Arc::new(Self::new(domain.clone(), route, 0, Weak::new()));

        let dispatcher = Arc::new(Dispatcher::new(Arc::downgrade(&root)));
        for pdf in [Pdf::READ, Pdf::WRITE, Pdf::NOTIFY] {
            let handler: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
            domain.ring.register_handler(pdf, handler as Weak<dyn FrameHandler>);
        }
        let _ = domain._dispatcher.set(dispatcher);

        root.probe()?;
        tracing::info!(route = %route, info = ?root.info(), "attached root router");
        Ok(root)
    }

    /// Attaches the router at `route`, one hop below this one.
    ///
    /// The new node is linked into this router's child slot before its
    /// configuration block is read, so the response can be routed to it. If
    /// the read fails the slot is cleared again.
    pub fn attach(self: &Arc<Self>, route: Route) -> Result<Arc<Self>, Error> {
        if self.depth >= Route::MAX_HOPS - 1 {
            return Err(Error::InvalidArgument("topology too deep"));
        }
        let hop = route.hop_at(self.depth);
        if hop == 0 || hop > self.max_adapter() {
            return Err(Error::InvalidArgument("hop out of range"));
        }
        if self.route.child(self.depth, hop) != route {
            return Err(Error::InvalidArgument("route does not extend parent route"));
        }

        let child = Arc::new(Self::new(
            self.domain.clone(),
            route,
            self.depth + 1,
            Arc::downgrade(self),
        ));
        {
            let mut children = self.children.lock();
            if self.is_detached() {
                return Err(Error::Detached);
            }
            let slot = children
                .get_mut(usize::from(hop))
                .ok_or(Error::InvalidArgument("hop out of range"))?;
            if slot.is_some() {
                return Err(Error::AlreadyExists);
            }
            *slot = Some(child.clone());
        }

        if let Err(err) = child.probe() {
            self.unlink(hop, &child);
            tracing::warn!(
                route = %route,
                error = &err as &dyn std::error::Error,
                "failed to attach router"
            );
            return Err(err);
        }
        tracing::info!(route = %route, info = ?child.info(), "attached router");
        Ok(child)
    }

    /// Finds the attached router at `route` by walking down from this one.
    pub fn lookup(self: &Arc<Self>, route: Route) -> Result<Arc<Self>, Error> {
        let mut node = self.clone();
        while node.route != route {
            if node.depth >= Route::MAX_HOPS {
                return Err(Error::NotFound(route));
            }
            let hop = route.hop_at(node.depth);
            if hop == 0 {
                return Err(Error::NotFound(route));
            }
            if hop > node.max_adapter() {
                return Err(Error::InvalidArgument("hop out of range"));
            }
            node = node.child(hop).ok_or(Error::NotFound(route))?;
        }
        Ok(node)
    }

    /// Unlinks this router from its parent.
    ///
    /// Fails with [`Error::Busy`] while requests are queued or in flight, or
    /// while children are still attached. Once detached, new requests and
    /// attaches below this router fail with [`Error::Detached`].
    pub fn detach(self: &Arc<Self>) -> Result<(), Error> {
        // Held across the unlink so nothing can be queued or attached after
        // the checks pass.
        let sched = self.sched.lock();
        let children = self.children.lock();
        if !sched.is_idle() || children.iter().any(Option::is_some) {
            return Err(Error::Busy);
        }
        if self.detached.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.unlink(self.route.hop_at(parent.depth), self);
        }
        drop(children);
        drop(sched);
        tracing::info!(route = %self.route, "detached router");
        Ok(())
    }

    /// Whether [`RouterNode::detach`] has succeeded on this router.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed)
    }

    /// Reads the configuration block and the link controller UUID.
    fn probe(self: &Arc<Self>) -> Result<(), Error> {
        let block = self.read(
            ConfigSpace::ROUTER,
            0,
            router_cs::ROUTER_CS_0,
            router_cs::ROUTER_CS_LEN,
        )?;
        let cs0 = router_cs::RouterCs0::from_bits(block[usize::from(router_cs::ROUTER_CS_0)]);
        let cs1 = router_cs::RouterCs1::from_bits(block[usize::from(router_cs::ROUTER_CS_1)]);
        let uuid_lo = block[usize::from(router_cs::ROUTER_CS_7)];
        let uuid_hi = block[usize::from(router_cs::ROUTER_CS_8)];
        let info = RouterInfo {
            vendor_id: cs0.vendor_id(),
            product_id: cs0.product_id(),
            revision: cs1.revision(),
            upstream_adapter: cs1.upstream_adapter(),
            max_adapter: cs1.max_adapter(),
            depth: cs1.depth(),
            first_cap: cs1.next_cap(),
            uuid: (u64::from(uuid_hi) << 32) | u64::from(uuid_lo),
        };
        if info.depth != self.depth {
            tracing::warn!(
                route = %self.route,
                depth = self.depth,
                reported = info.depth,
                "router reports unexpected depth"
            );
        }

        let slots = usize::from(info.max_adapter) + 1;
        {
            let mut children = self.children.lock();
            children
                .try_reserve_exact(slots)
                .map_err(|_| Error::NoMemory)?;
            children.resize_with(slots, || None);
        }
        let _ = self.info.set(info);

        match self.get_lc_uuid() {
            Ok(uuid) => {
                let _ = self.lc_uuid.set(uuid);
            }
            Err(Error::InvalidArgument(_)) => {
                tracing::debug!(route = %self.route, "no link controller capability");
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn unlink(&self, hop: u8, child: &Arc<Self>) {
        let mut children = self.children.lock();
        if let Some(slot) = children.get_mut(usize::from(hop)) {
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, child)) {
                *slot = None;
            }
        }
    }

    /// The router's route.
    pub fn route(&self) -> Route {
        self.route
    }

    /// The router's depth. The root is at depth 0.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The configuration block read at attach time.
    pub fn info(&self) -> Option<&RouterInfo> {
        self.info.get()
    }

    /// The link controller UUID, if the router has a link controller
    /// capability.
    pub fn uuid(&self) -> Option<u128> {
        self.lc_uuid.get().copied()
    }

    /// The parent router. `None` for the root.
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.upgrade()
    }

    /// The child reached through adapter `hop`.
    pub fn child(&self, hop: u8) -> Option<Arc<Self>> {
        self.children.lock().get(usize::from(hop))?.clone()
    }

    /// All attached children.
    pub fn children(&self) -> Vec<Arc<Self>> {
        self.children.lock().iter().flatten().cloned().collect()
    }

    pub(crate) fn max_adapter(&self) -> u8 {
        self.info.get().map_or(0, |info| info.max_adapter)
    }

    pub(crate) fn config(&self) -> &DomainConfig {
        &self.domain.config
    }

    pub(crate) fn ring(&self) -> &dyn TbRing {
        self.domain.ring.as_ref()
    }
}

impl fmt::Debug for RouterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterNode")
            .field("route", &self.route)
            .field("depth", &self.depth)
            .field("info", &self.info.get())
            .finish()
    }
}
