// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory ring that answers config requests from emulated routers.

use crate::DomainConfig;
use crate::ring::FrameHandler;
use crate::ring::RingError;
use crate::ring::TbRing;
use crate::ring::TxFrame;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tb_spec::AddrAttrs;
use tb_spec::CfgHeader;
use tb_spec::ConfigSpace;
use tb_spec::EventAdapter;
use tb_spec::NotifyCode;
use tb_spec::NotifyHeader;
use tb_spec::Pdf;
use tb_spec::Route;
use tb_spec::adapter_cs;
use tb_spec::caps::CapHeader;
use tb_spec::caps::CapabilityId;
use tb_spec::caps::VsecId;
use tb_spec::caps::VsecLongHeader;
use tb_spec::router_cs;
use zerocopy::IntoBytes;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> DomainConfig {
    DomainConfig::default()
        .with_retries(2)
        .with_timeout(Duration::from_millis(50))
        .with_poll_interval(Duration::from_millis(5))
}

/// A read or write response as a router would send it.
pub fn response_frame(route: Route, attrs: AddrAttrs, data: &[u32]) -> Vec<u8> {
    let mut header = CfgHeader::new(route, attrs);
    header.route_hi = (route.hi() | Route::VALID).into();
    tb_spec::build_frame(&header, data)
}

pub fn notify_frame(route: Route, code: NotifyCode, adapter: u8) -> Vec<u8> {
    let header = NotifyHeader {
        route_hi: (route.hi() | Route::VALID).into(),
        route_lo: route.lo().into(),
        event_adap: EventAdapter::new()
            .with_code(code.0)
            .with_adapter(adapter)
            .into_bits()
            .into(),
    };
    let mut frame = header.as_bytes().to_vec();
    let crc = tb_spec::frame_crc(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Configuration registers of one emulated router. Unset registers read as
/// zero.
pub struct MockRouter {
    regs: HashMap<(ConfigSpace, u8, u16), u32>,
    last_router_cap: Option<(u16, bool)>,
    last_adapter_cap: HashMap<u8, u16>,
}

impl MockRouter {
    pub const VENDOR_ID: u16 = 0x8086;
    pub const PRODUCT_ID: u16 = 0x15ef;

    pub fn new(max_adapter: u8, depth: u8) -> Self {
        let mut this = Self {
            regs: HashMap::new(),
            last_router_cap: None,
            last_adapter_cap: HashMap::new(),
        };
        this.set(
            ConfigSpace::ROUTER,
            0,
            router_cs::ROUTER_CS_0,
            router_cs::RouterCs0::new()
                .with_vendor_id(Self::VENDOR_ID)
                .with_product_id(Self::PRODUCT_ID)
                .into_bits(),
        );
        this.set(
            ConfigSpace::ROUTER,
            0,
            router_cs::ROUTER_CS_1,
            router_cs::RouterCs1::new()
                .with_upstream_adapter(1)
                .with_max_adapter(max_adapter)
                .with_depth(depth)
                .with_revision(1)
                .into_bits(),
        );
        this
    }

    pub fn uuid_for(route: Route) -> u64 {
        0x5a5a_0000_0000_0000 | route.0
    }

    fn key(space: ConfigSpace, adapter: u8, offset: u16) -> (ConfigSpace, u8, u16) {
        // Router space has no adapter index.
        let adapter = if space == ConfigSpace::ROUTER { 0 } else { adapter };
        (space, adapter, offset)
    }

    pub fn set(&mut self, space: ConfigSpace, adapter: u8, offset: u16, value: u32) {
        self.regs.insert(Self::key(space, adapter, offset), value);
    }

    pub fn get(&self, space: ConfigSpace, adapter: u8, offset: u16) -> u32 {
        self.regs
            .get(&Self::key(space, adapter, offset))
            .copied()
            .unwrap_or(0)
    }

    fn update(
        &mut self,
        space: ConfigSpace,
        adapter: u8,
        offset: u16,
        f: impl FnOnce(u32) -> u32,
    ) {
        let value = f(self.get(space, adapter, offset));
        self.set(space, adapter, offset, value);
    }

    /// Appends a vendor-specific capability to the router space list.
    pub fn add_router_vsec(&mut self, offset: u16, vsec_id: VsecId, length: u16, extended: bool) {
        let space = ConfigSpace::ROUTER;
        let header = CapHeader::new()
            .with_cap_id(CapabilityId::VSC.0)
            .with_vsec_id(vsec_id.0);
        if extended {
            self.set(space, 0, offset, header.into_bits());
            self.set(
                space,
                0,
                offset + 1,
                VsecLongHeader::new().with_length(length).into_bits(),
            );
        } else {
            self.set(space, 0, offset, header.with_length(length as u8).into_bits());
        }
        match self.last_router_cap.replace((offset, extended)) {
            None => self.update(space, 0, router_cs::ROUTER_CS_1, |v| {
                router_cs::RouterCs1::from_bits(v)
                    .with_next_cap(offset as u8)
                    .into_bits()
            }),
            Some((prev, true)) => self.set_vsec_next(prev, offset),
            Some((prev, false)) => self.update(space, 0, prev, |v| {
                CapHeader::from_bits(v).with_next(offset as u8).into_bits()
            }),
        }
    }

    /// Sets the next pointer of the extended capability at `offset`.
    pub fn set_vsec_next(&mut self, offset: u16, next: u16) {
        self.update(ConfigSpace::ROUTER, 0, offset + 1, |v| {
            VsecLongHeader::from_bits(v).with_next(next).into_bits()
        });
    }

    fn push_adapter_cap(&mut self, adapter: u8, offset: u16, header: CapHeader) {
        self.set(ConfigSpace::ADAPTER, adapter, offset, header.into_bits());
        match self.last_adapter_cap.insert(adapter, offset) {
            None => self.update(ConfigSpace::ADAPTER, adapter, adapter_cs::ADP_CS_1, |v| {
                adapter_cs::AdapterCs1::from_bits(v)
                    .with_next_cap(offset as u8)
                    .into_bits()
            }),
            Some(prev) => self.link_adapter_cap(adapter, prev, offset),
        }
    }

    /// Appends a capability to an adapter's list.
    pub fn add_adapter_cap(&mut self, adapter: u8, offset: u16, cap_id: CapabilityId) {
        self.push_adapter_cap(adapter, offset, CapHeader::new().with_cap_id(cap_id.0));
    }

    /// Appends a short vendor-specific capability to an adapter's list.
    pub fn add_adapter_vsc(&mut self, adapter: u8, offset: u16, vsec_id: VsecId, length: u8) {
        self.push_adapter_cap(
            adapter,
            offset,
            CapHeader::new()
                .with_cap_id(CapabilityId::VSC.0)
                .with_vsec_id(vsec_id.0)
                .with_length(length),
        );
    }

    /// Points the adapter capability at `from` to `to`.
    pub fn link_adapter_cap(&mut self, adapter: u8, from: u16, to: u16) {
        self.update(ConfigSpace::ADAPTER, adapter, from, |v| {
            CapHeader::from_bits(v).with_next(to as u8).into_bits()
        });
    }

    /// Applies a request frame and returns the frame the router answers
    /// with.
    fn execute(&mut self, pdf: Pdf, header: &CfgHeader, payload: &[u8]) -> (Pdf, Vec<u8>) {
        let attrs = header.attrs();
        let space = attrs.config_space();
        let adapter = attrs.adapter();
        let offset = attrs.offset();
        if pdf == Pdf::WRITE {
            for (i, value) in tb_spec::payload_dwords(payload).enumerate() {
                self.set(space, adapter, offset + i as u16, value);
            }
            (pdf, response_frame(header.route(), attrs, &[]))
        } else {
            let data = (0..u16::from(attrs.size()))
                .map(|i| self.get(space, adapter, offset + i))
                .collect::<Vec<_>>();
            (pdf, response_frame(header.route(), attrs, &data))
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Complete each frame from within `submit`.
    Inline,
    /// Hold frames until `deliver_one`, `deliver_all` or `poll`.
    Defer,
    /// Complete transmission but never respond.
    Drop,
}

struct Delivery {
    frame: TxFrame,
    rx: Vec<(Pdf, Vec<u8>)>,
}

struct MockState {
    routers: HashMap<Route, MockRouter>,
    mode: Mode,
    rx_first: bool,
    busy: usize,
    fail: usize,
    drop_next: usize,
    corrupt_next: usize,
    notify_next: Option<NotifyCode>,
    submitted: usize,
    pending: VecDeque<Delivery>,
    last_response: Option<(Pdf, Vec<u8>)>,
}

pub struct MockRing {
    state: Mutex<MockState>,
    handlers: Mutex<HashMap<Pdf, Weak<dyn FrameHandler>>>,
    polls: AtomicUsize,
}

impl MockRing {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                routers: HashMap::new(),
                mode: Mode::Inline,
                rx_first: false,
                busy: 0,
                fail: 0,
                drop_next: 0,
                corrupt_next: 0,
                notify_next: None,
                submitted: 0,
                pending: VecDeque::new(),
                last_response: None,
            }),
            handlers: Mutex::new(HashMap::new()),
            polls: AtomicUsize::new(0),
        })
    }

    pub fn add_router(&self, route: Route, mut router: MockRouter) {
        let uuid = MockRouter::uuid_for(route);
        router.set(ConfigSpace::ROUTER, 0, router_cs::ROUTER_CS_7, uuid as u32);
        router.set(
            ConfigSpace::ROUTER,
            0,
            router_cs::ROUTER_CS_8,
            (uuid >> 32) as u32,
        );
        self.state.lock().routers.insert(route, router);
    }

    pub fn get(&self, route: Route, space: ConfigSpace, adapter: u8, offset: u16) -> u32 {
        self.state
            .lock()
            .routers
            .get(&route)
            .map_or(0, |r| r.get(space, adapter, offset))
    }

    pub fn set_mode(&self, mode: Mode) {
        self.state.lock().mode = mode;
    }

    pub fn set_rx_first(&self, rx_first: bool) {
        self.state.lock().rx_first = rx_first;
    }

    /// Refuses the next `n` submissions as busy.
    pub fn set_busy(&self, n: usize) {
        self.state.lock().busy = n;
    }

    /// Fails the next `n` submissions.
    pub fn set_fail(&self, n: usize) {
        self.state.lock().fail = n;
    }

    /// Swallows the responses to the next `n` submissions.
    pub fn drop_next(&self, n: usize) {
        self.state.lock().drop_next = n;
    }

    /// Corrupts the CRC of the next `n` responses.
    pub fn corrupt_next(&self, n: usize) {
        self.state.lock().corrupt_next = n;
    }

    /// Sends an error notification ahead of the next response.
    pub fn notify_before_response(&self, code: NotifyCode) {
        self.state.lock().notify_next = Some(code);
    }

    /// Accepted submissions so far.
    pub fn submitted(&self) -> usize {
        self.state.lock().submitted
    }

    /// Deferred frames not yet delivered.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn handler(&self, pdf: Pdf) -> Option<Arc<dyn FrameHandler>> {
        self.handlers.lock().get(&pdf)?.upgrade()
    }

    pub fn deliver_one(&self) -> bool {
        let delivery = self.state.lock().pending.pop_front();
        match delivery {
            Some(delivery) => {
                self.deliver(delivery);
                true
            }
            None => false,
        }
    }

    pub fn deliver_all(&self) {
        while self.deliver_one() {}
    }

    /// Sends the most recent response again.
    pub fn replay_last_response(&self) {
        let last = self.state.lock().last_response.clone();
        if let Some((pdf, frame)) = last {
            if let Some(handler) = self.handler(pdf) {
                handler.rx_frame(pdf, &frame);
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let rx_first = self.state.lock().rx_first;
        let tx = || {
            if let Some(handler) = self.handler(delivery.frame.pdf()) {
                handler.tx_complete(&delivery.frame);
            }
        };
        if !rx_first {
            tx();
        }
        for (pdf, frame) in &delivery.rx {
            if *pdf != Pdf::NOTIFY {
                self.state.lock().last_response = Some((*pdf, frame.clone()));
            }
            if let Some(handler) = self.handler(*pdf) {
                handler.rx_frame(*pdf, frame);
            }
        }
        if rx_first {
            tx();
        }
    }
}

impl TbRing for MockRing {
    fn submit(&self, frame: TxFrame) -> Result<(), RingError> {
        let delivery = {
            let mut state = self.state.lock();
            if state.busy > 0 {
                state.busy -= 1;
                return Err(RingError::Busy);
            }
            if state.fail > 0 {
                state.fail -= 1;
                return Err(RingError::Io(std::io::Error::other("injected failure")));
            }
            state.submitted += 1;

            let route = frame.route();
            let mut rx = Vec::new();
            if let Some(code) = state.notify_next.take() {
                rx.push((Pdf::NOTIFY, notify_frame(route, code, 0)));
            }
            let dropped = state.mode == Mode::Drop || {
                let drop = state.drop_next > 0;
                state.drop_next = state.drop_next.saturating_sub(1);
                drop
            };
            if !dropped {
                let (header, payload) = tb_spec::parse_cfg_frame(frame.data())
                    .expect("request frames are well formed");
                let response = state
                    .routers
                    .get_mut(&header.route())
                    .map(|router| router.execute(frame.pdf(), &header, payload));
                match response {
                    Some((pdf, mut bytes)) => {
                        if state.corrupt_next > 0 {
                            state.corrupt_next -= 1;
                            let last = bytes.len() - 1;
                            bytes[last] ^= 0xff;
                        }
                        rx.push((pdf, bytes));
                    }
                    None => rx.push((Pdf::NOTIFY, notify_frame(route, NotifyCode::ERR_ADDR, 0))),
                }
            }

            let delivery = Delivery { frame, rx };
            if state.mode == Mode::Defer {
                state.pending.push_back(delivery);
                return Ok(());
            }
            delivery
        };
        self.deliver(delivery);
        Ok(())
    }

    fn register_handler(&self, pdf: Pdf, handler: Weak<dyn FrameHandler>) {
        self.handlers.lock().insert(pdf, handler);
    }

    fn poll(&self) {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.deliver_all();
    }
}
