// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thunderbolt / USB4 control channel definitions.
//!
//! Routes, configuration read/write request and response frames, notification
//! frames, and the router and adapter configuration space words needed to
//! enumerate a router and walk its capability lists.
//!
//! All multi-byte fields are big-endian on the wire. Every frame ends with a
//! CRC32 trailer computed over all preceding bytes.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use std::fmt;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::big_endian::U32;

/// Maximum size of a control frame in bytes, CRC trailer included.
pub const MAX_FRAME_SIZE: usize = 256;

/// Size of the CRC trailer in bytes.
pub const CRC_SIZE: usize = 4;

/// Maximum number of data dwords carried by one read or write.
pub const MAX_DWORDS: usize = (MAX_FRAME_SIZE - size_of::<CfgHeader>() - CRC_SIZE) / 4;

// The size field of `AddrAttrs` is 6 bits wide.
static_assertions::const_assert!(MAX_DWORDS < 1 << 6);

/// Highest dword offset addressable by [`AddrAttrs::offset`].
pub const MAX_OFFSET: u16 = (1 << 13) - 1;

/// Highest adapter number addressable by [`AddrAttrs::adapter`].
pub const MAX_ADAPTER: u8 = (1 << 6) - 1;

/// A router's position in the topology.
///
/// One hop byte per depth level: the hop taken from the router at depth `d`
/// is stored in byte `d`. The domain root is at depth 0 and has route
/// [`Route::ROOT`]. Hop 0 is the host interface adapter and only appears at
/// depth 0.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route(pub u64);

impl Route {
    /// The domain root.
    pub const ROOT: Self = Self(0);
    /// The number of hop bytes a route can hold.
    pub const MAX_HOPS: u8 = 8;
    /// Set by hardware in `route_hi` of received frames. Not part of the route.
    pub const VALID: u32 = 1 << 31;

    const HOP_BITS: u32 = 8;

    /// Builds a route from its two halves.
    pub const fn new(hi: u32, lo: u32) -> Self {
        Self(((hi as u64) << 32) | lo as u64)
    }

    /// Builds a route from the halves of a received frame header, stripping
    /// the valid-route marker.
    pub const fn from_wire(hi: u32, lo: u32) -> Self {
        Self::new(hi & !Self::VALID, lo)
    }

    /// The upper 32 bits.
    pub const fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The lower 32 bits.
    pub const fn lo(self) -> u32 {
        self.0 as u32
    }

    /// The hop taken from the router at `depth`.
    pub const fn hop_at(self, depth: u8) -> u8 {
        if depth >= Self::MAX_HOPS {
            return 0;
        }
        (self.0 >> (depth as u32 * Self::HOP_BITS)) as u8
    }

    /// The route of the router reached by taking `hop` from the router at
    /// this route and depth `parent_depth`.
    pub const fn child(self, parent_depth: u8, hop: u8) -> Self {
        if parent_depth >= Self::MAX_HOPS {
            return self;
        }
        let shift = parent_depth as u32 * Self::HOP_BITS;
        Self((self.0 & !(0xff_u64 << shift)) | ((hop as u64) << shift))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({:#x})", self.0)
    }
}

open_enum::open_enum! {
    /// Protocol data flow tag. Selects the frame class at the ring dispatch
    /// layer.
    pub enum Pdf: u8 {
        #![expect(missing_docs)] // self explanatory variants
        READ = 1,
        WRITE = 2,
        NOTIFY = 3,
    }
}

open_enum::open_enum! {
    /// Configuration space selector carried in [`AddrAttrs::space`].
    pub enum ConfigSpace: u8 {
        #![expect(missing_docs)] // self explanatory variants
        PATH = 0,
        ADAPTER = 1,
        ROUTER = 2,
        COUNTERS = 3,
    }
}

/// Address attributes of a configuration read or write.
///
/// | Bits  | Field   |
/// |-------|---------|
/// | 0-12  | offset  |
/// | 13-18 | size    |
/// | 19-24 | adapter |
/// | 25-26 | space   |
/// | 27-28 | seq     |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct AddrAttrs {
    /// Dword offset into the selected space.
    #[bits(13)]
    pub offset: u16,
    /// Number of dwords.
    #[bits(6)]
    pub size: u8,
    /// Adapter number, for adapter and path spaces.
    #[bits(6)]
    pub adapter: u8,
    /// The [`ConfigSpace`].
    #[bits(2)]
    pub space: u8,
    /// Sequence number. Echoed by the router.
    #[bits(2)]
    pub seq: u8,
    #[bits(3)]
    _reserved: u8,
}

impl AddrAttrs {
    /// The configuration space as a typed value.
    pub fn config_space(&self) -> ConfigSpace {
        ConfigSpace(self.space())
    }

    /// Returns true if `other` addresses the same registers.
    pub fn same_target(&self, other: &Self) -> bool {
        self.space() == other.space()
            && self.adapter() == other.adapter()
            && self.offset() == other.offset()
    }
}

/// Header shared by read and write requests and their responses.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct CfgHeader {
    /// Upper route half. Bit 31 is the valid-route marker in received frames.
    pub route_hi: U32,
    /// Lower route half.
    pub route_lo: U32,
    /// Packed [`AddrAttrs`].
    pub addr_attrs: U32,
}

static_assertions::const_assert_eq!(size_of::<CfgHeader>(), 12);

impl CfgHeader {
    /// Builds a request header.
    pub fn new(route: Route, attrs: AddrAttrs) -> Self {
        Self {
            route_hi: route.hi().into(),
            route_lo: route.lo().into(),
            addr_attrs: attrs.into_bits().into(),
        }
    }

    /// The route, with the valid-route marker stripped.
    pub fn route(&self) -> Route {
        Route::from_wire(self.route_hi.get(), self.route_lo.get())
    }

    /// The unpacked address attributes.
    pub fn attrs(&self) -> AddrAttrs {
        AddrAttrs::from_bits(self.addr_attrs.get())
    }
}

open_enum::open_enum! {
    /// Event codes carried by notification frames.
    pub enum NotifyCode: u8 {
        /// Connection error.
        ERR_CONN = 0x00,
        /// Link error.
        ERR_LINK = 0x01,
        /// Addressing error.
        ERR_ADDR = 0x02,
        /// Adapter error.
        ERR_ADP = 0x04,
        /// Hot-plug acknowledgement.
        HP_ACK = 0x07,
        /// Enumeration error.
        ERR_ENUM = 0x08,
        /// No such unit.
        ERR_NUA = 0x09,
        /// Length error.
        ERR_LEN = 0x0b,
        /// Header CRC error.
        ERR_HEC = 0x0c,
        /// Flow control error.
        ERR_FC = 0x0d,
        /// Hot-plug error.
        ERR_PLUG = 0x0e,
        /// Lock error.
        ERR_LOCK = 0x0f,
        /// DisplayPort bandwidth change.
        DP_BW = 0x20,
    }
}

impl NotifyCode {
    /// Returns true if the event terminates the router's outstanding
    /// configuration transaction.
    pub fn aborts_transaction(&self) -> bool {
        matches!(
            *self,
            Self::ERR_CONN
                | Self::ERR_LINK
                | Self::ERR_ADDR
                | Self::ERR_ADP
                | Self::ERR_ENUM
                | Self::ERR_NUA
                | Self::ERR_LEN
                | Self::ERR_HEC
                | Self::ERR_FC
                | Self::ERR_PLUG
                | Self::ERR_LOCK
                | Self::HP_ACK
        )
    }
}

open_enum::open_enum! {
    /// Plug state reported in [`EventAdapter::plug`].
    pub enum PlugEvent: u8 {
        #![expect(missing_docs)] // self explanatory variants
        NONE = 0,
        PLUG = 2,
        UNPLUG = 3,
    }
}

/// The `event_adap` word of a notification frame.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EventAdapter {
    /// The raw [`NotifyCode`].
    pub code: u8,
    /// The adapter the event refers to.
    #[bits(6)]
    pub adapter: u8,
    #[bits(16)]
    _reserved: u16,
    /// The raw [`PlugEvent`].
    #[bits(2)]
    pub plug: u8,
}

/// Notification frame body, without the CRC trailer.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct NotifyHeader {
    /// Upper route half. Bit 31 is the valid-route marker.
    pub route_hi: U32,
    /// Lower route half.
    pub route_lo: U32,
    /// Packed [`EventAdapter`].
    pub event_adap: U32,
}

static_assertions::const_assert_eq!(size_of::<NotifyHeader>(), 12);

impl NotifyHeader {
    /// The route, with the valid-route marker stripped.
    pub fn route(&self) -> Route {
        Route::from_wire(self.route_hi.get(), self.route_lo.get())
    }

    /// The unpacked event word.
    pub fn event(&self) -> EventAdapter {
        EventAdapter::from_bits(self.event_adap.get())
    }
}

/// An error parsing a received frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame cannot hold a header and a CRC trailer.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    /// The payload is not a whole number of dwords.
    #[error("frame payload is not dword aligned: {0} bytes")]
    Unaligned(usize),
    /// The CRC trailer does not match the frame contents.
    #[error("crc mismatch: frame has {found:#010x}, computed {computed:#010x}")]
    Crc {
        /// The trailer value.
        found: u32,
        /// The CRC of the frame contents.
        computed: u32,
    },
}

/// Computes the trailer CRC (CRC-32C, Castagnoli) over `bytes`.
pub fn frame_crc(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// Serializes a request header and its data dwords, and appends the CRC.
pub fn build_frame(header: &CfgHeader, data: &[u32]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(size_of::<CfgHeader>() + data.len() * 4 + CRC_SIZE);
    frame.extend_from_slice(header.as_bytes());
    for dword in data {
        frame.extend_from_slice(&dword.to_be_bytes());
    }
    let crc = frame_crc(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Verifies the CRC trailer and returns the bytes it covers.
pub fn check_crc(frame: &[u8]) -> Result<&[u8], FrameError> {
    let Some(body_len) = frame.len().checked_sub(CRC_SIZE) else {
        return Err(FrameError::TooShort(frame.len()));
    };
    let (body, trailer) = frame.split_at(body_len);
    let found = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = frame_crc(body);
    if found != computed {
        return Err(FrameError::Crc { found, computed });
    }
    Ok(body)
}

/// Parses a read/write frame: verifies the CRC and splits off the header.
/// Returns the header and the payload bytes between header and trailer.
pub fn parse_cfg_frame(frame: &[u8]) -> Result<(CfgHeader, &[u8]), FrameError> {
    if frame.len() < size_of::<CfgHeader>() + CRC_SIZE {
        return Err(FrameError::TooShort(frame.len()));
    }
    let body = check_crc(frame)?;
    let (header, payload) =
        CfgHeader::read_from_prefix(body).map_err(|_| FrameError::TooShort(frame.len()))?;
    if payload.len() % 4 != 0 {
        return Err(FrameError::Unaligned(payload.len()));
    }
    Ok((header, payload))
}

/// Parses a notification frame.
pub fn parse_notify_frame(frame: &[u8]) -> Result<NotifyHeader, FrameError> {
    if frame.len() < size_of::<NotifyHeader>() + CRC_SIZE {
        return Err(FrameError::TooShort(frame.len()));
    }
    let body = check_crc(frame)?;
    let (header, _) =
        NotifyHeader::read_from_prefix(body).map_err(|_| FrameError::TooShort(frame.len()))?;
    Ok(header)
}

/// Converts wire-order payload bytes to dwords.
pub fn payload_dwords(payload: &[u8]) -> impl Iterator<Item = u32> + '_ {
    payload
        .chunks_exact(4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Router configuration space.
pub mod router_cs {
    use bitfield_struct::bitfield;

    /// Vendor and product IDs.
    pub const ROUTER_CS_0: u16 = 0;
    /// Capability pointer, adapter count, depth, revision.
    pub const ROUTER_CS_1: u16 = 1;
    /// Topology ID, low half.
    pub const ROUTER_CS_2: u16 = 2;
    /// Topology ID, high half.
    pub const ROUTER_CS_3: u16 = 3;
    /// Notification timeout and versions.
    pub const ROUTER_CS_4: u16 = 4;
    /// Router UUID, low half.
    pub const ROUTER_CS_7: u16 = 7;
    /// Router UUID, high half.
    pub const ROUTER_CS_8: u16 = 8;

    /// Number of dwords in the basic router configuration block.
    pub const ROUTER_CS_LEN: usize = 9;

    /// `ROUTER_CS_0`.
    #[bitfield(u32)]
    pub struct RouterCs0 {
        /// Vendor ID.
        pub vendor_id: u16,
        /// Product ID.
        pub product_id: u16,
    }

    /// `ROUTER_CS_1`.
    #[bitfield(u32)]
    pub struct RouterCs1 {
        /// Offset of the first router capability.
        pub next_cap: u8,
        /// Adapter facing the parent.
        #[bits(6)]
        pub upstream_adapter: u8,
        /// Highest adapter number.
        #[bits(6)]
        pub max_adapter: u8,
        /// Depth in the topology.
        #[bits(3)]
        pub depth: u8,
        #[bits(1)]
        _reserved: u8,
        /// Revision ID.
        pub revision: u8,
    }
}

/// Adapter configuration space.
pub mod adapter_cs {
    use bitfield_struct::bitfield;

    /// Vendor and product IDs.
    pub const ADP_CS_0: u16 = 0;
    /// Capability pointer.
    pub const ADP_CS_1: u16 = 1;

    /// `ADP_CS_1`.
    #[bitfield(u32)]
    pub struct AdapterCs1 {
        /// Offset of the first adapter capability.
        pub next_cap: u8,
        #[bits(24)]
        _reserved: u32,
    }
}

/// Capability lists.
///
/// Router and adapter spaces each hold a linked list of capabilities,
/// starting at the pointer in `ROUTER_CS_1` / `ADP_CS_1`. Router space
/// capabilities and adapter vendor-specific capabilities carry a vendor
/// subtype and a length; a zero length marks the extended format, whose next
/// pointer and length live in the second dword.
pub mod caps {
    use bitfield_struct::bitfield;

    /// Capabilities must start below this offset. Walks stop past it.
    pub const MAX_CAP_OFFSET: u16 = 0xfff;

    open_enum::open_enum! {
        /// Capability IDs.
        pub enum CapabilityId: u8 {
            /// Lane adapter.
            LANE = 0x01,
            /// Time management unit.
            TMU = 0x03,
            /// Protocol adapter (PCIe, DisplayPort, USB3).
            PROTOCOL_ADAPTER = 0x04,
            /// Vendor specific.
            VSC = 0x05,
            /// USB4 port.
            USB4_PORT = 0x06,
        }
    }

    open_enum::open_enum! {
        /// Vendor-specific capability subtypes.
        pub enum VsecId: u8 {
            /// Plug events, also the EEPROM interface.
            PLUG_EVENTS = 0x01,
            /// Second time management block.
            TIME2 = 0x03,
            /// CP / LP control.
            CP_LP = 0x04,
            /// Link controller.
            LINK_CONTROLLER = 0x06,
        }
    }

    /// Dword offset of the UUID within the link controller capability.
    pub const LC_UUID_OFFSET: u16 = 0x03;
    /// Length of the link controller UUID in dwords.
    pub const LC_UUID_DWORDS: usize = 4;

    /// First dword of every capability.
    #[bitfield(u32)]
    pub struct CapHeader {
        /// Offset of the next capability, zero at the end of the list.
        pub next: u8,
        /// The raw [`CapabilityId`].
        pub cap_id: u8,
        /// The raw [`VsecId`], vendor-specific capabilities only.
        pub vsec_id: u8,
        /// Length in dwords; zero selects the extended format.
        pub length: u8,
    }

    /// Second dword of an extended vendor-specific capability.
    #[bitfield(u32)]
    pub struct VsecLongHeader {
        /// Offset of the next capability.
        pub next: u16,
        /// Length in dwords.
        #[bits(12)]
        pub length: u16,
        #[bits(4)]
        _reserved: u8,
    }
}
