// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capability list walking.
//!
//! Router space capabilities all use the vendor-specific layout: a header
//! dword with next pointer, ID, subtype and length, and for the extended
//! format (length zero) a second dword holding a wider next pointer and
//! length. Adapter space capabilities use the plain header unless their ID
//! is [`CapabilityId::VSC`].

use crate::Error;
use crate::RouterNode;
use std::collections::HashSet;
use std::sync::Arc;
use tb_spec::ConfigSpace;
use tb_spec::adapter_cs;
use tb_spec::caps::CapHeader;
use tb_spec::caps::LC_UUID_DWORDS;
use tb_spec::caps::LC_UUID_OFFSET;
use tb_spec::caps::MAX_CAP_OFFSET;
use tb_spec::caps::VsecLongHeader;
use tb_spec::router_cs;

pub use tb_spec::caps::CapabilityId;
pub use tb_spec::caps::VsecId;

/// A position in a capability list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Capability {
    /// The space holding the list.
    pub space: ConfigSpace,
    /// The adapter, for adapter space lists.
    pub adapter: u8,
    /// Dword offset of this capability. Zero before the first one.
    pub offset: u16,
    /// The capability ID.
    pub cap_id: CapabilityId,
    /// The vendor subtype, for vendor-specific capabilities.
    pub vsec_id: Option<VsecId>,
    /// True for the extended vendor-specific format.
    pub extended: bool,
    /// Length in dwords, for vendor-specific capabilities.
    pub length: u16,
    /// Offset of the next capability, zero at the end of the list.
    pub next: u16,
}

impl Capability {
    /// A cursor positioned before the capability at `first`.
    pub fn start(space: ConfigSpace, adapter: u8, first: u16) -> Self {
        Self {
            space,
            adapter,
            offset: 0,
            cap_id: CapabilityId(0),
            vsec_id: None,
            extended: false,
            length: 0,
            next: first,
        }
    }
}

impl RouterNode {
    /// Reads the capability that follows `cap`.
    ///
    /// Fails with [`Error::InvalidArgument`] at the end of the list or if
    /// the next pointer is out of range.
    pub fn next_cap(self: &Arc<Self>, cap: &Capability) -> Result<Capability, Error> {
        let offset = cap.next;
        if offset == 0 {
            return Err(Error::InvalidArgument("end of capability list"));
        }
        if offset > MAX_CAP_OFFSET {
            return Err(Error::InvalidArgument("capability offset out of range"));
        }

        let header = CapHeader::from_bits(self.read(cap.space, cap.adapter, offset, 1)?[0]);
        let cap_id = CapabilityId(header.cap_id());
        let mut next = Capability {
            space: cap.space,
            adapter: cap.adapter,
            offset,
            cap_id,
            vsec_id: None,
            extended: false,
            length: 0,
            next: header.next().into(),
        };

        if cap.space == ConfigSpace::ROUTER || cap_id == CapabilityId::VSC {
            let words = self.read(cap.space, cap.adapter, offset, 2)?;
            let header = CapHeader::from_bits(words[0]);
            next.vsec_id = Some(VsecId(header.vsec_id()));
            if header.length() != 0 {
                next.length = header.length().into();
            } else {
                let long = VsecLongHeader::from_bits(words[1]);
                next.extended = true;
                next.next = long.next();
                next.length = long.length();
            }
        }
        Ok(next)
    }

    /// Walks the list starting after `start` until `matches` accepts a
    /// capability.
    fn find_cap_by(
        self: &Arc<Self>,
        start: Capability,
        mut matches: impl FnMut(&Capability) -> bool,
    ) -> Result<Capability, Error> {
        let mut visited = HashSet::new();
        let mut cap = start;
        loop {
            if !visited.insert(cap.next) {
                tracelimit::warn_ratelimited!(
                    route = %self.route(),
                    space = ?cap.space,
                    offset = cap.next,
                    "capability list loops"
                );
                return Err(Error::InvalidArgument("capability list loops"));
            }
            cap = self.next_cap(&cap)?;
            if matches(&cap) {
                return Ok(cap);
            }
        }
    }

    /// Finds the capability with ID `cap_id`, and for vendor-specific
    /// capabilities subtype `vsec_id` if given, following `start`.
    pub fn find_cap(
        self: &Arc<Self>,
        start: Capability,
        cap_id: CapabilityId,
        vsec_id: Option<VsecId>,
    ) -> Result<Capability, Error> {
        self.find_cap_by(start, |cap| {
            cap.cap_id == cap_id && vsec_id.is_none_or(|id| cap.vsec_id == Some(id))
        })
    }

    fn router_caps(self: &Arc<Self>) -> Result<Capability, Error> {
        let cs1 = self.read(ConfigSpace::ROUTER, 0, router_cs::ROUTER_CS_1, 1)?[0];
        let first = router_cs::RouterCs1::from_bits(cs1).next_cap();
        Ok(Capability::start(ConfigSpace::ROUTER, 0, first.into()))
    }

    /// Finds a router space capability.
    pub fn find_router_cap(self: &Arc<Self>, cap_id: CapabilityId) -> Result<Capability, Error> {
        let start = self.router_caps()?;
        self.find_cap(start, cap_id, None)
    }

    /// Finds a short-format vendor-specific router capability.
    pub fn find_router_vsc(self: &Arc<Self>, vsec_id: VsecId) -> Result<Capability, Error> {
        let start = self.router_caps()?;
        self.find_cap_by(start, |cap| {
            cap.cap_id == CapabilityId::VSC && cap.vsec_id == Some(vsec_id) && !cap.extended
        })
    }

    /// Finds an extended vendor-specific router capability.
    pub fn find_router_vsec(self: &Arc<Self>, vsec_id: VsecId) -> Result<Capability, Error> {
        let start = self.router_caps()?;
        self.find_cap_by(start, |cap| {
            cap.cap_id == CapabilityId::VSC && cap.vsec_id == Some(vsec_id) && cap.extended
        })
    }

    /// Finds a capability of `adapter`.
    pub fn find_adapter_cap(
        self: &Arc<Self>,
        adapter: u8,
        cap_id: CapabilityId,
        vsec_id: Option<VsecId>,
    ) -> Result<Capability, Error> {
        let cs1 = self.read(ConfigSpace::ADAPTER, adapter, adapter_cs::ADP_CS_1, 1)?[0];
        let first = adapter_cs::AdapterCs1::from_bits(cs1).next_cap();
        self.find_cap(
            Capability::start(ConfigSpace::ADAPTER, adapter, first.into()),
            cap_id,
            vsec_id,
        )
    }

    /// Reads the UUID from the link controller capability.
    pub fn get_lc_uuid(self: &Arc<Self>) -> Result<u128, Error> {
        let cap = self.find_router_vsec(VsecId::LINK_CONTROLLER)?;
        let words = self.read(
            ConfigSpace::ROUTER,
            0,
            cap.offset + LC_UUID_OFFSET,
            LC_UUID_DWORDS,
        )?;
        Ok(words
            .iter()
            .rev()
            .fold(0, |uuid, &word| (uuid << 32) | u128::from(word)))
    }
}
