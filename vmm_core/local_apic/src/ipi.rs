// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt routing: destination matching, IPIs sent through ICR, bus and
//! MSI delivery, and the LINT0/LINT1 pins.

use crate::ApicEvent;
use crate::ApicPlatform;
use crate::GlobalState;
use crate::LocalApic;
use crate::LocalApicSet;
use crate::PrivilegeRequired;
use crate::SharedState;
use crate::StartRequest;
use crate::VpIndex;
use crate::WorkFlags;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use x86defs::apic::ApicRegister;
use x86defs::apic::DeliveryMode;
use x86defs::apic::DestinationShorthand;
use x86defs::apic::Dfr;
use x86defs::apic::Esr;
use x86defs::apic::Icr;
use x86defs::apic::Lvt;
use x86defs::apic::X2ApicLogicalId;
use x86defs::apic::XApicClusterLogicalId;
use x86defs::apic::APIC_ILLEGAL_VECTOR_END;
use x86defs::apic::X2APIC_BROADCAST_DESTINATION;
use x86defs::apic::XAPIC_BROADCAST_DESTINATION;
use x86defs::msi::MsiAddress;
use x86defs::msi::MsiData;

/// The trigger mode of an interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerMode {
    /// Edge triggered.
    Edge,
    /// Level triggered.
    Level,
}

impl TriggerMode {
    /// Returns the trigger mode for a trigger-mode bit.
    pub fn from_level(level: bool) -> Self {
        if level {
            Self::Level
        } else {
            Self::Edge
        }
    }
}

/// How a destination field is matched against the APICs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DestinationMode {
    /// The destination is an APIC ID.
    Physical,
    /// The destination is matched against each APIC's LDR.
    Logical,
}

impl DestinationMode {
    fn from_logical(logical: bool) -> Self {
        if logical {
            Self::Logical
        } else {
            Self::Physical
        }
    }
}

/// A set of processors, by index.
#[derive(Clone, PartialEq, Eq)]
pub struct VpSet {
    bits: Vec<u64>,
    count: usize,
}

impl VpSet {
    /// Returns an empty set that can hold `count` processors.
    pub fn new(count: usize) -> Self {
        Self {
            bits: vec![0; count.div_ceil(64)],
            count,
        }
    }

    /// Adds every processor.
    pub fn fill(&mut self) {
        for i in 0..self.count {
            self.insert(i);
        }
    }

    /// Adds processor `index`.
    pub fn insert(&mut self, index: usize) {
        assert!(index < self.count);
        self.bits[index / 64] |= 1 << (index % 64);
    }

    /// Removes processor `index`.
    pub fn remove(&mut self, index: usize) {
        if index < self.count {
            self.bits[index / 64] &= !(1 << (index % 64));
        }
    }

    /// Returns whether processor `index` is in the set.
    pub fn contains(&self, index: usize) -> bool {
        index < self.count && self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Iterates over the processors in the set, in index order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).filter(|&i| self.contains(i))
    }
}

impl std::fmt::Debug for VpSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// An interrupt message from the IO-APIC or another bus agent.
#[derive(Debug, Copy, Clone)]
pub struct BusInterrupt {
    /// The 8-bit destination field.
    pub destination: u8,
    /// Physical or logical destination.
    pub destination_mode: DestinationMode,
    /// The delivery mode.
    pub delivery_mode: DeliveryMode,
    /// The vector.
    pub vector: u8,
    /// The input pin polarity. Not used for routing.
    pub polarity: bool,
    /// Edge or level.
    pub trigger: TriggerMode,
    /// A tag identifying the source, reported back by
    /// [`LocalApic::next_interrupt`].
    pub source_tag: u32,
}

/// The outcome of a bus delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusDelivery {
    /// At least one APIC accepted the interrupt.
    Delivered,
    /// No APIC accepted the interrupt.
    Discarded,
}

/// An error asserting a local interrupt pin.
#[derive(Debug, Error)]
pub enum LocalInterruptError {
    /// The pin's LVT entry holds a delivery mode that local pins cannot use.
    #[error("invalid delivery mode {0:?} for local interrupt pin")]
    InvalidDeliveryMode(DeliveryMode),
}

/// The parts of an interrupt other than its destination.
#[derive(Debug, Copy, Clone)]
pub(crate) struct InterruptRequest {
    pub vector: u8,
    pub trigger: TriggerMode,
    pub delivery_mode: DeliveryMode,
    pub source_tag: u32,
}

/// Returns whether the APIC behind `shared` matches a logical destination.
///
/// The match uses the target's own mode and destination format.
fn is_logical_destination(shared: &SharedState, destination: u32) -> bool {
    let ldr = shared.page.read(ApicRegister::LDR);
    if shared.x2apic_enabled() {
        // Clustered only: high 16 bits select the cluster, low 16 bits the
        // members.
        let ldr = X2ApicLogicalId::from(ldr);
        let destination = X2ApicLogicalId::from(destination);
        return ldr.cluster_id() == destination.cluster_id()
            && ldr.logical_id() & destination.logical_id() != 0;
    }

    let destination = destination as u8;
    if destination == 0xff {
        return true;
    }
    let logical_id = (ldr >> 24) as u8;
    if Dfr(shared.page.read(ApicRegister::DFR)) == Dfr::FLAT_MODE {
        logical_id & destination != 0
    } else {
        let ldr = XApicClusterLogicalId::from(logical_id);
        let destination = XApicClusterLogicalId::from(destination);
        ldr.cluster_id() == destination.cluster_id()
            && ldr.logical_id() & destination.logical_id() != 0
    }
}

/// Computes the processors addressed by a destination field.
///
/// `broadcast` is the all-ones mask of the destination format in use.
pub(crate) fn destination_set(
    apics: &[Arc<SharedState>],
    mask: u32,
    broadcast: u32,
    destination_mode: DestinationMode,
    delivery_mode: DeliveryMode,
) -> VpSet {
    let mut set = VpSet::new(apics.len());

    // Lowest priority is meaningless for a single physical target.
    let lowest_priority = delivery_mode == DeliveryMode::LOWEST_PRIORITY
        && destination_mode == DestinationMode::Logical;

    if lowest_priority {
        // Ties go to the highest index.
        let target = apics
            .iter()
            .enumerate()
            .filter(|(_, apic)| is_logical_destination(apic, mask))
            .fold(None, |lowest: Option<(usize, u8)>, (index, apic)| {
                let tpr = apic.page.read(ApicRegister::TPR) as u8;
                match lowest {
                    Some((_, lowest_tpr)) if tpr > lowest_tpr => lowest,
                    _ => Some((index, tpr)),
                }
            });
        if let Some((index, _)) = target {
            set.insert(index);
        }
        return set;
    }

    if mask & broadcast == broadcast {
        set.fill();
        return set;
    }

    match destination_mode {
        DestinationMode::Physical => {
            if (mask as usize) < apics.len() {
                set.insert(mask as usize);
            }
        }
        DestinationMode::Logical => {
            if mask != 0 {
                for (index, apic) in apics.iter().enumerate() {
                    if is_logical_destination(apic, mask) {
                        set.insert(index);
                    }
                }
            }
        }
    }
    set
}

/// Raises processor-level work on every target, waking those that did not
/// already have it pending.
fn raise_all(
    apics: &[Arc<SharedState>],
    targets: &VpSet,
    flags: WorkFlags,
    platform: &mut dyn ApicPlatform,
) -> bool {
    for index in targets.iter() {
        let target = &apics[index];
        if target.raise(flags) {
            platform.wake(target.vp_index);
        }
    }
    !targets.is_empty()
}

impl GlobalState {
    /// Delivers an interrupt to every processor in `targets`.
    ///
    /// Returns whether any target accepted it. `sender` is the APIC that
    /// issued the interrupt, if any, for error reporting.
    pub(crate) fn send_interrupt(
        &self,
        apics: &[Arc<SharedState>],
        sender: Option<&SharedState>,
        targets: &VpSet,
        request: InterruptRequest,
        platform: &mut dyn ApicPlatform,
    ) -> Result<bool, PrivilegeRequired> {
        let InterruptRequest {
            vector,
            trigger,
            delivery_mode,
            source_tag,
        } = request;

        let mut accepted = false;
        match delivery_mode {
            DeliveryMode::FIXED => {
                for index in targets.iter() {
                    let target = &apics[index];
                    if target.hardware_enabled() {
                        accepted |= target.post_and_wake(vector, trigger, source_tag, platform);
                    }
                }
            }
            DeliveryMode::LOWEST_PRIORITY => {
                if let Some(index) = targets.iter().next() {
                    let target = &apics[index];
                    if target.hardware_enabled() {
                        accepted = target.post_and_wake(vector, trigger, source_tag, platform);
                    }
                }
            }
            DeliveryMode::SMI => {
                accepted = raise_all(apics, targets, WorkFlags::new().with_smi(true), platform);
            }
            DeliveryMode::NMI => {
                accepted = raise_all(apics, targets, WorkFlags::new().with_nmi(true), platform);
            }
            DeliveryMode::EXTINT => {
                accepted = raise_all(apics, targets, WorkFlags::new().with_extint(true), platform);
            }
            DeliveryMode::INIT | DeliveryMode::SIPI => {
                let request = if delivery_mode == DeliveryMode::INIT {
                    StartRequest::Init
                } else {
                    StartRequest::Startup(vector)
                };
                if !targets.is_empty() && !platform.can_start_cpus() {
                    return Err(PrivilegeRequired);
                }
                for index in targets.iter() {
                    tracing::debug!(vp = index, ?request, "start processor");
                    platform.start_cpu(apics[index].vp_index, request);
                    accepted = true;
                }
            }
            _ => {
                tracelimit::warn_ratelimited!(?delivery_mode, vector, "unsupported delivery mode");
            }
        }

        if let Some(sender) = sender {
            if delivery_mode == DeliveryMode::FIXED && vector <= APIC_ILLEGAL_VECTOR_END {
                sender.set_error(Esr::new().with_send_illegal_vector(true));
            }
        }
        Ok(accepted)
    }
}

impl LocalApic {
    /// Sends the IPI described by the current ICR value.
    pub(crate) fn send_ipi(&mut self, platform: &mut dyn ApicPlatform) -> Result<(), PrivilegeRequired> {
        let shared = &self.shared;
        let x2apic = shared.x2apic_enabled();
        let low = shared.page.read(ApicRegister::ICR0);
        let high = shared.page.read(ApicRegister::ICR1);
        let icr = Icr::from((u64::from(high) << 32) | u64::from(low));
        let delivery_mode = DeliveryMode(icr.delivery_mode());
        let trigger = TriggerMode::from_level(icr.trigger_mode_level());
        let vp = shared.vp_index.index();

        tracing::trace!(vp, ?icr, "ipi");

        if trigger == TriggerMode::Level && !icr.level_assert() {
            match delivery_mode {
                DeliveryMode::FIXED
                | DeliveryMode::LOWEST_PRIORITY
                | DeliveryMode::SMI
                | DeliveryMode::NMI
                | DeliveryMode::INIT => {
                    tracing::debug!(vp, ?delivery_mode, "ignoring level deassert ipi");
                    return Ok(());
                }
                _ => {}
            }
        }

        let mutable = self.global.mutable.read();
        let apics = mutable.by_index.as_slice();
        let self_index = vp as usize;
        let mut targets = VpSet::new(apics.len());
        match DestinationShorthand(icr.destination_shorthand()) {
            DestinationShorthand::SELF => targets.insert(self_index),
            DestinationShorthand::ALL_INCLUDING_SELF => targets.fill(),
            DestinationShorthand::ALL_EXCLUDING_SELF => {
                targets.fill();
                targets.remove(self_index);
            }
            _ => {
                let (mask, broadcast) = if x2apic {
                    (icr.x2apic_mda(), X2APIC_BROADCAST_DESTINATION)
                } else {
                    (u32::from(icr.xapic_mda()), XAPIC_BROADCAST_DESTINATION)
                };
                targets = destination_set(
                    apics,
                    mask,
                    broadcast,
                    DestinationMode::from_logical(icr.destination_mode_logical()),
                    delivery_mode,
                );
            }
        }

        shared.record(ApicEvent::IpiSent);
        self.global.send_interrupt(
            apics,
            Some(shared.as_ref()),
            &targets,
            InterruptRequest {
                vector: icr.vector(),
                trigger,
                delivery_mode,
                source_tag: 0,
            },
            platform,
        )?;
        Ok(())
    }
}

impl LocalApicSet {
    /// Delivers an interrupt message from the IO-APIC or another bus agent.
    /// May be called from any thread.
    pub fn bus_deliver(
        &self,
        interrupt: &BusInterrupt,
        platform: &mut dyn ApicPlatform,
    ) -> Result<BusDelivery, PrivilegeRequired> {
        let mutable = self.global.mutable.read();
        let apics = mutable.by_index.as_slice();

        // With the BSP's APIC disabled the bus is not routed through the
        // APICs at all.
        if !apics.first().is_some_and(|apic| apic.hardware_enabled()) {
            return Ok(BusDelivery::Delivered);
        }

        tracing::trace!(?interrupt, "bus deliver");
        let targets = destination_set(
            apics,
            interrupt.destination.into(),
            XAPIC_BROADCAST_DESTINATION,
            interrupt.destination_mode,
            interrupt.delivery_mode,
        );
        let accepted = self.global.send_interrupt(
            apics,
            None,
            &targets,
            InterruptRequest {
                vector: interrupt.vector,
                trigger: interrupt.trigger,
                delivery_mode: interrupt.delivery_mode,
                source_tag: interrupt.source_tag,
            },
            platform,
        )?;
        Ok(if accepted {
            BusDelivery::Delivered
        } else {
            BusDelivery::Discarded
        })
    }

    /// Requests a message-signaled interrupt.
    pub fn request_msi(
        &self,
        address: u64,
        data: u32,
        platform: &mut dyn ApicPlatform,
    ) -> Result<BusDelivery, PrivilegeRequired> {
        let address = MsiAddress::from(address as u32);
        let data = MsiData::from(data);
        if !address.is_interrupt_window() {
            tracelimit::warn_ratelimited!(
                address = u32::from(address),
                "msi address outside the interrupt window"
            );
            return Ok(BusDelivery::Discarded);
        }
        self.bus_deliver(
            &BusInterrupt {
                destination: address.destination(),
                destination_mode: DestinationMode::from_logical(address.destination_mode_logical()),
                delivery_mode: DeliveryMode(data.delivery_mode()),
                vector: data.vector(),
                polarity: false,
                trigger: TriggerMode::from_level(data.trigger_mode_level()),
                source_tag: 0,
            },
            platform,
        )
    }

    /// Drives the LINT0 (`pin == 0`) or LINT1 (`pin == 1`) input of the APIC
    /// of `vp`. May be called from any thread.
    ///
    /// Typically LINT0 is programmed by the guest for EXTINT interrupts and
    /// LINT1 is programmed for NMIs.
    pub fn local_interrupt(
        &self,
        vp: VpIndex,
        pin: usize,
        level: bool,
        platform: &mut dyn ApicPlatform,
    ) -> Result<(), LocalInterruptError> {
        assert!(pin <= 1, "invalid local interrupt pin {pin}");
        let mutable = self.global.mutable.read();
        let apics = mutable.by_index.as_slice();
        let Some(apic) = apics.get(vp.index() as usize) else {
            return Ok(());
        };

        if !apic.hardware_enabled() {
            // Without an APIC, LINT0 is INTR and LINT1 is NMI.
            if pin == 0 {
                let flag = WorkFlags::new().with_extint(true);
                if level {
                    if apic.raise(flag) {
                        platform.wake(vp);
                    }
                } else {
                    apic.lower(flag);
                }
            } else if apic.raise(WorkFlags::new().with_nmi(true)) {
                platform.wake(vp);
            }
            return Ok(());
        }

        let register = if pin == 0 {
            ApicRegister::LVT_LINT0
        } else {
            ApicRegister::LVT_LINT1
        };
        let lvt = Lvt::from(apic.page.read(register));
        if lvt.masked() {
            return Ok(());
        }

        let delivery_mode = DeliveryMode(lvt.delivery_mode());
        let mut trigger = TriggerMode::from_level(lvt.trigger_mode_level());
        let send = match delivery_mode {
            DeliveryMode::FIXED | DeliveryMode::INIT => {
                let active = &apic.active_lint[pin];
                if !level {
                    active.store(false, Ordering::Relaxed);
                    return Ok(());
                }
                // LINT1 cannot be level triggered.
                if pin == 1 {
                    trigger = TriggerMode::Edge;
                }
                match trigger {
                    TriggerMode::Edge => active
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok(),
                    TriggerMode::Level => {
                        active.store(true, Ordering::Relaxed);
                        let remote_irr = Lvt::new().with_remote_irr(true).into_bits();
                        apic.page.fetch_or(ApicRegister::LVT_LINT0, remote_irr) & remote_irr == 0
                    }
                }
            }
            DeliveryMode::SMI | DeliveryMode::NMI => true,
            DeliveryMode::EXTINT => {
                let flag = WorkFlags::new().with_extint(true);
                if level {
                    if apic.raise(flag) {
                        platform.wake(vp);
                    }
                } else {
                    apic.lower(flag);
                }
                false
            }
            _ => return Err(LocalInterruptError::InvalidDeliveryMode(delivery_mode)),
        };

        if send {
            tracing::trace!(vp = vp.index(), pin, ?delivery_mode, "local interrupt");
            let mut targets = VpSet::new(apics.len());
            targets.insert(vp.index() as usize);
            let request = InterruptRequest {
                vector: lvt.vector(),
                trigger,
                delivery_mode,
                source_tag: 0,
            };
            if let Err(err) =
                self.global
                    .send_interrupt(apics, Some(apic.as_ref()), &targets, request, platform)
            {
                tracelimit::warn_ratelimited!(
                    vp = vp.index(),
                    error = &err as &dyn std::error::Error,
                    "init through local interrupt pin failed"
                );
            }
        }
        Ok(())
    }
}
