// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Local APIC emulator.
//!
//! This emulates the per-processor local APIC, as documented by the Intel SDM
//! and the AMD APM, in both legacy xAPIC (MMIO) and x2APIC (MSR) modes.
//!
//! Interrupts may be posted to any APIC from any thread through
//! [`LocalApicSet`]. Posting sets a bit in a lock-free pending-interrupt
//! bitmap; the processor that owns the APIC folds those bits into IRR the
//! next time it calls [`LocalApic::scan`]. Everything that mutates the
//! register page goes through `&mut LocalApic`, so it can only happen on the
//! owning processor's thread.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod access;
mod ipi;
mod mode;
mod page;
mod pib;
mod priority;
mod save;
mod telemetry;
mod timer;
mod vmtime;

#[cfg(test)]
mod tests;

pub use access::ApicAccessError;
pub use access::LocalApicAccess;
pub use access::MsrAccessError;
pub use access::MsrAccessErrorKind;
pub use access::HV_X64_MSR_APIC_FREQUENCY;
pub use access::HV_X64_MSR_EOI;
pub use access::HV_X64_MSR_ICR;
pub use access::HV_X64_MSR_TPR;
pub use ipi::BusDelivery;
pub use ipi::BusInterrupt;
pub use ipi::DestinationMode;
pub use ipi::LocalInterruptError;
pub use ipi::TriggerMode;
pub use ipi::VpSet;
pub use mode::ApicMaxMode;
pub use mode::ApicMode;
pub use pib::PibState;
pub use pib::SOURCE_TAG_MULTIPLE;
pub use priority::NextInterrupt;
pub use priority::TaskPriority;
pub use save::ApicSavedState;
pub use save::RestoreError;
pub use telemetry::ApicEvent;
pub use telemetry::ApicStats;
pub use telemetry::ApicTelemetry;
pub use telemetry::NullTelemetry;
pub use vmtime::VmTime;

use bitfield_struct::bitfield;
use page::RegisterPage;
use parking_lot::Mutex;
use parking_lot::RwLock;
use pib::PendingInterruptBitmap;
use pib::SourceTags;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use telemetry::Counters;
use thiserror::Error;
use timer::TimerState;
use x86defs::apic::ApicBase;
use x86defs::apic::ApicVersion;
use x86defs::apic::ApicRegister;
use x86defs::apic::Esr;
use x86defs::apic::Svr;

const NANOS_PER_TICK: u64 = 5; // 200Mhz
const TIMER_FREQUENCY: u64 = 1_000_000_000 / NANOS_PER_TICK;
/// P4/Xeon: version 0x14, six LVT entries.
const APIC_VERSION: u32 = ApicVersion::new()
    .with_version(0x14)
    .with_max_lvt_entry(5)
    .into_bits();

/// The index of a virtual processor. The APIC ID of each processor equals its
/// index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VpIndex(u32);

impl VpIndex {
    /// The bootstrap processor.
    pub const BSP: Self = Self(0);

    /// Returns a new index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    pub const fn index(&self) -> u32 {
        self.0
    }

    /// Returns true if this is the bootstrap processor.
    pub const fn is_bsp(&self) -> bool {
        self.0 == 0
    }
}

/// A request to the processor-lifecycle collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StartRequest {
    /// Put the processor into the wait-for-SIPI state.
    Init,
    /// Start the processor at the given SIPI vector.
    Startup(u8),
}

/// The current context cannot perform a processor-lifecycle operation.
#[derive(Debug, Error)]
#[error("operation requires a privileged context")]
pub struct PrivilegeRequired;

/// Platform services used when delivering interrupts. May be called from any
/// thread.
pub trait ApicPlatform {
    /// Ensure the processor at `vp` calls [`LocalApic::scan`] soon.
    ///
    /// Best effort; nothing waits for the target to run.
    fn wake(&mut self, vp: VpIndex);

    /// Returns whether this context can start processors.
    ///
    /// Checked once before an INIT or startup IPI reaches any of its targets.
    fn can_start_cpus(&self) -> bool;

    /// Deliver an INIT or startup IPI to `vp`. Only called after
    /// [`Self::can_start_cpus`] returned true.
    fn start_cpu(&mut self, vp: VpIndex, request: StartRequest);
}

/// The client to pass to [`LocalApic::access`] and [`LocalApic::scan`], to
/// handle requests needed by the owning processor.
pub trait ApicClient: ApicPlatform {
    /// Notify the IO-APIC of an EOI for a level-triggered vector.
    fn eoi(&mut self, vector: u8);

    /// Returns the current time.
    fn now(&mut self) -> VmTime;
}

#[bitfield(u32)]
struct WorkFlags {
    /// An interrupt in IRR outranks everything in service.
    interrupt: bool,
    /// The pending-interrupt bitmaps need folding.
    update: bool,
    nmi: bool,
    smi: bool,
    /// The legacy INTR line is asserted.
    extint: bool,
    #[bits(27)]
    _rsvd: u32,
}

/// Work to do as a result of [`LocalApic::scan`] or [`LocalApic::flush`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ApicWork {
    /// A fixed interrupt outranks everything in service.
    ///
    /// Call [`LocalApic::next_interrupt`] when the processor can take it.
    pub interrupt: bool,
    /// An NMI was requested.
    pub nmi: bool,
    /// An SMI was requested.
    pub smi: bool,
    /// The legacy interrupt line is asserted.
    ///
    /// When the processor is ready for extint injection, query the PIC for the
    /// vector and inject the interrupt.
    pub extint: bool,
}

/// State reachable from any thread.
struct SharedState {
    vp_index: VpIndex,
    page: RegisterPage,
    apic_base: AtomicU64,
    pib_edge: PendingInterruptBitmap,
    pib_level: PendingInterruptBitmap,
    source_tags: SourceTags,
    /// Errors not yet latched into ESR.
    pending_errors: AtomicU32,
    work: AtomicU32,
    /// The input level of LINT0 and LINT1.
    active_lint: [AtomicBool; 2],
    timer: Mutex<TimerState>,
    counters: Counters,
    telemetry: Arc<dyn ApicTelemetry>,
}

impl SharedState {
    fn new(vp_index: VpIndex, telemetry: Arc<dyn ApicTelemetry>) -> Self {
        Self {
            vp_index,
            page: RegisterPage::new(),
            apic_base: AtomicU64::new(0),
            pib_edge: Default::default(),
            pib_level: Default::default(),
            source_tags: SourceTags::new(),
            pending_errors: AtomicU32::new(0),
            work: AtomicU32::new(0),
            active_lint: Default::default(),
            timer: Mutex::new(TimerState::default()),
            counters: Counters::new(),
            telemetry,
        }
    }

    fn apic_base(&self) -> ApicBase {
        ApicBase::from(self.apic_base.load(Ordering::Acquire))
    }

    fn mode(&self) -> ApicMode {
        ApicMode::from_base(self.apic_base())
    }

    fn hardware_enabled(&self) -> bool {
        self.apic_base().enable()
    }

    fn x2apic_enabled(&self) -> bool {
        self.mode() == ApicMode::X2Apic
    }

    fn software_enabled(&self) -> bool {
        Svr::from(self.page.read(ApicRegister::SVR)).enable()
    }

    /// Latches `error` for the next ESR write.
    fn set_error(&self, error: Esr) {
        self.pending_errors
            .fetch_or(error.into_bits(), Ordering::Relaxed);
    }

    /// Sets work flags, returning true if any of them was newly set.
    fn raise(&self, flags: WorkFlags) -> bool {
        let bits = flags.into_bits();
        self.work.fetch_or(bits, Ordering::Release) & bits != bits
    }

    fn lower(&self, flags: WorkFlags) {
        self.work.fetch_and(!flags.into_bits(), Ordering::Release);
    }

    fn work(&self) -> WorkFlags {
        WorkFlags::from(self.work.load(Ordering::Acquire))
    }

    fn record(&self, event: ApicEvent) {
        self.counters.increment(event);
        self.telemetry.record(self.vp_index, event);
    }
}

/// The interface to the local APIC for all processors.
#[derive(Debug)]
pub struct LocalApicSet {
    global: Arc<GlobalState>,
}

struct GlobalState {
    max_mode: ApicMaxMode,
    tsc_deadline: bool,
    hyperv_compat: bool,
    hyperv_enlightenments: bool,
    telemetry: Arc<dyn ApicTelemetry>,
    mutable: RwLock<MutableGlobalState>,
}

struct MutableGlobalState {
    by_index: Vec<Arc<SharedState>>,
}

impl fmt::Debug for GlobalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalState")
            .field("max_mode", &self.max_mode)
            .field("tsc_deadline", &self.tsc_deadline)
            .field("hyperv_compat", &self.hyperv_compat)
            .field("hyperv_enlightenments", &self.hyperv_enlightenments)
            .field("apic_count", &self.mutable.read().by_index.len())
            .finish()
    }
}

/// Builder for [`LocalApicSet`].
pub struct LocalApicSetBuilder {
    max_mode: ApicMaxMode,
    tsc_deadline: bool,
    hyperv_compat: bool,
    hyperv_enlightenments: bool,
    telemetry: Arc<dyn ApicTelemetry>,
}

impl LocalApicSetBuilder {
    fn new() -> Self {
        Self {
            max_mode: ApicMaxMode::X2Apic,
            tsc_deadline: false,
            hyperv_compat: false,
            hyperv_enlightenments: false,
            telemetry: Arc::new(NullTelemetry),
        }
    }

    /// Sets the most capable mode the guest may enable.
    pub fn max_mode(&mut self, max_mode: ApicMaxMode) -> &mut Self {
        self.max_mode = max_mode;
        self
    }

    /// Sets whether the timer supports TSC-deadline mode.
    pub fn tsc_deadline(&mut self, tsc_deadline: bool) -> &mut Self {
        self.tsc_deadline = tsc_deadline;
        self
    }

    /// Sets whether the x2APIC MSRs behave as Hyper-V expects: usable in
    /// xAPIC mode, with a writable LDR and a dummy MSR at 0x80e.
    pub fn hyperv_compat(&mut self, hyperv_compat: bool) -> &mut Self {
        self.hyperv_compat = hyperv_compat;
        self
    }

    /// Sets whether Hyper-V enlightenment MSRs are handled.
    pub fn hyperv_enlightenments(&mut self, hyperv_enlightenments: bool) -> &mut Self {
        self.hyperv_enlightenments = hyperv_enlightenments;
        self
    }

    /// Sets the telemetry sink.
    pub fn telemetry(&mut self, telemetry: Arc<dyn ApicTelemetry>) -> &mut Self {
        self.telemetry = telemetry;
        self
    }

    /// Builds a new local APIC set.
    pub fn build(&self) -> LocalApicSet {
        LocalApicSet {
            global: Arc::new(GlobalState {
                max_mode: self.max_mode,
                tsc_deadline: self.tsc_deadline,
                hyperv_compat: self.hyperv_compat,
                hyperv_enlightenments: self.hyperv_enlightenments,
                telemetry: self.telemetry.clone(),
                mutable: RwLock::new(MutableGlobalState {
                    by_index: Vec::new(),
                }),
            }),
        }
    }
}

impl LocalApicSet {
    /// Creates a new builder for a local APIC set.
    pub fn builder() -> LocalApicSetBuilder {
        LocalApicSetBuilder::new()
    }

    /// Returns the frequency of the APIC timer clock.
    pub fn frequency(&self) -> u64 {
        TIMER_FREQUENCY
    }

    /// Adds an APIC for the specified VP to the set.
    ///
    /// Processors must be added in index order, starting at zero.
    pub fn add_apic(&self, vp_index: VpIndex) -> LocalApic {
        let shared = Arc::new(SharedState::new(vp_index, self.global.telemetry.clone()));
        {
            let mut mutable = self.global.mutable.write();
            assert_eq!(
                mutable.by_index.len(),
                vp_index.index() as usize,
                "processors must be added in order"
            );
            mutable.by_index.push(shared.clone());
        }

        let mut apic = LocalApic {
            shared,
            global: self.global.clone(),
        };
        apic.reset();
        apic
    }

    /// Posts a fixed interrupt directly to the APIC of `vp`, bypassing
    /// destination matching. May be called from any thread.
    ///
    /// Returns true if the interrupt was accepted.
    pub fn post_interrupt(
        &self,
        vp: VpIndex,
        vector: u8,
        trigger: TriggerMode,
        source_tag: u32,
        platform: &mut dyn ApicPlatform,
    ) -> bool {
        let mutable = self.global.mutable.read();
        let Some(shared) = mutable.by_index.get(vp.index() as usize) else {
            return false;
        };
        shared.post_and_wake(vector, trigger, source_tag, platform)
    }

    /// Sends a fixed interrupt from the Hyper-V synthetic interrupt
    /// controller to `vp`.
    pub fn hv_send_interrupt(
        &self,
        vp: VpIndex,
        vector: u8,
        trigger: TriggerMode,
        platform: &mut dyn ApicPlatform,
    ) -> bool {
        self.post_interrupt(vp, vector, trigger, 0, platform)
    }

    /// Runs the timer expiry for the APIC of `vp` at time `now`. May be
    /// called from any thread, such as a timer service.
    ///
    /// Returns true if the timer fired.
    pub fn timer_expired(
        &self,
        vp: VpIndex,
        now: VmTime,
        platform: &mut dyn ApicPlatform,
    ) -> bool {
        let mutable = self.global.mutable.read();
        let Some(shared) = mutable.by_index.get(vp.index() as usize) else {
            return false;
        };
        shared.expire_timer(now, platform)
    }
}

/// An individual local APIC for a processor.
pub struct LocalApic {
    shared: Arc<SharedState>,
    global: Arc<GlobalState>,
}

impl fmt::Debug for LocalApic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalApic")
            .field("vp", &self.shared.vp_index.index())
            .field("apic_base", &format_args!("{:#x}", self.apic_base()))
            .field("mode", &self.mode())
            .field("registers", &self.shared.page)
            .field("stats", &self.shared.counters)
            .finish()
    }
}

impl LocalApic {
    /// Returns an object to access APIC registers.
    pub fn access<'a, T: ApicClient>(&'a mut self, client: &'a mut T) -> LocalApicAccess<'a, T> {
        LocalApicAccess::new(self, client)
    }

    /// The index of the owning processor.
    pub fn vp_index(&self) -> VpIndex {
        self.shared.vp_index
    }

    /// Returns a snapshot of the event counters.
    pub fn stats(&self) -> ApicStats {
        self.shared.counters.snapshot()
    }

    /// Reads a register from the page without side effects, for diagnostics.
    pub fn register(&self, register: ApicRegister) -> u32 {
        self.shared.page.read(register)
    }

    /// Scans for pending work: folds posted interrupts into IRR, polls the
    /// timer, and collects processor-level signals.
    pub fn scan<T: ApicClient>(&mut self, client: &mut T) -> ApicWork {
        let timer_armed = self.next_timer_deadline().is_some();
        if self.shared.hardware_enabled() && timer_armed {
            let now = client.now();
            self.shared.expire_timer(now, client);
        }
        if self.shared.work().update() {
            self.fold_pending_interrupts();
        }
        self.flush()
    }

    /// Collects processor-level signals as in [`Self::scan`], but does not
    /// poll the timer or fold posted interrupts.
    pub fn flush(&mut self) -> ApicWork {
        let work = self.shared.work();
        let edge = WorkFlags::new().with_nmi(true).with_smi(true);
        if work.into_bits() & edge.into_bits() != 0 {
            self.shared.lower(edge);
        }
        let r = ApicWork {
            interrupt: work.interrupt(),
            nmi: work.nmi(),
            smi: work.smi(),
            extint: work.extint(),
        };
        if r != ApicWork::default() {
            tracing::trace!(vp = self.shared.vp_index.index(), ?r, "apic work");
        }
        r
    }

    fn log_access_error(&self, error: &MsrAccessError) {
        tracelimit::warn_ratelimited!(
            vp = self.shared.vp_index.index(),
            msr = error.msr,
            kind = ?error.kind,
            "apic msr access error"
        );
    }
}
