// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test helpers and multi-processor scenarios.

use crate::ApicAccessError;
use crate::ApicClient;
use crate::ApicEvent;
use crate::ApicPlatform;
use crate::ApicTelemetry;
use crate::BusDelivery;
use crate::BusInterrupt;
use crate::DestinationMode;
use crate::LocalApic;
use crate::LocalApicSet;
use crate::LocalInterruptError;
use crate::MsrAccessErrorKind;
use crate::NextInterrupt;
use crate::StartRequest;
use crate::TriggerMode;
use crate::VmTime;
use crate::VpIndex;
use crate::SOURCE_TAG_MULTIPLE;
use parking_lot::Mutex;
use std::sync::Arc;
use x86defs::apic::ApicRegister;
use x86defs::apic::DeliveryMode;

/// Initializes `tracing` for tests. Honors `RUST_LOG`.
pub(crate) fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_env_filter(filter)
            .try_init();
    });
}

/// A platform and client that records every request.
#[derive(Debug, Default)]
pub(crate) struct TestClient {
    pub wakes: Vec<VpIndex>,
    pub eois: Vec<u8>,
    pub starts: Vec<(VpIndex, StartRequest)>,
    pub now: VmTime,
    /// Whether processor starts are allowed from this context.
    pub privileged: bool,
}

impl TestClient {
    pub fn new() -> Self {
        Self {
            privileged: true,
            ..Default::default()
        }
    }
}

impl ApicPlatform for TestClient {
    fn wake(&mut self, vp: VpIndex) {
        self.wakes.push(vp);
    }

    fn can_start_cpus(&self) -> bool {
        self.privileged
    }

    fn start_cpu(&mut self, vp: VpIndex, request: StartRequest) {
        assert!(self.privileged);
        self.starts.push((vp, request));
    }
}

impl ApicClient for TestClient {
    fn eoi(&mut self, vector: u8) {
        self.eois.push(vector);
    }

    fn now(&mut self) -> VmTime {
        self.now
    }
}

const SVR: u16 = 0xf0;
const TPR: u16 = 0x80;
const PPR: u16 = 0xa0;
const EOI: u16 = 0xb0;
const ESR: u16 = 0x280;
const ICR_LOW: u16 = 0x300;
const ICR_HIGH: u16 = 0x310;
const LVT_TIMER: u16 = 0x320;
const LVT_LINT0: u16 = 0x350;
const LVT_LINT1: u16 = 0x360;
const TIMER_ICR: u16 = 0x380;
const TIMER_CCR: u16 = 0x390;
const TIMER_DCR: u16 = 0x3e0;

const X2APIC_BASE: u64 = 0xfee0_0000 | (1 << 11) | (1 << 10);

/// Adds `count` software-enabled APICs.
fn enabled_apics(set: &LocalApicSet, count: u32, client: &mut TestClient) -> Vec<LocalApic> {
    let mut apics = Vec::new();
    for i in 0..count {
        let mut apic = set.add_apic(VpIndex::new(i));
        apic.access(client).mmio_write(SVR, 0x1ff).unwrap();
        apics.push(apic);
    }
    apics
}

fn enabled_apic(set: &LocalApicSet, client: &mut TestClient) -> LocalApic {
    let mut apics = enabled_apics(set, 1, client);
    apics.remove(0)
}

fn irr(apic: &LocalApic) -> [u32; 8] {
    std::array::from_fn(|i| apic.register(ApicRegister(ApicRegister::IRR0.0 + i as u8)))
}

#[test]
fn illegal_vectors_are_rejected() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    for vector in 0..=15 {
        assert!(!set.post_interrupt(VpIndex::BSP, vector, TriggerMode::Edge, 0, &mut client));
    }
    assert!(!apic.fold_pending_interrupts());
    assert_eq!(irr(&apic), [0; 8]);
    assert!(client.wakes.is_empty());
    assert_eq!(apic.stats().get(ApicEvent::PostIllegalVector), 16);

    let mut access = apic.access(&mut client);
    access.mmio_write(ESR, 0).unwrap();
    // Receive illegal vector.
    assert_eq!(access.mmio_read(ESR), 0x40);
}

#[test]
fn posting_is_idempotent() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    assert!(set.post_interrupt(VpIndex::BSP, 0x50, TriggerMode::Edge, 1, &mut client));
    assert!(set.post_interrupt(VpIndex::BSP, 0x50, TriggerMode::Edge, 2, &mut client));
    // The second post finds the notification outstanding.
    assert_eq!(client.wakes, [VpIndex::BSP]);

    assert!(apic.fold_pending_interrupts());
    assert_eq!(irr(&apic), [0, 0, 0x10000, 0, 0, 0, 0, 0]);

    assert!(set.post_interrupt(VpIndex::BSP, 0x50, TriggerMode::Edge, 3, &mut client));
    assert_eq!(apic.stats().get(ApicEvent::PostAlreadyPending), 1);
    assert!(!apic.fold_pending_interrupts());

    assert_eq!(
        apic.next_interrupt(),
        NextInterrupt::Pending {
            vector: 0x50,
            source_tag: 2 | SOURCE_TAG_MULTIPLE,
        }
    );
    assert_eq!(apic.highest_pending_interrupt(), None);
}

#[test]
fn tpr_masks_delivery() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    apic.access(&mut client).mmio_write(TPR, 0x40).unwrap();
    set.post_interrupt(VpIndex::BSP, 0x41, TriggerMode::Edge, 0, &mut client);
    apic.fold_pending_interrupts();
    assert_eq!(apic.next_interrupt(), NextInterrupt::MaskedByTpr(0x41));
    assert_eq!(apic.stats().get(ApicEvent::MaskedByTpr), 1);

    apic.access(&mut client).mmio_write(TPR, 0).unwrap();
    assert_eq!(
        apic.next_interrupt(),
        NextInterrupt::Pending {
            vector: 0x41,
            source_tag: 0,
        }
    );
    assert_eq!(apic.register(ApicRegister::ISR2), 1 << 1);
}

#[test]
fn eoi_with_empty_isr_changes_nothing() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    apic.access(&mut client).mmio_write(TPR, 0x30).unwrap();
    set.post_interrupt(VpIndex::BSP, 0x50, TriggerMode::Level, 0, &mut client);
    apic.fold_pending_interrupts();

    let mut access = apic.access(&mut client);
    access.mmio_write(EOI, 0).unwrap();
    assert_eq!(access.mmio_read(PPR), 0x30);
    assert_eq!(apic.highest_pending_interrupt(), Some(0x50));
    assert_eq!(apic.stats().get(ApicEvent::SpuriousEoi), 1);
    assert!(client.eois.is_empty());
}

#[test]
fn ppr_follows_service_and_eoi() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    apic.access(&mut client).mmio_write(TPR, 0x20).unwrap();
    set.post_interrupt(VpIndex::BSP, 0x61, TriggerMode::Level, 0, &mut client);
    assert!(apic.scan(&mut client).interrupt);
    assert!(matches!(
        apic.next_interrupt(),
        NextInterrupt::Pending { vector: 0x61, .. }
    ));

    let mut access = apic.access(&mut client);
    assert_eq!(access.mmio_read(PPR), 0x60);
    access.mmio_write(EOI, 0).unwrap();
    assert_eq!(access.mmio_read(PPR), 0x20);
    assert_eq!(client.eois, [0x61]);
}

#[test]
fn in_service_blocks_same_and_lower_class() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    set.post_interrupt(VpIndex::BSP, 0x65, TriggerMode::Edge, 0, &mut client);
    apic.scan(&mut client);
    assert!(matches!(
        apic.next_interrupt(),
        NextInterrupt::Pending { vector: 0x65, .. }
    ));

    set.post_interrupt(VpIndex::BSP, 0x62, TriggerMode::Edge, 0, &mut client);
    assert!(!apic.scan(&mut client).interrupt);
    assert_eq!(apic.next_interrupt(), NextInterrupt::NotPending);
    assert_eq!(apic.stats().get(ApicEvent::MaskedByPpr), 1);

    set.post_interrupt(VpIndex::BSP, 0x71, TriggerMode::Edge, 0, &mut client);
    assert!(apic.scan(&mut client).interrupt);
    assert!(matches!(
        apic.next_interrupt(),
        NextInterrupt::Pending { vector: 0x71, .. }
    ));
}

#[test]
fn periodic_timer_through_registers() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    {
        let mut access = apic.access(&mut client);
        access.mmio_write(TIMER_DCR, 0b1011).unwrap();
        access.mmio_write(LVT_TIMER, (1 << 17) | 0x40).unwrap();
        access.mmio_write(TIMER_ICR, 10).unwrap();
        assert_eq!(access.mmio_read(TIMER_CCR), 10);
    }
    client.now = VmTime::from_nanos(25);
    assert_eq!(apic.access(&mut client).mmio_read(TIMER_CCR), 5);
    assert!(!apic.scan(&mut client).interrupt);

    client.now = VmTime::from_nanos(50);
    assert!(apic.scan(&mut client).interrupt);
    assert_eq!(
        apic.next_interrupt(),
        NextInterrupt::Pending {
            vector: 0x40,
            source_tag: 0,
        }
    );
    assert_eq!(apic.next_timer_deadline(), Some(VmTime::from_nanos(100)));
    apic.access(&mut client).mmio_write(EOI, 0).unwrap();

    client.now = VmTime::from_nanos(100);
    assert!(apic.scan(&mut client).interrupt);
    assert_eq!(apic.stats().get(ApicEvent::TimerFired), 2);
    assert_eq!(apic.access(&mut client).mmio_read(TIMER_ICR), 10);
}

#[test]
fn mode_transitions_through_base_msr() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apics = enabled_apics(&set, 3, &mut client);
    let apic = &mut apics[2];

    let kind = |result: Result<_, ApicAccessError>| match result {
        Err(ApicAccessError::Gp(err)) => err.kind,
        other => panic!("unexpected result {other:?}"),
    };

    let mut access = apic.access(&mut client);
    access.msr_write(0x1b, 0xfee0_0000).unwrap();
    assert_eq!(
        kind(access.msr_write(0x1b, X2APIC_BASE)),
        MsrAccessErrorKind::WriteInvalid
    );
    assert_eq!(
        kind(access.msr_write(0x1b, 0xfee0_0400)),
        MsrAccessErrorKind::WriteInvalid
    );
    access.msr_write(0x1b, 0xfee0_0800).unwrap();
    access.msr_write(0x1b, X2APIC_BASE).unwrap();

    // The x2APIC ID and logical ID come from the processor index.
    assert_eq!(access.msr_read(0x802).unwrap(), 2);
    assert_eq!(access.msr_read(0x80d).unwrap(), 1 << 2);
    assert_eq!(
        kind(access.msr_write(0x80d, 0)),
        MsrAccessErrorKind::WriteReadOnly
    );
    assert_eq!(
        kind(access.msr_write(0x80e, 0xffff_ffff)),
        MsrAccessErrorKind::WriteReservedOrUnknown
    );
    assert_eq!(
        kind(access.msr_write(0x831, 0)),
        MsrAccessErrorKind::WriteReservedOrUnknown
    );
    access.mmio_write(0xe0, 0).unwrap();
    assert_eq!(access.mmio_read(0xe0), !0);

    assert_eq!(
        kind(access.msr_write(0x1b, 0xfee0_0800)),
        MsrAccessErrorKind::WriteInvalid
    );
    access.msr_write(0x1b, 0xfee0_0000).unwrap();
    drop(access);
    assert_eq!(apic.mode(), crate::ApicMode::Disabled);
    assert_eq!(apic.register(ApicRegister::ID), 2 << 24);
}

#[test]
fn logical_broadcast_reaches_everyone() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apics = enabled_apics(&set, 3, &mut client);
    for (apic, ldr) in apics.iter_mut().zip([0x0100_0000, 0x0200_0000, 0]) {
        apic.access(&mut client).mmio_write(0xd0, ldr).unwrap();
    }

    let interrupt = BusInterrupt {
        destination: 0xff,
        destination_mode: DestinationMode::Logical,
        delivery_mode: DeliveryMode::FIXED,
        vector: 0x45,
        polarity: false,
        trigger: TriggerMode::Edge,
        source_tag: 0x1234,
    };
    assert_eq!(
        set.bus_deliver(&interrupt, &mut client).unwrap(),
        BusDelivery::Delivered
    );
    for apic in &mut apics {
        apic.scan(&mut client);
        assert_eq!(
            apic.next_interrupt(),
            NextInterrupt::Pending {
                vector: 0x45,
                source_tag: 0x1234,
            }
        );
    }

    let interrupt = BusInterrupt {
        destination: 9,
        destination_mode: DestinationMode::Physical,
        ..interrupt
    };
    assert_eq!(
        set.bus_deliver(&interrupt, &mut client).unwrap(),
        BusDelivery::Discarded
    );
}

#[test]
fn ipi_to_all_excluding_self() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apics = enabled_apics(&set, 4, &mut client);

    // Fixed, assert, all excluding self, vector 0x30.
    apics[0]
        .access(&mut client)
        .mmio_write(ICR_LOW, (3 << 18) | (1 << 14) | 0x30)
        .unwrap();
    assert_eq!(
        client.wakes,
        [VpIndex::new(1), VpIndex::new(2), VpIndex::new(3)]
    );

    for (i, apic) in apics.iter_mut().enumerate() {
        apic.fold_pending_interrupts();
        let expected = (i != 0).then_some(0x30);
        assert_eq!(apic.highest_pending_interrupt(), expected, "vp {i}");
    }
    assert_eq!(apics[0].stats().get(ApicEvent::IpiSent), 1);
}

#[test]
fn x2apic_cluster_ipi() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apics = enabled_apics(&set, 3, &mut client);
    for apic in &mut apics {
        apic.set_apic_base(X2APIC_BASE).unwrap();
    }

    // Cluster 0, members 1 and 2, logical, fixed, vector 0x50.
    apics[0]
        .access(&mut client)
        .msr_write(0x830, (0b110 << 32) | (1 << 14) | (1 << 11) | 0x50)
        .unwrap();
    let pending: Vec<_> = apics
        .iter_mut()
        .map(|apic| {
            apic.fold_pending_interrupts();
            apic.highest_pending_interrupt()
        })
        .collect();
    assert_eq!(pending, [None, Some(0x50), Some(0x50)]);

    // Physical broadcast.
    apics[2]
        .access(&mut client)
        .msr_write(0x830, (0xffff_ffff << 32) | (1 << 14) | 0x60)
        .unwrap();
    for apic in &mut apics {
        apic.fold_pending_interrupts();
        assert_eq!(apic.highest_pending_interrupt(), Some(0x60));
    }
}

#[test]
fn illegal_self_ipi_sets_both_errors() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);
    apic.set_apic_base(X2APIC_BASE).unwrap();

    let mut access = apic.access(&mut client);
    access.msr_write(0x830, (1 << 18) | (1 << 14) | 0x05).unwrap();
    access.msr_write(0x828, 0).unwrap();
    assert_eq!(access.msr_read(0x828).unwrap(), 0x60);
    access.msr_write(0x828, 0).unwrap();
    assert_eq!(access.msr_read(0x828).unwrap(), 0);
}

#[test]
fn init_and_startup_ipis() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apics = enabled_apics(&set, 2, &mut client);

    let mut access = apics[0].access(&mut client);
    access.mmio_write(ICR_HIGH, 0x0100_0000).unwrap();
    access.mmio_write(ICR_LOW, (1 << 14) | 0x500).unwrap();
    // Level deassert INIT is ignored.
    access.mmio_write(ICR_LOW, (1 << 15) | 0x500).unwrap();
    access.mmio_write(ICR_LOW, (1 << 14) | 0x600 | 0x9a).unwrap();
    assert_eq!(
        client.starts,
        [
            (VpIndex::new(1), StartRequest::Init),
            (VpIndex::new(1), StartRequest::Startup(0x9a)),
        ]
    );

    client.privileged = false;
    let mut access = apics[0].access(&mut client);
    assert!(matches!(
        access.mmio_write(ICR_LOW, (1 << 14) | 0x600 | 0x9a),
        Err(ApicAccessError::RetryPrivileged)
    ));
    assert_eq!(client.starts.len(), 2);
}

#[test]
fn startup_broadcast_retried_once_per_target() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apics = enabled_apics(&set, 4, &mut client);

    // SIPI to all excluding self, vector 0x9a.
    let sipi = (0b11 << 18) | (1 << 14) | 0x600 | 0x9a;
    client.privileged = false;
    let mut access = apics[0].access(&mut client);
    assert!(matches!(
        access.mmio_write(ICR_LOW, sipi),
        Err(ApicAccessError::RetryPrivileged)
    ));
    assert!(client.starts.is_empty());

    client.privileged = true;
    apics[0].access(&mut client).mmio_write(ICR_LOW, sipi).unwrap();
    assert_eq!(
        client.starts,
        (1..4)
            .map(|i| (VpIndex::new(i), StartRequest::Startup(0x9a)))
            .collect::<Vec<_>>()
    );
}

#[test]
fn lint0_level_latches_remote_irr() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    // Fixed, level triggered, vector 0x70.
    apic.access(&mut client)
        .mmio_write(LVT_LINT0, (1 << 15) | 0x70)
        .unwrap();
    set.local_interrupt(VpIndex::BSP, 0, true, &mut client)
        .unwrap();
    assert_eq!(
        apic.access(&mut client).mmio_read(LVT_LINT0),
        (1 << 15) | (1 << 14) | 0x70
    );
    assert!(apic.scan(&mut client).interrupt);
    assert!(matches!(
        apic.next_interrupt(),
        NextInterrupt::Pending { vector: 0x70, .. }
    ));

    // Reasserting while remote IRR is set sends nothing.
    set.local_interrupt(VpIndex::BSP, 0, false, &mut client)
        .unwrap();
    set.local_interrupt(VpIndex::BSP, 0, true, &mut client)
        .unwrap();
    assert!(!apic.fold_pending_interrupts());

    apic.access(&mut client).mmio_write(EOI, 0).unwrap();
    assert_eq!(client.eois, [0x70]);
    assert_eq!(
        apic.access(&mut client).mmio_read(LVT_LINT0),
        (1 << 15) | 0x70
    );

    set.local_interrupt(VpIndex::BSP, 0, true, &mut client)
        .unwrap();
    assert!(apic.fold_pending_interrupts());
}

#[test]
fn lint1_nmi_and_pins_without_apic() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apics = enabled_apics(&set, 2, &mut client);

    // NMI delivery.
    apics[0]
        .access(&mut client)
        .mmio_write(LVT_LINT1, 0x400)
        .unwrap();
    set.local_interrupt(VpIndex::BSP, 1, true, &mut client)
        .unwrap();
    assert!(apics[0].scan(&mut client).nmi);
    assert!(!apics[0].flush().nmi);

    // Lowest priority cannot be used on a local pin.
    apics[1]
        .access(&mut client)
        .mmio_write(LVT_LINT0, 0x130)
        .unwrap();
    assert!(matches!(
        set.local_interrupt(VpIndex::new(1), 0, true, &mut client),
        Err(LocalInterruptError::InvalidDeliveryMode(
            DeliveryMode::LOWEST_PRIORITY
        ))
    ));

    // With the APIC disabled LINT0 is the INTR line and LINT1 is NMI.
    apics[0].set_apic_base(0xfee0_0100).unwrap();
    set.local_interrupt(VpIndex::BSP, 0, true, &mut client)
        .unwrap();
    assert!(apics[0].scan(&mut client).extint);
    assert!(apics[0].flush().extint);
    set.local_interrupt(VpIndex::BSP, 0, false, &mut client)
        .unwrap();
    assert!(!apics[0].flush().extint);
    set.local_interrupt(VpIndex::BSP, 1, true, &mut client)
        .unwrap();
    assert!(apics[0].flush().nmi);
}

#[derive(Default)]
struct RecordingTelemetry(Mutex<Vec<(VpIndex, ApicEvent)>>);

impl ApicTelemetry for RecordingTelemetry {
    fn record(&self, vp: VpIndex, event: ApicEvent) {
        self.0.lock().push((vp, event));
    }
}

#[test]
fn telemetry_sink_sees_events() {
    init_tracing();
    let telemetry = Arc::new(RecordingTelemetry::default());
    let set = LocalApicSet::builder().telemetry(telemetry.clone()).build();
    let mut client = TestClient::new();
    let _bsp = set.add_apic(VpIndex::BSP);
    let mut apic = set.add_apic(VpIndex::new(1));

    apic.access(&mut client).mmio_write(TPR, 0x10).unwrap();
    set.post_interrupt(VpIndex::new(1), 0x40, TriggerMode::Edge, 0, &mut client);
    let vp = VpIndex::new(1);
    assert_eq!(
        *telemetry.0.lock(),
        [
            (vp, ApicEvent::MmioWrite),
            (vp, ApicEvent::TprWrite),
            (vp, ApicEvent::PostAccepted),
        ]
    );
    let stats = apic.stats();
    assert_eq!(stats.get(ApicEvent::MmioWrite), 1);
    assert_eq!(stats.iter().map(|(_, n)| n).sum::<u64>(), 3);
}

#[test]
fn concurrent_posts_are_all_folded() {
    init_tracing();
    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);

    std::thread::scope(|s| {
        for t in 0..4u8 {
            let set = &set;
            s.spawn(move || {
                let mut client = TestClient::new();
                for vector in (0x20 + t..=0xff).step_by(4) {
                    assert!(set.post_interrupt(
                        VpIndex::BSP,
                        vector,
                        TriggerMode::Edge,
                        t.into(),
                        &mut client,
                    ));
                }
            });
        }
    });

    assert!(apic.fold_pending_interrupts());
    assert_eq!(
        irr(&apic),
        [0, !0, !0, !0, !0, !0, !0, !0]
    );
}

/// Collects formatted log output.
#[derive(Clone, Default)]
struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn guest_triggered_warnings_are_rate_limited() {
    let output = CaptureWriter::default();
    let writer = output.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .with_writer(move || writer.clone())
        .finish();

    let set = LocalApicSet::builder().build();
    let mut client = TestClient::new();
    let mut apic = enabled_apic(&set, &mut client);
    tracing::subscriber::with_default(subscriber, || {
        let mut access = apic.access(&mut client);
        access.mmio_write(ICR_HIGH, 0).unwrap();
        for _ in 0..1000 {
            // Reserved register.
            access.mmio_read(0x40);
            // ISR is read-only.
            let _ = access.mmio_write(0x100, 1);
            // Remote read delivery mode.
            let _ = access.mmio_write(ICR_LOW, 0x340);
            // x2APIC MSRs in xAPIC mode.
            assert!(access.msr_read(0x808).is_err());
        }
    });

    let output = String::from_utf8_lossy(&output.0.lock()).into_owned();
    let warnings = output.lines().filter(|line| line.contains("WARN")).count();
    assert!(warnings > 0, "{output}");
    assert!(warnings <= 40, "{warnings} warnings");

    // Every access still latched its error.
    let mut access = apic.access(&mut client);
    access.mmio_write(ESR, 0).unwrap();
    assert_ne!(access.mmio_read(ESR) & 0x80, 0);
}
