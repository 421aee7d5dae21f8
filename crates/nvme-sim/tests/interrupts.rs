mod common;

use nvme_harness::command::{CompletionEntry, COMPLETION_SIZE};
use nvme_harness::platform::IrqReturn;
use nvme_harness::{
    ControllerState, Error, HarnessConfig, InterruptScheme, LineSettle, Object, PrepareCq,
    SubmitRequest,
};
use nvme_sim::{InterruptCaps, SimConfig};

use common::*;

/// Admin queues, interrupts, then CC.EN.
fn rig_with_interrupts(scheme: InterruptScheme, lines: u16) -> Rig {
    let rig = Rig::new();
    rig.admin_queues(16);
    rig.dev.set_interrupts(scheme, lines).unwrap();
    rig.dev.set_state(ControllerState::Enable).unwrap();
    rig
}

#[test]
fn msix_line_fires_once_and_settles_on_drain() {
    let rig = rig_with_interrupts(InterruptScheme::MsiX, 4);
    assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::MsiX);
    assert!(rig.sim.line_masked(3));

    assert!(rig.create_cq(2, 16, Some(3)).succeeded());
    assert!(rig.create_sq(2, 2, 16).succeeded());
    assert_eq!(rig.dev.line_info(3).unwrap().bound_cqs, vec![2]);
    assert!(rig.dev.cq_info(2).unwrap().irq_enabled);

    rig.dev.unmask_line(3).unwrap();
    assert!(!rig.sim.line_masked(3));

    let cid = rig.dev.submit(&SubmitRequest::new(2, flush_cmd())).unwrap();
    rig.dev.ring_doorbell(2).unwrap();
    rig.dev.flush_interrupt_work().unwrap();

    let vector = rig.sim.vector_of(3).unwrap();
    assert_eq!(rig.sim.deliveries(vector), 1);
    let info = rig.dev.line_info(3).unwrap();
    assert!(info.fired);
    assert_eq!(info.fire_count, 1);
    assert_eq!(info.vector, vector);
    // The top half masks the line until the queue is drained.
    assert!(rig.sim.line_masked(3));

    let mut buf = [0u8; COMPLETION_SIZE];
    let outcome = rig.dev.reap(2, 0, &mut buf).unwrap();
    assert_eq!(outcome.reaped, 1);
    assert_eq!(
        outcome.line,
        Some(LineSettle {
            was_fired: true,
            cleared: true
        })
    );
    assert_eq!(CompletionEntry::parse(&buf).cid, cid);

    let info = rig.dev.line_info(3).unwrap();
    assert!(!info.fired);
    assert_eq!(info.fire_count, 1);
    assert!(!rig.sim.line_masked(3));
}

#[test]
fn msix_line_serves_a_single_queue() {
    let rig = rig_with_interrupts(InterruptScheme::MsiX, 4);
    assert!(rig.create_cq(1, 16, Some(2)).succeeded());

    // Line 0 already serves the admin queue, line 2 serves CQ 1.
    for line in [0, 2] {
        assert!(matches!(
            rig.dev.prepare_cq(PrepareCq {
                id: 5,
                elements: 16,
                contiguous: true,
                irq: Some(line),
            }),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert!(matches!(
        rig.dev.prepare_cq(PrepareCq {
            id: 5,
            elements: 16,
            contiguous: true,
            irq: Some(4),
        }),
        Err(Error::NotFound {
            object: Object::InterruptLine,
            id: 4
        })
    ));
}

#[test]
fn create_cq_interrupt_must_match_the_prepared_binding() {
    let rig = rig_with_interrupts(InterruptScheme::MsiX, 4);
    for (id, irq) in [(1, None), (2, Some(2))] {
        rig.dev
            .prepare_cq(PrepareCq {
                id,
                elements: 16,
                contiguous: true,
                irq,
            })
            .unwrap();
    }

    for (id, irq) in [(1, Some(1)), (2, None), (2, Some(3))] {
        assert!(
            matches!(
                rig.dev
                    .submit(&SubmitRequest::new(0, create_cq_cmd(id, 16, true, irq))),
                Err(Error::InvalidArgument(_))
            ),
            "cq {id} with {irq:?}"
        );
    }
    assert_eq!(rig.dev.sq_info(0).unwrap().tail_virt, 0);

    for (id, irq) in [(1, None), (2, Some(2))] {
        assert!(rig
            .admin(SubmitRequest::new(0, create_cq_cmd(id, 16, true, irq)))
            .succeeded());
    }
    assert_eq!(rig.dev.line_info(2).unwrap().bound_cqs, vec![2]);
}

#[test]
fn each_delivery_runs_one_bottom_half() {
    let rig = Rig::new();
    rig.dev.set_interrupts(InterruptScheme::MsiX, 2).unwrap();
    let vector = rig.sim.vector_of(1).unwrap();
    rig.dev.unmask_line(1).unwrap();

    assert_eq!(rig.sim.fire_vector(vector), IrqReturn::Handled);
    rig.dev.flush_interrupt_work().unwrap();
    assert_eq!(rig.dev.line_info(1).unwrap().fire_count, 1);
    assert!(rig.sim.line_masked(1));

    assert_eq!(rig.sim.fire_vector(vector), IrqReturn::Handled);
    rig.dev.flush_interrupt_work().unwrap();
    let info = rig.dev.line_info(1).unwrap();
    assert_eq!(info.fire_count, 2);
    assert!(info.fired);
    assert!(!rig.dev.line_info(0).unwrap().fired);

    assert_eq!(rig.sim.fire_vector(0xdead), IrqReturn::None);
}

#[test]
fn stale_msix_pending_bit_refuses_the_scheme() {
    let rig = Rig::new();
    rig.sim.set_stale_msix_pending(&[1]);
    assert!(matches!(
        rig.dev.set_interrupts(InterruptScheme::MsiX, 4),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::None);
    assert!(matches!(
        rig.dev.line_info(0),
        Err(Error::NotFound { .. })
    ));

    rig.sim.set_stale_msix_pending(&[]);
    rig.dev.set_interrupts(InterruptScheme::MsiX, 4).unwrap();
    assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::MsiX);
}

#[test]
fn scheme_cannot_change_while_enabled() {
    let rig = Rig::enabled(16);
    assert!(matches!(
        rig.dev.set_interrupts(InterruptScheme::MsiX, 2),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::None);
}

#[test]
fn unsupported_schemes_and_line_counts_are_refused() {
    let rig = Rig::with(
        SimConfig {
            interrupts: InterruptCaps {
                pin: false,
                ..InterruptCaps::default()
            },
            ..SimConfig::default()
        },
        HarnessConfig::default(),
    );

    let err = rig.dev.set_interrupts(InterruptScheme::Pin, 1).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
    assert_eq!(err.errno(), -95);

    for (scheme, count) in [
        (InterruptScheme::MsiSingle, 2),
        (InterruptScheme::MsiMulti, 9),
        (InterruptScheme::MsiMulti, 33),
        (InterruptScheme::MsiX, 17),
        (InterruptScheme::MsiX, 0),
    ] {
        assert!(
            matches!(
                rig.dev.set_interrupts(scheme, count),
                Err(Error::InvalidArgument(_))
            ),
            "{scheme:?} x{count}"
        );
        assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::None);
    }

    rig.dev.set_interrupts(InterruptScheme::MsiMulti, 8).unwrap();
    // Switching schemes replaces the old one.
    rig.dev.set_interrupts(InterruptScheme::MsiSingle, 1).unwrap();
    assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::MsiSingle);
    assert!(rig.dev.line_info(1).is_err());
    rig.dev.set_interrupts(InterruptScheme::None, 0).unwrap();
    assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::None);
}

#[test]
fn shared_pin_line_clears_only_when_every_queue_is_empty() {
    let rig = rig_with_interrupts(InterruptScheme::Pin, 1);
    assert!(!rig.sim.line_masked(0));

    rig.io_pair_with_irq(1, 16, 0);
    rig.io_pair_with_irq(2, 16, 0);
    assert_eq!(rig.dev.line_info(0).unwrap().bound_cqs, vec![0, 1, 2]);

    rig.dev.submit(&SubmitRequest::new(1, flush_cmd())).unwrap();
    rig.dev.submit(&SubmitRequest::new(2, flush_cmd())).unwrap();
    rig.dev.ring_doorbell(1).unwrap();
    rig.dev.ring_doorbell(2).unwrap();
    rig.dev.flush_interrupt_work().unwrap();
    assert!(rig.dev.line_info(0).unwrap().fired);

    let mut buf = [0u8; COMPLETION_SIZE];
    let outcome = rig.dev.reap(2, 0, &mut buf).unwrap();
    assert_eq!(
        outcome.line,
        Some(LineSettle {
            was_fired: true,
            cleared: false
        })
    );
    rig.dev.flush_interrupt_work().unwrap();
    assert!(rig.dev.line_info(0).unwrap().fired);

    let outcome = rig.dev.reap(1, 0, &mut buf).unwrap();
    assert_eq!(
        outcome.line,
        Some(LineSettle {
            was_fired: true,
            cleared: true
        })
    );
    assert!(!rig.dev.line_info(0).unwrap().fired);
    assert!(!rig.sim.line_masked(0));
}

#[test]
fn msi_multi_lines_map_to_their_queues() {
    let rig = rig_with_interrupts(InterruptScheme::MsiMulti, 4);
    rig.io_pair_with_irq(1, 16, 2);

    rig.dev.submit(&SubmitRequest::new(1, flush_cmd())).unwrap();
    rig.dev.ring_doorbell(1).unwrap();
    rig.dev.flush_interrupt_work().unwrap();

    let vector = rig.sim.vector_of(2).unwrap();
    assert_eq!(rig.sim.deliveries(vector), 1);
    assert!(rig.dev.line_info(2).unwrap().fired);
    assert!(rig.sim.line_masked(2));

    let mut buf = [0u8; COMPLETION_SIZE];
    let outcome = rig.dev.reap(1, 0, &mut buf).unwrap();
    assert_eq!(outcome.line.map(|settle| settle.cleared), Some(true));
    assert!(!rig.sim.line_masked(2));
}

#[test]
fn masking_needs_an_existing_line() {
    let rig = Rig::new();
    assert!(matches!(
        rig.dev.mask_line(0),
        Err(Error::NotFound {
            object: Object::InterruptLine,
            id: 0
        })
    ));

    rig.dev.set_interrupts(InterruptScheme::MsiX, 2).unwrap();
    rig.dev.unmask_line(1).unwrap();
    assert!(!rig.sim.line_masked(1));
    rig.dev.mask_line(1).unwrap();
    assert!(rig.sim.line_masked(1));
    assert!(rig.dev.unmask_line(2).is_err());
}

#[test]
fn full_teardown_drops_the_scheme() {
    let rig = rig_with_interrupts(InterruptScheme::MsiX, 4);
    assert!(rig.create_cq(1, 16, Some(1)).succeeded());

    rig.dev.set_state(ControllerState::DisableComplete).unwrap();
    assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::None);
    assert!(rig.dev.line_info(1).is_err());

    // A soft disable keeps it.
    let rig = rig_with_interrupts(InterruptScheme::MsiX, 4);
    assert!(rig.create_cq(1, 16, Some(1)).succeeded());
    rig.dev.set_state(ControllerState::Disable).unwrap();
    assert_eq!(rig.dev.interrupt_scheme(), InterruptScheme::MsiX);
    assert!(rig.dev.line_info(1).unwrap().bound_cqs.is_empty());
}
