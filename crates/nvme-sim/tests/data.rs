mod common;

use nvme_harness::command::{DataDirection, DescriptorCaps};
use nvme_harness::{
    BitBucket, ChainKind, ChainRequest, Error, Framing, Object, Release, SubmitRequest,
    UserBuffer,
};
use nvme_sim::{PAGE_SIZE, SECTOR_SIZE};
use proptest::prelude::*;

use common::*;

fn read_into(rig: &Rig, sqid: u16, lba: u64, buffer: UserBuffer) -> u16 {
    let blocks = (buffer.len / SECTOR_SIZE) as u32;
    rig.dev
        .submit(
            &SubmitRequest::new(sqid, io_cmd(OPC_READ, lba, blocks))
                .with_data(buffer, DataDirection::FromDevice)
                .with_caps(data_caps()),
        )
        .unwrap()
}

#[test]
fn three_page_buffer_without_a_list_is_refused_cleanly() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);

    let buffer = rig.user_buffer(&pattern(3 * PAGE_SIZE, 1));
    let err = rig
        .dev
        .submit(
            &SubmitRequest::new(1, io_cmd(OPC_WRITE, 0, 24))
                .with_data(buffer, DataDirection::ToDevice)
                .with_caps(DescriptorCaps::PRP1_PAGE | DescriptorCaps::PRP2_PAGE),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    assert_eq!(rig.sim.pinned_pages(), 0);
    assert_eq!(rig.dev.descriptor_pages_outstanding(), 0);
    let sq = rig.dev.sq_info(1).unwrap();
    assert_eq!((sq.tail_virt, sq.outstanding), (0, 0));
}

#[test]
fn multi_page_write_goes_through_a_prp_list() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);

    let data = pattern(5 * PAGE_SIZE, 7);
    let cid = rig.write_blocks(1, 0, &data);
    assert_eq!(rig.sim.pinned_pages(), 5);
    assert_eq!(rig.dev.descriptor_pages_outstanding(), 1);

    rig.dev.ring_doorbell(1).unwrap();
    let entry = rig.reap_one(1);
    assert_eq!(entry.cid, cid);
    assert!(entry.succeeded());
    assert_eq!(rig.sim.pinned_pages(), 0);
    assert_eq!(rig.dev.descriptor_pages_outstanding(), 0);
    assert_eq!(rig.sim.namespace_read(0, data.len() / SECTOR_SIZE), data);

    let out = rig.user_buffer(&vec![0; data.len()]);
    read_into(&rig, 1, 0, out);
    rig.dev.ring_doorbell(1).unwrap();
    assert!(rig.reap_one(1).succeeded());
    assert_eq!(rig.sim.read_user(out.addr, out.len).unwrap(), data);
}

#[test]
fn unaligned_two_page_write_uses_prp2_directly() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);

    let base = rig.sim.map_user(2 * PAGE_SIZE);
    let data = pattern(PAGE_SIZE, 3);
    rig.sim.write_user(base + 512, &data).unwrap();
    let buffer = UserBuffer {
        addr: base + 512,
        len: data.len(),
    };
    rig.dev
        .submit(
            &SubmitRequest::new(1, io_cmd(OPC_WRITE, 100, 8))
                .with_data(buffer, DataDirection::ToDevice)
                .with_caps(data_caps()),
        )
        .unwrap();
    assert_eq!(rig.sim.pinned_pages(), 2);
    assert_eq!(rig.dev.descriptor_pages_outstanding(), 0);

    rig.dev.ring_doorbell(1).unwrap();
    assert!(rig.reap_one(1).succeeded());
    assert_eq!(rig.sim.namespace_read(100, 8), data);
}

#[test]
fn bit_bucket_leaves_its_range_untouched_on_read() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);

    let stored = pattern(2048, 11);
    rig.sim.namespace_write(0, &stored);

    let out = rig.user_buffer(&[0xee; 2048]);
    let cid = rig
        .dev
        .submit(
            &SubmitRequest::new(1, io_cmd(OPC_READ, 0, 4).with_psdt(1))
                .with_data(out, DataDirection::FromDevice)
                .with_bit_buckets(vec![BitBucket {
                    offset: 512,
                    length: 1024,
                }]),
        )
        .unwrap();
    // Data, bucket, data: three descriptors in one segment page.
    assert_eq!(rig.dev.descriptor_pages_outstanding(), 1);

    rig.dev.ring_doorbell(1).unwrap();
    let entry = rig.reap_one(1);
    assert_eq!(entry.cid, cid);
    assert!(entry.succeeded());

    let got = rig.sim.read_user(out.addr, out.len).unwrap();
    assert_eq!(&got[..512], &stored[..512]);
    assert!(got[512..1536].iter().all(|&b| b == 0xee));
    assert_eq!(&got[1536..], &stored[1536..]);
}

#[test]
fn single_sgl_descriptor_travels_inline() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);

    let data = pattern(1024, 5);
    let buffer = rig.user_buffer(&data);
    rig.dev
        .submit(
            &SubmitRequest::new(1, io_cmd(OPC_WRITE, 8, 2).with_psdt(1))
                .with_data(buffer, DataDirection::ToDevice),
        )
        .unwrap();
    assert_eq!(rig.dev.descriptor_pages_outstanding(), 0);

    rig.dev.ring_doorbell(1).unwrap();
    assert!(rig.reap_one(1).succeeded());
    assert_eq!(rig.sim.namespace_read(8, 2), data);
}

#[test]
fn bit_buckets_need_sgl_and_a_buffer() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);
    let bucket = vec![BitBucket {
        offset: 0,
        length: 512,
    }];

    let buffer = rig.user_buffer(&[0; 1024]);
    assert!(matches!(
        rig.dev.submit(
            &SubmitRequest::new(1, io_cmd(OPC_READ, 0, 2))
                .with_data(buffer, DataDirection::FromDevice)
                .with_caps(data_caps())
                .with_bit_buckets(bucket.clone()),
        ),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        rig.dev.submit(
            &SubmitRequest::new(1, io_cmd(OPC_READ, 0, 2).with_psdt(1))
                .with_bit_buckets(bucket),
        ),
        Err(Error::InvalidArgument(_))
    ));
    // Overlapping and out-of-range buckets.
    for buckets in [
        vec![
            BitBucket {
                offset: 0,
                length: 600,
            },
            BitBucket {
                offset: 512,
                length: 8,
            },
        ],
        vec![BitBucket {
            offset: 1000,
            length: 100,
        }],
    ] {
        assert!(matches!(
            rig.dev.submit(
                &SubmitRequest::new(1, io_cmd(OPC_READ, 0, 2).with_psdt(1))
                    .with_data(buffer, DataDirection::FromDevice)
                    .with_bit_buckets(buckets),
            ),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert_eq!(rig.sim.pinned_pages(), 0);
    assert_eq!(rig.dev.sq_info(1).unwrap().tail_virt, 0);
}

#[test]
fn failed_pin_leaves_nothing_behind() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);

    let buffer = rig.user_buffer(&pattern(4 * PAGE_SIZE, 2));
    rig.sim.fail_next_pin();
    assert!(rig
        .dev
        .submit(
            &SubmitRequest::new(1, io_cmd(OPC_WRITE, 0, 32))
                .with_data(buffer, DataDirection::ToDevice)
                .with_caps(data_caps()),
        )
        .is_err());
    assert_eq!(rig.sim.pinned_pages(), 0);
    assert_eq!(rig.dev.descriptor_pages_outstanding(), 0);
    assert_eq!(rig.dev.sq_info(1).unwrap().outstanding, 0);
}

#[test]
fn metadata_pointer_lands_in_the_command() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);

    assert!(matches!(
        rig.dev.create_meta(1),
        Err(Error::NotFound {
            object: Object::MetadataPool,
            ..
        })
    ));
    assert!(matches!(
        rig.dev.create_meta_pool(6),
        Err(Error::InvalidArgument(_))
    ));
    rig.dev.create_meta_pool(64).unwrap();
    assert!(matches!(
        rig.dev.create_meta_pool(64),
        Err(Error::AlreadyExists { .. })
    ));

    let paddr = rig.dev.create_meta(7).unwrap();
    assert!(matches!(
        rig.dev.create_meta(7),
        Err(Error::AlreadyExists {
            object: Object::MetadataBuffer,
            id: 7
        })
    ));
    assert_eq!(rig.dev.metadata_buffers_outstanding(), 1);

    rig.dev
        .submit(
            &SubmitRequest::new(1, flush_cmd())
                .with_caps(DescriptorCaps::MPTR)
                .with_metadata(7),
        )
        .unwrap();
    rig.dev.ring_doorbell(1).unwrap();
    assert!(rig.reap_one(1).succeeded());

    let log = rig.sim.command_log();
    let last = log.last().unwrap();
    assert_eq!(u64::from_le_bytes(last[16..24].try_into().unwrap()), paddr);

    // Unknown id, and a metadata id without the capability.
    assert!(matches!(
        rig.dev.submit(
            &SubmitRequest::new(1, flush_cmd())
                .with_caps(DescriptorCaps::MPTR)
                .with_metadata(8),
        ),
        Err(Error::NotFound {
            object: Object::MetadataBuffer,
            id: 8
        })
    ));
    assert!(matches!(
        rig.dev
            .submit(&SubmitRequest::new(1, flush_cmd()).with_metadata(7)),
        Err(Error::InvalidArgument(_))
    ));

    assert_eq!(rig.dev.delete_meta(7), Release::Released);
    assert_eq!(rig.dev.delete_meta(7), Release::AlreadyGone);
    assert_eq!(rig.dev.metadata_buffers_outstanding(), 0);
}

#[test]
fn chain_exposes_frames_of_scattered_pages() {
    let rig = Rig::new();
    let buffer = rig.user_buffer(&pattern(3 * PAGE_SIZE, 9));

    let mut chain = rig
        .dev
        .build_chain(&ChainRequest {
            buffer,
            direction: DataDirection::ToDevice,
            caps: data_caps(),
            framing: Framing::Prp,
            kind: ChainKind::Data,
            bit_buckets: &[],
        })
        .unwrap();
    assert_eq!(chain.pinned_pages(), 3);
    assert_eq!(chain.segments().len(), 3);
    assert_eq!(chain.descriptor_pages().len(), 1);
    assert_eq!(chain.phys_at(0), Some(chain.segments()[0].paddr));
    assert_eq!(chain.phys_at(PAGE_SIZE + 8), Some(chain.segments()[1].paddr + 8));
    assert_eq!(chain.phys_at(3 * PAGE_SIZE), None);

    assert_eq!(chain.release(), Release::Released);
    assert_eq!(chain.phys_at(0), None);
}

#[test]
fn pages_the_device_writes_are_unpinned_dirty() {
    let rig = Rig::enabled(16);
    rig.io_pair(1, 16);

    rig.write_blocks(1, 0, &pattern(2 * PAGE_SIZE, 5));
    rig.dev.ring_doorbell(1).unwrap();
    assert!(rig.reap_one(1).succeeded());
    assert_eq!(rig.sim.pinned_pages(), 0);
    assert_eq!(rig.sim.dirty_unpins(), 0);

    let out = rig.user_buffer(&vec![0; 2 * PAGE_SIZE]);
    read_into(&rig, 1, 0, out);
    rig.dev.ring_doorbell(1).unwrap();
    assert!(rig.reap_one(1).succeeded());
    assert_eq!(rig.sim.dirty_unpins(), 2);

    let both = rig.user_buffer(&pattern(3 * PAGE_SIZE, 6));
    let mut chain = rig
        .dev
        .build_chain(&ChainRequest {
            buffer: both,
            direction: DataDirection::Bidirectional,
            caps: data_caps(),
            framing: Framing::Prp,
            kind: ChainKind::Data,
            bit_buckets: &[],
        })
        .unwrap();
    assert_eq!(rig.sim.dirty_unpins(), 2);
    assert_eq!(chain.release(), Release::Released);
    assert_eq!(rig.sim.dirty_unpins(), 5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Building a chain and releasing it returns every pin and descriptor
    /// page; releasing again is a no-op.
    #[test]
    fn chain_release_returns_every_resource(
        offset in (0usize..PAGE_SIZE / 4).prop_map(|dw| dw * 4),
        len in 1usize..(6 * PAGE_SIZE),
        sgl in any::<bool>(),
    ) {
        let rig = Rig::new();
        let base = rig.sim.map_user(offset + len);
        let buffer = UserBuffer { addr: base + offset as u64, len };

        let mut chain = rig.dev.build_chain(&ChainRequest {
            buffer,
            direction: DataDirection::Bidirectional,
            caps: data_caps(),
            framing: if sgl { Framing::Sgl } else { Framing::Prp },
            kind: ChainKind::Data,
            bit_buckets: &[],
        }).unwrap();

        let pages = (offset + len).div_ceil(PAGE_SIZE);
        prop_assert_eq!(chain.pinned_pages(), pages);
        prop_assert_eq!(rig.sim.pinned_pages(), pages);
        prop_assert_eq!(
            chain.segments().iter().map(|s| s.len).sum::<usize>(),
            len
        );
        prop_assert_eq!(
            rig.dev.descriptor_pages_outstanding(),
            chain.descriptor_pages().len()
        );

        prop_assert_eq!(chain.release(), Release::Released);
        prop_assert_eq!(rig.sim.pinned_pages(), 0);
        prop_assert_eq!(rig.dev.descriptor_pages_outstanding(), 0);
        prop_assert_eq!(rig.sim.coherent_regions(), 0);
        prop_assert_eq!(chain.release(), Release::AlreadyGone);
    }
}
