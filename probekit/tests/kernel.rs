//! Live-kernel integration tests.
//!
//! Everything here needs root and a bpf-capable kernel, so the tests are
//! ignored by default:
//!
//! ```text
//! sudo -E cargo test --test kernel -- --ignored
//! ```

use probekit::consts::{MapType, ProgramType};
use probekit::insn::{Asm, Reg};
use probekit::maps::{MapSpec, PodCodec, TypedMap, UpdateFlags};
use probekit::progs::{tracefs, LoadOptions, Program};
use probekit::{Map, RingBuffer};

fn trivial_program(retval: i32) -> Vec<u8> {
    let mut asm = Asm::new();
    asm.mov64(Reg::R0, retval).exit();
    asm.assemble()
}

#[test]
#[ignore = "needs root and a bpf-capable kernel"]
fn xdp_test_run_returns_bytecode_verdict() {
    let prog = Program::load(
        ProgramType::Xdp,
        &trivial_program(2),
        "GPL",
        LoadOptions::default(),
    )
    .expect("load XDP program");

    let input = [0xa5u8; 64];
    let out = prog.test_run(&input, 1).expect("test run");
    assert_eq!(out.retval, 2);
    assert_eq!(out.data_out, input);
    // duration is unsigned; the assertion documents the contract
    let _duration: u32 = out.duration_ns;
}

#[test]
#[ignore = "needs root and a bpf-capable kernel"]
fn kprobe_attach_detach_leaves_no_residue() {
    let mut prog = Program::load(
        ProgramType::Kprobe,
        &trivial_program(0),
        "GPL",
        LoadOptions::default(),
    )
    .expect("load kprobe program");

    prog.attach_kprobe("do_nanosleep").expect("attach kprobe");
    let event_name = match prog.attachments() {
        [probekit::progs::Attachment::Probe { event_name, .. }] => event_name.clone(),
        other => panic!("unexpected attachments: {} entries", other.len()),
    };

    let events = std::fs::read_to_string(format!(
        "{}/kprobe_events",
        tracefs::TRACEFS_ROOT
    ))
    .expect("read kprobe_events");
    assert!(events.contains(&event_name), "event visible while attached");

    prog.close().expect("close detaches");

    let events = std::fs::read_to_string(format!(
        "{}/kprobe_events",
        tracefs::TRACEFS_ROOT
    ))
    .expect("read kprobe_events");
    assert!(
        !events.contains(&event_name),
        "no tracefs residue after detach"
    );
}

#[test]
#[ignore = "needs root and a bpf-capable kernel"]
fn map_codec_roundtrip_against_kernel() {
    let map: TypedMap<PodCodec<u32, u64>> =
        TypedMap::create_pod(MapType::Hash, 128, Some("pk_test")).expect("create map");

    for key in 0..32u32 {
        map.update(&key, &(key as u64 * 3), UpdateFlags::ANY)
            .expect("update");
    }
    assert_eq!(map.lookup(&7).expect("lookup"), Some(21));
    assert_eq!(map.lookup(&999).expect("lookup"), None);

    assert!(map.delete(&7).expect("delete"));
    assert!(!map.delete(&7).expect("second delete finds nothing"));
    assert_eq!(map.lookup(&7).expect("lookup after delete"), None);

    let mut seen: Vec<u32> = map
        .entries()
        .map(|e| e.expect("entry").0)
        .collect();
    seen.sort_unstable();
    let expected: Vec<u32> = (0..32).filter(|k| *k != 7).collect();
    assert_eq!(seen, expected, "iteration visits every key exactly once");
}

#[test]
#[ignore = "needs root and a bpf-capable kernel"]
fn ringbuf_map_shape_accepted_by_kernel() {
    let page = 4096u32;
    let map = Map::create(MapSpec::new(MapType::Ringbuf, 0, 0, page * 4)).expect("create ringbuf");
    let ring = RingBuffer::new(map).expect("mmap ringbuf");
    assert_eq!(ring.consumer_pos(), 0);
    assert_eq!(ring.producer_pos(), 0);
    assert!(ring.peek(8).is_empty());
}
