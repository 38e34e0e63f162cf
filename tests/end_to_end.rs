//! End-to-end exercises of the buffer chain workflows a protocol stack
//! performs: building frames in place, sharing and isolating, splitting and
//! reassembling messages, and restoring contiguity.

use netbuf::{Error, NetBuf};

#[test]
fn test_create_append_trim() {
    let mut buf = NetBuf::create(64).unwrap();
    buf.advance(8);
    buf.tail_mut()[..5].copy_from_slice(b"hello");
    buf.append(5);

    assert_eq!(buf.headroom(), 8);
    assert_eq!(buf.len(), 5);
    assert_eq!(buf.tailroom(), buf.capacity() - 13);
    assert_eq!(buf, b"hello");
}

#[test]
fn test_zero_copy_header_prepend() {
    let mut buf = NetBuf::create(64).unwrap();
    buf.advance(16);
    buf.tail_mut()[..5].copy_from_slice(b"pay:5");
    buf.append(5);

    // The header goes into reserved headroom; the payload never moves.
    let payload_ptr = buf.as_ptr();
    buf.prepend(4);
    buf.data_mut()[..4].copy_from_slice(b"HDR1");

    assert!(!buf.is_chained());
    assert_eq!(buf.len(), 9);
    assert_eq!(buf, b"HDR1pay:5");
    assert_eq!(unsafe { buf.as_ptr().add(4) }, payload_ptr);
}

#[test]
fn test_share_then_unshare_isolates_writes() {
    let mut first = NetBuf::copy_buffer(b"abc", 0, 0).unwrap();
    let second = first.try_clone_one().unwrap();
    assert!(first.is_shared());
    assert!(second.is_shared());

    first.unshare().unwrap();
    first.data_mut()[0] = b'Z';

    assert_eq!(first, b"Zbc");
    assert_eq!(second, b"abc");
}

#[test]
fn test_chain_coalesce_preserves_rooms() {
    let mut head = NetBuf::copy_buffer(b"AB", 4, 2).unwrap();
    head.prepend_chain(NetBuf::copy_buffer(b"CD", 0, 0).unwrap());
    head.prepend_chain(NetBuf::copy_buffer(b"EF", 1, 6).unwrap());

    let flat = head.coalesce().unwrap();
    assert_eq!(flat, b"ABCDEF");
    assert_eq!(head.count_elements(), 1);
    assert!(head.headroom() >= 4);
    assert!(head.tailroom() >= 6);
}

#[test]
fn test_chain_surgery_round_trip() {
    let mut head = NetBuf::copy_buffer(b"A", 0, 0).unwrap();
    for part in [b"B", b"C", b"D", b"E"] {
        head.prepend_chain(NetBuf::copy_buffer(part, 0, 0).unwrap());
    }
    assert_eq!(head, b"ABCDE");

    let sep = head.separate(1..4);
    assert_eq!(sep, b"BCD");
    assert_eq!(head, b"AE");

    head.append_chain(sep);
    assert_eq!(head, b"ABCDE");
    assert_eq!(head.count_elements(), 5);
}

#[test]
fn test_gather_stops_early() {
    let segment = vec![0x11u8; 100];
    let mut head = NetBuf::copy_buffer(&segment, 0, 0).unwrap();
    for _ in 0..9 {
        head.prepend_chain(NetBuf::copy_buffer(&segment, 0, 0).unwrap());
    }

    head.gather(250).unwrap();
    assert!(head.len() >= 250);
    assert!(head.count_elements() >= 7, "the tail is untouched");
    assert_eq!(head.total_len(), 1000);
}

#[test]
fn test_copy_and_wrap_round_trips() {
    let buf = NetBuf::copy_buffer(b"round trip", 0, 0).unwrap();
    assert_eq!(buf, b"round trip");
    assert!(!buf.is_shared());

    let wrapped = NetBuf::wrap_static(b"wrapped").unwrap();
    let collected: Vec<u8> = wrapped.iter().flatten().copied().collect();
    assert_eq!(collected, b"wrapped");
    assert!(wrapped.is_shared());
}

#[test]
fn test_reserve_is_idempotent_and_monotonic() {
    let mut buf = NetBuf::copy_buffer(b"data", 0, 0).unwrap();
    buf.reserve(16, 16).unwrap();
    let (head, tail, ptr) = (buf.headroom(), buf.tailroom(), buf.as_ptr());
    assert!(head >= 16 && tail >= 16);

    // Smaller or equal asks are no-ops.
    buf.reserve(16, 16).unwrap();
    buf.reserve(8, 4).unwrap();
    assert_eq!((buf.headroom(), buf.tailroom(), buf.as_ptr()), (head, tail, ptr));
    assert_eq!(buf, b"data");
}

#[test]
fn test_clone_then_drop_restores_unshared() {
    let buf = NetBuf::copy_buffer(b"state", 2, 0).unwrap();
    let before = (buf.len(), buf.headroom(), buf.tailroom());

    let clone = buf.try_clone_one().unwrap();
    assert!(buf.is_shared_one() && clone.is_shared_one());
    drop(clone);

    assert_eq!((buf.len(), buf.headroom(), buf.tailroom()), before);
    assert_eq!(buf, b"state");
    assert!(!buf.is_shared_one());
}

#[test]
fn test_writev_vector_over_chain() {
    let mut head = NetBuf::copy_buffer(b"GET ", 0, 0).unwrap();
    head.prepend_chain(NetBuf::create(16).unwrap());
    head.prepend_chain(NetBuf::copy_buffer(b"/index HTTP/1.1", 0, 0).unwrap());

    let slices = head.io_slices();
    assert_eq!(slices.len(), 2, "empty fragments are skipped");
    let flattened: Vec<u8> = slices.iter().flat_map(|s| s.iter().copied()).collect();
    assert_eq!(flattened, b"GET /index HTTP/1.1");
}

#[test]
fn test_handover_releases_everything() {
    let mut head = NetBuf::from_vec(b"head".to_vec()).unwrap();
    head.prepend_chain(NetBuf::copy_buffer(b"-tail", 0, 0).unwrap());
    let bytes = head.into_bytes().unwrap();
    assert_eq!(&bytes[..], b"head-tail");
}

#[test]
fn test_overflow_is_strongly_safe() {
    let mut head = NetBuf::copy_buffer(b"ab", 0, 0).unwrap();
    head.prepend_chain(NetBuf::copy_buffer(b"cd", 0, 0).unwrap());
    assert_eq!(head.gather(1 << 40), Err(Error::Overflow));
    assert_eq!(head.count_elements(), 2);
    assert_eq!(head, b"abcd");
}
