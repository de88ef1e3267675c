// Black-box exercise of the loader facade's two independent streams and its
// pluggable FrameTransform capability.
use packetpipe::{FrameTransform, LoaderFacadeBuilder, Packet, PacketShape, PacketSize};

struct TaggingTransform;

impl FrameTransform for TaggingTransform {
    fn normalise(&self, packet: Packet, declared: PacketSize) -> Packet {
        // A stand-in for a real resize/pad transform: proves the facade
        // routes every loaded packet through the capability object before
        // it reaches the precacher, by tagging the first byte with the
        // declared width.
        let mut bytes = packet.bytes().to_vec();
        if let Some(first) = bytes.first_mut() {
            *first = declared.width as u8;
        }
        Packet::new(bytes, packet.shape())
    }
}

#[test]
fn transform_runs_before_the_precacher_ever_sees_the_bytes() {
    let mut facade = LoaderFacadeBuilder::new()
        .buffer_bytes(256 * 1024)
        .build(
            |_i: u64| Packet::new(vec![0u8; 16], PacketShape::new(7, 7, 1, 1)),
            |_i: u64| Packet::new(vec![0u8; 16], PacketShape::new(7, 7, 1, 1)),
            |_i: u64| PacketSize { width: 42, height: 7 },
            TaggingTransform,
        )
        .unwrap();
    facade.start().unwrap();

    let input = facade.get_input(0).unwrap();
    let gt = facade.get_gt(0).unwrap();
    assert_eq!(input.bytes()[0], 42);
    assert_eq!(gt.bytes()[0], 42);

    facade.stop();
}

#[test]
fn end_of_stream_propagates_through_both_streams() {
    let mut facade = LoaderFacadeBuilder::new()
        .buffer_bytes(64 * 1024)
        .build(
            |i: u64| if i >= 3 { Packet::empty() } else { Packet::new(vec![1u8; 8], PacketShape::new(2, 2, 1, 1)) },
            |i: u64| if i >= 3 { Packet::empty() } else { Packet::new(vec![2u8; 8], PacketShape::new(2, 2, 1, 1)) },
            |_i: u64| PacketSize { width: 2, height: 2 },
            packetpipe::IdentityTransform,
        )
        .unwrap();
    facade.start().unwrap();

    for i in 0..3u64 {
        assert!(!facade.get_input(i).unwrap().is_empty());
        assert!(!facade.get_gt(i).unwrap().is_empty());
    }
    assert!(facade.get_input(3).unwrap().is_empty());
    assert!(facade.get_gt(3).unwrap().is_empty());

    facade.stop();
}
