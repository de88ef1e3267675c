// Drives a Writer under the no-drop backpressure policy so `push` visibly
// blocks once the byte-bounded queue fills, matching scenario 4 of the
// Writer's testable properties.
use packetpipe::{Packet, PacketShape, PushOutcome, WriterBuilder};
use std::time::{Duration, Instant};

const PACKET_BYTES: usize = 1024;

fn main() {
    tracing_subscriber::fmt::init();

    let mut writer = WriterBuilder::new()
        .queue_bytes(4 * PACKET_BYTES)
        .drop_on_full(false)
        .n_workers(1)
        .build(|packet: Packet, index: u64| {
            std::thread::sleep(Duration::from_millis(10));
            println!("archived packet {index} ({} bytes)", packet.len());
            index
        })
        .expect("n_workers is nonzero");

    writer.start().expect("writer not already started");

    let start = Instant::now();
    for i in 0..5u64 {
        let packet = Packet::new(vec![i as u8; PACKET_BYTES], PacketShape::new(1, 1, 1, 1));
        let outcome = writer.push(packet, i).expect("sink never panics in this demo");
        println!("push({i}) -> {outcome:?} at {:.2?}", start.elapsed());
        match outcome {
            PushOutcome::Queued(_) | PushOutcome::Sunk(_) => {}
            PushOutcome::Dropped => unreachable!("backpressure policy never drops"),
        }
    }

    writer.stop();
    println!("all packets archived in {:.2?}", start.elapsed());
}
