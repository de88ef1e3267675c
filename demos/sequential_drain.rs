// Drives a Precacher through a sequential scan, the common access pattern
// for an evaluation harness walking a dataset in order.
use packetpipe::{Packet, PacketShape, PrecacherBuilder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const FRAME_COUNT: u64 = 200;
const FRAME_BYTES: usize = 64 * 1024;

fn main() {
    tracing_subscriber::fmt::init();

    let loads = Arc::new(AtomicU64::new(0));
    let loads_for_loader = Arc::clone(&loads);
    let mut precacher = PrecacherBuilder::new()
        .buffer_bytes(4 * 1024 * 1024)
        .build(move |i: u64| {
            loads_for_loader.fetch_add(1, Ordering::SeqCst);
            if i >= FRAME_COUNT {
                return Packet::empty();
            }
            let byte = (i % 256) as u8;
            Packet::new(vec![byte; FRAME_BYTES], PacketShape::new(256, 256, 1, 1))
        })
        .expect("buffer_bytes is nonzero");

    precacher.start().expect("precacher not already started");

    let start = std::time::Instant::now();
    for i in 0..FRAME_COUNT {
        let packet = precacher.get_packet(i).expect("worker thread alive");
        assert_eq!(packet.bytes()[0], (i % 256) as u8);
    }
    println!(
        "drained {FRAME_COUNT} frames in {:.2?} ({} loader invocations, prefill included)",
        start.elapsed(),
        loads.load(Ordering::SeqCst)
    );

    precacher.stop();
}
