// Reconnect and delta-sync behavior of the session fan-out, exercised
// through the public library API.

use itwillsync::core::protocol::ServerMessage;
use itwillsync::server::Fanout;
use std::sync::Arc;
use tokio::sync::mpsc;

fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

#[tokio::test]
async fn reconnecting_client_gets_exactly_the_missed_bytes() {
    let fanout = Arc::new(Fanout::new());

    // First connection: watch output through seq 1000.
    let (tx, mut rx) = mpsc::channel(64);
    fanout.join_snapshot(tx);
    fanout.push_output(&"a".repeat(1000));
    let frames = drain(&mut rx);
    let last_seq = match frames.last() {
        Some(ServerMessage::Data { seq, .. }) => *seq,
        other => panic!("expected data frame, got {:?}", other),
    };
    assert_eq!(last_seq, 1000);

    // Client disconnects; 500 more characters are produced.
    drop(rx);
    fanout.push_output(&"b".repeat(500));

    // Reconnect with resume{lastSeq: 1000}: first frame is seq 1500 with
    // exactly the 500 missed characters.
    let (tx, mut rx) = mpsc::channel(64);
    fanout.join_resume(tx, last_seq);
    match drain(&mut rx).first() {
        Some(ServerMessage::Data { data, seq }) => {
            assert_eq!(*seq, 1500);
            assert_eq!(data.len(), 500);
            assert!(data.chars().all(|c| c == 'b'));
        }
        other => panic!("expected delta frame, got {:?}", other),
    }
}

#[tokio::test]
async fn fresh_client_gets_empty_snapshot_then_live_output() {
    let fanout = Arc::new(Fanout::new());
    let (tx, mut rx) = mpsc::channel(64);
    fanout.join_snapshot(tx);

    // Scrollback is empty at connect time: the parity frame is empty.
    match rx.try_recv() {
        Ok(ServerMessage::Data { data, seq }) => {
            assert_eq!(data, "");
            assert_eq!(seq, 0);
        }
        other => panic!("expected empty snapshot, got {:?}", other),
    }

    fanout.push_output("$ echo hi\r\nhi\r\n");
    match rx.try_recv() {
        Ok(ServerMessage::Data { data, .. }) => assert!(data.contains("hi")),
        other => panic!("expected live frame, got {:?}", other),
    }
}

#[tokio::test]
async fn resume_past_trim_replays_surviving_window_with_monotone_seq() {
    let fanout = Arc::new(Fanout::new());
    // Push well past the 50k scrollback cap.
    for _ in 0..70 {
        fanout.push_output(&"x".repeat(1000));
    }

    // A client that was at seq 100 reconnects. That point is long trimmed;
    // it gets the retained window and a tail seq of 70k.
    let (tx, mut rx) = mpsc::channel(64);
    fanout.join_resume(tx, 100);
    match drain(&mut rx).first() {
        Some(ServerMessage::Data { data, seq }) => {
            assert_eq!(*seq, 70_000);
            assert_eq!(data.len(), 50_000);
        }
        other => panic!("expected windowed replay, got {:?}", other),
    }
}

#[tokio::test]
async fn every_client_sees_frames_in_seq_order() {
    let fanout = Arc::new(Fanout::new());
    let (tx, mut rx) = mpsc::channel(1024);
    fanout.join_snapshot(tx);

    for i in 0..100 {
        fanout.push_output(&format!("line {}\n", i));
    }

    let mut previous = 0u64;
    let mut total_chars = 0u64;
    for frame in drain(&mut rx) {
        let ServerMessage::Data { data, seq } = frame else {
            continue;
        };
        total_chars += data.chars().count() as u64;
        assert!(seq > previous || (seq == 0 && previous == 0));
        assert_eq!(seq, total_chars);
        previous = seq;
    }
}
