//! Dispatcher Deterministic Simulation Tests
//!
//! Seeded packet interleavings are fed to a single connection through
//! `queue_frame` while the request-side API drains it. A reference model
//! of the queues predicts every receive, and queue invariants are checked
//! after each step:
//! - no command or data entry is queued for an aborted request id
//! - abort markers are unique per request id
//! - `next_request_id` never hands out an id still held by a queue
//!
//! A second harness races parked receivers with timeouts against late
//! data on a paused clock and checks that every payload is owned by
//! exactly one side.

use bytes::BytesMut;
use conn_server::connection::{ConnStatus, ConnectionEntry};
use conn_server::dispatch::queue_frame;
use conn_server::protocol::{Frame, NetHeader, PacketType};
use conn_server::ConnError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

const MAX_RID: u16 = 8;

#[derive(Debug, Clone)]
enum Op {
    Command { rid: u16, function_code: u16 },
    Data { rid: u16, payload: Vec<u8> },
    Error { rid: u16, code: i32 },
    Abort { rid: u16 },
    ReceiveCommand,
    ReceiveData { rid: u16 },
    ReceiveError { rid: u16 },
    RemoveUnexpected { rid: u16 },
    NextRequestId,
}

/// Expected queue contents, in arrival order.
#[derive(Debug, Default)]
struct QueueModel {
    aborted: HashSet<u16>,
    commands: VecDeque<(u16, u16)>,
    data: VecDeque<(u16, Vec<u8>)>,
    errors: VecDeque<(u16, i32)>,
}

impl QueueModel {
    fn take_first<T>(queue: &mut VecDeque<(u16, T)>, rid: u16) -> Option<T> {
        let pos = queue.iter().position(|(r, _)| *r == rid)?;
        queue.remove(pos).map(|(_, v)| v)
    }

    fn drop_all<T>(queue: &mut VecDeque<(u16, T)>, rid: u16) {
        queue.retain(|(r, _)| *r != rid);
    }
}

#[derive(Debug, Default)]
struct DstResult {
    seed: u64,
    ops: usize,
    delivered: usize,
    violations: Vec<String>,
}

impl DstResult {
    fn is_success(&self) -> bool {
        self.violations.is_empty()
    }
}

struct DispatchHarness {
    rng: ChaCha8Rng,
    conn: ConnectionEntry,
    model: QueueModel,
    result: DstResult,
}

impl DispatchHarness {
    fn with_seed(seed: u64) -> Self {
        let conn = ConnectionEntry::new(3, 4);
        conn.with_lock(|c| c.status = ConnStatus::Open);
        DispatchHarness {
            rng: ChaCha8Rng::seed_from_u64(seed),
            conn,
            model: QueueModel::default(),
            result: DstResult {
                seed,
                ..Default::default()
            },
        }
    }

    fn random_op(&mut self) -> Op {
        let rid = self.rng.gen_range(1..=MAX_RID);
        match self.rng.gen_range(0..100) {
            0..=19 => Op::Command {
                rid,
                function_code: self.rng.gen_range(1..50),
            },
            20..=44 => {
                let len = self.rng.gen_range(0..32);
                let payload = (0..len).map(|_| self.rng.gen()).collect();
                Op::Data { rid, payload }
            }
            45..=49 => Op::Error {
                rid,
                code: -self.rng.gen_range(1..100),
            },
            50..=54 => Op::Abort { rid },
            55..=69 => Op::ReceiveCommand,
            70..=84 => Op::ReceiveData { rid },
            85..=89 => Op::ReceiveError { rid },
            90..=94 => Op::RemoveUnexpected { rid },
            _ => Op::NextRequestId,
        }
    }

    fn violation(&mut self, step: usize, op: &Op, msg: String) {
        self.result
            .violations
            .push(format!("seed {} step {} {:?}: {}", self.result.seed, step, op, msg));
    }

    async fn apply(&mut self, step: usize, op: Op) {
        match &op {
            Op::Command { rid, function_code } => {
                let kind = queue_frame(
                    &self.conn,
                    Frame::header_only(NetHeader::command(*rid, *function_code, 0)),
                );
                assert_eq!(kind, PacketType::Command);
                if !self.model.aborted.contains(rid) {
                    self.model.commands.push_back((*rid, *function_code));
                }
            }
            Op::Data { rid, payload } => {
                let frame = Frame::new(
                    NetHeader::data(*rid, payload.len() as u32),
                    BytesMut::from(&payload[..]),
                );
                queue_frame(&self.conn, frame);
                if !self.model.aborted.contains(rid) {
                    self.model.data.push_back((*rid, payload.clone()));
                }
            }
            Op::Error { rid, code } => {
                queue_frame(&self.conn, Frame::header_only(NetHeader::error(*rid, *code, 0)));
                if !self.model.aborted.contains(rid) {
                    self.model.errors.push_back((*rid, *code));
                }
            }
            Op::Abort { rid } => {
                queue_frame(
                    &self.conn,
                    Frame::header_only(NetHeader::new(PacketType::Abort, *rid)),
                );
                QueueModel::drop_all(&mut self.model.commands, *rid);
                QueueModel::drop_all(&mut self.model.data, *rid);
                self.model.aborted.insert(*rid);
            }
            Op::ReceiveCommand => {
                let expected = self.model.commands.pop_front();
                match (self.conn.receive_command(), expected) {
                    (Ok(header), Some((rid, fc))) => {
                        if header.request_id != rid || header.function_code != fc {
                            let msg = format!("got command {:?}, expected ({}, {})", header, rid, fc);
                            self.violation(step, &op, msg);
                        }
                    }
                    (Err(ConnError::NoDataAvailable), None) => {}
                    (got, expected) => {
                        let msg = format!("got {:?}, expected {:?}", got, expected);
                        self.violation(step, &op, msg);
                    }
                }
            }
            Op::ReceiveData { rid } => {
                let expected = QueueModel::take_first(&mut self.model.data, *rid);
                let got = self.conn.receive_data(*rid, Some(Duration::ZERO)).await;
                match (got, expected) {
                    (Ok(packet), Some(payload)) => {
                        self.result.delivered += 1;
                        if packet.request_id != *rid || packet.payload[..] != payload[..] {
                            let msg = format!("payload mismatch for rid {}", rid);
                            self.violation(step, &op, msg);
                        }
                    }
                    (Err(ConnError::NoDataAvailable), None) => {}
                    (got, expected) => {
                        let msg = format!("got {:?}, expected {:?}", got, expected);
                        self.violation(step, &op, msg);
                    }
                }
            }
            Op::ReceiveError { rid } => {
                let expected = QueueModel::take_first(&mut self.model.errors, *rid);
                match (self.conn.receive_error(*rid), expected) {
                    (Ok(packet), Some(code)) if packet.error_code == code => {}
                    (Err(ConnError::NoDataAvailable), None) => {}
                    (got, expected) => {
                        let msg = format!("got {:?}, expected {:?}", got, expected);
                        self.violation(step, &op, msg);
                    }
                }
            }
            Op::RemoveUnexpected { rid } => {
                self.conn.remove_unexpected_packets(*rid);
                QueueModel::drop_all(&mut self.model.commands, *rid);
                QueueModel::drop_all(&mut self.model.data, *rid);
                QueueModel::drop_all(&mut self.model.errors, *rid);
            }
            Op::NextRequestId => match self.conn.next_request_id() {
                Ok(rid) => {
                    let held = self.conn.with_lock(|c| c.holds_request_id(rid));
                    if rid == 0 || held {
                        self.violation(step, &op, format!("handed out busy request id {}", rid));
                    }
                }
                Err(e) => self.violation(step, &op, format!("allocation failed: {}", e)),
            },
        }
        self.check_invariants(step, &op);
    }

    fn check_invariants(&mut self, step: usize, op: &Op) {
        let problems = self.conn.with_lock(|c| {
            let mut problems = Vec::new();
            let mut markers = HashSet::new();
            for marker in &c.abort_queue {
                if !markers.insert(marker.request_id) {
                    problems.push(format!("duplicate abort marker for {}", marker.request_id));
                }
            }
            for entry in c.request_queue.iter().chain(c.data_queue.iter()) {
                if markers.contains(&entry.request_id) {
                    problems.push(format!("entry queued for aborted id {}", entry.request_id));
                }
            }
            if c.request_queue.len() != self.model.commands.len() {
                problems.push(format!(
                    "{} commands queued, model has {}",
                    c.request_queue.len(),
                    self.model.commands.len()
                ));
            }
            if c.data_queue.len() != self.model.data.len() {
                problems.push(format!(
                    "{} data entries queued, model has {}",
                    c.data_queue.len(),
                    self.model.data.len()
                ));
            }
            if !c.wait_queue.is_empty() {
                problems.push("receiver left parked".to_string());
            }
            problems
        });
        for msg in problems {
            self.violation(step, op, msg);
        }
    }

    async fn run(&mut self, ops: usize) {
        for step in 0..ops {
            let op = self.random_op();
            self.apply(step, op).await;
            self.result.ops += 1;
        }
    }
}

async fn run_batch(start_seed: u64, count: u64, ops: usize) -> Vec<DstResult> {
    let mut results = Vec::new();
    for seed in start_seed..start_seed + count {
        let mut harness = DispatchHarness::with_seed(seed);
        harness.run(ops).await;
        results.push(harness.result);
    }
    results
}

fn assert_all_pass(results: &[DstResult]) {
    let failed: Vec<&String> = results.iter().flat_map(|r| r.violations.iter()).collect();
    let delivered: usize = results.iter().map(|r| r.delivered).sum();
    println!(
        "{} seeds, {} ops, {} payloads delivered, {} violations",
        results.len(),
        results.iter().map(|r| r.ops).sum::<usize>(),
        delivered,
        failed.len()
    );
    assert!(results.iter().all(|r| r.is_success()), "violations: {:#?}", &failed[..failed.len().min(10)]);
}

// =============================================================================
// Queue Model Tests
// =============================================================================

#[tokio::test]
async fn test_dispatch_dst_100_seeds() {
    let results = run_batch(0, 100, 500).await;
    assert_all_pass(&results);
}

#[tokio::test]
async fn test_dispatch_dst_stress_5000_ops() {
    let results = run_batch(4242, 5, 5000).await;
    assert_all_pass(&results);
}

// =============================================================================
// Parked Receiver Races
// =============================================================================

#[derive(Debug)]
enum RaceOutcome {
    Delivered(Vec<u8>),
    TimedOut { waited: Duration },
}

/// One receiver with a timeout against one late data packet.
async fn race_once(rng: &mut ChaCha8Rng) -> Result<(), String> {
    let conn = Arc::new(ConnectionEntry::new(0, 4));
    conn.with_lock(|c| c.status = ConnStatus::Open);
    let rid = rng.gen_range(1..=MAX_RID);
    let timeout = Duration::from_millis(rng.gen_range(1..20));
    let delay = Duration::from_millis(rng.gen_range(0..30));
    let payload: Vec<u8> = (0..rng.gen_range(1..16)).map(|_| rng.gen()).collect();

    let receiver = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            match conn.receive_data(rid, Some(timeout)).await {
                Ok(packet) => Ok(RaceOutcome::Delivered(packet.payload.to_vec())),
                Err(ConnError::TimedOut) => Ok(RaceOutcome::TimedOut {
                    waited: start.elapsed(),
                }),
                Err(e) => Err(format!("unexpected receive error: {}", e)),
            }
        })
    };
    // Let the receiver park before the sender sleeps
    tokio::task::yield_now().await;
    tokio::time::sleep(delay).await;
    queue_frame(
        &conn,
        Frame::new(NetHeader::data(rid, payload.len() as u32), BytesMut::from(&payload[..])),
    );

    let outcome = receiver.await.map_err(|e| e.to_string())??;
    match outcome {
        RaceOutcome::Delivered(got) if got != payload => {
            return Err("delivered payload differs".to_string());
        }
        RaceOutcome::Delivered(_) => {}
        RaceOutcome::TimedOut { waited } if waited < timeout => {
            return Err(format!("timed out after {:?}, limit {:?}", waited, timeout));
        }
        RaceOutcome::TimedOut { .. } => {}
    }

    let leftovers = conn.with_lock(|c| {
        (
            c.data_queue.iter().filter(|e| e.request_id == rid).count(),
            c.wait_queue.len(),
            c.abandoned.len(),
        )
    });
    if leftovers != (0, 0, 0) {
        return Err(format!("leftover (data, waiters, abandoned) = {:?} after {:?}", leftovers, outcome));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_receive_timeout_race_200_seeds() {
    let mut failures = Vec::new();
    for seed in 0..200u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        if let Err(msg) = race_once(&mut rng).await {
            failures.push(format!("seed {}: {}", seed, msg));
        }
    }
    assert!(failures.is_empty(), "race failures: {:#?}", failures);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_wakes_every_receiver() {
    let conn = Arc::new(ConnectionEntry::new(1, 4));
    conn.with_lock(|c| c.status = ConnStatus::Open);

    let mut receivers = Vec::new();
    for rid in 1..=MAX_RID {
        let conn = conn.clone();
        receivers.push(tokio::spawn(async move { conn.receive_data(rid, None).await }));
    }
    while conn.with_lock(|c| c.wait_queue.len()) < MAX_RID as usize {
        tokio::task::yield_now().await;
    }

    conn.interrupt();
    for receiver in receivers {
        let res = receiver.await.unwrap();
        assert!(matches!(res, Err(ConnError::NoDataAvailable)));
    }
    conn.with_lock(|c| {
        assert!(c.wait_queue.is_empty());
        assert_eq!(c.abandoned.len(), MAX_RID as usize);
    });

    // Late data for abandoned ids is dropped instead of queued
    for rid in 1..=MAX_RID {
        queue_frame(&conn, Frame::new(NetHeader::data(rid, 1), BytesMut::from(&b"x"[..])));
    }
    conn.with_lock(|c| {
        assert!(c.data_queue.is_empty());
        assert!(c.abandoned.is_empty());
    });
}
