//! ReplicaManager tests driven through a scripted backup wire.

use super::*;

use std::collections::HashSet;

use crate::rpc::{
    BackupRequest, FreeOutcome, WriteOutcome, WriteSegmentRequest,
};
use crate::segment::LogEntry;

/// Test rig: a manager plus manual control over both wire sides.
struct Harness {
    mgr: ReplicaManager,
    wire: BackupWire,
    epoch_wire: EpochWire,
    down: HashSet<ServerId>,
    reject_opens: HashSet<ServerId>,
    log: Vec<(ServerId, BackupRequest)>,
}

impl Harness {
    fn new(
        num_backups: u64,
        config_str: Option<&str>,
    ) -> Result<Self, SeglineError> {
        let (mut mgr, wire, epoch_wire) =
            ReplicaManager::new_and_setup(ServerId::new(99), config_str)?;
        for id in 1..=num_backups {
            mgr.note_backup(ServerId::new(id));
        }
        Ok(Harness {
            mgr,
            wire,
            epoch_wire,
            down: HashSet::new(),
            reject_opens: HashSet::new(),
            log: vec![],
        })
    }

    /// Answers every pending backup request according to the scripted
    /// down/reject sets. Returns what was answered this round.
    fn pump(&mut self) -> Vec<(ServerId, BackupRequest)> {
        let mut seen = vec![];
        while let Ok((rpc_id, backup, req)) = self.wire.rx_req.try_recv() {
            let outcome = match &req {
                BackupRequest::Write(w) => {
                    if self.down.contains(&backup) {
                        RpcOutcome::Write(WriteOutcome::BackupDown)
                    } else if w.open && self.reject_opens.contains(&backup) {
                        RpcOutcome::Write(WriteOutcome::OpenRejected)
                    } else {
                        RpcOutcome::Write(WriteOutcome::Ok { group: vec![] })
                    }
                }
                BackupRequest::Free(_) => {
                    if self.down.contains(&backup) {
                        RpcOutcome::Free(FreeOutcome::BackupDown)
                    } else {
                        RpcOutcome::Free(FreeOutcome::Ok)
                    }
                }
            };
            self.wire.tx_ack.send((rpc_id, outcome)).unwrap();
            seen.push((backup, req.clone()));
            self.log.push((backup, req));
        }
        seen
    }

    /// Receives pending requests without answering them.
    fn collect_unacked(
        &mut self,
    ) -> Vec<(crate::rpc::RpcId, ServerId, BackupRequest)> {
        let mut reqs = vec![];
        while let Ok(req) = self.wire.rx_req.try_recv() {
            reqs.push(req);
        }
        reqs
    }

    /// Confirms every pending coordinator epoch update.
    fn confirm_epochs(&mut self) {
        while let Ok(req) = self.epoch_wire.rx_update.try_recv() {
            self.epoch_wire
                .tx_confirm
                .send((req.segment_id, req.epoch))
                .unwrap();
        }
    }

    /// Runs scheduling passes interleaved with wire pumping.
    fn drive(&mut self, rounds: usize) -> Result<(), SeglineError> {
        for _ in 0..rounds {
            self.mgr.proceed()?;
            self.pump();
            self.confirm_epochs();
            self.assert_progress_invariants();
        }
        self.mgr.proceed()?;
        Ok(())
    }

    /// Per-replica progress must never run ahead of its stage or of the
    /// queued target.
    fn assert_progress_invariants(&self) {
        for seg in self.mgr.segments.values() {
            for replica in &seg.replicas {
                assert!(replica.committed <= replica.acked);
                assert!(replica.acked <= replica.sent);
                assert!(replica.sent <= seg.queued);
            }
        }
    }

    fn write_requests_for(
        &self,
        segment_id: SegmentId,
    ) -> Vec<(ServerId, WriteSegmentRequest)> {
        self.log
            .iter()
            .filter_map(|(backup, req)| match req {
                BackupRequest::Write(w) if w.segment_id == segment_id => {
                    Some((*backup, w.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

fn head_segment(capacity: u32, digest: Vec<SegmentId>) -> Arc<Segment> {
    let segment = Segment::new(capacity);
    segment
        .append(&LogEntry::Digest { segment_ids: digest })
        .unwrap();
    segment
}

fn append_object(segment: &Segment, value_len: usize) {
    segment
        .append(&LogEntry::Object {
            table_id: 123,
            key_hash: 4,
            value: vec![7; value_len],
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn opening_write_reaches_every_replica() -> Result<(), SeglineError> {
    let mut harness = Harness::new(3, None)?;
    let segment = head_segment(4096, vec![88]);
    harness.mgr.open_segment(88, segment, true)?;
    harness.drive(8)?;

    assert!(harness.mgr.is_synced(88));
    let writes = harness.write_requests_for(88);
    assert_eq!(writes.len(), 3);
    let backups: HashSet<ServerId> =
        writes.iter().map(|(b, _)| *b).collect();
    assert_eq!(backups.len(), 3);
    for (_, w) in &writes {
        assert!(w.open);
        assert!(w.certificate.is_some());
        assert!(!w.atomic);
    }
    assert_eq!(writes.iter().filter(|(_, w)| w.primary).count(), 1);
    assert!(harness.mgr.committed(88).unwrap().open);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn certificate_only_on_final_chunk() -> Result<(), SeglineError> {
    let config = "num_replicas = 1\nmax_bytes_per_write_rpc = 30";
    let mut harness = Harness::new(1, Some(config))?;
    let segment = Segment::new(4096);
    harness.mgr.open_segment(88, segment.clone(), true)?;
    harness.drive(4)?;
    assert!(harness.mgr.is_synced(88));

    // queue several chunks worth of data, then re-sync
    append_object(&segment, 70);
    let (appended, _) = segment.appended_len();
    assert!(appended > 60, "need at least three 30-byte chunks");

    // sync would block here; drive the same loop it runs and check its
    // return condition by hand so the wire can be scripted synchronously
    assert!(!harness.mgr.sync_target_met(88, Some(50)));
    harness.mgr.sync(88, Some(0)).await?; // stretches queued to appended
    let mut rounds = 0;
    while !harness.mgr.sync_target_met(88, Some(50)) {
        harness.drive(1)?;
        // partial chunks carry no certificate, so durable progress stays
        // at zero until the final chunk lands
        let committed = harness.mgr.committed(88).unwrap().bytes;
        assert!(committed == 0 || committed == appended);
        rounds += 1;
        assert!(rounds < 64, "sync never became durable");
    }

    let writes = harness.write_requests_for(88);
    let data_writes: Vec<_> =
        writes.iter().filter(|(_, w)| !w.open).collect();
    let chunks = appended.div_ceil(30) as usize;
    assert!(chunks >= 3);
    assert_eq!(data_writes.len(), chunks);
    for (i, (_, w)) in data_writes.iter().enumerate() {
        assert_eq!(w.offset, 30 * i as u32);
        if i + 1 < chunks {
            assert_eq!(w.data.len(), 30);
            assert!(w.certificate.is_none());
        } else {
            assert_eq!(w.offset + w.data.len() as u32, appended);
            assert!(w.certificate.is_some());
        }
    }

    // no certificate was durable until the final chunk, so committed jumps
    // straight from the opening write to the full appended length
    assert_eq!(harness.mgr.committed(88).unwrap().bytes, appended);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn lost_open_replica_bumps_epoch() -> Result<(), SeglineError> {
    let mut harness = Harness::new(4, None)?;
    let segment = head_segment(4096, vec![88]);
    harness.mgr.open_segment(88, segment, true)?;
    harness.drive(8)?;
    assert!(harness.mgr.is_synced(88));

    let victim = harness
        .write_requests_for(88)
        .iter()
        .find(|(_, w)| w.primary)
        .map(|(backup, _)| *backup)
        .unwrap();
    harness.mgr.handle_backup_failure(victim);

    {
        let seg = &harness.mgr.segments[&88];
        assert_eq!(seg.queued.epoch, 1);
        assert!(seg.recovering_from_lost_open_replicas);
        assert!(!harness.mgr.is_synced(88));
    }

    let before = harness.log.len();
    harness.drive(12)?;

    // the replacement replica was written atomically: open carries no
    // certificate, and a later certified write catches it up
    let new_writes: Vec<_> = harness.log[before..]
        .iter()
        .filter_map(|(backup, req)| match req {
            BackupRequest::Write(w) => Some((*backup, w.clone())),
            _ => None,
        })
        .collect();
    let replacement_open =
        new_writes.iter().find(|(_, w)| w.open).unwrap();
    assert!(replacement_open.1.certificate.is_none());
    assert!(replacement_open.1.atomic);
    assert_ne!(replacement_open.0, victim);
    assert_eq!(replacement_open.1.epoch, 1);

    // survivors got re-stamped with the new epoch via certified writes
    let seg = &harness.mgr.segments[&88];
    assert!(!seg.recovering_from_lost_open_replicas);
    for replica in &seg.replicas {
        assert!(replica.is_active);
        assert_eq!(replica.committed.epoch, 1);
    }
    assert!(harness.mgr.epoch_is_at_least(88, 1));
    assert!(harness.mgr.is_synced(88));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn write_rpcs_capped_in_flight() -> Result<(), SeglineError> {
    let config = "num_replicas = 1";
    let mut harness = Harness::new(2, Some(config))?;
    for segment_id in 0..5 {
        // cleaner segments: not chained, so nothing gates their opens
        let segment = Segment::new(1024);
        append_object(&segment, 8);
        harness.mgr.open_segment(segment_id, segment, false)?;
    }
    for _ in 0..10 {
        harness.mgr.proceed()?;
    }

    let outstanding = harness.collect_unacked();
    assert_eq!(outstanding.len(), MAX_WRITE_RPCS_IN_FLIGHT as usize);

    for (rpc_id, _, _) in &outstanding {
        harness
            .wire
            .tx_ack
            .send((
                *rpc_id,
                RpcOutcome::Write(WriteOutcome::Ok { group: vec![] }),
            ))
            .unwrap();
    }
    for _ in 0..10 {
        harness.mgr.proceed()?;
    }
    let remaining = harness.collect_unacked();
    assert_eq!(remaining.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn close_deferred_until_following_open() -> Result<(), SeglineError> {
    let config = "num_replicas = 1";
    let mut harness = Harness::new(2, Some(config))?;
    let seg1 = head_segment(4096, vec![1]);
    let seg2 = head_segment(4096, vec![1, 2]);
    harness.mgr.open_segment(1, seg1, true)?;

    for _ in 0..4 {
        harness.mgr.proceed()?;
    }
    let first_open = harness.collect_unacked();
    assert_eq!(first_open.len(), 1);

    harness.mgr.open_segment(2, seg2, true)?;
    harness.mgr.close_segment(1)?;
    for _ in 0..6 {
        harness.mgr.proceed()?;
    }
    // segment 2 cannot open before 1 is durably open, and 1 cannot close
    // before 2 is durably open, so nothing else went out yet
    assert!(harness.collect_unacked().is_empty());
    assert!(!harness.mgr.segments[&2].preceding_open_committed);

    // ack segment 1's open; segment 2's open goes out, but 1's close stays
    let (rpc_id, _, _) = first_open[0];
    harness
        .wire
        .tx_ack
        .send((rpc_id, RpcOutcome::Write(WriteOutcome::Ok { group: vec![] })))
        .unwrap();
    for _ in 0..6 {
        harness.mgr.proceed()?;
    }
    let second_open = harness.collect_unacked();
    assert_eq!(second_open.len(), 1);
    match &second_open[0].2 {
        BackupRequest::Write(w) => {
            assert!(w.open);
            assert_eq!(w.segment_id, 2);
        }
        other => panic!("unexpected request {:?}", other),
    }
    assert!(harness.mgr.segments[&2].preceding_open_committed);

    // ack segment 2's open; now segment 1's close is allowed out
    let (rpc_id, _, _) = second_open[0];
    harness
        .wire
        .tx_ack
        .send((rpc_id, RpcOutcome::Write(WriteOutcome::Ok { group: vec![] })))
        .unwrap();
    harness.drive(6)?;
    let closes: Vec<_> = harness
        .write_requests_for(1)
        .into_iter()
        .filter(|(_, w)| w.close)
        .collect();
    assert_eq!(closes.len(), 1);
    assert!(harness.mgr.committed(1).unwrap().close);
    // close propagation: segment 2 may write data now, link is severed
    assert!(harness.mgr.segments[&2].preceding_close_committed);
    assert!(harness.mgr.segments[&1].following_segment.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn open_rejected_selects_another_backup() -> Result<(), SeglineError> {
    let config = "num_replicas = 1";
    let mut harness = Harness::new(2, Some(config))?;
    // backup 1 refuses opens (out of frames, or a leftover replica)
    harness.reject_opens.insert(ServerId::new(1));

    let segment = Segment::new(1024);
    append_object(&segment, 8);
    harness.mgr.open_segment(88, segment, false)?;
    harness.drive(8)?;

    assert!(harness.mgr.is_synced(88));
    let opens = harness
        .write_requests_for(88)
        .into_iter()
        .filter(|(_, w)| w.open)
        .collect::<Vec<_>>();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0].0, ServerId::new(1));
    assert_eq!(opens[1].0, ServerId::new(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn backup_down_waits_for_notification() -> Result<(), SeglineError> {
    let config = "num_replicas = 1";
    let mut harness = Harness::new(2, Some(config))?;
    let segment = head_segment(1024, vec![88]);
    harness.mgr.open_segment(88, segment, true)?;

    harness.mgr.proceed()?;
    let first = harness.collect_unacked();
    assert_eq!(first.len(), 1);
    let (rpc_id, failed_backup, _) = first[0];
    harness
        .wire
        .tx_ack
        .send((rpc_id, RpcOutcome::Write(WriteOutcome::BackupDown)))
        .unwrap();
    harness.mgr.proceed()?;

    // rolled back, not yet reset: the slot still points at the dead backup
    {
        let replica = &harness.mgr.segments[&88].replicas[0];
        assert!(replica.is_active);
        assert_eq!(replica.backup_id, failed_backup);
        assert!(!replica.acked.open);
        assert!(!replica.sent.open);
    }

    // the failure notification resets the slot and replication moves on
    harness.mgr.failure_notifier().send(failed_backup).unwrap();
    harness.drive(10)?;
    assert!(harness.mgr.is_synced(88));
    let seg = &harness.mgr.segments[&88];
    assert_ne!(seg.replicas[0].backup_id, failed_backup);
    assert_eq!(seg.queued.epoch, 1); // it was lost while open
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn replica_waits_until_backup_available() -> Result<(), SeglineError> {
    let mut harness = Harness::new(2, None)?; // 3 replicas, 2 backups
    let segment = head_segment(1024, vec![88]);
    harness.mgr.open_segment(88, segment, true)?;
    harness.drive(8)?;

    assert!(!harness.mgr.is_synced(88));
    let seg = &harness.mgr.segments[&88];
    assert_eq!(
        seg.replicas.iter().filter(|r| r.is_active).count(),
        2
    );

    harness.mgr.note_backup(ServerId::new(3));
    harness.drive(8)?;
    assert!(harness.mgr.is_synced(88));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_and_free_with_echoing_backups() -> Result<(), SeglineError> {
    let (mut mgr, mut wire, mut epoch_wire) =
        ReplicaManager::new_and_setup(ServerId::new(99), None)?;
    for id in 1..=3 {
        mgr.note_backup(ServerId::new(id));
    }
    // echo task: every write and free succeeds, every epoch update confirms
    tokio::spawn(async move {
        loop {
            tokio::select! {
                req = wire.rx_req.recv() => {
                    let Some((rpc_id, _backup, req)) = req else { break };
                    let outcome = match req {
                        BackupRequest::Write(_) => RpcOutcome::Write(
                            WriteOutcome::Ok { group: vec![] },
                        ),
                        BackupRequest::Free(_) => {
                            RpcOutcome::Free(FreeOutcome::Ok)
                        }
                    };
                    if wire.tx_ack.send((rpc_id, outcome)).is_err() {
                        break;
                    }
                }
                update = epoch_wire.rx_update.recv() => {
                    let Some(req) = update else { break };
                    if epoch_wire
                        .tx_confirm
                        .send((req.segment_id, req.epoch))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let segment = head_segment(4096, vec![88]);
    mgr.open_segment(88, segment.clone(), true)?;
    append_object(&segment, 100);
    mgr.sync(88, Some(50)).await?;
    assert!(mgr.committed(88).unwrap().bytes >= 50);

    mgr.close_segment(88)?;
    mgr.free_segment(88).await?;
    let mut rounds = 0;
    while !mgr.segments.is_empty() {
        mgr.proceed()?;
        tokio::task::yield_now().await;
        rounds += 1;
        assert!(rounds < 10000, "segment never freed");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn double_close_is_an_error() -> Result<(), SeglineError> {
    let mut harness = Harness::new(1, Some("num_replicas = 1"))?;
    let segment = head_segment(1024, vec![88]);
    harness.mgr.open_segment(88, segment, true)?;
    harness.mgr.close_segment(88)?;
    assert!(harness.mgr.close_segment(88).is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn invalid_config_rejected() {
    assert!(ReplicaManager::new_and_setup(
        ServerId::new(99),
        Some("max_bytes_per_write_rpc = 0"),
    )
    .is_err());
    assert!(ReplicaManager::new_and_setup(
        ServerId::new(99),
        Some("unknown_knob = 1"),
    )
    .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn halt_drops_all_state() -> Result<(), SeglineError> {
    let mut harness = Harness::new(3, None)?;
    let segment = head_segment(1024, vec![88]);
    harness.mgr.open_segment(88, segment, true)?;
    harness.mgr.proceed()?;
    harness.mgr.halt_and_cleanup();
    assert!(harness.mgr.segments.is_empty());
    assert_eq!(harness.mgr.writes_in_flight, 0);
    Ok(())
}
