//! End-to-end pipeline scenarios
//!
//! Every test runs the real worker tasks against the in-memory queue and
//! store, so redelivery, concurrent commits and broadcast ordering go
//! through the same code paths a deployment uses.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tally::{
    Pipeline, Result,
    config::PipelineConfig,
    publisher::Subscription,
    queue::InMemoryQueue,
    store::{InMemoryTallyStore, TallyStore},
    types::{CommitResult, TallySnapshot, VoteEnvelope},
};
use tokio::time::Instant;

fn setup(candidates: &[&str], workers: usize) -> Result<(PipelineConfig, Arc<InMemoryQueue>, Arc<InMemoryTallyStore>)> {
    let mut config = PipelineConfig::for_testing(candidates)?;
    config.consumer.workers = workers;
    config.publisher.subscriber_buffer = 1024;
    let queue = Arc::new(InMemoryQueue::with_defaults());
    let store = Arc::new(InMemoryTallyStore::new(&config.candidates));
    Ok((config, queue, store))
}

/// Poll `condition` until it holds or five seconds pass
async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn drain(subscription: &mut Subscription) -> Vec<Arc<TallySnapshot>> {
    let mut received = Vec::new();
    while let Some(snapshot) = subscription.try_recv() {
        received.push(snapshot);
    }
    received
}

// =============================================================================
// END-TO-END SCENARIO
// =============================================================================

#[tokio::test]
async fn test_redelivered_envelope_counted_once() -> Result<()> {
    println!("🗳️  Testing redelivered envelope end to end...");

    let (config, queue, store) = setup(&["A", "B"], 1)?;
    let handle = Pipeline::start(&config, queue.clone(), store.clone()).await?;
    let mut updates = handle.subscribe().await?;

    queue.submit(&VoteEnvelope::with_id("1", "alice", "A"))?;
    queue.submit(&VoteEnvelope::with_id("2", "bob", "B"))?;
    queue.submit(&VoteEnvelope::with_id("1", "alice", "A"))?;

    assert!(wait_until(|| queue.acked().unwrap_or(0) == 3).await);
    let report = handle.shutdown().await?;

    let final_tally = store.load_snapshot().await?;
    assert_eq!(final_tally.count("A"), 1);
    assert_eq!(final_tally.count("B"), 1);
    assert_eq!(final_tally.version, 2);

    let versions: Vec<u64> = drain(&mut updates).iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![0, 1, 2], "initial snapshot then exactly two increments");

    assert_eq!(report.stats.applied, 2);
    assert_eq!(report.stats.duplicates, 1);
    assert!(queue.dead_letters()?.is_empty());

    println!("✅ Redelivery is a no-op on tally state");
    Ok(())
}

// =============================================================================
// IDEMPOTENCE AND CONVERGENCE
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tally_equals_distinct_envelopes() -> Result<()> {
    println!("🔢 Testing idempotence law over a random stream with duplicates...");

    let options = ["A", "B", "C"];
    let (config, queue, store) = setup(&options, 3)?;
    let handle = Pipeline::start(&config, queue.clone(), store.clone()).await?;

    let mut rng = StdRng::seed_from_u64(7);
    let mut distinct: HashMap<String, &str> = HashMap::new();
    let mut submitted = 0u64;
    for _ in 0..300 {
        let id = format!("env-{}", rng.gen_range(0..120));
        let option = *distinct
            .entry(id.clone())
            .or_insert(options[rng.gen_range(0..options.len())]);
        queue.submit(&VoteEnvelope::with_id(id, "voter", option))?;
        submitted += 1;
    }

    assert!(wait_until(|| queue.acked().unwrap_or(0) == submitted).await);
    handle.shutdown().await?;

    let mut expected: BTreeMap<String, u64> = options.iter().map(|o| (o.to_string(), 0)).collect();
    for option in distinct.values() {
        *expected.entry(option.to_string()).or_default() += 1;
    }

    let snapshot = store.load_snapshot().await?;
    assert_eq!(snapshot.counts, expected);
    assert_eq!(snapshot.version, distinct.len() as u64);
    assert_eq!(store.processed_len()?, distinct.len());

    println!("✅ Final tally equals distinct accepted envelopes");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_match_sequential() -> Result<()> {
    println!("🏁 Testing concurrent consumers against a sequential reference...");

    let (config, queue, store) = setup(&["A", "B"], 4)?;
    let envelopes: Vec<VoteEnvelope> = (0..100)
        .map(|i| VoteEnvelope::with_id(format!("e{i}"), format!("v{i}"), if i % 3 == 0 { "A" } else { "B" }))
        .collect();

    // Sequential reference
    let reference = InMemoryTallyStore::new(&config.candidates);
    for envelope in envelopes.iter().chain(envelopes.iter()) {
        reference
            .commit("sequential", &envelope.envelope_id, &envelope.option)
            .await?;
    }

    // Every envelope delivered twice, overlapping across four consumers
    let handle = Pipeline::start(&config, queue.clone(), store.clone()).await?;
    for envelope in envelopes.iter().chain(envelopes.iter()) {
        queue.submit(envelope)?;
    }

    assert!(wait_until(|| queue.acked().unwrap_or(0) == 200).await);
    let report = handle.shutdown().await?;

    let concurrent = store.load_snapshot().await?;
    let sequential = reference.load_snapshot().await?;
    assert_eq!(concurrent.counts, sequential.counts);
    assert_eq!(concurrent.version, sequential.version);
    assert_eq!(report.drained, 4);
    assert_eq!(report.stats.applied, 100);
    assert_eq!(report.stats.duplicates, 100);

    println!("✅ Concurrent consumers converge");
    Ok(())
}

// =============================================================================
// SUBSCRIBER CONSISTENCY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribers_only_see_committed_states() -> Result<()> {
    println!("👀 Testing snapshot consistency for late subscribers...");

    let (config, queue, store) = setup(&["A", "B"], 3)?;
    let handle = Pipeline::start(&config, queue.clone(), store.clone()).await?;
    let early = handle.subscribe().await?;

    for i in 0..150 {
        queue.submit(&VoteEnvelope::with_id(format!("e{i}"), "v", if i % 2 == 0 { "A" } else { "B" }))?;
        if i == 75 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    let late = handle.subscribe().await?;

    assert!(wait_until(|| queue.acked().unwrap_or(0) == 150).await);
    handle.shutdown().await?;

    for mut subscription in [early, late] {
        let received = drain(&mut subscription);
        assert!(!received.is_empty(), "a subscriber always gets the current snapshot");

        for pair in received.windows(2) {
            assert!(pair[1].version > pair[0].version, "versions only move forward");
        }
        for snapshot in &received {
            // One commit adds exactly one vote, so a consistent snapshot
            // has as many votes as commits
            assert_eq!(snapshot.total(), snapshot.version);
        }
    }

    assert_eq!(store.load_snapshot().await?.total(), 150);
    println!("✅ No partial increments observed");
    Ok(())
}

// =============================================================================
// RECOVERY
// =============================================================================

#[tokio::test]
async fn test_restart_recovers_from_store() -> Result<()> {
    println!("🔄 Testing restart from persisted tally...");

    let (config, queue, store) = setup(&["A", "B"], 1)?;

    let first = Pipeline::start(&config, queue.clone(), store.clone()).await?;
    queue.submit(&VoteEnvelope::with_id("1", "v1", "A"))?;
    queue.submit(&VoteEnvelope::with_id("2", "v2", "A"))?;
    assert!(wait_until(|| queue.acked().unwrap_or(0) == 2).await);
    first.shutdown().await?;

    // The restarted pipeline starts from the store, not from queue replay
    let second = Pipeline::start(&config, queue.clone(), store.clone()).await?;
    let mut updates = second.subscribe().await?;
    let recovered = updates.recv().await.expect("current snapshot");
    assert_eq!(recovered.count("A"), 2);
    assert_eq!(recovered.version, 2);

    // A late redelivery of a committed envelope is still a no-op
    queue.submit(&VoteEnvelope::with_id("1", "v1", "A"))?;
    queue.submit(&VoteEnvelope::with_id("3", "v3", "B"))?;
    assert!(wait_until(|| queue.acked().unwrap_or(0) == 4).await);
    let report = second.shutdown().await?;

    assert_eq!(report.stats.duplicates, 1);
    let snapshot = store.load_snapshot().await?;
    assert_eq!(snapshot.count("A"), 2);
    assert_eq!(snapshot.count("B"), 1);
    assert_eq!(
        store.commit("manual", "3", "B").await?,
        CommitResult::AlreadyProcessed
    );

    let marker = store
        .processed_marker(&format!("{}-0", config.consumer.consumer_id))
        .await?
        .expect("worker wrote a marker");
    assert_eq!(marker.last_version, 3);

    println!("✅ Restart is independent of queue depth");
    Ok(())
}
