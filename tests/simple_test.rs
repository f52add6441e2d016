//! Simple test to verify compilation and basic functionality

use std::sync::Arc;
use std::time::Duration;
use tally::{
    Pipeline, Result,
    config::PipelineConfig,
    queue::InMemoryQueue,
    store::{InMemoryTallyStore, TallyStore},
    types::{CandidateSet, TallySnapshot, UpdateMessage, VoteEnvelope},
};

#[tokio::test]
async fn test_basic_compilation() -> Result<()> {
    println!("🔧 Testing basic compilation and functionality...");

    // Test configuration
    let config = PipelineConfig::for_testing(&["A", "B"])?;
    assert_eq!(config.candidates.len(), 2);
    assert_eq!(config.consumer.max_retries, 5);
    println!("✅ Configuration works");

    // Test envelope codec
    let envelope = VoteEnvelope::new("voter-1", "A");
    let decoded = VoteEnvelope::decode(&envelope.encode()?)?;
    assert_eq!(decoded, envelope);
    println!("✅ Envelope codec works");

    // Test pure tally application
    let empty = TallySnapshot::empty(&config.candidates);
    let one = empty.with_vote("A").expect("A is a candidate");
    assert_eq!(one.count("A"), 1);
    assert_eq!(one.version, 1);
    assert!(empty.with_vote("Z").is_none());
    println!("✅ Tally application works");

    // Test wire payload
    let message = UpdateMessage::from_snapshot(&one);
    let restored = UpdateMessage::from_bytes(&message.to_bytes()?)?;
    assert!(restored.verify());
    println!("✅ Update message works");

    println!("🎉 All basic functionality tests passed!");
    Ok(())
}

#[tokio::test]
async fn test_pipeline_smoke() -> Result<()> {
    println!("🗳️  Testing pipeline smoke run...");

    let config = PipelineConfig::for_testing(&["yes", "no"])?;
    let queue = Arc::new(InMemoryQueue::with_defaults());
    let store = Arc::new(InMemoryTallyStore::new(&config.candidates));

    let handle = Pipeline::start(&config, queue.clone(), store.clone()).await?;
    let mut updates = handle.subscribe().await?;
    assert_eq!(updates.recv().await.map(|s| s.version), Some(0));

    queue.submit(&VoteEnvelope::new("v1", "yes"))?;
    queue.submit(&VoteEnvelope::new("v2", "no"))?;
    queue.submit(&VoteEnvelope::new("v3", "yes"))?;

    let mut last = None;
    while let Ok(Some(snapshot)) = tokio::time::timeout(Duration::from_secs(2), updates.recv()).await {
        let done = snapshot.total() == 3;
        last = Some(snapshot);
        if done {
            break;
        }
    }
    let last = last.expect("received updates");
    assert_eq!(last.count("yes"), 2);
    assert_eq!(last.count("no"), 1);

    let report = handle.shutdown().await?;
    assert_eq!(report.stats.applied, 3);
    assert_eq!(store.load_snapshot().await?.total(), 3);

    println!("✅ Pipeline smoke run works");
    Ok(())
}

#[test]
fn test_candidate_set_parsing() -> Result<()> {
    let candidates = CandidateSet::parse("A, B ,C")?;
    assert_eq!(candidates.iter().collect::<Vec<_>>(), vec!["A", "B", "C"]);
    assert!(CandidateSet::parse("").is_err());
    assert!(CandidateSet::parse("A,A").is_err());
    Ok(())
}
