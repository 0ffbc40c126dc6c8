//! Invariant 1 (seq contiguity) under concurrent `append` — scenario S6.
//! `(session_id, seq)` is enforced unique by the store's schema; this
//! exercises the transactional `SELECT COALESCE(MAX(seq),0)+1` path under
//! real concurrency rather than just reading the schema.

use proptest::prelude::*;
use relayd::{journal::Journal, storage::Storage};
use std::sync::Arc;

async fn new_session(storage: &Arc<Storage>) -> String {
    let row = storage
        .create_session(relayd::storage::NewSession {
            mode: "chat",
            repo_full_name: None,
            branch: None,
            provider: Some("mock"),
            model_provider: None,
            model_id: None,
            system_prompt: None,
            environment_id: None,
        })
        .await
        .unwrap();
    row.id
}

/// S6 — N=100 concurrent appends to one session land at exactly the seqs
/// `{1..100}`, with the payload index set matching `{0..99}` (no dropped or
/// duplicated writes, no gaps).
#[tokio::test]
async fn concurrent_appends_produce_a_contiguous_seq_range() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    let journal = Arc::new(Journal::new(storage.clone()));
    let session_id = new_session(&storage).await;

    const N: i64 = 100;
    let mut handles = Vec::with_capacity(N as usize);
    for i in 0..N {
        let journal = journal.clone();
        let session_id = session_id.clone();
        handles.push(tokio::spawn(async move {
            journal.append(&session_id, "msg", &serde_json::json!({"i": i})).await.unwrap()
        }));
    }

    let mut seqs: Vec<i64> = Vec::with_capacity(N as usize);
    let mut indices: Vec<i64> = Vec::with_capacity(N as usize);
    for h in handles {
        let event = h.await.unwrap();
        seqs.push(event.seq);
        indices.push(event.payload.get("i").and_then(|v| v.as_i64()).unwrap());
    }

    seqs.sort_unstable();
    indices.sort_unstable();
    let expected: Vec<i64> = (1..=N).collect();
    assert_eq!(seqs, expected, "seqs must be exactly {{1..{N}}} with no gaps or duplicates");
    assert_eq!(indices, (0..N).collect::<Vec<_>>(), "every payload index 0..{N} must appear exactly once");

    assert_eq!(journal.get_max_seq(&session_id).await.unwrap(), N);
}

proptest! {
    /// For any concurrency level between 2 and 64, the resulting seq set is
    /// still exactly `{1..n}` — the invariant doesn't depend on the
    /// specific fan-out width chosen by S6's literal N=100.
    #[test]
    fn seq_contiguity_holds_for_varied_concurrency(n in 2i64..64) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
            let journal = Arc::new(Journal::new(storage.clone()));
            let session_id = new_session(&storage).await;

            let mut handles = Vec::with_capacity(n as usize);
            for i in 0..n {
                let journal = journal.clone();
                let session_id = session_id.clone();
                handles.push(tokio::spawn(async move {
                    journal.append(&session_id, "msg", &serde_json::json!({"i": i})).await.unwrap().seq
                }));
            }
            let mut seqs = Vec::with_capacity(n as usize);
            for h in handles {
                seqs.push(h.await.unwrap());
            }
            seqs.sort_unstable();
            prop_assert_eq!(seqs, (1..=n).collect::<Vec<_>>());
            Ok(())
        })?;
    }
}
