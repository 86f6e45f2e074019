mod common;

use std::sync::Arc;

use logagent::store::{active_key, config_key};
use logagent::{Agent, Collector, ConfigStore, MemoryStore, OffsetStore};
use tempfile::tempdir;
use tokio::sync::oneshot;

use common::{append, canonical, config, RecordingSink};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_saves_every_offset() {
    const N: usize = 4;

    let dir = tempdir().unwrap();
    let config = config(&dir.path().join("runtime"));

    let mut collectors = Vec::new();
    let mut expected = Vec::new();
    for i in 0..N {
        let path = dir.path().join(format!("app-{}.log", i));
        let content = format!("line {} a\nline {} b\n", i, i);
        append(&path, &content);
        expected.push((path.clone(), content.len() as u64));
        collectors.push(Collector::file(path.to_string_lossy(), format!("topic-{}", i)));
    }

    let store = Arc::new(MemoryStore::new());
    store
        .put(&config_key(&config.id), serde_json::to_vec(&collectors).unwrap())
        .await
        .unwrap();

    let sink = RecordingSink::default();
    let (stop, stopped) = oneshot::channel::<()>();
    let agent = tokio::spawn(
        Agent::new(config.clone(), store.clone(), sink.clone()).run_until(async {
            let _ = stopped.await;
        }),
    );

    sink.wait_for(2 * N).await;
    assert_eq!(
        store.get(&active_key(&config.id)).await.unwrap(),
        Some(b"1".to_vec())
    );

    stop.send(()).unwrap();
    agent.await.unwrap().unwrap();

    let offsets = OffsetStore::open(config.offset_dir()).unwrap();
    for (path, len) in &expected {
        assert_eq!(offsets.load(&canonical(path)).unwrap(), *len);
    }
    assert_eq!(offsets.paths().unwrap().len(), N);
    assert!(*sink.closed.lock());
    assert_eq!(
        store.get(&active_key(&config.id)).await.unwrap(),
        Some(b"0".to_vec())
    );

    // Every record carries its topic, source key and agent header.
    let records = sink.records.lock();
    assert_eq!(records.len(), 2 * N);
    for record in records.iter() {
        let i: usize = record.topic["topic-".len()..].parse().unwrap();
        assert_eq!(record.key, collectors[i].path.as_bytes());
        assert_eq!(record.headers, vec![("source_agent".to_string(), b"test-agent".to_vec())]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_resumes_without_duplicates() {
    let dir = tempdir().unwrap();
    let config = config(&dir.path().join("runtime"));
    let path = dir.path().join("app.log");
    append(&path, "one\ntwo\n");

    let store = Arc::new(MemoryStore::new());
    let collectors = vec![Collector::file(path.to_string_lossy(), "app")];
    store
        .put(&config_key(&config.id), serde_json::to_vec(&collectors).unwrap())
        .await
        .unwrap();

    let first = RecordingSink::default();
    let (stop, stopped) = oneshot::channel::<()>();
    let agent = tokio::spawn(
        Agent::new(config.clone(), store.clone(), first.clone()).run_until(async {
            let _ = stopped.await;
        }),
    );
    first.wait_for(2).await;
    stop.send(()).unwrap();
    agent.await.unwrap().unwrap();

    append(&path, "three\n");

    let second = RecordingSink::default();
    let (stop, stopped) = oneshot::channel::<()>();
    let agent = tokio::spawn(
        Agent::new(config.clone(), store.clone(), second.clone()).run_until(async {
            let _ = stopped.await;
        }),
    );
    second.wait_for(1).await;
    stop.send(()).unwrap();
    agent.await.unwrap().unwrap();

    assert_eq!(first.values(), vec!["one", "two"]);
    assert_eq!(second.values(), vec!["three"]);
}
