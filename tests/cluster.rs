//! End-to-end tests driving a real coordinator and real workers over
//! loopback HTTP, with shrunk chunk sizes and loop cadences.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

use sfs_client::{Client, DownloadOptions, UploadOptions};
use sfs_tools::digest::sha256_hex;
use sfs_tools::http::{error_kind, ErrorKind, HttpClient};

use sfs_api_types::{CommitRequest, CommitResponse, FileRecord, UploadInitRequest, UploadPlan};
use swarmfs::config::{CoordinatorConfig, WorkerConfig};
use swarmfs::coordinator::{self, Coordinator};
use swarmfs::worker::{heartbeat, rest as worker_rest, Worker};

struct TestWorker {
    worker: Arc<Worker>,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

struct TestCluster {
    coordinator: Arc<Coordinator>,
    coordinator_url: String,
    client: Client,
    workers: Vec<TestWorker>,
    _shutdown: watch::Sender<bool>,
    _state_dir: tempfile::TempDir,
}

async fn start_cluster(
    num_workers: usize,
    tune: impl FnOnce(&mut CoordinatorConfig),
) -> TestCluster {
    let state_dir = tempfile::tempdir().unwrap();
    let mut config = CoordinatorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        state_dir: state_dir.path().to_owned(),
        chunk_size: 1024,
        replication: 3,
        dead_threshold: 2,
        scan_period: Duration::from_millis(200),
        repair_period: Duration::from_millis(500),
        // keep GC out of the picture unless a test runs it explicitly
        gc_period: Duration::from_secs(3600),
        ..Default::default()
    };
    tune(&mut config);

    let coordinator = Coordinator::open(config).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(coordinator::rest::serve(
        listener,
        Arc::clone(&coordinator),
        shutdown_rx.clone(),
    ));
    tokio::spawn(coordinator::run_scan_loop(
        Arc::clone(&coordinator),
        shutdown_rx.clone(),
    ));
    tokio::spawn(coordinator::repair::run_repair_loop(
        Arc::clone(&coordinator),
        shutdown_rx,
    ));

    let coordinator_url = format!("http://{addr}");
    let mut cluster = TestCluster {
        coordinator,
        client: Client::new(&coordinator_url),
        coordinator_url,
        workers: Vec::new(),
        _shutdown: shutdown_tx,
        _state_dir: state_dir,
    };

    for _ in 0..num_workers {
        cluster.add_worker().await;
    }
    cluster.wait_for_active_workers(num_workers).await;
    cluster
}

impl TestCluster {
    async fn add_worker(&mut self) -> String {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = WorkerConfig {
            node_id: None,
            coordinator_url: self.coordinator_url.clone(),
            storage_path: dir.path().to_owned(),
            host: "127.0.0.1".to_string(),
            port,
            rack: None,
            heartbeat_interval: Duration::from_millis(200),
            rescan_period: Duration::from_secs(3600),
        };
        let worker = Worker::new(config).unwrap();
        let node_id = worker.node_id().to_string();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(worker_rest::serve(
            listener,
            Arc::clone(&worker),
            shutdown_rx.clone(),
        ));
        tokio::spawn(heartbeat::run_heartbeat_loop(
            Arc::clone(&worker),
            shutdown_rx,
        ));

        self.workers.push(TestWorker {
            worker,
            shutdown: shutdown_tx,
            _dir: dir,
        });
        node_id
    }

    fn stop_worker(&mut self, index: usize) -> String {
        let entry = self.workers.remove(index);
        let node_id = entry.worker.node_id().to_string();
        let _ = entry.shutdown.send(true);
        node_id
    }

    fn worker_holding(&self, chunk_id: Uuid) -> Option<usize> {
        self.workers
            .iter()
            .position(|w| w.worker.store().contains(chunk_id))
    }

    async fn wait_for_active_workers(&self, expected: usize) {
        let client = self.client.clone();
        wait_for("active workers", move || {
            let client = client.clone();
            async move {
                client
                    .health()
                    .await
                    .map(|h| h.details.active_nodes == expected)
                    .unwrap_or(false)
            }
        })
        .await;
    }

    async fn wait_for_record<F>(&self, path: &str, cond: F) -> FileRecord
    where
        F: Fn(&FileRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if let Ok(record) = self.client.get(path).await {
                if cond(&record) {
                    return record;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for condition on {path}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if cond().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn sorted_chunk_sizes(record: &FileRecord) -> Vec<u64> {
    let mut chunks: Vec<_> = record.chunks.iter().collect();
    chunks.sort_by_key(|c| c.index);
    chunks.iter().map(|c| c.size).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip() {
    let cluster = start_cluster(3, |_| {}).await;

    // chunk size 1024, so this is two full chunks plus one byte
    let data = pattern(2049);
    let stats = cluster
        .client
        .upload_bytes("/a", Bytes::from(data.clone()), &UploadOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.chunks, 3);

    let record = cluster
        .wait_for_record("/a", |r| r.chunks.iter().all(|c| c.replicas.len() == 3))
        .await;
    assert_eq!(record.size, 2049);
    assert_eq!(sorted_chunk_sizes(&record), vec![1024, 1024, 1]);

    let downloaded = cluster
        .client
        .download("/a", &DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(sha256_hex(&downloaded), sha256_hex(&data));
    assert_eq!(downloaded, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_direct_upload_and_replica_download() {
    let cluster = start_cluster(3, |_| {}).await;

    let data = pattern(1500);
    let opts = UploadOptions {
        direct: true,
        ..Default::default()
    };
    cluster
        .client
        .upload_bytes("/direct", Bytes::from(data.clone()), &opts)
        .await
        .unwrap();

    let opts = DownloadOptions {
        use_proxy: false,
        ..Default::default()
    };
    let downloaded = cluster.client.download("/direct", &opts).await.unwrap();
    assert_eq!(downloaded, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_and_exact_multiple_files() {
    let cluster = start_cluster(3, |_| {}).await;

    cluster
        .client
        .upload_bytes("/empty", Bytes::new(), &UploadOptions::default())
        .await
        .unwrap();
    let record = cluster.client.get("/empty").await.unwrap();
    assert_eq!(record.size, 0);
    assert!(record.chunks.is_empty());
    let downloaded = cluster
        .client
        .download("/empty", &DownloadOptions::default())
        .await
        .unwrap();
    assert!(downloaded.is_empty());

    // exact multiple of the chunk size: full last chunk, no empty trailer
    let data = pattern(2048);
    cluster
        .client
        .upload_bytes("/exact", Bytes::from(data.clone()), &UploadOptions::default())
        .await
        .unwrap();
    let record = cluster.client.get("/exact").await.unwrap();
    assert_eq!(sorted_chunk_sizes(&record), vec![1024, 1024]);
    let downloaded = cluster
        .client
        .download("/exact", &DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(downloaded, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_path_conflict_and_overwrite() {
    let cluster = start_cluster(3, |_| {}).await;

    let first = pattern(64);
    cluster
        .client
        .upload_bytes("/c", Bytes::from(first.clone()), &UploadOptions::default())
        .await
        .unwrap();

    // same path again without overwrite: 409
    let err = cluster
        .client
        .upload_bytes("/c", Bytes::from(pattern(32)), &UploadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::PathConflict));

    // with overwrite the old record is soft-deleted and replaced
    let second = pattern(100);
    let opts = UploadOptions {
        overwrite: true,
        ..Default::default()
    };
    cluster
        .client
        .upload_bytes("/c", Bytes::from(second.clone()), &opts)
        .await
        .unwrap();

    let record = cluster.client.get("/c").await.unwrap();
    assert_eq!(record.size, 100);

    let listed = cluster.client.list(Some("/c")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size, 100);

    let downloaded = cluster
        .client
        .download("/c", &DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(downloaded, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_inventory_is_authoritative() {
    // repair effectively off so the shrunken replica set stays observable
    let cluster = start_cluster(3, |c| {
        c.repair_period = Duration::from_secs(3600);
    })
    .await;

    cluster
        .client
        .upload_bytes("/hb", Bytes::from(pattern(512)), &UploadOptions::default())
        .await
        .unwrap();
    let record = cluster
        .wait_for_record("/hb", |r| r.chunks[0].replicas.len() == 3)
        .await;
    let chunk_id = record.chunks[0].chunk_id;

    // drop the chunk from one worker's disk; its next heartbeat must
    // retract the placement
    let victim = cluster.worker_holding(chunk_id).unwrap();
    let victim_id = cluster.workers[victim].worker.node_id().to_string();
    cluster.workers[victim]
        .worker
        .store()
        .remove_chunk(chunk_id)
        .unwrap();

    let record = cluster
        .wait_for_record("/hb", |r| r.chunks[0].replicas.len() == 2)
        .await;
    assert!(record.chunks[0].replica(&victim_id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repair_after_worker_loss() {
    let mut cluster = start_cluster(3, |_| {}).await;

    cluster
        .client
        .upload_bytes("/b", Bytes::from(pattern(700)), &UploadOptions::default())
        .await
        .unwrap();
    let record = cluster
        .wait_for_record("/b", |r| r.chunks[0].replicas.len() == 3)
        .await;
    let chunk_id = record.chunks[0].chunk_id;

    // one worker dies: its replica disappears from the live set and the
    // chunk stays under-replicated while no third worker exists
    let lost = cluster.stop_worker(0);
    cluster.wait_for_active_workers(2).await;
    let record = cluster
        .wait_for_record("/b", |r| r.chunks[0].replicas.len() == 2)
        .await;
    assert!(record.chunks[0].replica(&lost).is_none());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let record = cluster.client.get("/b").await.unwrap();
    assert_eq!(record.chunks[0].replicas.len(), 2);

    // a fresh worker joins: repair copies the chunk within a cycle or two
    cluster.add_worker().await;
    cluster.wait_for_active_workers(3).await;
    cluster
        .wait_for_record("/b", |r| {
            r.chunks[0].replicas.len() == 3
                && r.chunks[0]
                    .replicas
                    .iter()
                    .all(|p| p.state == sfs_api_types::ReplicaState::Committed)
        })
        .await;

    let newcomer = cluster.workers.last().unwrap();
    assert!(newcomer.worker.store().contains(chunk_id));

    // the healed copy is byte-identical
    let downloaded = cluster
        .client
        .download("/b", &DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(downloaded, pattern(700));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corruption_failover_and_reheal() {
    let cluster = start_cluster(3, |_| {}).await;

    let data = pattern(900);
    cluster
        .client
        .upload_bytes("/corrupt", Bytes::from(data.clone()), &UploadOptions::default())
        .await
        .unwrap();
    let record = cluster.client.get("/corrupt").await.unwrap();
    let chunk_id = record.chunks[0].chunk_id;

    // flip bits in one replica behind the worker's back
    let victim = cluster.worker_holding(chunk_id).unwrap();
    let victim_store = Arc::clone(cluster.workers[victim].worker.store());
    std::fs::write(victim_store.chunk_path(chunk_id), b"rotten bytes").unwrap();

    // enough downloads that the proxy's round-robin hits the bad replica;
    // every one of them must still return correct bytes
    for _ in 0..6 {
        let downloaded = cluster
            .client
            .download("/corrupt", &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(downloaded, data);
    }

    // the bad pair was quarantined on first read
    assert!(!victim_store.contains(chunk_id));

    // heartbeat retracts it, repair re-replicates, and the cluster returns
    // to three verified copies
    cluster
        .wait_for_record("/corrupt", |r| {
            r.chunks[0].replicas.len() == 3
                && r.chunks[0]
                    .replicas
                    .iter()
                    .all(|p| p.state == sfs_api_types::ReplicaState::Committed)
        })
        .await;
    wait_for("re-replicated copy on disk", || async {
        cluster
            .workers
            .iter()
            .filter(|w| w.worker.store().contains(chunk_id))
            .count()
            == 3
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_timeout() {
    let cluster = start_cluster(3, |c| {
        c.session_timeout = 1;
    })
    .await;

    // drive the wire protocol by hand: init, upload nothing, let it expire
    let http = HttpClient::new(Duration::from_secs(10));
    let plan: UploadPlan = http
        .post_json(
            &format!("{}/api/v1/files/upload-init", cluster.coordinator_url),
            &UploadInitRequest {
                path: "/d".to_string(),
                size: 2048,
                overwrite: false,
                compressed: false,
                original_size: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(plan.chunks.len(), 2);

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let err = http
        .post_json::<_, CommitResponse>(
            &format!("{}/api/v1/files/commit", cluster.coordinator_url),
            &CommitRequest {
                file_id: plan.file_id,
                chunks: Vec::new(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::SessionExpired));

    // no provisional state remains visible
    let err = cluster.client.get("/d").await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
    assert!(cluster.client.list(Some("/d")).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_and_gc() {
    let cluster = start_cluster(3, |c| {
        c.gc_grace = 0;
    })
    .await;

    cluster
        .client
        .upload_bytes("/del", Bytes::from(pattern(300)), &UploadOptions::default())
        .await
        .unwrap();
    let record = cluster.client.get("/del").await.unwrap();
    let chunk_id = record.chunks[0].chunk_id;

    cluster.client.delete("/del", false).await.unwrap();
    let err = cluster.client.get("/del").await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
    assert!(cluster.client.list(None).await.unwrap().is_empty());

    // repeated delete of the same path is idempotent
    let response = cluster.client.delete("/del", false).await.unwrap();
    assert_eq!(response.status, "deleted");

    // grace period of zero: one GC pass removes records and worker bytes
    coordinator::gc::gc_cycle(&cluster.coordinator).await.unwrap();
    wait_for("chunks physically removed", || async {
        cluster
            .workers
            .iter()
            .all(|w| !w.worker.store().contains(chunk_id))
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_permanent_delete_removes_bytes() {
    let cluster = start_cluster(3, |_| {}).await;

    cluster
        .client
        .upload_bytes("/perm", Bytes::from(pattern(256)), &UploadOptions::default())
        .await
        .unwrap();
    let record = cluster.client.get("/perm").await.unwrap();
    let chunk_id = record.chunks[0].chunk_id;

    cluster.client.delete("/perm", true).await.unwrap();
    let err = cluster.client.get("/perm").await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));

    wait_for("chunks physically removed", || async {
        cluster
            .workers
            .iter()
            .all(|w| !w.worker.store().contains(chunk_id))
    })
    .await;
}
