use chubby::{
    client::{ClientSession, RpcClient},
    config::LeaseConfig,
    storage::ReplicatedStore,
    test_utils::TestCluster,
    ClientId, Error, LockError, LockMode, LockPath,
};
use std::future::Future;
use std::time::Duration;

async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn session(cluster: &TestCluster, id: &str) -> ClientSession {
    ClientSession::init(cluster.client_config(id)).await.unwrap()
}

#[tokio::test]
async fn test_exclusive_handover_between_clients() {
    let cluster = TestCluster::start(1, LeaseConfig::fast()).await.unwrap();
    let a = session(&cluster, "a").await;
    let b = session(&cluster, "b").await;
    let l = LockPath::new("L");

    a.open_lock(&l).await.unwrap();
    assert!(a.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());
    assert!(!b.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());
    assert!(!b.try_acquire_lock(&l, LockMode::Shared).await.unwrap());

    a.release_lock(&l).await.unwrap();
    assert!(b.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());
    assert_eq!(b.held_locks().get(&l), Some(&LockMode::Exclusive));
    assert!(a.held_locks().is_empty());
}

#[tokio::test]
async fn test_shared_holders_block_exclusive() {
    let cluster = TestCluster::start(1, LeaseConfig::fast()).await.unwrap();
    let a = session(&cluster, "a").await;
    let b = session(&cluster, "b").await;
    let c = session(&cluster, "c").await;
    let l = LockPath::new("L");

    a.open_lock(&l).await.unwrap();
    assert!(a.try_acquire_lock(&l, LockMode::Shared).await.unwrap());
    assert!(b.try_acquire_lock(&l, LockMode::Shared).await.unwrap());
    assert!(!c.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());

    let lock = cluster
        .node(0)
        .state
        .sessions
        .lock_manager()
        .lock(&l)
        .await
        .unwrap();
    assert_eq!(lock.mode, LockMode::Shared);
    assert_eq!(lock.owners.len(), 2);
}

#[tokio::test]
async fn test_local_bookkeeping_refuses_without_rpc() {
    let cluster = TestCluster::start(1, LeaseConfig::fast()).await.unwrap();
    let a = session(&cluster, "a").await;
    let l = LockPath::new("L");

    let err = a.release_lock(&l).await.unwrap_err();
    assert!(matches!(err, Error::Lock(LockError::NotOwned { .. })));

    a.open_lock(&l).await.unwrap();
    assert!(a.try_acquire_lock(&l, LockMode::Shared).await.unwrap());
    let err = a.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap_err();
    assert!(matches!(err, Error::Lock(LockError::AlreadyOwned { .. })));
}

#[tokio::test]
async fn test_delete_requires_exclusive_and_leaves_no_residue() {
    let cluster = TestCluster::start(1, LeaseConfig::fast()).await.unwrap();
    let a = session(&cluster, "a").await;
    let l = LockPath::new("L");

    let err = a.delete_lock(&l).await.unwrap_err();
    assert!(err.is_precondition(), "unexpected error: {err}");

    a.open_lock(&l).await.unwrap();
    a.open_lock(&l).await.unwrap();
    assert!(a.try_acquire_lock(&l, LockMode::Shared).await.unwrap());
    let err = a.delete_lock(&l).await.unwrap_err();
    assert!(matches!(err, Error::Lock(LockError::NotExclusive { .. })));

    a.release_lock(&l).await.unwrap();
    assert!(a.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());
    a.delete_lock(&l).await.unwrap();
    assert!(a.held_locks().is_empty());

    let state = &cluster.node(0).state;
    assert!(state.sessions.lock_manager().lock(&l).await.is_none());
    assert_eq!(state.store.get(l.as_str()).await.unwrap(), None);

    let err = a.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap_err();
    assert!(matches!(err, Error::Lock(LockError::NotOpened { .. })));
}

#[tokio::test]
async fn test_follower_redirects_init_session() {
    let cluster = TestCluster::start(3, LeaseConfig::fast()).await.unwrap();
    cluster.elect(2);

    let a = session(&cluster, "a").await;
    assert_eq!(a.server_addr(), cluster.node(2).addr);

    let err = RpcClient::new(cluster.node(0).addr.clone())
        .open_lock(&ClientId::new("a"), &LockPath::new("L"))
        .await
        .unwrap_err();
    assert_eq!(err.redirect(), Some(cluster.node(2).addr.as_str()));
}

#[tokio::test]
async fn test_session_outlives_many_leases() {
    let lease = LeaseConfig::fast();
    let cluster = TestCluster::start(1, lease).await.unwrap();
    let a = session(&cluster, "a").await;
    let l = LockPath::new("L");
    a.open_lock(&l).await.unwrap();
    assert!(a.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());

    tokio::time::sleep(lease.lease_length * 4).await;

    assert!(!a.is_expired());
    assert!(!a.in_jeopardy());
    assert!(a.lease_length() > lease.lease_length);
    let b = session(&cluster, "b").await;
    assert!(!b.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());
}

#[tokio::test]
async fn test_server_expiry_frees_locks_for_others() {
    let lease = LeaseConfig::fast();
    let cluster = TestCluster::start(1, lease).await.unwrap();
    let a = session(&cluster, "a").await;
    let b = session(&cluster, "b").await;
    let l = LockPath::new("L");

    a.open_lock(&l).await.unwrap();
    assert!(a.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());
    a.close();

    let freed = eventually(lease.lease_length * 6, || async {
        b.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap()
    })
    .await;
    assert!(freed, "lock was never released by the expired session");

    let err = a.open_lock(&l).await.unwrap_err();
    assert!(matches!(err, Error::SessionExpired { .. }));
}

#[tokio::test]
async fn test_status_reports_sessions_and_locks() {
    let cluster = TestCluster::start(2, LeaseConfig::fast()).await.unwrap();
    let a = session(&cluster, "a").await;
    a.open_lock(&LockPath::new("L")).await.unwrap();
    assert!(a
        .try_acquire_lock(&LockPath::new("L"), LockMode::Shared)
        .await
        .unwrap());

    let status = RpcClient::new(cluster.node(0).addr.clone())
        .status()
        .await
        .unwrap();
    assert!(status.is_leader);
    assert_eq!(status.sessions, 1);
    assert_eq!(status.locks, 1);
    assert_eq!(status.leader.as_deref(), Some(cluster.node(0).addr.as_str()));

    let status = RpcClient::new(cluster.node(1).addr.clone())
        .status()
        .await
        .unwrap();
    assert!(!status.is_leader);
    assert_eq!(status.sessions, 0);
}
