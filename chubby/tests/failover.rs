use chubby::{
    client::{ClientSession, SessionPhase},
    config::LeaseConfig,
    test_utils::TestCluster,
    Error, LockMode, LockPath,
};
use std::time::Duration;
use tokio::time::{timeout, Instant};

async fn wait_for_phase(session: &ClientSession, limit: Duration, wanted: fn(SessionPhase) -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if wanted(session.phase()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_jeopardy_recovers_locks_on_new_leader() {
    let lease = LeaseConfig::fast();
    let cluster = TestCluster::start(3, lease).await.unwrap();
    let client = ClientSession::init(cluster.client_config("a")).await.unwrap();
    let l = LockPath::new("L");
    let m = LockPath::new("M");

    client.open_lock(&l).await.unwrap();
    client.open_lock(&m).await.unwrap();
    assert!(client.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());
    assert!(client.try_acquire_lock(&m, LockMode::Shared).await.unwrap());

    cluster.crash(0);
    cluster.elect(1);
    println!("master moved from {} to {}", cluster.node(0).addr, cluster.node(1).addr);

    // Only jeopardy recovery moves a session to another server.
    let limit = lease.lease_length * 3 + lease.jeopardy;
    let deadline = Instant::now() + limit;
    while client.server_addr() != cluster.node(1).addr && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.server_addr(), cluster.node(1).addr, "client never recovered");
    assert!(wait_for_phase(&client, limit, |p| p == SessionPhase::Active).await);
    assert_eq!(client.held_locks().len(), 2);

    let locks = cluster.node(1).state.sessions.lock_manager();
    let lock = locks.lock(&l).await.unwrap();
    assert_eq!(lock.mode, LockMode::Exclusive);
    assert!(lock.is_owned_by(client.client_id()));
    let lock = locks.lock(&m).await.unwrap();
    assert_eq!(lock.mode, LockMode::Shared);

    // The recovered session is fully usable.
    client.release_lock(&l).await.unwrap();
    assert!(client.try_acquire_lock(&l, LockMode::Shared).await.unwrap());
}

#[tokio::test]
async fn test_calls_wait_out_jeopardy() {
    let lease = LeaseConfig::fast();
    let cluster = TestCluster::start(2, lease).await.unwrap();
    let client = ClientSession::init(cluster.client_config("a")).await.unwrap();
    let l = LockPath::new("L");
    client.open_lock(&l).await.unwrap();

    cluster.crash(0);
    assert!(
        wait_for_phase(&client, lease.lease_length * 3, |p| matches!(p, SessionPhase::Jeopardy { .. })).await
    );

    let pending = {
        let client = client.clone();
        let l = l.clone();
        tokio::spawn(async move { client.try_acquire_lock(&l, LockMode::Exclusive).await })
    };
    tokio::time::sleep(lease.probe_interval * 4).await;
    assert!(!pending.is_finished(), "call went through during jeopardy");

    cluster.elect(1);
    let acquired = timeout(lease.jeopardy, pending).await.unwrap().unwrap();
    assert!(acquired.unwrap());
    assert_eq!(client.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn test_no_reachable_master_expires_session() {
    let lease = LeaseConfig::fast();
    let cluster = TestCluster::start(2, lease).await.unwrap();
    let client = ClientSession::init(cluster.client_config("a")).await.unwrap();
    let l = LockPath::new("L");
    client.open_lock(&l).await.unwrap();
    assert!(client.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());

    cluster.crash(0);
    cluster.crash(1);

    let started = Instant::now();
    timeout(lease.lease_length * 3 + lease.jeopardy * 2, client.expired())
        .await
        .expect("session never expired");
    assert!(started.elapsed() >= lease.jeopardy);
    assert!(client.is_expired());

    let err = client.release_lock(&l).await.unwrap_err();
    assert!(matches!(err, Error::SessionExpired { .. }));
    let err = client.open_lock(&l).await.unwrap_err();
    assert!(err.is_session_expired());
}

#[tokio::test]
async fn test_recovery_refused_when_lock_was_taken() {
    let lease = LeaseConfig::fast();
    let cluster = TestCluster::start(2, lease).await.unwrap();
    let client = ClientSession::init(cluster.client_config("a")).await.unwrap();
    let l = LockPath::new("L");
    client.open_lock(&l).await.unwrap();
    assert!(client.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());

    cluster.crash(0);
    cluster.elect(1);

    // Someone else grabs L on the new master before the old holder returns.
    let rival = ClientSession::init(cluster.client_config("rival")).await.unwrap();
    assert!(rival.try_acquire_lock(&l, LockMode::Exclusive).await.unwrap());

    timeout(lease.lease_length * 3 + lease.jeopardy, client.expired())
        .await
        .expect("session should end when its lock cannot be restored");
    let lock = cluster.node(1).state.sessions.lock_manager().lock(&l).await.unwrap();
    assert!(lock.is_owned_by(rival.client_id()));
}

#[tokio::test]
async fn test_session_settles_after_refresh_by_live_master() {
    let lease = LeaseConfig::fast();
    let cluster = TestCluster::start(1, lease).await.unwrap();
    // A short local lease runs out while the first KeepAlive is still parked.
    let impatient = LeaseConfig {
        lease_length: Duration::from_millis(400),
        ..lease
    };
    let client = ClientSession::init(cluster.client_config("a").with_lease(impatient))
        .await
        .unwrap();

    // Jeopardy is usually over within a millisecond here, too quick to poll.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(wait_for_phase(&client, lease.jeopardy, |p| p == SessionPhase::Active).await);
    assert!(client.lease_length() < lease.lease_length * 2);
    assert_eq!(client.server_addr(), cluster.node(0).addr);

    let watch_until = Instant::now() + lease.lease_length * 6;
    while Instant::now() < watch_until {
        assert_eq!(client.phase(), SessionPhase::Active, "fell back into jeopardy");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Each lease was extended rather than restarted.
    assert!(
        client.lease_length() >= lease.lease_length * 4,
        "lease is only {:?}",
        client.lease_length()
    );
}
