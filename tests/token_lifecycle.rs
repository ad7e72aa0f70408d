//! Lifecycle behaviour of `TokenManager` against the in-memory store, a
//! scripted issuer and a hand-driven clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use shift_token_broker::providers::{IssuedToken, ProviderRegistry, TokenIssuer};
use shift_token_broker::store::{CredentialStore, CredentialWrite, MemoryCredentialStore};
use shift_token_broker::tokens::refresh::refresh_cycle;
use shift_token_broker::tokens::{ManualClock, SeedRequest, TokenManager, MAX_EXPIRES_IN_SECS};
use shift_token_broker::BrokerError;

const PROVIDER: &str = "freee";
const SKEW_SECS: i64 = 60;

#[derive(Clone)]
enum Reply {
    Issue {
        refresh_token: Option<&'static str>,
        expires_in: Option<f64>,
    },
    /// 2xx body that only carried a rotated refresh token.
    RotationOnly(&'static str),
    Reject(u16, &'static str),
    Timeout,
}

struct ScriptedIssuer {
    reply: Mutex<Reply>,
    delay: StdDuration,
    calls: AtomicUsize,
    presented: Mutex<Vec<String>>,
}

impl ScriptedIssuer {
    fn new(reply: Reply) -> Self {
        Self {
            reply: Mutex::new(reply),
            delay: StdDuration::ZERO,
            calls: AtomicUsize::new(0),
            presented: Mutex::new(Vec::new()),
        }
    }

    fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn presented(&self) -> Vec<String> {
        self.presented.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenIssuer for ScriptedIssuer {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, BrokerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.presented.lock().unwrap().push(refresh_token.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::Issue {
                refresh_token,
                expires_in,
            } => Ok(IssuedToken {
                access_token: Some(format!("at-{n}")),
                expires_in,
                refresh_token: refresh_token.map(str::to_string),
                token_type: Some("bearer".into()),
                scope: None,
            }),
            Reply::RotationOnly(refresh_token) => Ok(IssuedToken::rotation_only(refresh_token)),
            Reply::Reject(status, body) => Err(BrokerError::RefreshRejected {
                provider: PROVIDER.into(),
                status: Some(status),
                detail: body.into(),
            }),
            Reply::Timeout => Err(BrokerError::IssuerTimeout(PROVIDER.into())),
        }
    }
}

struct Harness {
    store: Arc<MemoryCredentialStore>,
    issuer: Arc<ScriptedIssuer>,
    clock: Arc<ManualClock>,
    manager: Arc<TokenManager>,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
}

fn harness_with(issuer: ScriptedIssuer) -> Harness {
    let store = Arc::new(MemoryCredentialStore::new());
    let issuer = Arc::new(issuer);
    let clock = Arc::new(ManualClock::new(t0()));

    let mut registry = ProviderRegistry::new();
    registry.register(issuer.clone());

    let manager = TokenManager::new(store.clone(), registry)
        .with_skew(Duration::seconds(SKEW_SECS))
        .with_clock(clock.clone());

    Harness {
        store,
        issuer,
        clock,
        manager: Arc::new(manager),
    }
}

fn harness() -> Harness {
    harness_with(ScriptedIssuer::new(Reply::Issue {
        refresh_token: None,
        expires_in: Some(21_600.0),
    }))
}

async fn store_record(store: &MemoryCredentialStore, provider: &str, expires_at: DateTime<Utc>) {
    store
        .put(
            provider,
            &CredentialWrite {
                access_token: "at-seed".into(),
                refresh_token: "rt-seed".into(),
                expires_at,
                token_type: Some("bearer".into()),
                scope: Some("read write".into()),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn fresh_token_is_served_without_writes_or_issuer_calls() {
    let h = harness();
    store_record(&h.store, PROVIDER, t0() + Duration::hours(5)).await;

    for _ in 0..3 {
        let token = h.manager.get_valid_access_token(PROVIDER).await.unwrap();
        assert_eq!(token.access_token, "at-seed");
        assert!(!token.refreshed);
    }

    assert_eq!(h.issuer.calls(), 0);
    assert_eq!(h.store.writes(), 1);
}

#[tokio::test]
async fn expired_token_is_refreshed_once_and_persisted() {
    let h = harness();
    store_record(&h.store, PROVIDER, t0() - Duration::minutes(5)).await;

    let token = h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    assert!(token.refreshed);
    assert_eq!(token.access_token, "at-1");
    assert_eq!(h.issuer.calls(), 1);
    assert_eq!(h.issuer.presented(), vec!["rt-seed".to_string()]);

    let stored = h.store.get(PROVIDER).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "at-1");
    assert_eq!(stored.expires_at, token.expires_at);
    assert_eq!(h.store.writes(), 2);
}

#[tokio::test]
async fn omitted_refresh_token_keeps_the_stored_one() {
    let h = harness();
    store_record(&h.store, PROVIDER, t0() - Duration::seconds(1)).await;

    h.manager.get_valid_access_token(PROVIDER).await.unwrap();

    let stored = h.store.get(PROVIDER).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "rt-seed");
}

#[tokio::test]
async fn rotated_refresh_token_replaces_the_stored_one() {
    let h = harness_with(ScriptedIssuer::new(Reply::Issue {
        refresh_token: Some("rt-2"),
        expires_in: Some(3_600.0),
    }));
    store_record(&h.store, PROVIDER, t0() - Duration::seconds(1)).await;

    h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    let stored = h.store.get(PROVIDER).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "rt-2");

    // The next refresh must present the rotated token, never the old one.
    h.clock.advance(Duration::hours(2));
    h.issuer.set_reply(Reply::Issue {
        refresh_token: None,
        expires_in: Some(3_600.0),
    });
    h.manager.get_valid_access_token(PROVIDER).await.unwrap();

    assert_eq!(
        h.issuer.presented(),
        vec!["rt-seed".to_string(), "rt-2".to_string()]
    );
    let stored = h.store.get(PROVIDER).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "rt-2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_collapse_to_a_single_refresh() {
    let mut issuer = ScriptedIssuer::new(Reply::Issue {
        refresh_token: Some("rt-rotated"),
        expires_in: Some(21_600.0),
    });
    issuer.delay = StdDuration::from_millis(50);
    let h = harness_with(issuer);
    store_record(&h.store, PROVIDER, t0() - Duration::minutes(1)).await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.get_valid_access_token(PROVIDER).await })
        })
        .collect();

    let mut tokens = Vec::new();
    for task in tasks {
        tokens.push(task.await.unwrap().unwrap().access_token);
    }

    assert_eq!(h.issuer.calls(), 1);
    assert!(tokens.iter().all(|t| t == "at-1"));
    assert_eq!(h.store.writes(), 2);
    assert_eq!(
        h.store.get(PROVIDER).await.unwrap().unwrap().refresh_token,
        "rt-rotated"
    );
}

#[tokio::test]
async fn rejected_refresh_leaves_the_record_untouched() {
    let h = harness_with(ScriptedIssuer::new(Reply::Reject(
        401,
        r#"{"error":"invalid_grant"}"#,
    )));
    store_record(&h.store, PROVIDER, t0() - Duration::minutes(1)).await;
    let before = h.store.get(PROVIDER).await.unwrap().unwrap();

    let err = h.manager.get_valid_access_token(PROVIDER).await.unwrap_err();
    match err {
        BrokerError::RefreshRejected { status, detail, .. } => {
            assert_eq!(status, Some(401));
            assert_eq!(detail, r#"{"error":"invalid_grant"}"#);
        }
        other => panic!("expected RefreshRejected, got {other:?}"),
    }

    let after = h.store.get(PROVIDER).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(h.store.writes(), 1);

    // A later attempt retries with the same refresh token.
    h.issuer.set_reply(Reply::Issue {
        refresh_token: None,
        expires_in: Some(3_600.0),
    });
    h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    assert_eq!(
        h.issuer.presented(),
        vec!["rt-seed".to_string(), "rt-seed".to_string()]
    );
}

#[tokio::test]
async fn issuer_timeout_leaves_the_record_untouched() {
    let h = harness_with(ScriptedIssuer::new(Reply::Timeout));
    store_record(&h.store, PROVIDER, t0() - Duration::minutes(1)).await;
    let before = h.store.get(PROVIDER).await.unwrap().unwrap();

    let err = h.manager.get_valid_access_token(PROVIDER).await.unwrap_err();
    assert!(matches!(err, BrokerError::IssuerTimeout(_)));

    assert_eq!(h.store.get(PROVIDER).await.unwrap().unwrap(), before);
    assert_eq!(h.store.writes(), 1);
}

#[tokio::test]
async fn skew_boundary_decides_between_cache_and_refresh() {
    let h = harness();
    store_record(&h.store, PROVIDER, t0() - Duration::seconds(1)).await;

    let token = h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    let expected = t0() + Duration::seconds(21_600) - Duration::seconds(SKEW_SECS);
    assert_eq!(token.expires_at, expected);
    assert_eq!(
        h.store.get(PROVIDER).await.unwrap().unwrap().expires_at,
        expected
    );
    assert_eq!(h.issuer.calls(), 1);

    h.clock.set(expected - Duration::seconds(1));
    let token = h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    assert!(!token.refreshed);
    assert_eq!(h.issuer.calls(), 1);

    h.clock.set(expected + Duration::seconds(1));
    let token = h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    assert!(token.refreshed);
    assert_eq!(h.issuer.calls(), 2);
}

#[tokio::test]
async fn returned_expiry_never_goes_backwards() {
    let h = harness();
    store_record(&h.store, PROVIDER, t0() - Duration::seconds(1)).await;

    let mut last = h.manager.get_valid_access_token(PROVIDER).await.unwrap().expires_at;
    for step in 1..=4 {
        h.clock.advance(Duration::hours(3) * step);
        let current = h.manager.get_valid_access_token(PROVIDER).await.unwrap().expires_at;
        assert!(current >= last);
        last = current;
    }
}

#[tokio::test]
async fn unseeded_provider_fails_without_calling_the_issuer() {
    let h = harness();

    let err = h.manager.get_valid_access_token(PROVIDER).await.unwrap_err();
    assert!(matches!(err, BrokerError::CredentialNotSeeded(ref p) if p == PROVIDER));
    assert_eq!(h.issuer.calls(), 0);
}

#[tokio::test]
async fn unreachable_store_is_reported_as_unavailable() {
    let h = harness();
    store_record(&h.store, PROVIDER, t0() - Duration::seconds(1)).await;
    h.store.set_offline(true);

    let err = h.manager.get_valid_access_token(PROVIDER).await.unwrap_err();
    assert!(matches!(err, BrokerError::StorageUnavailable(_)));
    assert_eq!(h.issuer.calls(), 0);
}

#[tokio::test]
async fn stale_record_without_issuer_is_unknown_provider() {
    let h = harness();
    store_record(&h.store, "smarthr", t0() - Duration::seconds(1)).await;

    let err = h.manager.get_valid_access_token("smarthr").await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownProvider(_)));
}

fn seed_request(expires_in: f64) -> SeedRequest {
    SeedRequest {
        access_token: "at-manual".into(),
        refresh_token: "rt-manual".into(),
        expires_at: None,
        expires_in: Some(expires_in),
        token_type: Some("bearer".into()),
        scope: None,
    }
}

#[tokio::test]
async fn seeding_applies_the_skew_once() {
    let h = harness();

    let stored_expiry = h.manager.seed(PROVIDER, seed_request(3_600.0)).await.unwrap();
    assert_eq!(
        stored_expiry,
        t0() + Duration::seconds(3_600) - Duration::seconds(SKEW_SECS)
    );

    let token = h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    assert_eq!(token.access_token, "at-manual");
    assert_eq!(token.expires_at, stored_expiry);
    assert_eq!(h.issuer.calls(), 0);
}

#[tokio::test]
async fn seeding_replaces_an_existing_record() {
    let h = harness();
    store_record(&h.store, PROVIDER, t0() - Duration::hours(1)).await;

    h.manager.seed(PROVIDER, seed_request(600.0)).await.unwrap();

    let stored = h.store.get(PROVIDER).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "rt-manual");
}

#[tokio::test]
async fn seeding_an_unregistered_provider_is_refused() {
    let h = harness();

    let err = h.manager.seed("smarthr", seed_request(600.0)).await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownProvider(_)));
    assert_eq!(h.store.writes(), 0);
}

#[tokio::test]
async fn keeper_cycle_refreshes_only_stale_credentials() {
    let h = harness();
    assert_eq!(refresh_cycle(&h.manager).await, 0);

    store_record(&h.store, PROVIDER, t0() - Duration::seconds(1)).await;
    assert_eq!(refresh_cycle(&h.manager).await, 1);
    assert_eq!(refresh_cycle(&h.manager).await, 0);
    assert_eq!(h.issuer.calls(), 1);
}

#[tokio::test]
async fn unusable_response_still_stores_the_rotated_refresh_token() {
    let h = harness_with(ScriptedIssuer::new(Reply::RotationOnly("rt-2")));
    store_record(&h.store, PROVIDER, t0() - Duration::minutes(1)).await;

    let err = h.manager.get_valid_access_token(PROVIDER).await.unwrap_err();
    assert!(matches!(err, BrokerError::RefreshRejected { .. }));

    let stored = h.store.get(PROVIDER).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "rt-2");
    assert_eq!(stored.access_token, "at-seed");
    assert!(stored.expires_at <= t0());

    // The retry presents the rotated token and succeeds.
    h.issuer.set_reply(Reply::Issue {
        refresh_token: None,
        expires_in: Some(3_600.0),
    });
    let token = h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    assert_eq!(token.access_token, "at-2");
    assert_eq!(
        h.issuer.presented(),
        vec!["rt-seed".to_string(), "rt-2".to_string()]
    );
}

#[tokio::test]
async fn negative_lifetime_is_rejected_but_rotation_is_kept() {
    let h = harness_with(ScriptedIssuer::new(Reply::Issue {
        refresh_token: Some("rt-2"),
        expires_in: Some(-5.0),
    }));
    store_record(&h.store, PROVIDER, t0() - Duration::minutes(1)).await;

    let err = h.manager.get_valid_access_token(PROVIDER).await.unwrap_err();
    assert!(matches!(err, BrokerError::RefreshRejected { status: None, .. }));
    assert_eq!(
        h.store.get(PROVIDER).await.unwrap().unwrap().refresh_token,
        "rt-2"
    );
}

#[tokio::test]
async fn absurd_lifetime_is_capped_instead_of_overflowing() {
    let h = harness_with(ScriptedIssuer::new(Reply::Issue {
        refresh_token: Some("rt-2"),
        expires_in: Some(i64::MAX as f64),
    }));
    store_record(&h.store, PROVIDER, t0() - Duration::minutes(1)).await;

    let token = h.manager.get_valid_access_token(PROVIDER).await.unwrap();
    assert_eq!(
        token.expires_at,
        t0() + Duration::seconds(MAX_EXPIRES_IN_SECS) - Duration::seconds(SKEW_SECS)
    );
    assert_eq!(
        h.store.get(PROVIDER).await.unwrap().unwrap().refresh_token,
        "rt-2"
    );
}

