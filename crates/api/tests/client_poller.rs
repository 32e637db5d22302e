use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use finsync_api::app::{self, AppServices};
use finsync_api::auth::JwtClaims;
use finsync_client::{ClientError, HttpSyncApi, PollError, PollerState, StartSyncParams, SyncPoller};
use finsync_core::{EmailCategory, RawEmail, SyncJobStatus, UserId};
use finsync_infra::provider::InMemoryMailbox;
use finsync_infra::sync::SyncSettings;
use jsonwebtoken::{Algorithm, EncodingKey, Header};

const JWT_SECRET: &str = "poller-secret";

async fn spawn_server(mailbox: Arc<InMemoryMailbox>) -> (String, tokio::task::JoinHandle<()>) {
    let services = Arc::new(AppServices::in_memory(
        mailbox,
        SyncSettings::new().with_batch_size(2),
    ));
    let app = app::build_app(services, JWT_SECRET);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), handle)
}

fn token_for(user: UserId) -> String {
    let claims = JwtClaims {
        sub: user.to_string(),
        exp: (chrono::Utc::now().timestamp() + 300) as u64,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn poller_follows_a_real_job_to_completion() {
    let user = UserId::new();
    let mailbox = Arc::new(InMemoryMailbox::new());
    for i in 0..5 {
        mailbox
            .deliver(
                user,
                RawEmail::new(format!("msg-{i}"), EmailCategory::expenses())
                    .with_subject("Card alert")
                    .with_body_text(format!("USD {i}.50 debited")),
            )
            .await;
    }
    let (base_url, handle) = spawn_server(mailbox).await;

    let refreshed = Arc::new(AtomicUsize::new(0));
    let hook = refreshed.clone();
    let mut poller = SyncPoller::new(HttpSyncApi::new(base_url, token_for(user)))
        .with_poll_interval(Duration::from_millis(20))
        .on_completed(move |_| {
            hook.fetch_add(1, Ordering::SeqCst);
        });

    let job = tokio::time::timeout(Duration::from_secs(5), poller.run(&StartSyncParams::default()))
        .await
        .expect("poller did not finish")
        .unwrap();

    assert_eq!(job.status, SyncJobStatus::Completed);
    assert_eq!(job.total_emails, Some(5));
    assert_eq!(job.processed_emails, 5);
    assert_eq!(job.new_emails, 5);
    assert_eq!(refreshed.load(Ordering::SeqCst), 1);
    assert_eq!(poller.state().progress_percent(), 100);

    handle.abort();
}

#[tokio::test]
async fn poller_reports_rejected_credentials() {
    let (base_url, handle) = spawn_server(Arc::new(InMemoryMailbox::new())).await;
    let mut poller = SyncPoller::new(HttpSyncApi::new(base_url, "not-a-jwt"));

    let err = poller.run(&StartSyncParams::default()).await.unwrap_err();
    assert!(matches!(
        err,
        PollError::Start(ClientError::Api { status: 401, .. })
    ));
    assert!(matches!(poller.state(), PollerState::Error { job: None, .. }));

    handle.abort();
}
