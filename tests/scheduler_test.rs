//! Integration tests for the scheduler facade: cache reuse, Vary
//! incompatibility, redirect aliasing and cache upkeep after each outcome.

mod common;

use std::sync::Arc;

use http::Method;

use common::{flush, RecordingObserver, ScriptedTransport};
use fetch_scheduler::cache::CacheConfig;
use fetch_scheduler::net::{NetworkObserver, Request, RequestMatcher, RequestState, Response};
use fetch_scheduler::{Scheduler, SchedulerConfig};

fn scheduler(transport: &Arc<ScriptedTransport>) -> Scheduler {
    Scheduler::new(SchedulerConfig::default(), transport.clone()).unwrap()
}

fn targeted(url: &str, target: &str) -> Request {
    Request::builder(Method::GET, url).header("X-Up-Target", target).build()
}

#[tokio::test]
async fn identical_get_is_served_from_cache() {
    let transport = ScriptedTransport::new();
    let scheduler = scheduler(&transport);

    let first = scheduler.request(Request::get("/users"));
    let second = scheduler.request(Request::get("/users"));
    flush().await;
    assert_eq!(transport.sent_count(), 1);
    assert_eq!(second.state(), RequestState::Tracking);

    transport.respond("/users", 200, "alice, bob");
    assert_eq!(first.response().await.unwrap().text(), "alice, bob");
    assert_eq!(second.response().await.unwrap().text(), "alice, bob");
    assert!(second.is_from_cache());

    let third = scheduler.request(Request::get("/users"));
    assert_eq!(third.response().await.unwrap().text(), "alice, bob");
    assert_eq!(transport.sent_count(), 1);
}

#[tokio::test]
async fn unsafe_methods_bypass_cache_and_expire_it() {
    let transport = ScriptedTransport::new();
    let scheduler = scheduler(&transport);

    let list = scheduler.request(Request::get("/posts"));
    flush().await;
    transport.respond("/posts", 200, "[]");
    list.response().await.unwrap();

    let create = Request::builder(Method::POST, "/posts").body("title=hi").build();
    assert!(!scheduler.will_cache(&create));
    let create = scheduler.request(create);
    flush().await;
    assert_eq!(transport.sent_count(), 2);
    assert!(!list.is_expired());

    transport.respond("/posts", 201, "created");
    create.response().await.unwrap();

    assert!(list.is_expired());
    assert_eq!(scheduler.cache().len(), 1);
    let cached = scheduler.request(Request::get("/posts"));
    assert_eq!(cached.response().await.unwrap().text(), "[]");
    assert!(cached.is_expired());
}

#[tokio::test]
async fn failed_response_evicts_entries_for_its_url() {
    let transport = ScriptedTransport::new();
    let scheduler = scheduler(&transport);

    let broken = scheduler.request(Request::get("/report"));
    flush().await;
    transport.respond("/report", 500, "boom");
    assert!(!broken.response().await.unwrap().ok());
    assert!(scheduler.cache().is_empty());

    let retry = scheduler.request(Request::get("/report"));
    flush().await;
    assert_eq!(transport.sent_count(), 2);
    transport.respond("/report", 200, "ok");
    assert!(retry.ok_response().await.is_ok());
    assert_eq!(scheduler.cache().len(), 1);
}

#[tokio::test]
async fn network_failure_and_abort_drop_the_entry() {
    let transport = ScriptedTransport::new();
    let scheduler = scheduler(&transport);

    let offline = scheduler.request(Request::get("/a"));
    let gone = scheduler.request(Request::get("/b"));
    flush().await;
    assert_eq!(scheduler.cache().len(), 2);

    transport.fail("/a", "offline");
    assert!(offline.response().await.is_err());
    scheduler.abort(&RequestMatcher::from(&gone), "user left");
    assert!(gone.response().await.unwrap_err().is_aborted());

    assert!(scheduler.cache().is_empty());
}

#[tokio::test]
async fn learned_vary_makes_tracking_request_reprocess() {
    let transport = ScriptedTransport::new();
    let scheduler = scheduler(&transport);

    let main = scheduler.request(targeted("/page", ".main"));
    let sidebar = scheduler.request(targeted("/page", ".sidebar"));
    flush().await;
    assert_eq!(transport.sent_count(), 1);
    assert_eq!(sidebar.state(), RequestState::Tracking);

    let response = Response::builder(Method::GET, "/page", 200)
        .header("Vary", "X-Up-Target")
        .body("main fragment")
        .build();
    transport.respond_with("/page", response);
    assert_eq!(main.response().await.unwrap().text(), "main fragment");
    flush().await;

    assert_eq!(transport.sent_count(), 2);
    assert!(!sidebar.is_terminal());
    transport.respond("/page", 200, "sidebar fragment");
    assert_eq!(sidebar.response().await.unwrap().text(), "sidebar fragment");
    assert!(!sidebar.is_from_cache());

    let again = scheduler.request(targeted("/page", ".main"));
    assert_eq!(again.response().await.unwrap().text(), "main fragment");
    assert_eq!(transport.sent_count(), 2);
}

#[tokio::test]
async fn empty_vary_header_is_not_served_to_request_without_it() {
    let transport = ScriptedTransport::new();
    let scheduler = scheduler(&transport);

    let empty = scheduler.request(targeted("/page", ""));
    flush().await;
    let response = Response::builder(Method::GET, "/page", 200)
        .header("Vary", "X-Up-Target")
        .body("empty target")
        .build();
    transport.respond_with("/page", response);
    empty.response().await.unwrap();

    let bare = scheduler.request(Request::get("/page"));
    flush().await;
    assert!(!bare.is_from_cache());
    assert_eq!(transport.sent_count(), 2);
    transport.respond("/page", 200, "no target");
    assert_eq!(bare.response().await.unwrap().text(), "no target");

    let again = scheduler.request(targeted("/page", ""));
    assert_eq!(again.response().await.unwrap().text(), "empty target");
    assert_eq!(transport.sent_count(), 2);
}

#[tokio::test]
async fn redirect_target_is_cached_as_alias() {
    let transport = ScriptedTransport::new();
    let scheduler = scheduler(&transport);

    let old = scheduler.request(Request::get("/old"));
    flush().await;
    let response = Response::builder(Method::GET, "/new", 200).body("moved here").build();
    transport.respond_with("/old", response);
    old.response().await.unwrap();

    let new = scheduler.request(Request::get("/new"));
    assert_eq!(new.response().await.unwrap().text(), "moved here");
    assert!(new.is_from_cache());
    assert_eq!(transport.sent_count(), 1);
}

#[tokio::test]
async fn foreground_hit_promotes_a_pending_preload() {
    let transport = ScriptedTransport::new();
    let scheduler = scheduler(&transport);

    let warm = scheduler.request(Request::builder(Method::GET, "/next").preload(true).build());
    assert!(warm.is_preload());
    scheduler.request(Request::get("/next"));
    assert!(!warm.is_preload());
}

#[tokio::test]
async fn disabled_cache_sends_every_request() {
    let transport = ScriptedTransport::new();
    let config = SchedulerConfig {
        cache: CacheConfig { enabled: false, ..CacheConfig::default() },
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(config, transport.clone()).unwrap();

    let forced = Request::builder(Method::GET, "/a").cache(true).build();
    assert!(!scheduler.will_cache(&forced));
    scheduler.request(forced);
    scheduler.request(Request::get("/a"));
    flush().await;
    assert_eq!(transport.sent_count(), 2);
    assert!(scheduler.cache().is_empty());
}

#[tokio::test]
async fn reset_aborts_and_forgets_everything() {
    let transport = ScriptedTransport::new();
    let observer = RecordingObserver::new();
    let scheduler = Scheduler::with_observer(
        SchedulerConfig::default(),
        transport.clone(),
        observer.clone() as Arc<dyn NetworkObserver>,
    )
    .unwrap();

    let pending = scheduler.request(Request::get("/a"));
    flush().await;
    scheduler.reset();

    assert!(pending.response().await.unwrap_err().is_aborted());
    assert!(!scheduler.is_busy());
    assert!(scheduler.cache().is_empty());
    assert_eq!(observer.count("aborted /a"), 1);
}

#[test]
fn zero_cache_size_fails_construction() {
    let transport = ScriptedTransport::new();
    let config = SchedulerConfig {
        cache: CacheConfig { max_size: 0, ..CacheConfig::default() },
        ..SchedulerConfig::default()
    };
    assert!(Scheduler::new(config, transport).is_err());
}
