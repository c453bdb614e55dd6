//! Kernel integration tests - drive a real multi-worker `Kite` end to end.

use kite::kernel::{Service, TimerState};
use kite::types::shard;
use kite::{
    BodyStream, BootDefinition, ComponentDefinition, Error, Kite, MiddlewareContext,
    MiddlewareDefinition, Module, Request, Resource, Router, ServiceDefinition, ServiceRuntime,
    ServiceState, TimerDefinition,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Helper: start a kite with `module` on `workers` workers.
async fn start(module: Module, workers: usize) -> Kite {
    let mut kite = Kite::new();
    kite.regist(module).unwrap();
    kite.start(Some(workers)).await.unwrap();
    kite
}

/// Helper: fetch and decode a JSON body.
async fn fetch_json(kite: &Kite, target: Router, path: &str, body: Value) -> (u16, Value) {
    let response = kite.fetch(Request::fetch(target, path).body(body)).await;
    let status = response.status;
    let body = match response.body {
        kite::Body::Stream(stream) => Value::Array(stream.collect_values().await.unwrap()),
        other => other.into_json().unwrap_or(Value::Null),
    };
    (status, body)
}

/// Helper: poll `check` until it holds or two seconds pass.
async fn wait_until(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn echo() -> ServiceDefinition {
    ServiceDefinition::new().handler("hello", |_cx, _event| async { Ok("world") })
}

#[tokio::test]
async fn test_echo_round_trip() {
    let kite = start(Module::new("m").service("echo", echo()), 2).await;
    let router = Router::new("echo", "a");
    kite.create_service(router.clone(), Value::Null).await.unwrap();

    let (status, body) = fetch_json(&kite, router, "handlers/hello", Value::Null).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!("world"));
}

#[tokio::test]
async fn test_instances_shard_and_keep_their_own_props() {
    let service = ServiceDefinition::new()
        .auto_create(true)
        .handler("set", |cx, event| async move {
            cx.set_prop("value", event.body().clone());
            Ok(())
        })
        .handler("get", |cx, _event| async move { Ok(cx.prop("value").unwrap_or(Value::Null)) })
        .handler("where", |cx, _event| async move {
            Ok(json!(cx.kernel().worker_index()))
        });
    let mut kite = start(Module::new("m").service("echo", service), 4).await;
    let (a, b) = (Router::new("echo", "a"), Router::new("echo", "b"));

    fetch_json(&kite, a.clone(), "handlers/set", json!(1)).await;
    assert_eq!(fetch_json(&kite, a.clone(), "handlers/get", Value::Null).await.1, json!(1));
    assert_eq!(fetch_json(&kite, b.clone(), "handlers/get", Value::Null).await.1, Value::Null);

    for router in [a, b] {
        let (_, worker) = fetch_json(&kite, router.clone(), "handlers/where", Value::Null).await;
        assert_eq!(worker, json!(shard(&router, 4)));
    }

    let services = kite.list_services().await.unwrap();
    assert_eq!(services.len(), 2);
    assert_ne!(services[0].instance, services[1].instance);
    kite.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_creates_share_one_instance() {
    let setups = Arc::new(AtomicUsize::new(0));
    let counter = setups.clone();
    let service = ServiceDefinition::new().setup(move |_cx, _options| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(None)
        }
    });
    let kite = start(Module::new("m").service("slow", service), 2).await;
    let router = Router::new("slow", 7u64);

    let refs = futures::future::join_all(
        (0..8).map(|_| kite.create_service(router.clone(), Value::Null)),
    )
    .await;

    assert_eq!(setups.load(Ordering::SeqCst), 1);
    let first = refs[0].as_ref().unwrap();
    for created in &refs {
        assert_eq!(created.as_ref().unwrap(), first);
    }
}

#[tokio::test]
async fn test_keep_alive_cache_reclaim_and_eviction() {
    let setups = Arc::new(AtomicUsize::new(0));
    let destroys = Arc::new(AtomicUsize::new(0));
    let starts = log();

    let (s, d, st) = (setups.clone(), destroys.clone(), starts.clone());
    let service = ServiceDefinition::new()
        .keep_alive(Duration::from_millis(200))
        .setup(move |_cx, _options| {
            s.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .on_start(move |_cx, reclaimed| {
            st.lock().unwrap().push(reclaimed.to_string());
            async { Ok(()) }
        })
        .on_destroy(move |_cx| {
            d.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
    let kite = start(Module::new("m").service("session", service), 2).await;
    let router = Router::new("session", "u1");

    let created = kite.create_service(router.clone(), Value::Null).await.unwrap();
    kite.stop_service(router.clone(), false).await.unwrap();
    assert_eq!(kite.service_state(router.clone()).await.unwrap(), ServiceState::Cached);

    let reclaimed = kite.create_service(router.clone(), Value::Null).await.unwrap();
    assert_eq!(reclaimed.instance, created.instance);
    assert_eq!(setups.load(Ordering::SeqCst), 1);
    assert_eq!(entries(&starts), vec!["false", "true"]);
    assert_eq!(kite.service_state(router.clone()).await.unwrap(), ServiceState::Live);

    // The first eviction was cancelled by the reclaim.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(destroys.load(Ordering::SeqCst), 0);

    kite.stop_service(router.clone(), false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(destroys.load(Ordering::SeqCst), 1);
    assert_eq!(kite.service_state(router).await.unwrap(), ServiceState::Absent);
}

#[tokio::test]
async fn test_force_destroy_skips_cache() {
    let service = ServiceDefinition::new().keep_alive(Duration::from_secs(60));
    let kite = start(Module::new("m").service("session", service), 1).await;
    let router = Router::new("session", "u2");

    kite.create_service(router.clone(), Value::Null).await.unwrap();
    kite.stop_service(router.clone(), true).await.unwrap();
    assert_eq!(kite.service_state(router).await.unwrap(), ServiceState::Absent);
}

thread_local! {
    static TRACKED: RefCell<Option<Weak<Service>>> = const { RefCell::new(None) };
}

fn tracked_alive() -> bool {
    TRACKED.with(|t| t.borrow().as_ref().is_some_and(|w| w.upgrade().is_some()))
}

#[tokio::test]
async fn test_destroyed_service_is_freed_despite_middleware_context() {
    let holding = MiddlewareDefinition::new(|cx: MiddlewareContext| async move {
        Ok(kite::middleware::handler(move |_event, next| {
            let cx = cx.clone();
            async move {
                tracing::trace!("middleware {}", cx.name());
                next.run().await
            }
        }))
    });
    let tracked = ServiceDefinition::new()
        .middleware("holding", holding)
        .setup(|cx, _options| {
            TRACKED.with(|t| *t.borrow_mut() = Some(Rc::downgrade(cx.service())));
            async { Ok(None) }
        })
        .handler("hello", |_cx, _event| async { Ok("world") });
    let checker = ServiceDefinition::new()
        .auto_create(true)
        .handler("alive", |_cx, _event| async { Ok(json!(tracked_alive())) });
    let kite = start(
        Module::new("m").service("tracked", tracked).service("checker", checker),
        1,
    )
    .await;
    let router = Router::new("tracked", "t");
    let check = Router::new("checker", "c");

    kite.create_service(router.clone(), Value::Null).await.unwrap();
    let (status, _) = fetch_json(&kite, router.clone(), "handlers/hello", Value::Null).await;
    assert_eq!(status, 200);
    assert_eq!(fetch_json(&kite, check.clone(), "handlers/alive", Value::Null).await.1, json!(true));

    kite.stop_service(router.clone(), true).await.unwrap();
    assert_eq!(kite.service_state(router).await.unwrap(), ServiceState::Absent);
    assert_eq!(fetch_json(&kite, check, "handlers/alive", Value::Null).await.1, json!(false));
}

#[tokio::test]
async fn test_failed_restart_destroys_reclaimed_instance() {
    let destroys = Arc::new(AtomicUsize::new(0));
    let d = destroys.clone();
    let service = ServiceDefinition::new()
        .keep_alive(Duration::from_millis(100))
        .on_start(|_cx, reclaimed| async move {
            if reclaimed {
                return Err(Error::handler("cannot resume"));
            }
            Ok(())
        })
        .on_destroy(move |_cx| {
            d.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
    let kite = start(Module::new("m").service("session", service), 2).await;
    let router = Router::new("session", "r");

    kite.create_service(router.clone(), Value::Null).await.unwrap();
    kite.stop_service(router.clone(), false).await.unwrap();
    assert_eq!(destroys.load(Ordering::SeqCst), 0);

    assert!(kite.create_service(router.clone(), Value::Null).await.is_err());
    assert_eq!(destroys.load(Ordering::SeqCst), 1);
    assert_eq!(kite.service_state(router).await.unwrap(), ServiceState::Absent);

    // The cancelled eviction must not destroy it a second time.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_first_start_destroys_components() {
    let destroyed = log();
    let (c, s) = (destroyed.clone(), destroyed.clone());
    let part = ComponentDefinition::new().on_destroy(move |_cx| {
        c.lock().unwrap().push("part".to_string());
        async { Ok(()) }
    });
    let service = ServiceDefinition::new()
        .component("part", part)
        .on_start(|_cx, _reclaimed| async { Err(Error::handler("refused")) })
        .on_destroy(move |_cx| {
            s.lock().unwrap().push("service".to_string());
            async { Ok(()) }
        });
    let kite = start(Module::new("m").service("broken", service), 1).await;
    let router = Router::new("broken", 1u64);

    assert!(kite.create_service(router.clone(), Value::Null).await.is_err());
    assert_eq!(entries(&destroyed), vec!["part", "service"]);
    assert_eq!(kite.service_state(router).await.unwrap(), ServiceState::Absent);
}

#[tokio::test]
async fn test_fired_delay_timer_is_not_rearmed_on_reclaim() {
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let service = ServiceDefinition::new()
        .keep_alive(Duration::from_secs(60))
        .timer(
            "once",
            TimerDefinition::delay(Duration::from_millis(30), move |_cx| {
                f.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
        );
    let kite = start(Module::new("m").service("session", service), 2).await;
    let router = Router::new("session", "fired");

    kite.create_service(router.clone(), Value::Null).await.unwrap();
    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;

    kite.stop_service(router.clone(), false).await.unwrap();
    kite.create_service(router.clone(), Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unfired_delay_timer_is_rearmed_on_reclaim() {
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let service = ServiceDefinition::new()
        .keep_alive(Duration::from_secs(60))
        .timer(
            "once",
            TimerDefinition::delay(Duration::from_millis(100), move |_cx| {
                f.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
        );
    let kite = start(Module::new("m").service("session", service), 2).await;
    let router = Router::new("session", "pending");

    kite.create_service(router.clone(), Value::Null).await.unwrap();
    kite.stop_service(router.clone(), false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    kite.create_service(router.clone(), Value::Null).await.unwrap();
    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_missing_instance_and_handler_are_404() {
    let kite = start(Module::new("m").service("echo", echo()), 2).await;
    let router = Router::new("echo", "nobody");

    let response = kite
        .fetch(Request::fetch(router.clone(), "handlers/hello"))
        .await;
    assert_eq!(response.status, 404);

    kite.create_service(router.clone(), Value::Null).await.unwrap();
    let response = kite.fetch(Request::fetch(router, "handlers/missing")).await;
    assert_eq!(response.status, 404);
    assert_eq!(
        response.status_message.as_deref(),
        Some("no such handler: handlers/missing")
    );
}

#[tokio::test]
async fn test_auto_create_on_fetch_and_notify() {
    let bumps = Arc::new(AtomicUsize::new(0));
    let counter = bumps.clone();
    let service = echo().auto_create(true).handler("bump", move |_cx, _event| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });
    let kite = start(Module::new("m").service("echo", service), 2).await;

    let (status, body) =
        fetch_json(&kite, Router::new("echo", "fresh"), "handlers/hello", Value::Null).await;
    assert_eq!((status, body), (200, json!("world")));

    let other = Router::new("echo", "notified");
    kite.notify(Request::notify(other.clone(), "handlers/bump")).unwrap();
    wait_until(|| bumps.load(Ordering::SeqCst) == 1).await;
    assert_eq!(kite.service_state(other).await.unwrap(), ServiceState::Live);
}

#[tokio::test]
async fn test_handler_failure_is_502() {
    let service = ServiceDefinition::new()
        .auto_create(true)
        .handler("boom", |_cx, _event| async {
            Err::<Value, _>(Error::handler("boom"))
        });
    let kite = start(Module::new("m").service("faulty", service), 2).await;

    let response = kite
        .fetch(Request::fetch(Router::new("faulty", 1u64), "handlers/boom"))
        .await;
    assert_eq!(response.status, 502);
    assert!(response.status_message.unwrap().contains("boom"));

    let response = kite
        .fetch(Request::fetch(Router::new("unregistered", 1u64), "handlers/x"))
        .await;
    assert_eq!(response.status, 502);
}

#[tokio::test]
async fn test_stream_crosses_workers_in_order() {
    let numbers = ServiceDefinition::new()
        .auto_create(true)
        .handler("count", |_cx, _event| async {
            let (tx, stream) = BodyStream::channel();
            for i in 1..=3 {
                tx.send(json!(i))?;
            }
            Ok(stream)
        });
    let proxy = ServiceDefinition::new()
        .auto_create(true)
        .handler("relay", |cx, event| async move {
            let target = Router::from(event.body().as_str().unwrap_or_default());
            cx.target(target).call("handlers/count", Value::Null).await
        });
    let kite = start(
        Module::new("m").service("numbers", numbers).service("proxy", proxy),
        2,
    )
    .await;

    let source = Router::new("numbers", "n");
    let relay = (0u64..)
        .map(|i| Router::new("proxy", i))
        .find(|r| shard(r, 2) != shard(&source, 2))
        .unwrap();

    let (status, body) = fetch_json(&kite, source, "handlers/count", Value::Null).await;
    assert_eq!((status, body), (200, json!([1, 2, 3])));

    let (status, body) = fetch_json(&kite, relay, "handlers/relay", json!("numbers/n")).await;
    assert_eq!((status, body), (200, json!([1, 2, 3])));
}

#[tokio::test]
async fn test_broad_event_reaches_global_listeners_only() {
    let heard = log();
    let h = heard.clone();
    let service = ServiceDefinition::new()
        .event("~ping", move |cx, args| {
            h.lock()
                .unwrap()
                .push(format!("{}:{}", cx.router().id, args[0]));
            async { Ok(()) }
        })
        .event("pong", |_cx, _args| async {
            Err(Error::handler("local event must not be broadcast"))
        });
    let kite = start(
        Module::new("m").service("listener", service).service("quiet", echo()),
        2,
    )
    .await;
    let mut errors = kite.subscribe_errors();

    for id in 1u64..=3 {
        kite.create_service(Router::new("listener", id), Value::Null)
            .await
            .unwrap();
    }
    kite.create_service(Router::new("quiet", 1u64), Value::Null)
        .await
        .unwrap();

    kite.broad_event(None, "pong", vec![json!("x")]).unwrap();
    kite.broad_event(None, "ping", vec![json!("hi")]).unwrap();
    wait_until(|| heard.lock().unwrap().len() == 3).await;

    let mut got = entries(&heard);
    got.sort();
    assert_eq!(got, vec!["1:\"hi\"", "2:\"hi\"", "3:\"hi\""]);
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_stopped_service_leaves_global_set() {
    let heard = Arc::new(AtomicUsize::new(0));
    let h = heard.clone();
    let service = ServiceDefinition::new().event("~ping", move |_cx, _args| {
        h.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });
    let kite = start(Module::new("m").service("listener", service), 2).await;
    let (a, b) = (Router::new("listener", "a"), Router::new("listener", "b"));
    kite.create_service(a.clone(), Value::Null).await.unwrap();
    kite.create_service(b, Value::Null).await.unwrap();
    kite.stop_service(a, true).await.unwrap();

    kite.broad_event(None, "ping", Vec::new()).unwrap();
    wait_until(|| heard.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(heard.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_notify_all_hits_every_instance() {
    let bumps = Arc::new(AtomicUsize::new(0));
    let counter = bumps.clone();
    let service = ServiceDefinition::new().handler("bump", move |_cx, event| {
        counter.fetch_add(event.body().as_u64().unwrap_or(0) as usize, Ordering::SeqCst);
        async { Ok(()) }
    });
    let kite = start(
        Module::new("m").service("counter", service).service("echo", echo()),
        3,
    )
    .await;
    for id in 1u64..=4 {
        kite.create_service(Router::new("counter", id), Value::Null)
            .await
            .unwrap();
    }
    kite.create_service(Router::new("echo", 1u64), Value::Null)
        .await
        .unwrap();

    kite.notify_all(None, "counter", "handlers/bump", json!(10))
        .unwrap();
    wait_until(|| bumps.load(Ordering::SeqCst) == 40).await;
}

#[tokio::test]
async fn test_boot_and_coordinated_stop_follow_dependencies() {
    let events = log();
    let tracked = |kind: &'static str| {
        let (up, down) = (events.clone(), events.clone());
        ServiceDefinition::new()
            .on_start(move |_cx, _reclaimed| {
                up.lock().unwrap().push(format!("start:{}", kind));
                async { Ok(()) }
            })
            .on_stop(move |_cx| {
                down.lock().unwrap().push(format!("stop:{}", kind));
                async { Ok(()) }
            })
    };

    let mut kite = Kite::new();
    kite.regist(
        Module::new("app")
            .service("api", tracked("api").depends("cache"))
            .service("cache", tracked("cache").depends("db"))
            .module(Module::new("storage").service("db", tracked("db"))),
    )
    .unwrap()
    .boot(
        BootDefinition::new()
            .service("api/1")
            .service("cache/1")
            .service("db/1"),
    )
    .unwrap();
    kite.start(Some(3)).await.unwrap();

    assert_eq!(
        entries(&events),
        vec!["start:db", "start:cache", "start:api"]
    );

    kite.stop().await.unwrap();
    assert_eq!(
        entries(&events)[3..].to_vec(),
        vec!["stop:api", "stop:cache", "stop:db"]
    );
}

#[tokio::test]
async fn test_unknown_service_keeps_its_kind_across_workers() {
    let service = ServiceDefinition::new()
        .auto_create(true)
        .handler("probe", |cx, _event| async move {
            let outcome = cx
                .kernel()
                .create_service(Router::new("nope", "x"), Value::Null)
                .await;
            Ok(json!(matches!(outcome, Err(Error::UnknownService(_)))))
        });
    let kite = start(Module::new("m").service("probe", service), 2).await;

    assert!(matches!(
        kite.create_service(Router::new("nope", 1u64), Value::Null).await,
        Err(Error::UnknownService(_))
    ));
    for id in 0u64..4 {
        let (_, body) = fetch_json(&kite, Router::new("probe", id), "handlers/probe", Value::Null).await;
        assert_eq!(body, json!(true));
    }
}

#[tokio::test]
async fn test_failing_timer_reports_runtime_error() {
    let service = ServiceDefinition::new()
        .timer(
            "tick",
            TimerDefinition::delay(Duration::from_millis(10), |_cx| async {
                Err(Error::handler("tick failed"))
            }),
        )
        .handler("state", |cx, _event| async move {
            Ok(json!(cx.service().timer_state("tick") == TimerState::Fired))
        });
    let kite = start(Module::new("m").service("ticker", service), 2).await;
    let mut errors = kite.subscribe_errors();
    let router = Router::new("ticker", "t");
    kite.create_service(router.clone(), Value::Null).await.unwrap();

    let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error.origin, "timer:tick");
    assert_eq!(error.code, "HANDLER");
    assert_eq!(error.router, Some(router.clone()));
    assert_eq!(error.worker, shard(&router, 2));

    // The worker survived and the one-shot timer is spent.
    let (status, body) = fetch_json(&kite, router, "handlers/state", Value::Null).await;
    assert_eq!((status, body), (200, json!(true)));
}

#[tokio::test]
async fn test_middleware_onion_order() {
    let trace = log();
    let layer = |name: &'static str| {
        let trace = trace.clone();
        MiddlewareDefinition::from_fn(move |_event, next| {
            let trace = trace.clone();
            async move {
                trace.lock().unwrap().push(format!("{}:in", name));
                next.run().await?;
                trace.lock().unwrap().push(format!("{}:out", name));
                Ok(())
            }
        })
    };
    let t = trace.clone();
    let service = ServiceDefinition::new()
        .auto_create(true)
        .middleware("inner", layer("inner"))
        .handler("hello", move |_cx, _event| {
            t.lock().unwrap().push("handler".to_string());
            async { Ok("world") }
        });
    let guard = MiddlewareDefinition::from_fn(|event, next| async move {
        if event.header("x-token").is_none() {
            event.set_status(401, Some("unauthorized".to_string()));
            return Ok(());
        }
        next.run().await
    });

    let mut kite = Kite::new();
    kite.regist(
        Module::new("m")
            .service("echo", service)
            .middleware("outer", layer("outer"))
            .middleware("guard", guard),
    )
    .unwrap()
    .boot(BootDefinition::new().middleware("outer").middleware("guard"))
    .unwrap();
    kite.start(Some(2)).await.unwrap();

    let router = Router::new("echo", "a");
    let response = kite
        .fetch(Request::fetch(router.clone(), "handlers/hello").header("x-token", "t"))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(
        entries(&trace),
        vec!["outer:in", "inner:in", "handler", "inner:out", "outer:out"]
    );

    let response = kite.fetch(Request::fetch(router, "handlers/hello")).await;
    assert_eq!(response.status, 401);
    assert_eq!(response.status_message.as_deref(), Some("unauthorized"));
    kite.stop().await.unwrap();
}

#[tokio::test]
async fn test_setup_selects_components_and_props() {
    let cache = ComponentDefinition::new()
        .setup(|_cx, options| async move {
            let mut props = serde_json::Map::new();
            props.insert("size".to_string(), options);
            Ok(Some(props))
        })
        .handler("size", |cx, _event| async move { Ok(cx.prop("size").unwrap_or(Value::Null)) });
    let service = ServiceDefinition::new()
        .auto_create(true)
        .component("cache", cache)
        .setup(|_cx, _options| async {
            Ok(Some(
                ServiceRuntime::new()
                    .prop("greeting", json!("hi"))
                    .component(("cache", json!(16))),
            ))
        })
        .handler("greeting", |cx, _event| async move {
            Ok(cx.prop("greeting").unwrap_or(Value::Null))
        });
    let kite = start(Module::new("m").service("store", service), 2).await;
    let router = Router::new("store", "s");

    assert_eq!(
        fetch_json(&kite, router.clone(), "cache/handlers/size", Value::Null).await,
        (200, json!(16))
    );
    assert_eq!(
        fetch_json(&kite, router.clone(), "store/handlers/greeting", Value::Null).await,
        (200, json!("hi"))
    );
    let services = kite.list_services().await.unwrap();
    assert_eq!(services[0].components, vec!["cache".to_string()]);
}

#[tokio::test]
async fn test_resources_are_shared() {
    let service = ServiceDefinition::new()
        .auto_create(true)
        .handler("read", |cx, _event| async move {
            let greeting = cx.resource::<String>("greeting").map(|s| s.to_string());
            let answer = cx.resource::<u32>("answer").map(|n| *n);
            Ok(json!([greeting, answer]))
        });
    let mut kite = Kite::new();
    kite.regist(
        Module::new("m")
            .service("reader", service)
            .resource("answer", Resource::factory(|| Ok(42u32))),
    )
    .unwrap()
    .resource("greeting", Resource::value("hello".to_string()))
    .unwrap();
    kite.start(Some(2)).await.unwrap();

    for id in 0u64..3 {
        let (_, body) = fetch_json(&kite, Router::new("reader", id), "handlers/read", Value::Null).await;
        assert_eq!(body, json!(["hello", 42]));
    }
}

#[tokio::test]
async fn test_call_method_on_service_and_component() {
    let math = ComponentDefinition::new().method("triple", |_cx, args| async move {
        Ok(args[0].as_i64().unwrap_or(0) * 3)
    });
    let service = ServiceDefinition::new()
        .auto_create(true)
        .component("math", math)
        .method("double", |_cx, args| async move { Ok(args[0].as_i64().unwrap_or(0) * 2) })
        .handler("compute", |cx, _event| async move {
            let doubled = cx.call_method("double", vec![json!(2)]).await?;
            let tripled = cx.call_method("math.triple", vec![json!(2)]).await?;
            let missing = cx.call_method("nothing", Vec::new()).await;
            Ok(json!([doubled, tripled, matches!(missing, Err(Error::NotFound(_)))]))
        });
    let kite = start(Module::new("m").service("calc", service), 1).await;

    let (_, body) = fetch_json(&kite, Router::new("calc", "c"), "handlers/compute", Value::Null).await;
    assert_eq!(body, json!([4, 6, true]));
}

#[tokio::test]
async fn test_duplicate_definitions_abort_start() {
    let mut kite = Kite::new();
    kite.regist(Module::new("a").service("echo", echo()))
        .unwrap()
        .regist(Module::new("b").service("echo", echo()))
        .unwrap();
    assert!(matches!(kite.start(Some(1)).await, Err(Error::Config(_))));
}
