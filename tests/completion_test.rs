mod common;

use common::{context, native};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use webcl_lifetime::{
    Completion, Error, LifetimeConfig, NativeBuffer, NativeObject, ResourceKind, Status, status,
};

#[derive(Debug, Clone, PartialEq)]
struct Seen {
    status: Status,
    error: Option<&'static str>,
    message: Option<String>,
    diagnostics: Option<Vec<u8>>,
    tag: Option<&'static str>,
}

type Log = Arc<Mutex<Vec<Seen>>>;

fn recorder() -> (Log, impl FnOnce(Completion) + Send + 'static) {
    let log: Log = Arc::default();
    let sink = log.clone();

    let callback = move |completion: Completion| {
        sink.lock().unwrap().push(Seen {
            status: completion.status,
            error: completion.error.as_ref().and_then(Error::cl_error).map(|e| e.name),
            message: completion.message.clone(),
            diagnostics: completion.diagnostics.as_ref().map(|b| b.to_vec()),
            tag: completion.user_data::<&'static str>().copied(),
        });
    };

    (log, callback)
}

#[test]
fn test_event_bridge_scenario() {
    let (ctx, mut queue, driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe0)), None);
    let (log, callback) = recorder();

    let bridge = ctx.submit(&event, callback, Some(Box::new("read"))).unwrap();
    assert_eq!(ctx.lifecycles().count_of(&event), 2);
    assert_eq!(event.pending_attachments(), 1);

    let freed = Arc::new(AtomicUsize::new(0));
    let worker = {
        let bridge = bridge.clone();
        let freed = freed.clone();
        std::thread::spawn(move || {
            let message = b"done\0".to_vec();
            let buffer = NativeBuffer::with_release(&message, || {
                freed.fetch_add(1, Ordering::SeqCst);
            });
            bridge.resolve(status::SUCCESS, Some(buffer), None)
        })
    };
    worker.join().unwrap().unwrap();

    // Buffers are released on the resolving thread, the callback waits for the host.
    assert_eq!(freed.load(Ordering::SeqCst), 1);
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(queue.pending(), 1);

    assert_eq!(queue.process_pending(), 1);

    let seen = log.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![Seen {
            status: status::SUCCESS,
            error: None,
            message: Some("done".to_string()),
            diagnostics: None,
            tag: Some("read"),
        }]
    );

    assert!(bridge.is_resolved());
    assert_eq!(ctx.lifecycles().count_of(&event), 1);
    assert_eq!(event.pending_attachments(), 0);
    assert!(!event.is_destroyed());
    assert_eq!(driver.total(), 0);
}

#[test]
fn test_second_resolve_rejected() {
    let (ctx, mut queue, _driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe1)), None);
    let (log, callback) = recorder();
    let freed = AtomicUsize::new(0);

    let bridge = ctx.submit(&event, callback, None).unwrap();

    let message = b"first".to_vec();
    bridge
        .resolve(
            status::SUCCESS,
            Some(NativeBuffer::with_release(&message, || {
                freed.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();

    let again = bridge.resolve(
        status::SUCCESS,
        Some(NativeBuffer::with_release(&message, || {
            freed.fetch_add(1, Ordering::SeqCst);
        })),
        None,
    );

    assert!(matches!(again, Err(Error::DoubleResolve { bridge: id }) if id == bridge.id()));
    assert_eq!(freed.load(Ordering::SeqCst), 1);

    assert_eq!(queue.process_pending(), 1);
    assert_eq!(queue.process_pending(), 0);
    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(ctx.lifecycles().count_of(&event), 1);
}

#[test]
fn test_failure_status_carries_error() {
    let (ctx, mut queue, _driver) = context(LifetimeConfig::permissive());
    let program = ctx.wrap(NativeObject::Program(native(0x9f)), None);
    let (log, callback) = recorder();

    let bridge = ctx.submit(&program, callback, None).unwrap();

    let message = b"kernel.cl:3: error: expected ';'\0\0\0".to_vec();
    let diagnostics = [0xde_u8, 0xad, 0xbe, 0xef];
    bridge
        .resolve(
            status::BUILD_PROGRAM_FAILURE,
            Some(NativeBuffer::borrowed(&message)),
            Some(NativeBuffer::borrowed(&diagnostics)),
        )
        .unwrap();

    queue.process_pending();

    let seen = log.lock().unwrap()[0].clone();
    assert_eq!(seen.status, status::BUILD_PROGRAM_FAILURE);
    assert_eq!(seen.error, Some("BUILD_PROGRAM_FAILURE"));
    assert_eq!(seen.message.as_deref(), Some("kernel.cl:3: error: expected ';'"));
    assert_eq!(seen.diagnostics, Some(diagnostics.to_vec()));
}

#[test]
fn test_resolve_inside_host_scope_runs_inline() {
    let (ctx, mut queue, _driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe2)), None);
    let (log, callback) = recorder();

    let bridge = ctx.submit(&event, callback, None).unwrap();

    {
        let _scope = ctx.enter();
        bridge.resolve(status::SUCCESS, None, None).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    assert_eq!(queue.pending(), 0);
    assert_eq!(queue.process_pending(), 0);
}

#[test]
fn test_inline_completions_disabled() {
    let config = LifetimeConfig {
        inline_host_completions: false,
        ..LifetimeConfig::permissive()
    };
    let (ctx, mut queue, _driver) = context(config);
    let event = ctx.wrap(NativeObject::Event(native(0xe3)), None);
    let (log, callback) = recorder();

    let bridge = ctx.submit(&event, callback, None).unwrap();

    let _scope = ctx.enter();
    bridge.resolve(status::SUCCESS, None, None).unwrap();
    assert!(log.lock().unwrap().is_empty());

    assert_eq!(queue.process_pending(), 1);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn test_drain_cancels_pending_bridge() {
    let (ctx, mut queue, driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe4)), None);
    let (log, callback) = recorder();

    let bridge = ctx.submit(&event, callback, Some(Box::new("write"))).unwrap();
    assert_eq!(ctx.port().in_flight(), 1);

    let report = ctx.shutdown();
    assert_eq!(report.destroyed, 1);
    assert_eq!(driver.releases_of(native(0xe4)), 1);
    assert!(bridge.is_resolved());
    assert_eq!(ctx.port().in_flight(), 0);

    assert_eq!(queue.process_pending(), 1);
    let seen = log.lock().unwrap()[0].clone();
    assert_eq!(seen.status, status::RESOURCE_RELEASED);
    assert_eq!(seen.error, Some("RESOURCE_RELEASED"));
    assert_eq!(seen.tag, Some("write"));

    // The driver reports late; nothing runs twice and nothing is released again.
    let late = bridge.resolve(status::SUCCESS, None, None);
    assert!(matches!(late, Err(Error::DoubleResolve { .. })));
    assert_eq!(queue.process_pending(), 0);
    assert_eq!(driver.releases_of(native(0xe4)), 1);
}

#[test]
fn test_late_completion_after_drain_releases_buffers() {
    let (ctx, mut queue, _driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe4a)), None);
    let (log, callback) = recorder();

    let bridge = ctx.submit(&event, callback, None).unwrap();
    ctx.shutdown();
    assert_eq!(queue.process_pending(), 1);

    let freed = Arc::new(AtomicUsize::new(0));
    let release = |freed: &Arc<AtomicUsize>| {
        let freed = freed.clone();
        move || {
            freed.fetch_add(1, Ordering::SeqCst);
        }
    };
    let message = b"CL_COMPLETE\0".to_vec();
    let diagnostics = b"build log".to_vec();

    let late = bridge.resolve(
        status::SUCCESS,
        Some(NativeBuffer::with_release(&message, release(&freed))),
        Some(NativeBuffer::with_release(&diagnostics, release(&freed))),
    );

    assert!(matches!(late, Err(Error::DoubleResolve { .. })));
    assert_eq!(freed.load(Ordering::SeqCst), 2);
    assert_eq!(queue.process_pending(), 0);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn test_explicit_destroy_cancels_pending_bridge() {
    let (ctx, mut queue, driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe5)), None);
    let (log, callback) = recorder();

    let _bridge = ctx.submit(&event, callback, None).unwrap();
    assert_eq!(ctx.lifecycles().count_of(&event), 2);

    assert!(ctx.destroy(&event));
    assert_eq!(ctx.lifecycles().count_of(&event), 1);

    queue.process_pending();
    assert_eq!(log.lock().unwrap()[0].status, status::RESOURCE_RELEASED);

    // Wrapper collected afterwards: bookkeeping clears without a second release.
    {
        let _scope = ctx.enter();
        ctx.finalize(event.clone());
    }
    assert_eq!(ctx.lifecycles().live_count(), 0);
    assert_eq!(driver.releases_of(native(0xe5)), 1);
}

#[test]
fn test_bridge_keeps_collected_resource_alive() {
    let (ctx, mut queue, driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe6)), None);
    let (log, callback) = recorder();

    let bridge = ctx.submit(&event, callback, None).unwrap();

    {
        let _scope = ctx.enter();
        ctx.finalize(event.clone());
    }
    assert!(!event.is_destroyed());
    assert_eq!(ctx.lifecycles().count_of(&event), 1);

    std::thread::spawn(move || bridge.resolve(status::SUCCESS, None, None))
        .join()
        .unwrap()
        .unwrap();

    assert!(event.is_destroyed());
    assert_eq!(driver.releases_of(native(0xe6)), 1);

    assert_eq!(queue.process_pending(), 1);
    assert_eq!(log.lock().unwrap()[0].status, status::SUCCESS);
    assert_eq!(ctx.shutdown().destroyed, 0);
}

#[test]
fn test_closed_queue_drops_completion() {
    let (ctx, queue, _driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe7)), None);
    let (log, callback) = recorder();
    let payload = Arc::new(());

    let bridge = ctx
        .submit(&event, callback, Some(Box::new(payload.clone())))
        .unwrap();
    drop(queue);

    bridge.resolve(status::SUCCESS, None, None).unwrap();

    assert!(log.lock().unwrap().is_empty());
    assert_eq!(Arc::strong_count(&payload), 1);
    assert_eq!(ctx.lifecycles().count_of(&event), 1);
}

#[test]
fn test_submit_on_destroyed_resource() {
    let (ctx, _queue, _driver) = context(LifetimeConfig::strict());
    let event = ctx.wrap(NativeObject::Event(native(0xe8)), None);
    ctx.destroy(&event);

    let (_log, callback) = recorder();
    let err = ctx.submit(&event, callback, None).unwrap_err();

    assert!(matches!(
        err,
        Error::UseAfterDestroy {
            kind: ResourceKind::Event,
            ..
        }
    ));
}

#[test]
fn test_many_threads_resolve_distinct_bridges() {
    let (ctx, mut queue, _driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xe9)), None);
    let hits = Arc::new(AtomicUsize::new(0));

    let bridges: Vec<_> = (0..16)
        .map(|_| {
            let hits = hits.clone();
            ctx.submit(
                &event,
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .unwrap()
        })
        .collect();

    assert_eq!(ctx.lifecycles().count_of(&event), 17);

    std::thread::scope(|s| {
        for bridge in &bridges {
            s.spawn(move || bridge.resolve(status::SUCCESS, None, None).unwrap());
        }
    });

    assert_eq!(queue.process_pending(), 16);
    assert_eq!(hits.load(Ordering::SeqCst), 16);
    assert_eq!(ctx.lifecycles().count_of(&event), 1);
}

#[tokio::test]
async fn test_run_next_waits_for_driver_thread() {
    let (ctx, mut queue, _driver) = context(LifetimeConfig::permissive());
    let event = ctx.wrap(NativeObject::Event(native(0xea)), None);
    let (log, callback) = recorder();

    let bridge = ctx.submit(&event, callback, None).unwrap();

    let resolver = tokio::task::spawn_blocking(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        bridge.resolve(status::SUCCESS, None, None)
    });

    assert!(queue.run_next().await);
    resolver.await.unwrap().unwrap();

    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(ctx.lifecycles().count_of(&event), 1);
}
