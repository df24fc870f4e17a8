//! Stress tests for causation tracking under concurrency.
//!
//! These tests exercise interleaved dispatch cycles, nested dispatch,
//! spawned work and listener churn.

#[cfg(test)]
mod stress_tests {
    use crate::dispatch::{handler_fn, CommandBus, EVENT_DISPATCH, EVENT_FINALIZE};
    use crate::emitter::Priority;
    use crate::enricher::CAUSATION_NAME_KEY;
    use crate::message::{Command, Event, Message};
    use crate::store::{EventStore, StreamName};
    use crate::testing::{assert_caused_by, assert_uncaused, record, CausationHarness};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn stream_for(cmd: &Command) -> StreamName {
        let i = cmd.payload()["i"].as_u64().unwrap_or_default();
        StreamName::new(format!("stream-{i}"))
    }

    // ==========================================================================
    // Interleaved cycles
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cycles_only_stamp_their_own_command() {
        let harness = CausationHarness::new();
        let store = harness.store().clone();
        harness
            .bus()
            .route(
                "Work",
                handler_fn(move |cmd: Command| {
                    let store = store.clone();
                    async move {
                        let stream = stream_for(&cmd);
                        let delay = cmd.payload()["i"].as_u64().unwrap_or_default() % 5;
                        record(&*store, &stream, vec![Event::new("Started", json!({}))]).await?;
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        record(&*store, &stream, vec![Event::new("Finished", json!({}))]).await?;
                        anyhow::Ok(())
                    }
                }),
            )
            .unwrap();

        let commands: Vec<Command> = (0..64)
            .map(|i| Command::new("Work", json!({ "i": i })))
            .collect();
        let mut handles = Vec::new();
        for cmd in commands.clone() {
            let bus = harness.bus().clone();
            handles.push(tokio::spawn(async move { bus.dispatch(cmd).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for cmd in &commands {
            let events = harness.store().load(&stream_for(cmd), 0, None).await.unwrap();
            assert_eq!(events.len(), 2);
            for event in &events {
                assert_caused_by(event, cmd);
            }
        }
        assert!(harness.tracking().context().is_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_and_panicking_cycles_leave_context_idle() {
        let harness = CausationHarness::new();
        harness
            .bus()
            .route(
                "Flaky",
                handler_fn(|cmd: Command| async move {
                    match cmd.payload()["i"].as_u64().unwrap_or_default() % 3 {
                        0 => Ok(()),
                        1 => Err(anyhow::anyhow!("flaky failure")),
                        _ => panic!("flaky panic"),
                    }
                }),
            )
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..30 {
            let bus = harness.bus().clone();
            handles.push(tokio::spawn(async move {
                bus.dispatch(Command::new("Flaky", json!({ "i": i }))).await
            }));
        }

        let mut failures = 0;
        for handle in handles {
            if handle.await.unwrap().is_err() {
                failures += 1;
            }
        }

        assert_eq!(failures, 20);
        assert!(harness.tracking().context().is_idle());

        // Recording after every cycle is over carries no cause.
        record(&**harness.store(), &"after".into(), vec![Event::new("Late", json!({}))])
            .await
            .unwrap();
        assert_uncaused(&harness.events("after").await[0]);
    }

    // ==========================================================================
    // Nested dispatch
    // ==========================================================================

    #[tokio::test]
    async fn test_nested_dispatch_restores_outer_cause() {
        let harness = CausationHarness::new();
        harness.route_recording("Inner", "log", |_| vec![Event::new("InnerDone", json!({}))]);

        let store = harness.store().clone();
        let bus = harness.bus().clone();
        let inner = Command::new("Inner", json!({}));
        let inner_cmd = inner.clone();
        harness
            .bus()
            .route(
                "Outer",
                handler_fn(move |_cmd: Command| {
                    let (store, bus, inner) = (store.clone(), bus.clone(), inner_cmd.clone());
                    async move {
                        let started = vec![Event::new("OuterStarted", json!({}))];
                        record(&*store, &"log".into(), started).await?;
                        bus.dispatch(inner).await?;
                        let done = vec![Event::new("OuterDone", json!({}))];
                        record(&*store, &"log".into(), done).await?;
                        anyhow::Ok(())
                    }
                }),
            )
            .unwrap();

        let outer = Command::new("Outer", json!({}));
        harness.bus().dispatch(outer.clone()).await.unwrap();

        let events = harness.events("log").await;
        let names: Vec<_> = events.iter().map(|e| e.message_name()).collect();
        assert_eq!(names, vec!["OuterStarted", "InnerDone", "OuterDone"]);
        assert_caused_by(&events[0], &outer);
        assert_caused_by(&events[1], &inner);
        assert_caused_by(&events[2], &outer);
        assert!(harness.tracking().context().is_idle());
    }

    // ==========================================================================
    // Spawned work
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_work_needs_propagate() {
        let harness = CausationHarness::new();
        let store = harness.store().clone();
        harness
            .bus()
            .route(
                "Fork",
                handler_fn(move |_cmd: Command| {
                    let store = store.clone();
                    async move {
                        let s = store.clone();
                        tokio::spawn(async move {
                            let events = vec![Event::new("Detached", json!({}))];
                            record(&*s, &"detached".into(), events).await
                        })
                        .await??;

                        let s = store.clone();
                        tokio::spawn(crate::cycle::propagate(async move {
                            let events = vec![Event::new("Attached", json!({}))];
                            record(&*s, &"attached".into(), events).await
                        }))
                        .await??;
                        anyhow::Ok(())
                    }
                }),
            )
            .unwrap();

        let cmd = Command::new("Fork", json!({}));
        harness.bus().dispatch(cmd.clone()).await.unwrap();

        assert_uncaused(&harness.events("detached").await[0]);
        assert_caused_by(&harness.events("attached").await[0], &cmd);
    }

    // ==========================================================================
    // Listener churn
    // ==========================================================================

    #[tokio::test]
    async fn test_listener_detaching_itself_during_dispatch_does_not_deadlock() {
        let harness = CausationHarness::new();
        harness.route_recording("Ping", "pings", |_| vec![Event::new("Pong", json!({}))]);

        let emitter = harness.bus().action_event_emitter().clone();
        let handle = Arc::new(Mutex::new(None));
        let fired = Arc::new(AtomicUsize::new(0));
        let (h, f, e) = (handle.clone(), fired.clone(), emitter.clone());
        let registered =
            emitter.attach_listener(EVENT_DISPATCH, "one-shot", Priority(10), move |_| {
                f.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = h.lock().unwrap().take() {
                    e.detach_listener(own);
                }
            });
        *handle.lock().unwrap() = Some(registered);

        for _ in 0..3 {
            harness.bus().dispatch(Command::new("Ping", json!({}))).await.unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(EVENT_DISPATCH), 1);
        assert!(harness
            .events("pings")
            .await
            .iter()
            .all(|e| e.metadata_str(CAUSATION_NAME_KEY) == Some("Ping")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_attach_churn_while_dispatching() {
        let harness = CausationHarness::new();
        harness.route_recording("Work", "churn", |_| vec![Event::new("Done", json!({}))]);

        let emitter = harness.bus().action_event_emitter().clone();
        let churn = tokio::spawn(async move {
            for _ in 0..200 {
                let handle = emitter.attach_listener(EVENT_FINALIZE, "churn", Priority(5), |_| {});
                tokio::task::yield_now().await;
                emitter.detach_listener(handle);
            }
        });

        let mut handles = Vec::new();
        for i in 0..50 {
            let bus = harness.bus().clone();
            handles.push(tokio::spawn(async move {
                bus.dispatch(Command::new("Work", json!({ "i": i }))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        churn.await.unwrap();

        let events = harness.events("churn").await;
        assert_eq!(events.len(), 50);
        assert!(events.iter().all(|e| e.metadata_str(CAUSATION_NAME_KEY) == Some("Work")));
        assert_eq!(harness.bus().action_event_emitter().listener_count(EVENT_FINALIZE), 1);
        assert!(harness.tracking().context().is_idle());
    }

    #[tokio::test]
    async fn test_bus_clones_share_tracking() {
        let harness = CausationHarness::new();
        harness.route_recording("Ping", "pings", |_| vec![Event::new("Pong", json!({}))]);
        let clone: CommandBus = harness.bus().clone();

        let cmd = Command::new("Ping", json!({}));
        clone.dispatch(cmd.clone()).await.unwrap();

        assert_caused_by(&harness.events("pings").await[0], &cmd);
    }
}
