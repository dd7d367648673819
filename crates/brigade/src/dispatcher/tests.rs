use super::*;
use crate::{ChannelConnection, Tag, channel_pair};
use futures::future::join_all;
use serde_json::{Value, json};
use std::{collections::HashSet, time::Duration};
use tokio::sync::oneshot;

type Conn = ChannelConnection<String>;

fn grill() -> Capability {
    Capability::try_from("grill").unwrap()
}

fn tags(tags: &[&str]) -> Capability {
    tags.iter().map(|tag| Tag::new(*tag).unwrap()).collect()
}

fn id(name: &str) -> WorkerId {
    name.into()
}

/// Spawns a worker that answers every job with `"{name}:{job}"`.
fn spawn_worker(name: &'static str) -> Conn {
    let (dispatcher_end, mut worker) = channel_pair::<String>(1);
    tokio::spawn(async move {
        while let Ok(job) = worker.recv().await {
            if worker.send(format!("{name}:{job}")).await.is_err() {
                break;
            }
        }
    });
    dispatcher_end
}

/// Spawns a worker that reports each payload it receives and never replies.
/// The worker drops its connection once `release` fires.
fn spawn_stalled_worker() -> (Conn, oneshot::Receiver<String>, oneshot::Sender<()>) {
    let (dispatcher_end, mut worker) = channel_pair::<String>(1);
    let (received_tx, received_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        if let Ok(job) = worker.recv().await {
            let _ = received_tx.send(job);
        }
        let _ = release_rx.await;
        drop(worker);
    });
    (dispatcher_end, received_rx, release_tx)
}

async fn order(dispatcher: &Dispatcher<Conn>, tag: &str, payload: &str) -> Result<String> {
    let (mut caller, mut incoming) = channel_pair::<String>(1);
    caller.send(payload.to_string()).await?;
    dispatcher.handle_job(tag, &mut incoming).await?;
    caller.recv().await
}

#[tokio::test]
async fn grill_rotation_alternates_between_workers() -> Result<()> {
    let dispatcher = Dispatcher::new();
    dispatcher.on_duty("a", grill(), spawn_worker("a"))?;
    dispatcher.on_duty("b", grill(), spawn_worker("b"))?;

    assert_eq!(order(&dispatcher, "grill", "1").await?, "a:1");
    assert_eq!(dispatcher.rotation("grill"), vec![id("b"), id("a")]);
    assert_eq!(order(&dispatcher, "grill", "2").await?, "b:2");
    assert_eq!(order(&dispatcher, "grill", "3").await?, "a:3");
    Ok(())
}

#[tokio::test]
async fn n_dispatches_visit_each_worker_once_in_registration_order() -> Result<()> {
    const NAMES: [&str; 5] = ["w0", "w1", "w2", "w3", "w4"];
    let dispatcher = Dispatcher::new();
    for name in NAMES {
        dispatcher.on_duty(name, grill(), spawn_worker(name))?;
    }

    for round in 0..2 {
        for name in NAMES {
            let reply = order(&dispatcher, "grill", &round.to_string()).await?;
            assert_eq!(reply, format!("{name}:{round}"));
        }
    }
    Ok(())
}

#[tokio::test]
async fn leaving_multi_tag_worker_empties_its_tags() -> Result<()> {
    let dispatcher = Dispatcher::new();
    dispatcher.on_duty("c", tags(&["grill", "fry"]), spawn_worker("c"))?;
    dispatcher.on_duty("d", grill(), spawn_worker("d"))?;

    dispatcher.off_duty(&id("c"))?;

    let err = order(&dispatcher, "fry", "chips").await.unwrap_err();
    assert_eq!(err, Error::NoAvailableWorker { tag: "fry".into() });
    assert_eq!(dispatcher.rotation("grill"), vec![id("d")]);
    assert!(!dispatcher.is_on_duty(&id("c")));
    Ok(())
}

#[tokio::test]
async fn non_tag_capability_never_reaches_the_registry() {
    let dispatcher = Dispatcher::<Conn>::new();

    let err = Capability::try_from(json!(42)).unwrap_err();
    assert!(matches!(err, Error::InvalidCapability { .. }));
    assert!(!dispatcher.is_on_duty(&id("x")));

    let (conn, _worker) = channel_pair::<String>(1);
    let rejected = dispatcher
        .on_duty("x", Capability::Multiple(Vec::new()), conn)
        .unwrap_err();
    assert!(matches!(rejected.error, Error::InvalidCapability { .. }));
    assert!(!dispatcher.is_on_duty(&id("x")));
    assert_eq!(dispatcher.worker_count(), 0);
}

#[tokio::test]
async fn duplicate_on_duty_is_rejected_and_returns_connection() -> Result<()> {
    let dispatcher = Dispatcher::new();
    dispatcher.on_duty("a", grill(), spawn_worker("a"))?;

    let (conn, mut peer) = channel_pair::<String>(1);
    let mut rejected = dispatcher
        .on_duty("a", tags(&["fry"]), conn)
        .unwrap_err();
    assert_eq!(rejected.error, Error::DuplicateRegistration { id: id("a") });

    // The handed-back connection is still live.
    rejected.connection.send("still here".into()).await?;
    assert_eq!(peer.recv().await?, "still here");

    // The first registration is intact and no "fry" rotation appeared.
    assert!(dispatcher.rotation("fry").is_empty());
    assert_eq!(order(&dispatcher, "grill", "1").await?, "a:1");
    Ok(())
}

#[tokio::test]
async fn payload_and_result_relay_unchanged() -> Result<()> {
    let dispatcher = Dispatcher::new();
    let (conn, mut worker) = channel_pair::<Value>(1);
    dispatcher.on_duty(7_i64, grill(), conn)?;

    let payload = json!({ "item": "burger", "extras": ["cheese", null, 3.5] });
    let result = json!({ "plate": [1, 2, 3], "note": "ünïcode" });

    let expected_payload = payload.clone();
    let reply = result.clone();
    let worker_task = tokio::spawn(async move {
        let got = worker.recv().await?;
        assert_eq!(got, expected_payload);
        worker.send(reply).await
    });

    let (mut caller, mut incoming) = channel_pair::<Value>(1);
    caller.send(payload).await?;
    dispatcher.handle_job("grill", &mut incoming).await?;
    assert_eq!(caller.recv().await?, result);
    worker_task.await.unwrap()?;
    Ok(())
}

#[tokio::test]
async fn unknown_tag_fails_without_touching_state_or_caller() -> Result<()> {
    let dispatcher = Dispatcher::new();
    dispatcher.on_duty("a", grill(), spawn_worker("a"))?;
    dispatcher.on_duty("b", grill(), spawn_worker("b"))?;
    let before = dispatcher.rotation("grill");

    let (mut caller, mut incoming) = channel_pair::<String>(1);
    caller.send("soup".into()).await?;
    let err = dispatcher.handle_job("soup", &mut incoming).await.unwrap_err();

    assert_eq!(err, Error::NoAvailableWorker { tag: "soup".into() });
    assert_eq!(dispatcher.rotation("grill"), before);
    assert_eq!(dispatcher.worker_count(), 2);
    // The payload was never consumed.
    assert_eq!(incoming.recv().await?, "soup");
    Ok(())
}

#[tokio::test]
async fn rotations_match_declared_capabilities() -> Result<()> {
    let dispatcher = Dispatcher::new();
    dispatcher.on_duty("a", tags(&["grill", "fry"]), spawn_worker("a"))?;
    dispatcher.on_duty("b", tags(&["fry", "wok"]), spawn_worker("b"))?;
    dispatcher.on_duty("c", tags(&["wok"]), spawn_worker("c"))?;
    dispatcher.off_duty(&id("b"))?;

    for tag in ["grill", "fry", "wok"] {
        let rotation = dispatcher.rotation(tag);
        let unique: HashSet<_> = rotation.iter().collect();
        assert_eq!(unique.len(), rotation.len(), "duplicate in {tag}");

        for worker in ["a", "b", "c"] {
            let declared = dispatcher
                .capabilities_of(&id(worker))
                .is_ok_and(|caps| caps.contains(tag));
            assert_eq!(rotation.contains(&id(worker)), declared, "{worker} in {tag}");
        }
    }
    assert!(dispatcher.capabilities_of(&id("b")).is_err());
    Ok(())
}

#[tokio::test]
async fn off_duty_unknown_worker_is_not_found() {
    let dispatcher = Dispatcher::<Conn>::new();
    assert_eq!(
        dispatcher.off_duty(&id("ghost")).unwrap_err(),
        Error::NotFound { id: id("ghost") }
    );
}

#[tokio::test]
async fn off_duty_returns_idle_connection() -> Result<()> {
    let dispatcher = Dispatcher::new();
    let (conn, mut peer) = channel_pair::<String>(1);
    dispatcher.on_duty("a", grill(), conn)?;

    let mut released = dispatcher.off_duty(&id("a"))?.expect("idle connection");
    released.send("bye".into()).await?;
    assert_eq!(peer.recv().await?, "bye");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_jobs_never_double_assign_within_a_cycle() -> Result<()> {
    const WORKERS: [&str; 8] = ["w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7"];
    let dispatcher = Dispatcher::new();
    for name in WORKERS {
        dispatcher.on_duty(name, grill(), spawn_worker(name))?;
    }

    let jobs = (0..WORKERS.len()).map(|i| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { order(&dispatcher, "grill", &i.to_string()).await })
    });
    let replies = join_all(jobs).await;

    let served: HashSet<String> = replies
        .into_iter()
        .map(|reply| {
            let reply = reply.unwrap().unwrap();
            reply.split(':').next().unwrap().to_string()
        })
        .collect();
    assert_eq!(served.len(), WORKERS.len());
    assert_eq!(dispatcher.rotation("grill").len(), WORKERS.len());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_worker_serves_queued_jobs_in_turn() -> Result<()> {
    let dispatcher = Dispatcher::new();
    dispatcher.on_duty("solo", grill(), spawn_worker("solo"))?;

    let jobs = (0..4).map(|i| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { order(&dispatcher, "grill", &i.to_string()).await })
    });
    let mut replies: Vec<String> = join_all(jobs)
        .await
        .into_iter()
        .map(|reply| reply.unwrap().unwrap())
        .collect();
    replies.sort();
    assert_eq!(replies, ["solo:0", "solo:1", "solo:2", "solo:3"]);
    Ok(())
}

#[tokio::test]
async fn worker_failure_mid_exchange_takes_it_off_duty() -> Result<()> {
    let dispatcher = Dispatcher::new();
    let (conn, received, release) = spawn_stalled_worker();
    dispatcher.on_duty("flaky", grill(), conn)?;
    dispatcher.on_duty("steady", grill(), spawn_worker("steady"))?;

    let job = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { order(&dispatcher, "grill", "steak").await })
    };
    assert_eq!(received.await.unwrap(), "steak");
    release.send(()).unwrap();

    let err = job.await.unwrap().unwrap_err();
    assert_eq!(err, Error::WorkerDisconnected { id: id("flaky") });
    assert!(!dispatcher.is_on_duty(&id("flaky")));
    assert_eq!(dispatcher.rotation("grill"), vec![id("steady")]);
    assert_eq!(order(&dispatcher, "grill", "fish").await?, "steady:fish");
    Ok(())
}

#[tokio::test]
async fn caller_leaving_before_payload_keeps_worker() -> Result<()> {
    let dispatcher = Dispatcher::new();
    dispatcher.on_duty("a", grill(), spawn_worker("a"))?;

    let (caller, mut incoming) = channel_pair::<String>(1);
    drop(caller);
    let err = dispatcher.handle_job("grill", &mut incoming).await.unwrap_err();

    assert_eq!(err, Error::RequestCancelled);
    assert!(dispatcher.is_on_duty(&id("a")));
    assert_eq!(order(&dispatcher, "grill", "next").await?, "a:next");
    Ok(())
}

#[tokio::test]
async fn abandoned_exchange_evicts_worker() -> Result<()> {
    let dispatcher = Dispatcher::new();
    let (conn, received, _release) = spawn_stalled_worker();
    dispatcher.on_duty("slow", grill(), conn)?;

    let (mut caller, mut incoming) = channel_pair::<String>(1);
    caller.send("stew".into()).await?;
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        dispatcher.handle_job("grill", &mut incoming),
    )
    .await;

    assert!(outcome.is_err(), "stalled worker should not answer");
    assert_eq!(received.await.unwrap(), "stew");
    assert!(!dispatcher.is_on_duty(&id("slow")));
    assert!(dispatcher.rotation("grill").is_empty());
    Ok(())
}

#[tokio::test]
async fn eviction_spares_a_reregistered_worker() -> Result<()> {
    let dispatcher = Dispatcher::new();
    let (conn, received, release) = spawn_stalled_worker();
    dispatcher.on_duty("a", grill(), conn)?;

    let job = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { order(&dispatcher, "grill", "first").await })
    };
    assert_eq!(received.await.unwrap(), "first");

    // Still mid-exchange, so the connection stays with the job.
    assert!(dispatcher.off_duty(&id("a"))?.is_none());
    dispatcher.on_duty("a", grill(), spawn_worker("a2"))?;
    release.send(()).unwrap();

    let err = job.await.unwrap().unwrap_err();
    assert_eq!(err, Error::WorkerDisconnected { id: id("a") });
    assert!(dispatcher.is_on_duty(&id("a")));
    assert_eq!(order(&dispatcher, "grill", "second").await?, "a2:second");
    Ok(())
}

#[tokio::test]
async fn shutdown_fails_in_flight_jobs_and_closes_session() -> Result<()> {
    let dispatcher = Dispatcher::new();
    let (conn, received, _release) = spawn_stalled_worker();
    dispatcher.on_duty("a", grill(), conn)?;
    dispatcher.on_duty("b", tags(&["fry"]), spawn_worker("b"))?;

    let job = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { order(&dispatcher, "grill", "late").await })
    };
    assert_eq!(received.await.unwrap(), "late");

    let mut released = dispatcher.shutdown();
    released.sort();
    assert_eq!(released, vec![id("a"), id("b")]);

    assert_eq!(job.await.unwrap().unwrap_err(), Error::SessionClosed);
    assert!(dispatcher.is_closed());
    assert_eq!(dispatcher.worker_count(), 0);
    assert!(dispatcher.rotation("fry").is_empty());

    let rejected = dispatcher
        .on_duty("c", grill(), spawn_worker("c"))
        .unwrap_err();
    assert_eq!(rejected.error, Error::SessionClosed);
    assert_eq!(
        order(&dispatcher, "fry", "x").await.unwrap_err(),
        Error::SessionClosed
    );
    assert_eq!(
        dispatcher.off_duty(&id("b")).unwrap_err(),
        Error::SessionClosed
    );
    Ok(())
}

#[tokio::test]
async fn worker_leaving_after_selection_gets_no_payload() -> Result<()> {
    let dispatcher = Dispatcher::new();
    let (conn, mut peer) = channel_pair::<String>(1);
    dispatcher.on_duty("a", grill(), conn)?;
    dispatcher.on_duty("b", grill(), spawn_worker("b"))?;

    let (mut caller, mut incoming) = channel_pair::<String>(1);
    let job = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.handle_job("grill", &mut incoming).await })
    };
    // "a" has been picked once the rotation moves past it.
    while dispatcher.rotation("grill") != [id("b"), id("a")] {
        tokio::task::yield_now().await;
    }
    assert!(dispatcher.off_duty(&id("a"))?.is_none());

    caller.send("after-leave".into()).await?;
    let err = job.await.unwrap().unwrap_err();
    assert_eq!(err, Error::NotFound { id: id("a") });

    // The connection was dropped with nothing written to it.
    assert!(peer.recv().await.is_err());
    assert_eq!(order(&dispatcher, "grill", "next").await?, "b:next");
    Ok(())
}

#[tokio::test]
async fn workers_lists_on_duty_staff_by_id() -> Result<()> {
    let dispatcher = Dispatcher::new();
    assert!(dispatcher.workers().is_empty());

    dispatcher.on_duty("b", tags(&["fry", "grill"]), spawn_worker("b"))?;
    dispatcher.on_duty("a", grill(), spawn_worker("a"))?;
    dispatcher.on_duty("c", grill(), spawn_worker("c"))?;
    dispatcher.off_duty(&id("c"))?;

    let workers = dispatcher.workers();
    let ids: Vec<_> = workers.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(ids, [id("a"), id("b")]);
    assert_eq!(workers[0].1.len(), 1);
    assert!(workers[1].1.contains("fry") && workers[1].1.contains("grill"));

    dispatcher.shutdown();
    assert!(dispatcher.workers().is_empty());
    Ok(())
}

/// A caller whose payload never decodes.
struct GarbledCaller;

impl Connection for GarbledCaller {
    type Message = String;

    async fn recv(&mut self) -> Result<String> {
        Err(Error::invalid_request("expected a dish"))
    }

    async fn send(&mut self, _message: String) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn undecodable_payload_is_invalid_request() -> Result<()> {
    let dispatcher = Dispatcher::new();
    dispatcher.on_duty("a", grill(), spawn_worker("a"))?;

    let err = dispatcher
        .handle_job("grill", &mut GarbledCaller)
        .await
        .unwrap_err();
    assert_eq!(err, Error::invalid_request("expected a dish"));
    assert!(dispatcher.is_on_duty(&id("a")));
    assert_eq!(order(&dispatcher, "grill", "soup").await?, "a:soup");
    Ok(())
}
