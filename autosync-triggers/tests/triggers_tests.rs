use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use autosync_controller::{ExecutionTrigger, TriggerContext, TriggerError, TriggerEvent, TriggerNotice};
use autosync_core::{AgentName, TriggerConfig};
use autosync_triggers::{build, build_all, FileWatchTrigger, IntervalTrigger};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn context(trigger: &dyn ExecutionTrigger) -> (TriggerContext, mpsc::UnboundedReceiver<TriggerNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        TriggerContext::new(AgentName::from("AD"), trigger.display_name(), tx),
        rx,
    )
}

fn fired_names(rx: &mut mpsc::UnboundedReceiver<TriggerNotice>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        if let TriggerEvent::Fired(request) = notice.event {
            names.push(request.describe());
        }
    }
    names
}

#[tokio::test(start_paused = true)]
async fn interval_trigger_fires_each_period_until_stopped() {
    let mut trigger = IntervalTrigger::new("DI", Duration::from_secs(60), None, false).expect("trigger");
    let (ctx, mut rx) = context(&trigger);

    trigger.start(ctx).await.expect("start");
    tokio::time::sleep(Duration::from_secs(185)).await;
    assert_eq!(fired_names(&mut rx), ["DI", "DI", "DI"]);

    trigger.stop().await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(fired_names(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn interval_trigger_cannot_start_twice() {
    let mut trigger = IntervalTrigger::new("DI", Duration::from_secs(60), None, false).expect("trigger");
    let (ctx, _rx) = context(&trigger);
    trigger.start(ctx.clone()).await.expect("start");

    let err = trigger.start(ctx).await.expect_err("second start");
    assert!(matches!(err, TriggerError::AlreadyStarted(_)));
    trigger.stop().await;
}

#[tokio::test(start_paused = true)]
async fn interval_trigger_exits_when_controller_is_gone() {
    let mut trigger = IntervalTrigger::new("DI", Duration::from_secs(1), None, false).expect("trigger");
    let (ctx, rx) = context(&trigger);
    drop(rx);

    trigger.start(ctx).await.expect("start");
    tokio::time::sleep(Duration::from_secs(5)).await;
    trigger.stop().await;
}

#[tokio::test]
async fn file_watch_requires_existing_path() {
    let dir = TempDir::new().expect("tempdir");
    let missing = dir.path().join("missing");
    let mut trigger = FileWatchTrigger::new(&missing, "DI", Duration::from_millis(100)).expect("trigger");
    let (ctx, _rx) = context(&trigger);

    let err = trigger.start(ctx).await.expect_err("missing path");
    match err {
        TriggerError::Io { path, .. } => assert_eq!(path, missing),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn file_watch_fires_on_new_file() {
    let dir = TempDir::new().expect("tempdir");
    let mut trigger =
        FileWatchTrigger::new(dir.path(), "Import users", Duration::from_millis(50)).expect("trigger");
    let (ctx, mut rx) = context(&trigger);
    trigger.start(ctx).await.expect("start");

    fs::write(dir.path().join("users.csv"), "id,name\n1,alice\n").expect("write");

    let fired = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(notice) = rx.recv().await {
            if let TriggerEvent::Fired(request) = notice.event {
                return Some(request);
            }
        }
        None
    })
    .await
    .expect("trigger fired in time")
    .expect("channel open");

    assert_eq!(fired.explicit_name(), Some("Import users"));
    trigger.stop().await;
}

#[test]
fn factory_builds_each_kind() {
    let interval = build(&TriggerConfig::Interval {
        run_profile_name: "DI".to_string(),
        interval_secs: 300,
        start: None,
        exclusive: false,
    })
    .expect("interval");
    assert_eq!(interval.display_name(), "Interval: DI every 300s");

    let watch = build(&TriggerConfig::FileWatch {
        path: PathBuf::from("/srv/drop"),
        run_profile_name: "FI".to_string(),
        debounce_ms: 500,
    })
    .expect("file watch");
    assert_eq!(watch.display_name(), "File watch: FI on /srv/drop");
}

#[test]
fn factory_rejects_invalid_entries() {
    let configs = [
        TriggerConfig::Interval {
            run_profile_name: "DI".to_string(),
            interval_secs: 60,
            start: None,
            exclusive: false,
        },
        TriggerConfig::Interval {
            run_profile_name: "EX".to_string(),
            interval_secs: 0,
            start: None,
            exclusive: false,
        },
    ];
    assert!(matches!(build_all(&configs), Err(TriggerError::Invalid(_))));
}
