mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autosync_controller::{
    Controller, ControllerError, ControllerEvent, EnqueueOutcome, ExecutionTrigger,
    TriggerContext, TriggerError,
};
use autosync_core::{ControlState, ControllerConfiguration, ExecutionRequest, ExecutionState};

use common::{controller, coordination, eventually, fast_settings, identity, settle, FakeEngine};

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let engine = Arc::new(FakeEngine::new("AD"));
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        engine,
        coordination(),
    );

    ctl.start().await.expect("start");
    assert_eq!(ctl.control_state(), ControlState::Running);

    ctl.stop(false).await;
    assert_eq!(ctl.control_state(), ControlState::Stopped);
    ctl.stop(false).await;
    assert_eq!(ctl.control_state(), ControlState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stopped_controller_can_restart() {
    let engine = Arc::new(FakeEngine::new("AD"));
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::clone(&engine),
        coordination(),
    );

    ctl.start().await.expect("first start");
    ctl.stop(false).await;
    ctl.start().await.expect("second start");

    ctl.enqueue(&ExecutionRequest::named("DI"), "test", false);
    eventually("DI to run after restart", || engine.calls() == ["DI"]).await;
    ctl.stop(false).await;
}

#[tokio::test(start_paused = true)]
async fn disabled_configuration_never_starts() {
    let engine = Arc::new(FakeEngine::new("AD"));
    let mut config = ControllerConfiguration::new("AD");
    config.disabled = true;
    let ctl = controller(identity("AD"), config, Arc::clone(&engine), coordination());

    assert_eq!(ctl.control_state(), ControlState::Disabled);
    ctl.start().await.expect("start on disabled agent is not an error");
    assert_eq!(ctl.control_state(), ControlState::Disabled);

    assert_eq!(
        ctl.enqueue(&ExecutionRequest::named("DI"), "test", false),
        EnqueueOutcome::Closed
    );
    settle(Duration::from_secs(5)).await;
    assert!(engine.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unconfigured_agent_is_disabled() {
    let mut config = ControllerConfiguration::new("AD");
    config.version = 0;
    let ctl = controller(
        identity("AD"),
        config,
        Arc::new(FakeEngine::new("AD")),
        coordination(),
    );
    assert_eq!(ctl.control_state(), ControlState::Disabled);
}

#[tokio::test(start_paused = true)]
async fn start_while_running_is_a_no_op() {
    let engine = Arc::new(FakeEngine::new("AD"));
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::clone(&engine),
        coordination(),
    );

    ctl.start().await.expect("start");
    ctl.enqueue(&ExecutionRequest::named("DI"), "test", false);
    ctl.start().await.expect("second start");
    assert_eq!(ctl.control_state(), ControlState::Running);

    eventually("DI to run", || engine.calls() == ["DI"]).await;
    ctl.stop(false).await;
}

#[tokio::test(start_paused = true)]
async fn stop_clears_queue_and_status() {
    let engine = Arc::new(FakeEngine::new("AD"));
    engine.set_run_duration(Duration::from_secs(30));
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::clone(&engine),
        coordination(),
    );

    ctl.start().await.expect("start");
    ctl.enqueue(&ExecutionRequest::named("DI"), "test", false);
    ctl.enqueue(&ExecutionRequest::named("EX"), "test", false);
    eventually("DI to start", || engine.calls() == ["DI"]).await;

    ctl.stop(false).await;

    let status = ctl.status();
    assert_eq!(status.control_state, ControlState::Stopped);
    assert_eq!(status.execution_state, ExecutionState::Idle);
    assert!(status.execution_queue.is_empty());
    assert!(ctl.queued().is_empty());
    assert_eq!(engine.calls(), ["DI"], "queued EX must not run after stop");
}

#[tokio::test(start_paused = true)]
async fn cancel_run_abandons_current_job() {
    let engine = Arc::new(FakeEngine::new("AD"));
    engine.set_run_duration(Duration::from_secs(600));
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::clone(&engine),
        coordination(),
    );

    ctl.start().await.expect("start");
    ctl.enqueue(&ExecutionRequest::named("DI"), "test", false);
    eventually("DI to be running", || {
        ctl.status().execution_state == ExecutionState::Running
    })
    .await;

    ctl.cancel_run().await;
    eventually("controller to go idle", || {
        ctl.status().execution_state == ExecutionState::Idle
    })
    .await;
    assert_eq!(ctl.control_state(), ControlState::Running);
    assert_eq!(engine.last_run_number(), 0, "cancelled run records nothing");
    ctl.stop(false).await;
}

#[tokio::test(start_paused = true)]
async fn stop_with_cancel_asks_busy_engine_to_stop() {
    let engine = Arc::new(FakeEngine::new("AD"));
    engine.begin_unmanaged_run("FI", Duration::from_secs(3_600));
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::clone(&engine),
        coordination(),
    );

    ctl.start().await.expect("start");
    settle(Duration::from_secs(1)).await;
    ctl.stop(true).await;

    assert_eq!(ctl.control_state(), ControlState::Stopped);
    assert_eq!(engine.stop_requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_requires_stopped_controller() {
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::new(FakeEngine::new("AD")),
        coordination(),
    );

    ctl.start().await.expect("start");
    let err = ctl
        .reconfigure(ControllerConfiguration::new("AD"), Vec::new())
        .await
        .expect_err("running controller");
    assert!(matches!(
        err,
        ControllerError::InvalidState {
            state: ControlState::Running,
            ..
        }
    ));

    ctl.stop(false).await;
    let mut next = ControllerConfiguration::new("ad");
    next.version = 7;
    ctl.reconfigure(next, Vec::new()).await.expect("reconfigure");
    assert_eq!(ctl.status().active_version, 7);
    assert_eq!(ctl.configuration().version, 7);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_rejects_other_agent() {
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::new(FakeEngine::new("AD")),
        coordination(),
    );

    let err = ctl
        .reconfigure(ControllerConfiguration::new("HR"), Vec::new())
        .await
        .expect_err("mismatched agent");
    assert!(matches!(err, ControllerError::ConfigurationMismatch { .. }));
}

#[tokio::test(start_paused = true)]
async fn reconfigure_to_disabled_sets_disabled() {
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::new(FakeEngine::new("AD")),
        coordination(),
    );

    let mut next = ControllerConfiguration::new("AD");
    next.disabled = true;
    ctl.reconfigure(next, Vec::new()).await.expect("reconfigure");
    assert_eq!(ctl.control_state(), ControlState::Disabled);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_changes_are_published() {
    let ctl = controller(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::new(FakeEngine::new("AD")),
        coordination(),
    );
    let mut events = ctl.subscribe();

    ctl.start().await.expect("start");
    ctl.stop(false).await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ControllerEvent::StatusChanged(status) = event {
            if states.last() != Some(&status.control_state) {
                states.push(status.control_state);
            }
        }
    }
    assert_eq!(
        states,
        [
            ControlState::Starting,
            ControlState::Running,
            ControlState::Stopping,
            ControlState::Stopped
        ]
    );
}

/// Trigger whose start takes a while, so a stop can arrive in the middle.
struct SlowStartTrigger {
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl ExecutionTrigger for SlowStartTrigger {
    fn display_name(&self) -> String {
        "slow".to_string()
    }

    async fn start(&mut self, _context: TriggerContext) -> Result<(), TriggerError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn stop_during_trigger_start_leaves_no_trigger_running() {
    let armed = Arc::new(AtomicBool::new(false));
    let ctl = Controller::builder(
        identity("AD"),
        ControllerConfiguration::new("AD"),
        Arc::new(FakeEngine::new("AD")),
        coordination(),
    )
    .settings(fast_settings())
    .trigger(Box::new(SlowStartTrigger {
        armed: Arc::clone(&armed),
    }))
    .build();

    ctl.start().await.expect("start");
    settle(Duration::from_millis(100)).await;
    ctl.stop(false).await;
    assert_eq!(ctl.control_state(), ControlState::Stopped);
    assert!(!armed.load(Ordering::SeqCst));

    settle(Duration::from_secs(2)).await;
    assert!(!armed.load(Ordering::SeqCst), "trigger started after stop");
}
