//! Full cycles through the default handlers against scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use delio_core::mock::{MockModel, MockReply, MockSet, MockTools};
use delio_core::{Action, ErrorKind, KernelEvent, State, UserId};
use delio_kernel::states::{CRITIC_NOTICE, GENERIC_NOTICE, TIMEOUT_NOTICE};
use delio_kernel::{Kernel, NotifyOutcome};
use delio_settings::DelioSettings;
use delio_telemetry::{names, MetricsRecorder};

const USER: UserId = UserId::new(1);

fn boot(mocks: &MockSet) -> Kernel {
    Kernel::boot(DelioSettings::default(), mocks.collaborators(), None)
}

#[tokio::test]
async fn message_is_answered_and_remembered() {
    let mocks = MockSet::new(MockModel::replying("Hello! How can I help today?"), MockTools::new());
    let kernel = boot(&mocks);

    let ctx = kernel.process_event(KernelEvent::message(USER, "hi")).await;
    assert_eq!(
        ctx.trace(),
        ["START", "OBSERVE", "RETRIEVE", "PLAN", "DECIDE", "RESPOND", "REFLECT", "MEMORY_WRITE"]
    );
    assert!(ctx.errors().is_empty(), "{:?}", ctx.errors());
    assert_eq!(mocks.delivery.sent_to(USER), vec!["Hello! How can I help today?".to_string()]);
    assert_eq!(mocks.memory.interactions().len(), 1);
    assert_eq!(mocks.model.evaluate_calls(), 1);
    assert_eq!(kernel.controller().guard().get_state(USER), State::Idle);
}

#[tokio::test]
async fn tool_results_are_planned_over() {
    let model = MockModel::new(vec![
        MockReply::text(r#"{"tool_calls": [{"name": "weather", "arguments": {"city": "Oslo"}}]}"#),
        MockReply::text("It is sunny in Oslo."),
    ]);
    let tools = MockTools::new().with_tool("weather", &[Action::Network], "sunny, 21C");
    let mocks = MockSet::new(model, tools);
    let kernel = boot(&mocks);

    let ctx = kernel.process_event(KernelEvent::message(USER, "weather in Oslo?")).await;
    assert_eq!(
        ctx.trace(),
        [
            "START",
            "OBSERVE",
            "RETRIEVE",
            "PLAN",
            "DECIDE",
            "ACT",
            "REFLECT",
            "PLAN",
            "DECIDE",
            "RESPOND",
            "REFLECT",
            "MEMORY_WRITE"
        ]
    );
    assert!(ctx.errors().is_empty(), "{:?}", ctx.errors());
    assert_eq!(mocks.model.requests()[1].tool_outputs[0].output, "sunny, 21C");
    assert_eq!(mocks.delivery.sent_to(USER), vec!["It is sunny in Oslo.".to_string()]);
}

#[tokio::test]
async fn quiet_heartbeat_sends_nothing() {
    let mocks = MockSet::new(MockModel::replying("SKIP"), MockTools::new());
    let kernel = boot(&mocks);

    let ctx = kernel.process_event(KernelEvent::heartbeat(USER)).await;
    assert_eq!(ctx.trace(), ["START", "OBSERVE", "RETRIEVE", "PLAN", "DECIDE"]);
    assert!(mocks.delivery.sent().is_empty());
    assert!(mocks.memory.interactions().is_empty());
}

#[tokio::test]
async fn critic_rejection_sends_critic_notice() {
    let mocks = MockSet::new(MockModel::replying("Just guess."), MockTools::new());
    mocks.model.reject_with("speculative");
    let kernel = boot(&mocks);

    let ctx = kernel.process_event(KernelEvent::message(USER, "what is my balance?")).await;
    assert_eq!(ctx.trace(), ["START", "OBSERVE", "RETRIEVE", "PLAN", "ERROR"]);
    assert!(ctx.has_error(ErrorKind::CriticRejected));
    assert_eq!(mocks.delivery.sent_to(USER), vec![CRITIC_NOTICE.to_string()]);
}

#[tokio::test]
async fn empty_message_sends_generic_notice() {
    let mocks = MockSet::default();
    let kernel = boot(&mocks);

    let ctx = kernel.process_event(KernelEvent::message(USER, "")).await;
    assert_eq!(ctx.trace(), ["START", "OBSERVE", "ERROR"]);
    assert!(ctx.has_error(ErrorKind::EmptyInput));
    assert_eq!(mocks.delivery.sent_to(USER), vec![GENERIC_NOTICE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn slow_model_times_out_with_notice() {
    let model = MockModel::new(vec![MockReply::delayed(
        Duration::from_secs(600),
        MockReply::text("too late"),
    )]);
    let mocks = MockSet::new(model, MockTools::new());
    let mut settings = DelioSettings::default();
    settings.cycle.timeout_ms = 1_000;
    let kernel = Kernel::boot(settings, mocks.collaborators(), None);

    let ctx = kernel.process_event(KernelEvent::message(USER, "think hard")).await;
    assert!(ctx.timed_out);
    assert!(ctx.has_error(ErrorKind::CycleTimeout));
    assert_eq!(mocks.delivery.sent_to(USER), vec![TIMEOUT_NOTICE.to_string()]);
    assert_eq!(kernel.controller().guard().get_state(USER), State::Idle);
}

#[tokio::test]
async fn reminder_is_delivered_between_cycles() {
    let mocks = MockSet::default();
    let metrics = Arc::new(MetricsRecorder::new());
    let kernel =
        Kernel::boot(DelioSettings::default(), mocks.collaborators(), Some(metrics.clone()));

    let outcome = kernel.dispatch_notification(USER, "Dentist at 3pm").await;
    assert_eq!(outcome, NotifyOutcome::Delivered);
    assert_eq!(mocks.delivery.sent_to(USER), vec!["Dentist at 3pm".to_string()]);
    assert_eq!(metrics.counter_get(names::NOTIFICATIONS_TOTAL, &[("outcome", "delivered")]), 1);
    assert_eq!(kernel.controller().guard().get_state(USER), State::Idle);
}

#[tokio::test]
async fn cycle_metrics_are_recorded() {
    let mocks = MockSet::default();
    let metrics = Arc::new(MetricsRecorder::new());
    let kernel =
        Kernel::boot(DelioSettings::default(), mocks.collaborators(), Some(metrics.clone()));

    kernel.process_event(KernelEvent::message(USER, "hello")).await;
    assert_eq!(metrics.counter_get(names::CYCLES_TOTAL, &[("outcome", "ok")]), 1);
    assert_eq!(
        metrics.counter_get(names::TRANSITIONS_TOTAL, &[("from", "IDLE"), ("to", "OBSERVE")]),
        1
    );
    assert_eq!(kernel.health().tracked_users, 0);
}
