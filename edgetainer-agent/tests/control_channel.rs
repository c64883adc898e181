//! Wire-level tests for the agent's command path
//!
//! Drives command envelopes through the same framing the control channel
//! carries and checks the responses decode back as control messages on the
//! server side.

use edgetainer_agent::commands::{CommandHandler, ContainerRuntime, NullRuntime, StatusHandle};
use edgetainer_protocol::envelope::{ExecuteCommand, GetStatusCommand};
use edgetainer_protocol::{frame, CommandEnvelope, CommandPayload, ControlMessage, FrameBuffer};
use std::sync::Arc;

fn handler() -> CommandHandler {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(NullRuntime);
    CommandHandler::new(runtime, StatusHandle::default())
}

/// Encode an envelope as the server would, push it through a frame buffer as
/// the agent would receive it, handle it, and decode the response frame as
/// the server does.
async fn roundtrip(payload: CommandPayload) -> (CommandEnvelope, ControlMessage) {
    let envelope = CommandEnvelope::new(&payload).unwrap();
    let wire = frame::encode(&envelope).unwrap();

    let mut inbound = FrameBuffer::new();
    inbound.extend(&wire);
    let received: Vec<CommandEnvelope> = inbound.drain_decoded().unwrap();
    assert_eq!(received.len(), 1);

    let response = handler().handle(&received[0]).await;
    let wire = frame::encode(&response).unwrap();

    let mut upstream = FrameBuffer::new();
    upstream.extend(&wire);
    let mut messages: Vec<ControlMessage> = upstream.drain_decoded().unwrap();
    assert_eq!(messages.len(), 1);
    (envelope, messages.remove(0))
}

#[tokio::test]
async fn execute_roundtrip_correlates() {
    let (envelope, message) = roundtrip(CommandPayload::Execute(ExecuteCommand {
        command: "printf tunnel-ok".into(),
        timeout: 10,
    }))
    .await;

    match message {
        ControlMessage::Response(response) => {
            assert_eq!(response.command_id, envelope.id);
            assert!(response.success);
            assert_eq!(response.data["stdout"], "tunnel-ok");
        }
        other => panic!("expected a response, got {other:?}"),
    }
}

#[tokio::test]
async fn repeated_get_status_responses_are_independent() {
    let (first_env, first) =
        roundtrip(CommandPayload::GetStatus(GetStatusCommand::default())).await;
    let (second_env, second) =
        roundtrip(CommandPayload::GetStatus(GetStatusCommand::default())).await;

    let (ControlMessage::Response(first), ControlMessage::Response(second)) = (first, second)
    else {
        panic!("expected responses");
    };

    assert_ne!(first_env.id, second_env.id);
    assert_eq!(first.command_id, first_env.id);
    assert_eq!(second.command_id, second_env.id);
    assert!(first.success && second.success);
}

#[tokio::test]
async fn container_command_without_runtime_is_device_error() {
    let (envelope, message) = roundtrip(CommandPayload::Undeploy(
        edgetainer_protocol::envelope::UndeployCommand {
            software_id: "web".into(),
        },
    ))
    .await;

    let ControlMessage::Response(response) = message else {
        panic!("expected a response");
    };
    assert_eq!(response.command_id, envelope.id);
    assert!(!response.success);
    assert!(response.message.contains("not configured"));
}
