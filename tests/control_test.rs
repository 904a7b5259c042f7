//! End-to-end control-plane test: a device handler served over real
//! localhost TCP, driven through the client helper.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use washroom::wire;
use washroom::{
    ActuatorAction, CommandRequest, CommandResponse, ErrorCode, ErrorDetails, LightAction,
    SinkAction, bind_ephemeral, send_request, serve,
};

/// A lamp-shaped handler with observable state.
async fn spawn_lamp() -> (u16, Arc<Mutex<BTreeMap<String, String>>>) {
    let (listener, port) = bind_ephemeral().await.unwrap();
    let state = Arc::new(Mutex::new(BTreeMap::from([(
        "is_on".to_string(),
        "false".to_string(),
    )])));

    let handler_state = state.clone();
    tokio::spawn(serve(listener, move |request: CommandRequest| {
        let state = handler_state.clone();
        async move {
            let CommandRequest::SendActuatorCommand { action, .. } = request;
            let ActuatorAction::Light(light) = action else {
                return CommandResponse::Error(ErrorDetails::invalid_command(
                    "only light actions are supported",
                ));
            };
            let mut state = state.lock().await;
            let mut message = String::from("No change.");
            if let Some(turn_on) = light.turn_on {
                state.insert("is_on".into(), turn_on.to_string());
                message = if turn_on {
                    "Light turned ON.".into()
                } else {
                    "Light turned OFF.".into()
                };
            }
            CommandResponse::ActuatorAck { message }
        }
    }));

    (port, state)
}

fn light_on_request() -> CommandRequest {
    CommandRequest::SendActuatorCommand {
        device_id: "Lamp._lightlamp._tcp.local.".into(),
        action: ActuatorAction::Light(LightAction {
            turn_on: Some(true),
            brightness: None,
            color: None,
        }),
    }
}

#[tokio::test]
async fn command_round_trip_mutates_device_state() {
    let (port, state) = spawn_lamp().await;

    let payload = send_request(&["127.0.0.1".into()], port, &light_on_request())
        .await
        .unwrap();
    let response: CommandResponse = wire::decode(&payload).unwrap();
    assert_eq!(
        response,
        CommandResponse::ActuatorAck {
            message: "Light turned ON.".into()
        }
    );
    assert_eq!(state.lock().await["is_on"], "true");
}

#[tokio::test]
async fn wrong_action_comes_back_as_invalid_command() {
    let (port, _state) = spawn_lamp().await;

    let request = CommandRequest::SendActuatorCommand {
        device_id: "Lamp._lightlamp._tcp.local.".into(),
        action: ActuatorAction::Sink(SinkAction { turn_on: true }),
    };
    let payload = send_request(&["127.0.0.1".into()], port, &request)
        .await
        .unwrap();
    let response: CommandResponse = wire::decode(&payload).unwrap();
    match response {
        CommandResponse::Error(details) => {
            assert_eq!(details.code, ErrorCode::InvalidCommand);
        }
        other => panic!("expected invalid-command error, got {other:?}"),
    }
}

#[tokio::test]
async fn client_walks_the_address_list() {
    let (port, _state) = spawn_lamp().await;

    // The first two addresses have nothing listening on this port.
    let payload = send_request(
        &["127.0.0.3".into(), "127.0.0.2".into(), "127.0.0.1".into()],
        port,
        &light_on_request(),
    )
    .await
    .unwrap();
    let response: CommandResponse = wire::decode(&payload).unwrap();
    assert!(matches!(response, CommandResponse::ActuatorAck { .. }));
}

#[tokio::test]
async fn repeated_requests_each_get_a_reply() {
    let (port, state) = spawn_lamp().await;

    for expected in ["true", "false", "true"] {
        let request = CommandRequest::SendActuatorCommand {
            device_id: "Lamp._lightlamp._tcp.local.".into(),
            action: ActuatorAction::Light(LightAction {
                turn_on: Some(expected == "true"),
                brightness: None,
                color: None,
            }),
        };
        let payload = send_request(&["127.0.0.1".into()], port, &request)
            .await
            .unwrap();
        let response: CommandResponse = wire::decode(&payload).unwrap();
        assert!(matches!(response, CommandResponse::ActuatorAck { .. }));
        assert_eq!(state.lock().await["is_on"], expected);
    }
}
