use crate::command::errors::DispatchError;
use crate::command::types::{
    CommandDocument, HeartbeatDocument, RegistrationDocument, ResponseEnvelope,
};
use crate::test_helpers::factory::Factory;
use serde_json::json;

#[test]
fn parses_well_formed_command() {
    let doc = Factory::command_doc()
        .with_execute("echo")
        .with_args(vec![json!(42), json!("x")])
        .create();

    let command = CommandDocument::from_value(&doc).expect("command should parse");

    assert_eq!(command.execute, "echo");
    assert_eq!(command.arguments, vec![json!(42), json!("x")]);
    assert_eq!(command.doc_type, "command");
}

#[test]
fn missing_arguments_means_no_arguments() {
    let doc = Factory::command_doc().without_arguments().create();
    let command = CommandDocument::from_value(&doc).unwrap();
    assert!(command.arguments.is_empty());
}

#[test]
fn rejects_non_list_arguments() {
    for raw in [json!({"a": 1}), json!("42"), json!(7), json!(true)] {
        let doc = Factory::command_doc()
            .with_execute("echo")
            .with_raw_arguments(raw.clone())
            .create();
        let err = CommandDocument::from_value(&doc).unwrap_err();
        assert!(
            matches!(err, DispatchError::ArgumentsNotList { ref command } if command == "echo"),
            "arguments {raw} should be rejected, got {err:?}"
        );
    }
}

#[test]
fn rejects_missing_or_non_string_execute() {
    let missing = Factory::command_doc().without_execute().create();
    assert!(matches!(
        CommandDocument::from_value(&missing),
        Err(DispatchError::MissingExecute)
    ));

    let numeric = Factory::command_doc().with_raw_execute(json!(3)).create();
    assert!(matches!(
        CommandDocument::from_value(&numeric),
        Err(DispatchError::InvalidExecute)
    ));
}

#[test]
fn success_envelope_carries_return_and_ok() {
    let envelope = ResponseEnvelope::success("echo", json!(42));
    let update = envelope.to_update().unwrap();

    assert_eq!(update["response"]["content"], "'echo' success");
    assert_eq!(update["response"]["return"], json!(42));
    assert_eq!(update["response"]["ok"], json!(true));
    assert!(update["response"]["timestamp"].is_string());
    assert!(!envelope.is_failure());
}

#[test]
fn failure_envelope_has_no_ok_or_return() {
    let outcome = Err(DispatchError::UnknownCommand("nope".to_string()));
    let envelope = ResponseEnvelope::from_outcome(&outcome);
    let update = envelope.to_update().unwrap();

    let content = update["response"]["content"].as_str().unwrap();
    assert!(content.starts_with("Exception:\n"));
    assert!(content.contains("unknown command 'nope'"));
    assert!(update["response"].get("ok").is_none());
    assert!(update["response"].get("return").is_none());
    assert!(envelope.is_failure());
}

#[test]
fn registration_document_serializes_keys_with_info() {
    let registration = Factory::registration()
        .with_uuid("node-a")
        .with_commands(&["start", "stop"])
        .create();
    let value = registration.to_value().unwrap();

    assert_eq!(value["type"], "export_commands");
    assert_eq!(value["uuid"], "node-a");
    assert!(value["keys"]["start"]["Info"].is_string());
    assert!(value.get("log_servers").is_none());

    let back: RegistrationDocument = serde_json::from_value(value).unwrap();
    assert_eq!(back.command_names(), vec!["start", "stop"]);
}

#[test]
fn heartbeat_is_keyed_per_node() {
    assert_eq!(HeartbeatDocument::doc_id("rpi-1"), "heartbeat_rpi-1");
    assert_ne!(
        HeartbeatDocument::doc_id("rpi-1"),
        HeartbeatDocument::doc_id("rpi-2")
    );
    let value = HeartbeatDocument::new("rpi-1").to_value();
    assert_eq!(value["type"], "heartbeat");
    assert_eq!(value["node_id"], "rpi-1");
}
