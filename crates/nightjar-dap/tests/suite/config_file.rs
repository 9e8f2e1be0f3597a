use nightjar_cdp::mock::MockRuntime;
use nightjar_config::NightjarConfig;
use nightjar_dap::wire_server::AdapterOptions;

use crate::harness::spawn_wire_server_with;

#[tokio::test]
async fn adapter_settings_come_from_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nightjar.toml");
    std::fs::write(
        &path,
        "[adapter]\ncondition_identifier = \"err\"\ndefault_exception_filters = [\"uncaught\"]\n",
    )
    .unwrap();
    let config = NightjarConfig::load_from_path(&path).unwrap();

    let runtime = MockRuntime::spawn().await.unwrap();
    let mut client = spawn_wire_server_with(AdapterOptions::from_config(&config));
    let caps = client.initialize_handshake().await;
    let description = caps["exceptionBreakpointFilters"][0]["conditionDescription"]
        .as_str()
        .unwrap();
    assert!(description.contains("`err`"), "{description}");

    let resp = client.attach(runtime.addr().port()).await;
    assert_eq!(resp["success"], true, "{resp}");
    let sent = runtime.commands_for(None, "Debugger.setPauseOnExceptions");
    assert_eq!(sent[0].params["state"], "uncaught");
    client.disconnect().await;
}
