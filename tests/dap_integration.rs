
use dap_client::{write_fixture, DapSession};
use serde_json::{json, Value};
use serial_test::serial;

fn assert_response(response: &Value, command: &str, success: bool) {
    assert_eq!(
        response.get("type").and_then(Value::as_str),
        Some("response")
    );
    assert_eq!(
        response.get("command").and_then(Value::as_str),
        Some(command)
    );
    assert_eq!(
        response.get("success").and_then(Value::as_bool),
        Some(success),
        "response: {response}"
    );
    assert!(response.get("seq").and_then(Value::as_i64).is_some());
}

fn initialize(session: &mut DapSession) -> anyhow::Result<()> {
    let seq = session
        .client
        .send_request("initialize", json!({ "adapterID": "dapper" }))?;
    let response = session.client.read_response(seq)?;
    assert_response(&response, "initialize", true);
    assert_eq!(response["request_seq"], seq);
    let body = &response["body"];
    assert_eq!(body["supportsConfigurationDoneRequest"], true);
    assert_eq!(body["supportsDataBreakpoints"], true);
    assert_eq!(body["supportTerminateDebuggee"], true);
    assert_eq!(body["exceptionBreakpointFilters"][1]["filter"], "uncaught");
    assert_eq!(body["exceptionBreakpointFilters"][1]["default"], true);

    let event = session.client.wait_for_event("initialized")?;
    assert_eq!(event.get("type").and_then(Value::as_str), Some("event"));
    Ok(())
}

/// initialize + launch (in-process) + one breakpoint + configurationDone,
/// returning the stopped thread id.
fn launch_with_breakpoint(
    session: &mut DapSession,
    program: &std::path::Path,
    breakpoints: Value,
) -> anyhow::Result<i64> {
    initialize(session)?;
    let response = session.client.request(
        "launch",
        json!({ "program": program, "inProcess": true }),
    )?;
    assert_response(&response, "launch", true);

    let response = session.client.request(
        "setBreakpoints",
        json!({ "source": { "path": program }, "breakpoints": breakpoints }),
    )?;
    assert_response(&response, "setBreakpoints", true);

    let response = session.client.request("configurationDone", json!({}))?;
    assert_response(&response, "configurationDone", true);

    let stopped = session.client.wait_for_event("stopped")?;
    Ok(stopped["body"]["threadId"].as_i64().unwrap_or_default())
}

#[test]
#[serial]
fn test_initialize_handshake() -> anyhow::Result<()> {
    let mut session = DapSession::start()?;
    initialize(&mut session)?;
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_unsupported_command() -> anyhow::Result<()> {
    let mut session = DapSession::start()?;
    initialize(&mut session)?;
    let response = session
        .client
        .request("setExpression", json!({ "expression": "x", "value": "1" }))?;
    assert_response(&response, "setExpression", false);
    assert!(response["message"]
        .as_str()
        .unwrap_or_default()
        .contains("Unsupported command"));
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_breakpoint_stop_and_variables() -> anyhow::Result<()> {
    let program = write_fixture(
        "dapper_it_vars.scr",
        "x = 10\ny = 20\nz = x + y\nprint z\n",
    );
    let mut session = DapSession::start()?;
    let thread_id = launch_with_breakpoint(&mut session, &program, json!([{ "line": 3 }]))?;
    assert!(thread_id > 0);

    let response = session
        .client
        .request("threads", json!({}))?;
    assert_response(&response, "threads", true);
    assert!(!response["body"]["threads"].as_array().unwrap().is_empty());

    let response = session
        .client
        .request("stackTrace", json!({ "threadId": thread_id }))?;
    assert_response(&response, "stackTrace", true);
    let frame = &response["body"]["stackFrames"][0];
    assert_eq!(frame["line"], 3);
    let frame_id = frame["id"].as_i64().unwrap();

    let response = session
        .client
        .request("scopes", json!({ "frameId": frame_id }))?;
    assert_response(&response, "scopes", true);
    let scopes = response["body"]["scopes"].as_array().unwrap().clone();
    assert_eq!(scopes[0]["name"], "Local");
    let locals_ref = scopes[0]["variablesReference"].as_i64().unwrap();
    assert!(locals_ref >= 1000);

    let response = session
        .client
        .request("variables", json!({ "variablesReference": locals_ref }))?;
    assert_response(&response, "variables", true);
    let variables = response["body"]["variables"].as_array().unwrap();
    let x = variables.iter().find(|v| v["name"] == "x").unwrap();
    assert_eq!(x["value"], "10");
    // Line 3 has not executed yet.
    assert!(variables.iter().all(|v| v["name"] != "z"));

    let response = session.client.request(
        "evaluate",
        json!({ "expression": "x + y", "frameId": frame_id, "context": "watch" }),
    )?;
    assert_response(&response, "evaluate", true);
    assert_eq!(response["body"]["result"], "30");

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);
    assert_eq!(response["body"]["allThreadsContinued"], true);

    session.client.wait_for_event("exited")?;
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_conditional_breakpoint_never_fires() -> anyhow::Result<()> {
    // The condition is false at the breakpoint line, so the program runs
    // to completion without a breakpoint stop.
    let program = write_fixture("dapper_it_cond.scr", "x = 5\nprint x\nprint x\n");
    let mut session = DapSession::start()?;
    initialize(&mut session)?;
    let response = session.client.request(
        "launch",
        json!({ "program": program, "inProcess": true }),
    )?;
    assert_response(&response, "launch", true);
    let response = session.client.request(
        "setBreakpoints",
        json!({
            "source": { "path": program },
            "breakpoints": [{ "line": 2, "condition": "x > 100" }],
        }),
    )?;
    assert_response(&response, "setBreakpoints", true);
    let response = session.client.request("configurationDone", json!({}))?;
    assert_response(&response, "configurationDone", true);

    session.client.wait_for_event("exited")?;
    for stopped in session.client.drain_matching("stopped") {
        assert_ne!(stopped["body"]["reason"], "breakpoint", "{stopped}");
    }
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_hit_condition_every_third() -> anyhow::Result<()> {
    // The breakpoint line executes seven times; `% 3` stops on hits 3
    // and 6 only.
    let program = write_fixture(
        "dapper_it_hits.scr",
        "x = 0\nrepeat 7:\n    x = x + 1\nprint x\n",
    );
    let mut session = DapSession::start()?;
    initialize(&mut session)?;
    let response = session.client.request(
        "launch",
        json!({ "program": program, "inProcess": true }),
    )?;
    assert_response(&response, "launch", true);
    let response = session.client.request(
        "setBreakpoints",
        json!({
            "source": { "path": program },
            "breakpoints": [{ "line": 3, "hitCondition": "% 3" }],
        }),
    )?;
    assert_response(&response, "setBreakpoints", true);
    let response = session.client.request("configurationDone", json!({}))?;
    assert_response(&response, "configurationDone", true);

    let mut stop_count = 0;
    loop {
        let event = session.client.read_event()?;
        match event["event"].as_str() {
            Some("stopped") if event["body"]["reason"] == "breakpoint" => {
                stop_count += 1;
                let thread_id = event["body"]["threadId"].as_i64().unwrap();
                let response = session
                    .client
                    .request("continue", json!({ "threadId": thread_id }))?;
                assert_response(&response, "continue", true);
            }
            Some("exited") => break,
            _ => {}
        }
    }
    assert_eq!(stop_count, 2);
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_log_point_emits_output_without_stop() -> anyhow::Result<()> {
    let program = write_fixture(
        "dapper_it_log.scr",
        "x = 10\ny = 20\nz = 0\nz = x + y\nprint z\n",
    );
    let mut session = DapSession::start()?;
    initialize(&mut session)?;
    let response = session.client.request(
        "launch",
        json!({ "program": program, "inProcess": true }),
    )?;
    assert_response(&response, "launch", true);
    let response = session.client.request(
        "setBreakpoints",
        json!({
            "source": { "path": program },
            "breakpoints": [{ "line": 4, "logMessage": "x={x}, y={y}" }],
        }),
    )?;
    assert_response(&response, "setBreakpoints", true);
    let response = session.client.request("configurationDone", json!({}))?;
    assert_response(&response, "configurationDone", true);

    // The log point renders on the console category; no stop happens.
    let mut saw_log = false;
    loop {
        let event = session.client.read_event()?;
        match event["event"].as_str() {
            Some("output")
                if event["body"]["category"] == "console"
                    && event["body"]["output"]
                        .as_str()
                        .unwrap_or_default()
                        .contains("x=10, y=20") =>
            {
                saw_log = true;
            }
            Some("stopped") => panic!("log point must not stop: {event}"),
            Some("exited") => break,
            _ => {}
        }
    }
    assert!(saw_log);
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_stack_frame_invalidation_after_continue() -> anyhow::Result<()> {
    let program = write_fixture(
        "dapper_it_inval.scr",
        "x = 1\nx = 2\nx = 3\nprint x\n",
    );
    let mut session = DapSession::start()?;
    let thread_id =
        launch_with_breakpoint(&mut session, &program, json!([{ "line": 2 }, { "line": 3 }]))?;

    let response = session
        .client
        .request("stackTrace", json!({ "threadId": thread_id }))?;
    let stale_frame = response["body"]["stackFrames"][0]["id"].as_i64().unwrap();

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);
    session.client.wait_for_event("stopped")?;

    // The frame id minted at the first stop is dead now.
    let response = session
        .client
        .request("scopes", json!({ "frameId": stale_frame }))?;
    assert_response(&response, "scopes", false);

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);
    session.client.wait_for_event("exited")?;
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_set_variable_literal_and_expression() -> anyhow::Result<()> {
    let program = write_fixture(
        "dapper_it_setvar.scr",
        "x = 1\ny = 2\nprint x + y\n",
    );
    let mut session = DapSession::start()?;
    let thread_id = launch_with_breakpoint(&mut session, &program, json!([{ "line": 3 }]))?;

    let response = session
        .client
        .request("stackTrace", json!({ "threadId": thread_id }))?;
    let frame_id = response["body"]["stackFrames"][0]["id"].as_i64().unwrap();
    let response = session
        .client
        .request("scopes", json!({ "frameId": frame_id }))?;
    let locals_ref = response["body"]["scopes"][0]["variablesReference"]
        .as_i64()
        .unwrap();

    // Literal assignment.
    let response = session.client.request(
        "setVariable",
        json!({ "variablesReference": locals_ref, "name": "x", "value": "40" }),
    )?;
    assert_response(&response, "setVariable", true);
    assert_eq!(response["body"]["value"], "40");

    // Expression assignment against the frame.
    let response = session.client.request(
        "setVariable",
        json!({ "variablesReference": locals_ref, "name": "y", "value": "x + 2" }),
    )?;
    assert_response(&response, "setVariable", true);
    assert_eq!(response["body"]["value"], "42");

    // Neither literal nor expression: stored as a string.
    let response = session.client.request(
        "setVariable",
        json!({ "variablesReference": locals_ref, "name": "note", "value": "not an expr ???" }),
    )?;
    assert_response(&response, "setVariable", true);
    assert_eq!(response["body"]["type"], "str");

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);

    // The program prints the updated sum.
    let mut saw_output = false;
    loop {
        let event = session.client.read_event()?;
        match event["event"].as_str() {
            Some("output")
                if event["body"]["output"]
                    .as_str()
                    .unwrap_or_default()
                    .contains("82") =>
            {
                saw_output = true;
            }
            Some("exited") => break,
            _ => {}
        }
    }
    assert!(saw_output);
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_exception_breakpoint_uncaught() -> anyhow::Result<()> {
    let program = write_fixture("dapper_it_exc.scr", "x = 1\nraise \"boom\"\n");
    let mut session = DapSession::start()?;
    initialize(&mut session)?;
    let response = session.client.request(
        "launch",
        json!({ "program": program, "inProcess": true }),
    )?;
    assert_response(&response, "launch", true);
    let response = session.client.request(
        "setExceptionBreakpoints",
        json!({ "filters": ["uncaught"] }),
    )?;
    assert_response(&response, "setExceptionBreakpoints", true);
    let response = session.client.request("configurationDone", json!({}))?;
    assert_response(&response, "configurationDone", true);

    let stopped = session.client.wait_for_event("stopped")?;
    assert_eq!(stopped["body"]["reason"], "exception");
    let thread_id = stopped["body"]["threadId"].as_i64().unwrap();

    let response = session
        .client
        .request("exceptionInfo", json!({ "threadId": thread_id }))?;
    assert_response(&response, "exceptionInfo", true);
    assert_eq!(response["body"]["description"], "boom");
    assert_eq!(response["body"]["breakMode"], "unhandled");

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);
    session.client.wait_for_event("exited")?;
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_step_over() -> anyhow::Result<()> {
    let program = write_fixture(
        "dapper_it_step.scr",
        "x = 1\nx = 2\nx = 3\nprint x\n",
    );
    let mut session = DapSession::start()?;
    let thread_id = launch_with_breakpoint(&mut session, &program, json!([{ "line": 1 }]))?;

    let response = session
        .client
        .request("next", json!({ "threadId": thread_id }))?;
    assert_response(&response, "next", true);
    let stopped = session.client.wait_for_event("stopped")?;
    assert_eq!(stopped["body"]["reason"], "step");

    let response = session
        .client
        .request("stackTrace", json!({ "threadId": thread_id }))?;
    assert_eq!(response["body"]["stackFrames"][0]["line"], 2);

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);
    session.client.wait_for_event("exited")?;
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_data_breakpoint_fires_on_change() -> anyhow::Result<()> {
    let program = write_fixture(
        "dapper_it_watch.scr",
        "count = 1\ncount = 1\ncount = 2\nprint count\n",
    );
    let mut session = DapSession::start()?;
    let thread_id = launch_with_breakpoint(&mut session, &program, json!([{ "line": 1 }]))?;

    let response = session
        .client
        .request("stackTrace", json!({ "threadId": thread_id }))?;
    let frame_id = response["body"]["stackFrames"][0]["id"].as_i64().unwrap();

    let response = session.client.request(
        "dataBreakpointInfo",
        json!({ "name": "count", "frameId": frame_id }),
    )?;
    assert_response(&response, "dataBreakpointInfo", true);
    let data_id = response["body"]["dataId"].as_str().unwrap().to_string();
    assert_eq!(data_id, format!("frame:{frame_id}:var:count"));
    assert_eq!(response["body"]["canPersist"], false);

    let response = session.client.request(
        "setDataBreakpoints",
        json!({ "breakpoints": [{ "dataId": data_id }] }),
    )?;
    assert_response(&response, "setDataBreakpoints", true);
    assert_eq!(response["body"]["breakpoints"][0]["verified"], true);

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);

    let stopped = session.client.wait_for_event("stopped")?;
    assert_eq!(stopped["body"]["reason"], "data breakpoint");

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);
    session.client.wait_for_event("exited")?;
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_external_backend_round_trip() -> anyhow::Result<()> {
    // Full external-mode flow: spawn the launcher child over a socket
    // transport, stop at a breakpoint, inspect over correlated IPC
    // commands, resume to completion.
    let program = write_fixture(
        "dapper_it_external.scr",
        "a = 7\nb = a * 6\nprint b\n",
    );
    let mut session = DapSession::start()?;
    initialize(&mut session)?;
    let response = session.client.request(
        "launch",
        json!({ "program": program, "useIpc": true, "useBinaryIpc": true }),
    )?;
    assert_response(&response, "launch", true);

    let response = session.client.request(
        "setBreakpoints",
        json!({ "source": { "path": program }, "breakpoints": [{ "line": 3 }] }),
    )?;
    assert_response(&response, "setBreakpoints", true);
    let response = session.client.request("configurationDone", json!({}))?;
    assert_response(&response, "configurationDone", true);

    let stopped = session.client.wait_for_event("stopped")?;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    let thread_id = stopped["body"]["threadId"].as_i64().unwrap();

    let response = session
        .client
        .request("stackTrace", json!({ "threadId": thread_id }))?;
    assert_response(&response, "stackTrace", true);
    let frame = &response["body"]["stackFrames"][0];
    assert_eq!(frame["line"], 3);
    let frame_id = frame["id"].as_i64().unwrap();

    let response = session
        .client
        .request("scopes", json!({ "frameId": frame_id }))?;
    assert_response(&response, "scopes", true);
    let locals_ref = response["body"]["scopes"][0]["variablesReference"]
        .as_i64()
        .unwrap();

    let response = session
        .client
        .request("variables", json!({ "variablesReference": locals_ref }))?;
    assert_response(&response, "variables", true);
    let variables = response["body"]["variables"].as_array().unwrap();
    let b = variables.iter().find(|v| v["name"] == "b").unwrap();
    assert_eq!(b["value"], "42");

    let response = session.client.request(
        "evaluate",
        json!({ "expression": "b + 1", "frameId": frame_id, "context": "repl" }),
    )?;
    assert_response(&response, "evaluate", true);
    assert_eq!(response["body"]["result"], "43");

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);
    session.client.wait_for_event("exited")?;
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_loaded_sources_and_modules() -> anyhow::Result<()> {
    let program = write_fixture("dapper_it_sources.scr", "x = 1\nprint x\n");
    let mut session = DapSession::start()?;
    let thread_id = launch_with_breakpoint(&mut session, &program, json!([{ "line": 2 }]))?;

    let response = session.client.request("loadedSources", json!({}))?;
    assert_response(&response, "loadedSources", true);
    let sources = response["body"]["sources"].as_array().unwrap();
    assert!(sources
        .iter()
        .any(|s| s["name"] == "dapper_it_sources.scr"));

    let response = session.client.request("modules", json!({}))?;
    assert_response(&response, "modules", true);
    assert!(response["body"]["totalModules"].as_u64().unwrap() >= 1);

    let response = session.client.request(
        "source",
        json!({ "source": { "path": program } }),
    )?;
    assert_response(&response, "source", true);
    assert!(response["body"]["content"]
        .as_str()
        .unwrap()
        .contains("x = 1"));

    let response = session
        .client
        .request("continue", json!({ "threadId": thread_id }))?;
    assert_response(&response, "continue", true);
    session.client.wait_for_event("exited")?;
    session.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_restart_emits_terminated_with_restart_flag() -> anyhow::Result<()> {
    let program = write_fixture("dapper_it_restart.scr", "x = 1\nprint x\n");
    let mut session = DapSession::start()?;
    let _thread_id = launch_with_breakpoint(&mut session, &program, json!([{ "line": 2 }]))?;

    let response = session.client.request("restart", json!({}))?;
    assert_response(&response, "restart", true);
    let event = session.client.wait_for_event("terminated")?;
    assert_eq!(event["body"]["restart"], true);
    session.shutdown();
    Ok(())
}
