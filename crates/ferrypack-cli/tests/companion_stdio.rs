//! Integration tests for `ferrypack companion`.
//!
//! Drives the companion over its stdin/stdout with length-prefixed frames.

use ferrypack_proto::{
    codes, read_frame, write_frame, CompileOptions, Frame, FrameResponse, Request, Response,
    PROTO_SCHEMA_VERSION,
};
use std::process::{Command, Stdio};

#[test]
fn test_companion_speaks_frame_protocol() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_ferrypack"))
        .arg("companion")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start companion");
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = child.stdout.take().unwrap();

    write_frame(&mut stdin, &Frame::new("test", Request::Ping { nonce: 42 })).unwrap();
    let pong: FrameResponse = read_frame(&mut stdout).unwrap();
    assert_eq!(pong.hello.proto_schema_version, PROTO_SCHEMA_VERSION);
    assert!(matches!(pong.response, Response::Pong { nonce: 42, .. }));

    let compile = Request::Compile {
        id: 1,
        path: "/definitely/not/here/Main.purs".into(),
        source: None,
        options: CompileOptions::new("purs"),
    };
    write_frame(&mut stdin, &Frame::new("test", compile)).unwrap();
    let reply: FrameResponse = read_frame(&mut stdout).unwrap();
    match reply.response {
        Response::Error { code, .. } => assert_eq!(code, codes::SOURCE_NOT_FOUND),
        other => panic!("unexpected response: {other:?}"),
    }

    write_frame(&mut stdin, &Frame::new("test", Request::Shutdown)).unwrap();
    let ack: FrameResponse = read_frame(&mut stdout).unwrap();
    assert!(matches!(ack.response, Response::ShutdownAck));

    drop(stdin);
    let status = child.wait().unwrap();
    assert!(status.success());
}

#[test]
fn test_version_json() {
    let output = Command::new(env!("CARGO_BIN_EXE_ferrypack"))
        .args(["version", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value =
        serde_json::from_str(&String::from_utf8_lossy(&output.stdout)).unwrap();
    assert_eq!(json["name"], "ferrypack");
    assert!(json["version"].is_string());
}
