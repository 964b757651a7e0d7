//! End-to-end protocol tests: drive the dispatcher over an in-memory duplex
//! socket against the `reference` session backend, exercising the
//! scenarios from spec §8.

use bytes::{Buf, BufMut, BytesMut};
use doorframe::connection::{Connection, ConnectionRegistry};
use doorframe::reference_engine::ReferenceSessionFactory;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;

const PROTOCOL_VERSION: i32 = 196_608;

fn encode_startup(params: &[(&str, &str)]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION);
    for (k, v) in params {
        body.put_slice(k.as_bytes());
        body.put_u8(0);
        body.put_slice(v.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    let mut out = BytesMut::new();
    out.put_i32(4 + body.len() as i32);
    out.put_slice(&body);
    out
}

fn encode_frame(msg_type: u8, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(msg_type);
    out.put_i32(4 + body.len() as i32);
    out.put_slice(body);
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

struct RawFrame {
    msg_type: u8,
    body: BytesMut,
}

async fn read_frame(stream: &mut DuplexStream) -> RawFrame {
    let msg_type = stream.read_u8().await.unwrap();
    let len = stream.read_i32().await.unwrap();
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await.unwrap();
    RawFrame {
        msg_type,
        body: BytesMut::from(&body[..]),
    }
}

fn read_cstr(body: &mut BytesMut) -> String {
    let end = body.as_ref().iter().position(|b| *b == 0).unwrap();
    let s = String::from_utf8_lossy(&body[..end]).into_owned();
    body.advance(end + 1);
    s
}

/// Spawn a `Connection` wired to the reference backend over a duplex
/// stream and drive it through startup + cleartext auth. Returns the
/// client-side half positioned right after `ReadyForQuery`.
async fn connected_client(pid: i32) -> DuplexStream {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let registry: ConnectionRegistry = Arc::new(dashmap::DashMap::new());
    let session_factory = Arc::new(ReferenceSessionFactory);
    let (_tx, rx) = broadcast::channel::<()>(1);

    tokio::spawn(async move {
        let mut conn = Connection::new(
            server,
            pid,
            4242,
            "test".to_string(),
            registry,
            session_factory,
            "8.4.7".to_string(),
            Arc::new(doorframe::stats::Stats::default()),
            true,
        );
        let startup = conn.read_next_startup().await.unwrap();
        let params = match startup {
            doorframe::messages::StartupFrame::Startup(body) => {
                doorframe::connection::parse_startup_params(body).unwrap()
            }
            _ => panic!("expected a regular startup frame"),
        };
        conn.run(params, rx).await.unwrap();
    });

    let mut client = client;
    let startup = encode_startup(&[
        ("user", "alice"),
        ("database", "test"),
        ("client_encoding", "UNICODE"),
    ]);
    client.write_all(&startup).await.unwrap();

    // AuthenticationCleartextPassword
    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'R');

    let password = encode_frame(b'p', &cstr("anything"));
    client.write_all(&password).await.unwrap();

    // AuthenticationOk
    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'R');

    // 4 ParameterStatus frames: client_encoding, server_encoding,
    // server_version, session_authorization.
    let mut seen = Vec::new();
    for _ in 0..4 {
        let mut f = read_frame(&mut client).await;
        assert_eq!(f.msg_type, b'S');
        seen.push(read_cstr(&mut f.body));
    }
    assert_eq!(
        seen,
        vec![
            "client_encoding".to_string(),
            "server_encoding".to_string(),
            "server_version".to_string(),
            "session_authorization".to_string(),
        ]
    );

    // BackendKeyData
    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'K');

    // ReadyForQuery('I')
    let mut f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'Z');
    assert_eq!(f.body[0], b'I');

    client
}

#[tokio::test]
async fn startup_and_auth_handshake() {
    // `connected_client` itself asserts the full scenario-1 frame sequence.
    let _client = connected_client(1).await;
}

#[tokio::test]
async fn odbc_lo_probe_short_circuits() {
    let mut client = connected_client(2).await;

    let query = encode_frame(
        b'Q',
        &cstr("select oid, typbasetype from pg_type where typname = 'lo'"),
    );
    client.write_all(&query).await.unwrap();

    let mut f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'C');
    assert_eq!(read_cstr(&mut f.body), "SELECT");

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'Z');
}

#[tokio::test]
async fn simple_select_returns_row() {
    let mut client = connected_client(3).await;

    let query = encode_frame(b'Q', &cstr("SELECT 1"));
    client.write_all(&query).await.unwrap();

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'T');

    let mut f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'D');
    let n_cols = f.body.get_i16();
    assert_eq!(n_cols, 1);
    let len = f.body.get_i32();
    let value = String::from_utf8(f.body[..len as usize].to_vec()).unwrap();
    assert_eq!(value, "1");

    let mut f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'C');
    assert_eq!(read_cstr(&mut f.body), "SELECT");

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'Z');
}

#[tokio::test]
async fn extended_query_happy_path() {
    let mut client = connected_client(4).await;

    // Parse "" "SELECT 1" 0
    let mut parse_body = cstr("");
    parse_body.extend(cstr("SELECT 1"));
    parse_body.extend(0i16.to_be_bytes());
    client
        .write_all(&encode_frame(b'P', &parse_body))
        .await
        .unwrap();

    // Bind "" "" 0 0 0
    let mut bind_body = cstr("");
    bind_body.extend(cstr(""));
    bind_body.extend(0i16.to_be_bytes()); // n param formats
    bind_body.extend(0i16.to_be_bytes()); // n params
    bind_body.extend(0i16.to_be_bytes()); // n result formats
    client
        .write_all(&encode_frame(b'B', &bind_body))
        .await
        .unwrap();

    // Describe P ""
    let mut describe_body = vec![b'P'];
    describe_body.extend(cstr(""));
    client
        .write_all(&encode_frame(b'D', &describe_body))
        .await
        .unwrap();

    // Execute "" 0
    let mut execute_body = cstr("");
    execute_body.extend(0i32.to_be_bytes());
    client
        .write_all(&encode_frame(b'E', &execute_body))
        .await
        .unwrap();

    client.write_all(&encode_frame(b'S', &[])).await.unwrap();

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'1'); // ParseComplete

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'2'); // BindComplete

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'T'); // RowDescription from Describe

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'D'); // DataRow from Execute

    let mut f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'C');
    assert_eq!(read_cstr(&mut f.body), "SELECT");

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'Z'); // ReadyForQuery from Sync
}

#[tokio::test]
async fn parse_error_inside_extended_enters_skip_until_sync() {
    let mut client = connected_client(5).await;

    let mut parse_body = cstr("");
    parse_body.extend(cstr("NOT SQL"));
    parse_body.extend(0i16.to_be_bytes());
    client
        .write_all(&encode_frame(b'P', &parse_body))
        .await
        .unwrap();

    let mut describe_body = vec![b'S'];
    describe_body.extend(cstr(""));
    client
        .write_all(&encode_frame(b'D', &describe_body))
        .await
        .unwrap();

    client.write_all(&encode_frame(b'S', &[])).await.unwrap();

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'E'); // ErrorResponse: NOT SQL doesn't start with SELECT

    // Describe was discarded; next frame is ReadyForQuery from the Sync.
    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'Z');
}

#[tokio::test]
async fn binary_parameter_is_rejected() {
    let mut client = connected_client(6).await;

    let mut parse_body = cstr("");
    parse_body.extend(cstr("SELECT $1"));
    parse_body.extend(1i16.to_be_bytes());
    parse_body.extend(23i32.to_be_bytes()); // int4 oid

    client
        .write_all(&encode_frame(b'P', &parse_body))
        .await
        .unwrap();
    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'1');

    let mut bind_body = cstr("");
    bind_body.extend(cstr(""));
    bind_body.extend(1i16.to_be_bytes()); // n param formats
    bind_body.extend(1i16.to_be_bytes()); // binary
    bind_body.extend(1i16.to_be_bytes()); // n params
    bind_body.extend(4i32.to_be_bytes()); // param length
    bind_body.extend(42i32.to_be_bytes()); // 4 raw bytes
    bind_body.extend(0i16.to_be_bytes()); // n result formats

    client
        .write_all(&encode_frame(b'B', &bind_body))
        .await
        .unwrap();
    client.write_all(&encode_frame(b'S', &[])).await.unwrap();

    let mut f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'E');
    assert_eq!(read_cstr_field(&mut f.body), "Don't know how to parse binary format.");

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'Z');
}

/// `ErrorResponse`'s body is `byte field-id, cstr, ... 0`; pull out the `M`
/// field's text.
fn read_cstr_field(body: &mut BytesMut) -> String {
    loop {
        let field = body.get_u8();
        if field == 0 {
            panic!("no M field found in ErrorResponse");
        }
        let s = read_cstr(body);
        if field == b'M' {
            return s;
        }
    }
}

#[tokio::test]
async fn close_of_absent_name_is_a_silent_no_op() {
    let mut client = connected_client(7).await;

    let mut close_body = vec![b'S'];
    close_body.extend(cstr("never-registered"));
    client
        .write_all(&encode_frame(b'C', &close_body))
        .await
        .unwrap();

    let f = read_frame(&mut client).await;
    assert_eq!(f.msg_type, b'3'); // CloseComplete
}

#[tokio::test]
async fn cancel_request_sets_target_flag_only_on_secret_match() {
    let registry: ConnectionRegistry = Arc::new(dashmap::DashMap::new());
    let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));
    registry.insert(
        100,
        doorframe::connection::ConnectionHandle {
            secret_key: 777,
            cancel: cancel.clone(),
        },
    );

    doorframe::connection::handle_cancel_request(&registry, 100, 1);
    assert!(!cancel.load(std::sync::atomic::Ordering::SeqCst));

    doorframe::connection::handle_cancel_request(&registry, 999, 777);
    assert!(!cancel.load(std::sync::atomic::Ordering::SeqCst));

    doorframe::connection::handle_cancel_request(&registry, 100, 777);
    assert!(cancel.load(std::sync::atomic::Ordering::SeqCst));
}
