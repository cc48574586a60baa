//! Async connection tests over an in-memory transport.
//!
//! The transport replays a canned server: the greeting is readable from the
//! start and every write releases the next scripted reply.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use asupersync::types::CancelKind;
use asupersync::{Cx, Outcome};
use sqlwire_core::{ConnectionErrorKind, Error, IsolationLevel, Value};
use sqlwire_mysql::buffer::Buffer;
use sqlwire_mysql::column::FieldType;
use sqlwire_mysql::protocol::{capabilities, frame_payload, server_status};
use sqlwire_mysql::{Connection, ConnectionState, MySqlConfig, Transport};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug, Clone, Default)]
struct Wire {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Wire {
    fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().expect("wire lock").clone()
    }

    /// Command byte of each write, skipping the handshake response.
    fn commands(&self) -> Vec<u8> {
        self.writes().iter().skip(1).map(|w| w[4]).collect()
    }
}

#[derive(Debug)]
struct ScriptedServer {
    inbound: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    wire: Wire,
}

impl ScriptedServer {
    fn new(replies: Vec<Vec<u8>>) -> (Self, Wire) {
        let wire = Wire::default();
        let server = Self {
            inbound: greeting().into_iter().collect(),
            replies: replies.into(),
            wire: wire.clone(),
        };
        (server, wire)
    }
}

impl Transport for ScriptedServer {
    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.wire.writes.lock().expect("wire lock").push(buf.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            self.inbound.extend(reply);
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut s = seq.wrapping_sub(1);
    frame_payload(payload, &mut s, &mut out);
    out
}

fn greeting() -> Vec<u8> {
    let caps = capabilities::DEFAULT_CLIENT_FLAGS;
    let scramble = b"ABCDEFGHIJKLMNOPQRST";
    let mut buf = Buffer::new();
    buf.put_u8(10);
    buf.put_null_terminated(b"8.0.36-test");
    buf.put_u32(314);
    buf.put_bytes(&scramble[..8]);
    buf.put_u8(0);
    buf.put_u16((caps & 0xFFFF) as u16);
    buf.put_u8(45);
    buf.put_u16(2);
    buf.put_u16((caps >> 16) as u16);
    buf.put_u8(21);
    buf.put_zeros(10);
    buf.put_bytes(&scramble[8..]);
    buf.put_u8(0);
    buf.put_null_terminated(b"mysql_native_password");
    packet(0, buf.written())
}

fn ok(seq: u8, affected: u8, status: u16) -> Vec<u8> {
    let [lo, hi] = status.to_le_bytes();
    packet(seq, &[0x00, affected, 0x00, lo, hi, 0x00, 0x00])
}

fn eof_ok(seq: u8, status: u16) -> Vec<u8> {
    let [lo, hi] = status.to_le_bytes();
    packet(seq, &[0xFE, 0x00, 0x00, lo, hi, 0x00, 0x00])
}

fn column(seq: u8, name: &str, ty: FieldType) -> Vec<u8> {
    let mut buf = Buffer::new();
    for part in ["def", "shop", "t", "t", name, name] {
        buf.put_lenenc_str(part);
    }
    buf.put_lenenc_int(0x0c);
    buf.put_u16(45);
    buf.put_u32(255);
    buf.put_u8(ty as u8);
    buf.put_u16(0);
    buf.put_u8(0);
    buf.put_zeros(2);
    packet(seq, buf.written())
}

fn text_row(seq: u8, cells: &[&str]) -> Vec<u8> {
    let mut buf = Buffer::new();
    for cell in cells {
        buf.put_lenenc_str(cell);
    }
    packet(seq, buf.written())
}

/// `SELECT id, name` answered with two rows.
fn users_result(status: u16) -> Vec<u8> {
    let mut out = packet(1, &[2]);
    out.extend(column(2, "id", FieldType::LongLong));
    out.extend(column(3, "name", FieldType::VarString));
    out.extend(text_row(4, &["1", "ada"]));
    out.extend(text_row(5, &["2", "grace"]));
    out.extend(eof_ok(6, status));
    out
}

const AUTOCOMMIT: u16 = server_status::SERVER_STATUS_AUTOCOMMIT;

fn config() -> MySqlConfig {
    MySqlConfig::new().user("app").password("secret")
}

#[test]
fn session_runs_commands_in_order() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    let (server, wire) = ScriptedServer::new(vec![
        ok(2, 0, AUTOCOMMIT),
        users_result(AUTOCOMMIT),
        ok(1, 3, AUTOCOMMIT),
        ok(1, 0, AUTOCOMMIT),
        vec![],
    ]);

    rt.block_on(async {
        let mut conn = unwrap_outcome(Connection::connect(&cx, server, config()).await);
        assert_eq!(conn.state(), ConnectionState::Ok);
        let info = conn.server_info().expect("server info");
        assert_eq!(info.server_version, "8.0.36-test");
        assert_eq!(info.connection_id, 314);
        assert!(!conn.is_secure());

        let rows = unwrap_outcome(conn.query(&cx, "SELECT id, name FROM users").await);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get_named::<String>("name").unwrap(), "grace");

        let summary = unwrap_outcome(conn.execute(&cx, "UPDATE users SET active = 1").await);
        assert_eq!(summary.affected_rows, 3);

        unwrap_outcome(conn.ping(&cx).await);
        unwrap_outcome(conn.close(&cx).await);
    });

    assert_eq!(wire.commands(), vec![0x03, 0x03, 0x0e, 0x01]);
}

#[test]
fn row_stream_reads_incrementally() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (server, _wire) = ScriptedServer::new(vec![ok(2, 0, AUTOCOMMIT), users_result(AUTOCOMMIT)]);

    rt.block_on(async {
        let mut conn = unwrap_outcome(Connection::connect(&cx, server, config()).await);
        let mut stream = unwrap_outcome(conn.query_stream(&cx, "SELECT id, name FROM users").await);
        assert_eq!(stream.columns().len(), 2);

        let mut ids = Vec::new();
        while let Some(row) = unwrap_outcome(stream.next(&cx).await) {
            ids.push(row.get_as::<i64>(0).unwrap());
        }
        assert_eq!(ids, vec![1, 2]);
        assert!(stream.is_done());
        assert_eq!(stream.summaries().len(), 1);
    });
}

#[test]
fn transaction_statements_track_state() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let in_trans = AUTOCOMMIT | server_status::SERVER_STATUS_IN_TRANS;
    let (server, wire) = ScriptedServer::new(vec![
        ok(2, 0, AUTOCOMMIT),
        // SET TRANSACTION ISOLATION LEVEL, then START TRANSACTION
        ok(1, 0, AUTOCOMMIT),
        ok(1, 0, in_trans),
        ok(1, 0, AUTOCOMMIT),
    ]);

    rt.block_on(async {
        let mut conn = unwrap_outcome(Connection::connect(&cx, server, config()).await);
        unwrap_outcome(
            conn.begin_with(&cx, Some(IsolationLevel::Serializable))
                .await,
        );
        assert!(conn.in_transaction());

        match conn.begin(&cx).await {
            Outcome::Err(e) => assert!(e.is_usage_error()),
            other => panic!("nested begin should fail: {other:?}"),
        }

        unwrap_outcome(conn.commit(&cx).await);
        assert!(!conn.in_transaction());
        assert!(matches!(conn.rollback(&cx).await, Outcome::Err(e) if e.is_usage_error()));
    });

    let writes = wire.writes();
    assert_eq!(
        &writes[1][5..],
        b"SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
    );
    assert_eq!(&writes[2][5..], b"START TRANSACTION");
    assert_eq!(&writes[3][5..], b"COMMIT");
}

#[test]
fn peer_close_fails_the_running_query() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    // Column count arrives, then the server disappears.
    let (server, _wire) = ScriptedServer::new(vec![ok(2, 0, AUTOCOMMIT), packet(1, &[2])]);

    rt.block_on(async {
        let mut conn = unwrap_outcome(Connection::connect(&cx, server, config()).await);
        match conn.query(&cx, "SELECT id, name FROM users").await {
            Outcome::Err(Error::Connection(c)) => {
                assert_eq!(c.kind, ConnectionErrorKind::Disconnected);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Unusable);
        assert!(matches!(conn.ping(&cx).await, Outcome::Err(e) if e.is_going_away()));
    });
}

#[test]
fn cancelled_context_touches_nothing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (server, wire) = ScriptedServer::new(vec![ok(2, 0, AUTOCOMMIT)]);

    rt.block_on(async {
        let mut conn = unwrap_outcome(Connection::connect(&cx, server, config()).await);
        cx.cancel_with(CancelKind::User, Some("test cancel"));
        assert!(matches!(
            conn.query(&cx, "SELECT 1").await,
            Outcome::Cancelled(_)
        ));
        // The submitted query never reached the wire, but the session is
        // no longer trusted.
        assert_eq!(conn.state(), ConnectionState::Unusable);
    });

    assert_eq!(wire.writes().len(), 1);
}

#[test]
fn quote_follows_session_mode() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (server, _wire) = ScriptedServer::new(vec![ok(2, 0, AUTOCOMMIT)]);

    rt.block_on(async {
        let conn = unwrap_outcome(Connection::connect(&cx, server, config()).await);
        assert_eq!(
            conn.quote(&Value::Text("it's".into())).unwrap(),
            "'it\\'s'"
        );
    });
}
