//! Integration tests for assuan-ipc.
//!
//! These drive full conversations between a server and a client over an
//! in-process socket pair, checking both the high-level role APIs and the
//! literal bytes on the wire.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::thread::JoinHandle;

use assuan_ipc::{transport, Client, Error, Server};

/// Spawn the server loop on its own thread.
fn serve(mut server: Server) -> JoinHandle<assuan_ipc::Result<()>> {
    std::thread::spawn(move || server.process())
}

fn shutdown(mut client: Client, server: JoinHandle<assuan_ipc::Result<()>>) {
    client.transact("BYE").run().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn nop_replies_ok_on_the_wire() {
    let (server, mut client) = transport::socketpair().unwrap();
    let server = serve(server);

    client.send_raw("NOP").unwrap();
    assert_eq!(client.receive_line().unwrap(), b"OK");

    shutdown(client, server);
}

#[test]
fn echo_routes_data_to_sink() {
    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command("ECHO", |ctx, args| ctx.write_data(args.as_bytes()), None)
        .unwrap();
    let server = serve(server);

    let mut received = Vec::new();
    client
        .transact("ECHO hello world")
        .on_data(|bytes| {
            received.extend_from_slice(bytes);
            Ok(())
        })
        .run()
        .unwrap();
    assert_eq!(received, b"hello world");

    shutdown(client, server);
}

#[test]
fn echo_wire_shape() {
    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command("ECHO", |ctx, args| ctx.write_data(args.as_bytes()), None)
        .unwrap();
    let server = serve(server);

    client.send_raw("ECHO hello world").unwrap();
    assert_eq!(client.receive_line().unwrap(), b"D hello world");
    assert_eq!(client.receive_line().unwrap(), b"OK");

    shutdown(client, server);
}

#[test]
fn inquiry_roundtrip_decodes_payload() {
    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command(
            "GETDATA",
            |ctx, _args| {
                let payload = ctx.inquire("NEED", "3", 0)?;
                assert_eq!(payload, b"ab%c\r");
                Ok(())
            },
            None,
        )
        .unwrap();
    let server = serve(server);

    client
        .transact("GETDATA")
        .on_inquire(|keyword, args, responder| {
            assert_eq!(keyword, "NEED");
            assert_eq!(args, "3");
            responder.data(b"ab%c")?;
            responder.data(b"\r")
        })
        .run()
        .unwrap();

    shutdown(client, server);
}

#[test]
fn unknown_command_wire_line() {
    let (server, mut client) = transport::socketpair().unwrap();
    let server = serve(server);

    client.send_raw("UNKNOWN foo").unwrap();
    assert_eq!(
        client.receive_line().unwrap(),
        b"ERR 275 Unknown command"
    );

    shutdown(client, server);
}

#[test]
fn cancel_mid_inquiry_wire_line() {
    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command(
            "GETDATA",
            |ctx, _args| {
                // The inquiry is aborted by the client; propagate that as
                // the command outcome.
                let err = ctx.inquire("NEED", "3", 0).unwrap_err();
                assert_eq!(err, Error::Canceled);
                Err(err)
            },
            None,
        )
        .unwrap();
    let server = serve(server);

    client.send_raw("GETDATA").unwrap();
    assert_eq!(client.receive_line().unwrap(), b"INQUIRE NEED 3");
    client.send_raw("CANCEL").unwrap();
    assert_eq!(client.receive_line().unwrap(), b"ERR 99 canceled");

    shutdown(client, server);
}

#[test]
fn large_payload_splits_into_bounded_data_lines() {
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command(
            "BIGDATA",
            move |ctx, _args| ctx.write_data(&payload),
            None,
        )
        .unwrap();
    let server = serve(server);

    client.send_raw("BIGDATA").unwrap();
    let mut data_lines = 0;
    let mut decoded = Vec::new();
    loop {
        let line = client.receive_line().unwrap();
        // Lines arrive without their LF; the wire line is one byte longer.
        assert!(line.len() + 1 <= 1002, "wire line within the envelope");
        assert!(!line.contains(&b'\n'), "no embedded terminator");
        if let Some(encoded) = line.strip_prefix(b"D ") {
            data_lines += 1;
            decoded.extend(assuan_ipc::protocol::decode_percent(encoded).unwrap());
        } else {
            assert_eq!(line, b"OK");
            break;
        }
    }
    assert!(data_lines >= 5, "5000 bytes need at least 5 lines");
    assert_eq!(decoded, expected);

    shutdown(client, server);
}

#[test]
fn reply_discipline_one_terminal_per_command() {
    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command(
            "STATS",
            |ctx, _args| {
                ctx.write_status("ALPHA", "1")?;
                ctx.write_data(b"payload")?;
                ctx.write_status("BETA", "2")
            },
            None,
        )
        .unwrap();
    let server = serve(server);

    for _ in 0..3 {
        client.send_raw("STATS").unwrap();
        let mut terminals = 0;
        loop {
            let line = client.receive_line().unwrap();
            if line.starts_with(b"OK") || line.starts_with(b"ERR") {
                terminals += 1;
                break;
            }
        }
        assert_eq!(terminals, 1);
    }

    shutdown(client, server);
}

#[test]
fn nop_has_no_side_effects() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command(
            "COUNT",
            move |_ctx, _args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            None,
        )
        .unwrap();
    let server = serve(server);

    client.transact("COUNT").run().unwrap();
    for _ in 0..5 {
        client.transact("NOP").run().unwrap();
    }
    client.transact("COUNT").run().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    shutdown(client, server);
}

#[test]
fn descriptor_travels_with_command_line() {
    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command(
            "TAKEFD",
            |ctx, _args| {
                let fd = ctx.receive_fd()?;
                let mut stream = UnixStream::from(fd);
                let mut buf = [0u8; 16];
                let n = stream.read(&mut buf).map_err(|_| Error::General)?;
                ctx.write_data(&buf[..n])
            },
            None,
        )
        .unwrap();
    let server = serve(server);

    let (ours, theirs) = UnixStream::pair().unwrap();
    client.send_fd(theirs.as_fd()).unwrap();
    drop(theirs);

    let mut ours_writer = ours.try_clone().unwrap();
    ours_writer.write_all(b"over the wall").unwrap();

    let mut echoed = Vec::new();
    client
        .transact("TAKEFD")
        .on_data(|bytes| {
            echoed.extend_from_slice(bytes);
            Ok(())
        })
        .run()
        .unwrap();
    assert_eq!(echoed, b"over the wall");

    shutdown(client, server);
}

#[test]
fn nested_inquiry_refused_first_unaffected() {
    let (mut server, mut client) = transport::socketpair().unwrap();
    server
        .register_command(
            "DOUBLE",
            |ctx, _args| {
                let first = ctx.inquire("FIRST", "", 0)?;
                // The first inquiry resolved; a follow-up is fine.
                let second = ctx.inquire("SECOND", "", 0)?;
                ctx.write_data(&first)?;
                ctx.write_data(&second)
            },
            None,
        )
        .unwrap();
    let server = serve(server);

    let mut collected = Vec::new();
    client
        .transact("DOUBLE")
        .on_inquire(|keyword, _args, responder| {
            responder.data(keyword.as_bytes())
        })
        .on_data(|bytes| {
            collected.extend_from_slice(bytes);
            Ok(())
        })
        .run()
        .unwrap();
    assert_eq!(collected, b"FIRSTSECOND");

    shutdown(client, server);
}

#[test]
fn spawned_pipe_server_full_conversation() {
    // The peer is a shell one-liner speaking just enough of the protocol
    // over its stdio to answer ECHO and BYE.
    let script = r#"while IFS= read -r line; do
  set -- $line
  case "$1" in
    NOP) printf 'OK\n';;
    ECHO) shift; printf 'D %s\nOK\n' "$*";;
    BYE) printf 'OK\n'; exit 0;;
    *) printf 'ERR 275 Unknown command\n';;
  esac
done"#;
    let (mut client, pid) =
        transport::pipe_client("/bin/sh", &["-c".to_owned(), script.to_owned()], &[]).unwrap();
    assert!(pid > 0);
    assert_eq!(client.peer_pid(), Some(pid));

    let mut received = Vec::new();
    client
        .transact("ECHO across processes")
        .on_data(|bytes| {
            received.extend_from_slice(bytes);
            Ok(())
        })
        .run()
        .unwrap();
    assert_eq!(received, b"across processes");

    assert_eq!(
        client.transact("FROBNICATE").run(),
        Err(Error::UnknownCommand)
    );

    client.transact("BYE").run().unwrap();
}
