//! End-to-end tests for the control-socket transport
//!
//! These tests drive the public `listen`/`connect` API the way the client and
//! daemon do, once per backend available on the host:
//! 1. Rendezvous rules (name in use, missing listener, re-listen after close)
//! 2. A full request/reply exchange and orderly shutdown
//! 3. Backend-specific behavior (deadlines, handshake rejection)

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ctlsock::{connect, listen, BackendKind, Conn, ConnectionStrategy, Error, Listener};

/// Time any single step may take before the test counts as hung
const STEP: Duration = Duration::from_secs(2);

fn strategy(backend: BackendKind, dir: &Path, name: &str) -> ConnectionStrategy {
    ConnectionStrategy::at(backend, dir.join(name))
}

/// Accept one peer while `connect` runs, returning both ends
async fn pair(listener: &dyn Listener, strategy: &ConnectionStrategy) -> (Box<dyn Conn>, Box<dyn Conn>) {
    let (server, client) = tokio::join!(
        tokio::time::timeout(STEP, listener.accept()),
        tokio::time::timeout(STEP, connect(strategy)),
    );
    (
        server.expect("accept timed out").expect("accept failed"),
        client.expect("connect timed out").expect("connect failed"),
    )
}

/// Read exactly `len` bytes
async fn read_exact(conn: &dyn Conn, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        let want = (len - out.len()).min(buf.len());
        let n = tokio::time::timeout(STEP, conn.read(&mut buf[..want]))
            .await
            .expect("read timed out")
            .expect("read failed");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

async fn second_listen_is_refused(backend: BackendKind) {
    let dir = tempfile::tempdir().unwrap();
    let strategy = strategy(backend, dir.path(), "busy.sock");

    let first = listen(&strategy).await.unwrap();
    let err = listen(&strategy).await.err().expect("second listen succeeded");
    assert!(matches!(err, Error::PathInUse(_)), "got {err:?}");

    first.close().await.unwrap();
    let again = listen(&strategy).await.unwrap();
    again.close().await.unwrap();
}

async fn connect_without_listener(backend: BackendKind) {
    let dir = tempfile::tempdir().unwrap();
    let strategy = strategy(backend, dir.path(), "nobody.sock");

    let err = connect(&strategy).await.err().expect("connect succeeded");
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}

async fn ping_pong(backend: BackendKind) {
    let dir = tempfile::tempdir().unwrap();
    let strategy = strategy(backend, dir.path(), "ping.sock");
    let listener = listen(&strategy).await.unwrap();

    let (server, client) = pair(listener.as_ref(), &strategy).await;
    assert_eq!(server.addr(), strategy.display_name());
    assert_eq!(client.addr(), strategy.display_name());

    client.write_all(b"PING").await.unwrap();
    assert_eq!(read_exact(server.as_ref(), 4).await, b"PING");

    server.write_all(b"PONG").await.unwrap();
    assert_eq!(read_exact(client.as_ref(), 4).await, b"PONG");

    server.close().await.unwrap();
    let mut buf = [0u8; 4];
    let end = tokio::time::timeout(STEP, client.read(&mut buf)).await.unwrap();
    assert!(matches!(end, Err(Error::EndOfStream)), "got {end:?}");

    client.close().await.unwrap();
    listener.close().await.unwrap();
}

async fn close_unblocks_accept(backend: BackendKind) {
    let dir = tempfile::tempdir().unwrap();
    let strategy = strategy(backend, dir.path(), "idle.sock");
    let listener: std::sync::Arc<dyn Listener> = listen(&strategy).await.unwrap().into();

    let waiting = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    listener.close().await.unwrap();
    let outcome = tokio::time::timeout(STEP, waiting).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(Error::Closed)), "got {outcome:?}");

    // Closing twice is harmless
    listener.close().await.unwrap();
}

async fn io_after_close(backend: BackendKind) {
    let dir = tempfile::tempdir().unwrap();
    let strategy = strategy(backend, dir.path(), "closed.sock");
    let listener = listen(&strategy).await.unwrap();
    let (server, client) = pair(listener.as_ref(), &strategy).await;

    client.close().await.unwrap();
    client.close().await.unwrap();

    let mut buf = [0u8; 4];
    assert!(matches!(client.read(&mut buf).await, Err(Error::Closed)));
    assert!(matches!(client.write(b"late").await, Err(Error::Closed)));

    server.close().await.unwrap();
    listener.close().await.unwrap();
}

async fn read_while_writing(backend: BackendKind) {
    let dir = tempfile::tempdir().unwrap();
    let strategy = strategy(backend, dir.path(), "duplex.sock");
    let listener = listen(&strategy).await.unwrap();
    let (server, client) = pair(listener.as_ref(), &strategy).await;
    let server: Arc<dyn Conn> = server.into();

    // Park a read on the server before anything is in flight
    let reading = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut buf = [0u8; 2];
            let n = server.read(&mut buf).await?;
            Ok::<_, Error>(buf[..n].to_vec())
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reading.is_finished());

    // A write from another task goes through while the read is blocked
    let writing = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.write_all(b"out").await })
    };
    tokio::time::timeout(STEP, writing).await.unwrap().unwrap().unwrap();
    assert_eq!(read_exact(client.as_ref(), 3).await, b"out");

    client.write_all(b"in").await.unwrap();
    let got = tokio::time::timeout(STEP, reading).await.unwrap().unwrap().unwrap();
    assert_eq!(got, b"in");

    listener.close().await.unwrap();
}

#[cfg(unix)]
mod local_socket {
    use super::*;

    #[tokio::test]
    async fn test_second_listen_is_refused() {
        second_listen_is_refused(BackendKind::LocalSocket).await;
    }

    #[tokio::test]
    async fn test_connect_without_listener() {
        connect_without_listener(BackendKind::LocalSocket).await;
    }

    #[tokio::test]
    async fn test_ping_pong() {
        ping_pong(BackendKind::LocalSocket).await;
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        close_unblocks_accept(BackendKind::LocalSocket).await;
    }

    #[tokio::test]
    async fn test_io_after_close() {
        io_after_close(BackendKind::LocalSocket).await;
    }

    #[tokio::test]
    async fn test_read_while_writing() {
        read_while_writing(BackendKind::LocalSocket).await;
    }

    #[tokio::test]
    async fn test_socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::LocalSocket, dir.path(), "private.sock");
        let listener = listen(&strategy).await.unwrap();

        let mode = std::fs::metadata(strategy.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        listener.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_listeners_over_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::LocalSocket, dir.path(), "race.sock");

        for _ in 0..20 {
            drop(std::os::unix::net::UnixListener::bind(strategy.path()).unwrap());

            let spawn_listen = || {
                let strategy = strategy.clone();
                tokio::spawn(async move { listen(&strategy).await })
            };
            let (a, b) = (spawn_listen(), spawn_listen());
            let (a, b) = (a.await.unwrap(), b.await.unwrap());

            let (winner, loser) = match (a, b) {
                (Ok(listener), Err(e)) | (Err(e), Ok(listener)) => (listener, e),
                (a, b) => panic!("expected one holder, got ok={} and ok={}", a.is_ok(), b.is_ok()),
            };
            assert!(matches!(loser, Error::PathInUse(_)), "got {loser:?}");

            // The socket on disk is the winner's
            let (server, client) = pair(winner.as_ref(), &strategy).await;
            client.write_all(b"mine").await.unwrap();
            assert_eq!(read_exact(server.as_ref(), 4).await, b"mine");

            winner.close().await.unwrap();
            assert!(!strategy.path().exists());
        }
    }

    #[tokio::test]
    async fn test_silent_peer_does_not_block_others() {
        use interprocess::local_socket::tokio::{prelude::*, Stream};
        use interprocess::local_socket::GenericFilePath;

        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::LocalSocket, dir.path(), "patient.sock")
            .with_handshake_timeout(Duration::from_secs(30));
        let listener = listen(&strategy).await.unwrap();

        let name = strategy.path().to_fs_name::<GenericFilePath>().unwrap();
        let _silent = Stream::connect(name).await.unwrap();

        let (server, client) = pair(listener.as_ref(), &strategy).await;
        client.write_all(b"next").await.unwrap();
        assert_eq!(read_exact(server.as_ref(), 4).await, b"next");
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::LocalSocket, dir.path(), "backpressure.sock");
        let listener = listen(&strategy).await.unwrap();
        let (server, _client) = pair(listener.as_ref(), &strategy).await;

        // Nobody reads on the client side, so the socket buffer fills up
        server
            .set_write_deadline(Some(Instant::now() + Duration::from_millis(200)))
            .unwrap();
        let chunk = vec![0u8; 64 * 1024];
        let err = tokio::time::timeout(STEP, async {
            loop {
                if let Err(e) = server.write_all(&chunk).await {
                    return e;
                }
            }
        })
        .await
        .expect("write never blocked");
        assert!(matches!(err, Error::DeadlineExceeded), "got {err:?}");

        // Reads are not bound by the write deadline
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(300), server.read(&mut buf)).await;
        assert!(read.is_err(), "read returned {read:?}");

        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_many_clients_share_one_listener() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::LocalSocket, dir.path(), "shared.sock");
        let listener = listen(&strategy).await.unwrap();
        assert!(listener.capabilities().multi_accept);

        for i in 0..3u8 {
            let (server, client) = pair(listener.as_ref(), &strategy).await;
            client.write_all(&[i]).await.unwrap();
            assert_eq!(read_exact(server.as_ref(), 1).await, [i]);
        }
        listener.close().await.unwrap();
        assert!(!strategy.path().exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::LocalSocket, dir.path(), "crashed.sock");

        // A std listener leaves its socket file behind when dropped
        drop(std::os::unix::net::UnixListener::bind(strategy.path()).unwrap());
        assert!(strategy.path().exists());

        let listener = listen(&strategy).await.unwrap();
        let (server, client) = pair(listener.as_ref(), &strategy).await;
        client.write_all(b"back").await.unwrap();
        assert_eq!(read_exact(server.as_ref(), 4).await, b"back");
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_handshake_is_rejected() {
        use interprocess::local_socket::tokio::{prelude::*, Stream};
        use interprocess::local_socket::GenericFilePath;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::LocalSocket, dir.path(), "strict.sock");
        let listener: std::sync::Arc<dyn Listener> = listen(&strategy).await.unwrap().into();

        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };

        let name = strategy.path().to_fs_name::<GenericFilePath>().unwrap();
        let mut impostor = Stream::connect(name).await.unwrap();
        impostor.write_all(b"Hxllo").await.unwrap();

        // The listener hangs up on the impostor and keeps waiting
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(STEP, impostor.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(!accepting.is_finished());

        let client = connect(&strategy).await.unwrap();
        let server = tokio::time::timeout(STEP, accepting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        client.write_all(b"ok").await.unwrap();
        assert_eq!(read_exact(server.as_ref(), 2).await, b"ok");
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::LocalSocket, dir.path(), "deadline.sock");
        let listener = listen(&strategy).await.unwrap();
        let (server, client) = pair(listener.as_ref(), &strategy).await;
        assert!(server.capabilities().deadlines);

        server
            .set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 4];
        let err = tokio::time::timeout(STEP, server.read(&mut buf)).await.unwrap();
        assert!(matches!(err, Err(Error::DeadlineExceeded)), "got {err:?}");

        // Clearing the deadline makes the conn usable again
        server.set_deadline(None).unwrap();
        client.write_all(b"late").await.unwrap();
        assert_eq!(read_exact(server.as_ref(), 4).await, b"late");

        listener.close().await.unwrap();
    }
}

#[cfg(target_os = "linux")]
mod srv {
    use super::*;

    #[tokio::test]
    async fn test_second_listen_is_refused() {
        second_listen_is_refused(BackendKind::Srv).await;
    }

    #[tokio::test]
    async fn test_connect_without_listener() {
        connect_without_listener(BackendKind::Srv).await;
    }

    #[tokio::test]
    async fn test_ping_pong() {
        ping_pong(BackendKind::Srv).await;
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        close_unblocks_accept(BackendKind::Srv).await;
    }

    #[tokio::test]
    async fn test_io_after_close() {
        io_after_close(BackendKind::Srv).await;
    }

    #[tokio::test]
    async fn test_read_while_writing() {
        read_while_writing(BackendKind::Srv).await;
    }

    #[tokio::test]
    async fn test_second_client_cannot_join_pending_channel() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::Srv, dir.path(), "taken.sock");
        let listener = listen(&strategy).await.unwrap();

        // Both clients arrive before the server accepts
        let first = connect(&strategy).await.unwrap();
        let err = connect(&strategy).await.err().expect("second client joined");
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");

        first.write_all(b"ONE").await.unwrap();
        let server = tokio::time::timeout(STEP, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_exact(server.as_ref(), 3).await, b"ONE");

        server.write_all(b"REPLY").await.unwrap();
        assert_eq!(read_exact(first.as_ref(), 5).await, b"REPLY");

        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_deadlines_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::Srv, dir.path(), "nodeadline.sock");
        let listener = listen(&strategy).await.unwrap();
        let (server, client) = pair(listener.as_ref(), &strategy).await;
        assert!(!server.capabilities().deadlines);

        let soon = Some(Instant::now() + Duration::from_millis(10));
        assert!(matches!(
            server.set_read_deadline(soon),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            client.set_deadline(soon),
            Err(Error::UnsupportedOperation(_))
        ));

        // The refused deadline left the conn untouched
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"still here").await.unwrap();
        assert_eq!(read_exact(server.as_ref(), 10).await, b"still here");

        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_serves_one_peer() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(BackendKind::Srv, dir.path(), "once.sock");
        let listener = listen(&strategy).await.unwrap();
        assert!(!listener.capabilities().multi_accept);

        let (server, _client) = pair(listener.as_ref(), &strategy).await;

        let err = listener.accept().await.err().expect("second accept succeeded");
        assert!(matches!(err, Error::UnsupportedOperation(_)), "got {err:?}");

        // The shared channel goes down with its listener
        listener.close().await.unwrap();
        let mut buf = [0u8; 1];
        assert!(server.read(&mut buf).await.is_err());
        assert!(!strategy.path().exists());
    }
}
