//! Unix socket server

use snipbox_core::protocol::{self, Request, Response};
use snipbox_core::result::SYSTEM_ERROR_MESSAGE;
use snipbox_core::{FetchError, Snipbox, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Accept connections until the listener fails
pub async fn run(listener: UnixListener, snipbox: Arc<Snipbox>) -> Result<(), BoxError> {
    loop {
        let (stream, _) = listener.accept().await?;
        let snipbox = Arc::clone(&snipbox);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, snipbox).await {
                tracing::error!(error = %e, "connection error");
            }
        });
    }
}

/// Serve requests on one connection until the client hangs up
pub async fn handle_connection<S>(mut stream: S, snipbox: Arc<Snipbox>) -> Result<(), BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();

    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            break; // Client disconnected
        }
        let len = protocol::frame_len(len_buf)?;

        buf.resize(len, 0);
        stream.read_exact(&mut buf[..len]).await?;

        let response = match protocol::decode::<Request>(&buf[..len]) {
            Ok(request) => {
                tracing::debug!(?request, "received request");
                handle_request(request, &snipbox).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable request");
                Response::Error {
                    message: "malformed request".into(),
                }
            }
        };

        let response_bytes = protocol::encode(&response)?;
        stream.write_all(&protocol::frame_header(response_bytes.len())?).await?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;
    }

    Ok(())
}

async fn handle_request(request: Request, snipbox: &Arc<Snipbox>) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::Execute { user, code } => {
            with_user(snipbox, &user, move |snipbox, user| {
                Response::Execute(snipbox.execute(&user, &code))
            })
            .await
        }

        Request::Reset { user } => {
            with_user(snipbox, &user, |snipbox, user| match snipbox.reset_sandbox(&user) {
                Ok(()) => Response::Reset,
                Err(e) => {
                    tracing::error!(user = %user, error = %e, "sandbox reset failed");
                    Response::Error {
                        message: "unable to reset sandbox".into(),
                    }
                }
            })
            .await
        }

        Request::Logout { user } => {
            with_user(snipbox, &user, |snipbox, user| {
                snipbox.destroy_sandbox(&user);
                Response::Logout
            })
            .await
        }

        Request::Fetch { user, artifact } => {
            with_user(snipbox, &user, move |snipbox, user| {
                match snipbox.fetch_artifact(&user, &artifact) {
                    Ok(content) => Response::Artifact { content },
                    Err(FetchError::Forbidden) => Response::Forbidden,
                    Err(FetchError::NotFound) => Response::NotFound,
                    Err(e) => {
                        tracing::error!(user = %user, artifact = %artifact, error = %e, "artifact read failed");
                        Response::Error {
                            message: "unable to read artifact".into(),
                        }
                    }
                }
            })
            .await
        }

        Request::Status { user } => {
            with_user(snipbox, &user, |snipbox, user| Response::Status(snipbox.status(&user))).await
        }
    }
}

/// Validate `user` and run `f` on the blocking pool.
///
/// Everything that touches a sandbox may wait on that user's lock, which an
/// execution holds for up to the timeout.
async fn with_user<F>(snipbox: &Arc<Snipbox>, user: &str, f: F) -> Response
where
    F: FnOnce(&Snipbox, UserId) -> Response + Send + 'static,
{
    let user = match UserId::new(user) {
        Ok(user) => user,
        Err(e) => {
            return Response::Error {
                message: e.to_string(),
            };
        }
    };

    let snipbox = Arc::clone(snipbox);
    match tokio::task::spawn_blocking(move || f(&snipbox, user)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "request task failed");
            Response::Error {
                message: SYSTEM_ERROR_MESSAGE.into(),
            }
        }
    }
}

/// Reclaim idle sandboxes every `interval`
pub async fn reap_loop(snipbox: Arc<Snipbox>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let sweep = Arc::clone(&snipbox);
        match tokio::task::spawn_blocking(move || sweep.reap_expired()).await {
            Ok(0) => {}
            Ok(reaped) => tracing::info!(reaped, "expired sessions reclaimed"),
            Err(e) => tracing::error!(error = %e, "reaper task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snipbox_core::SandboxConfig;
    use tokio::io::DuplexStream;

    fn snipbox(dir: &std::path::Path) -> Arc<Snipbox> {
        let config = SandboxConfig::builder()
            .sandbox_root(dir.join("sandboxes"))
            .artifact_dir(dir.join("artifacts"))
            .build();
        Arc::new(Snipbox::new(&config).unwrap())
    }

    async fn roundtrip(client: &mut DuplexStream, request: &Request) -> Response {
        let body = protocol::encode(request).unwrap();
        client.write_all(&protocol::frame_header(body.len()).unwrap()).await.unwrap();
        client.write_all(&body).await.unwrap();

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let mut buf = vec![0u8; protocol::frame_len(len_buf).unwrap()];
        client.read_exact(&mut buf).await.unwrap();
        protocol::decode(&buf).unwrap()
    }

    #[tokio::test]
    async fn serves_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(server, snipbox(dir.path())));

        assert!(matches!(roundtrip(&mut client, &Request::Ping).await, Response::Pong));

        let reset = Request::Reset { user: "alice".into() };
        assert!(matches!(roundtrip(&mut client, &reset).await, Response::Reset));

        match roundtrip(&mut client, &Request::Status { user: "alice".into() }).await {
            Response::Status(status) => {
                assert_eq!(status.user, "alice");
                assert!(status.sandbox_created);
            }
            other => panic!("unexpected {other:?}"),
        }

        let logout = Request::Logout { user: "alice".into() };
        assert!(matches!(roundtrip(&mut client, &logout).await, Response::Logout));

        let empty = Request::Execute {
            user: "alice".into(),
            code: "   ".into(),
        };
        match roundtrip(&mut client, &empty).await {
            Response::Execute(result) => assert_eq!(result.output, "No code provided"),
            other => panic!("unexpected {other:?}"),
        }

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fetch_answers_forbidden_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server, snipbox(dir.path())));

        let foreign = Request::Fetch {
            user: "mallory".into(),
            artifact: "alice_00000000-0000-4000-8000-000000000000.html".into(),
        };
        assert!(matches!(roundtrip(&mut client, &foreign).await, Response::Forbidden));

        let missing = Request::Fetch {
            user: "alice".into(),
            artifact: "alice_00000000-0000-4000-8000-000000000000.html".into(),
        };
        assert!(matches!(roundtrip(&mut client, &missing).await, Response::NotFound));
    }

    #[tokio::test]
    async fn panicking_request_becomes_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let snipbox = snipbox(dir.path());

        let response = with_user(&snipbox, "alice", |_, _| panic!("boom")).await;
        match response {
            Response::Error { message } => assert_eq!(message, SYSTEM_ERROR_MESSAGE),
            other => panic!("unexpected {other:?}"),
        }

        let status = Request::Status { user: "alice".into() };
        assert!(matches!(handle_request(status, &snipbox).await, Response::Status(_)));
    }

    #[tokio::test]
    async fn invalid_users_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server, snipbox(dir.path())));

        let request = Request::Reset { user: "../etc".into() };
        match roundtrip(&mut client, &request).await {
            Response::Error { message } => assert!(message.contains("invalid user id")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(std::fs::read_dir(dir.path().join("sandboxes")).unwrap().count(), 0);
    }
}
