//! Connection handling and the accept loop.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod telemetry;

use self::{
    config::ServerConfig,
    connection::LineConnection,
    envelope::{Envelope, Reply},
};
use brigade::{Capability, Dispatcher, Rejected};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

/// The dispatcher type the server runs, with TCP workers.
pub type TcpDispatcher = Dispatcher<LineConnection<TcpStream>>;

/// Accepts connections until `shutdown` fires, then ends the dispatch
/// session and waits up to the configured timeout for open connections.
pub async fn serve(
    listener: TcpListener,
    dispatcher: TcpDispatcher,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                let connection = LineConnection::new(stream, config.max_line_bytes);
                tracker.spawn(
                    handle_connection(dispatcher.clone(), connection)
                        .instrument(tracing::info_span!("connection", %peer)),
                );
            }
        }
    }

    let released = dispatcher.shutdown();
    tracing::info!(workers = released.len(), "Released on-duty workers");

    tracker.close();
    if tokio::time::timeout(config.shutdown_timeout, tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!(
            open = tracker.len(),
            "Timed out waiting for connections to close"
        );
    }

    Ok(())
}

/// Serves one connection from its envelope line to completion.
///
/// A worker connection is handed to the dispatcher and outlives this call;
/// every other connection is closed when it returns.
pub async fn handle_connection<IO>(
    dispatcher: Dispatcher<LineConnection<IO>>,
    mut connection: LineConnection<IO>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    let envelope = match connection.read_json::<Envelope>().await {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected envelope");
            reply(&mut connection, &Reply::from(&e)).await;
            return;
        }
    };

    match envelope {
        Envelope::OnDuty { id, capability } => {
            let capability = match Capability::try_from(capability) {
                Ok(capability) => capability,
                Err(e) => {
                    reply(&mut connection, &Reply::from(&e)).await;
                    return;
                }
            };
            if let Err(Rejected {
                error,
                mut connection,
            }) = dispatcher.on_duty(id, capability, connection)
            {
                reply(&mut connection, &Reply::from(&error)).await;
            }
        }
        Envelope::OffDuty { id } => {
            let outcome = match dispatcher.off_duty(&id) {
                // The released worker connection closes when dropped.
                Ok(_) => Reply::OFF_DUTY,
                Err(e) => Reply::from(&e),
            };
            reply(&mut connection, &outcome).await;
        }
        Envelope::Job { capability } => {
            if let Err(e) = dispatcher.handle_job(&capability, &mut connection).await {
                tracing::debug!(error = %e, "Job failed");
                reply(&mut connection, &Reply::from(&e)).await;
            }
        }
    }
}

async fn reply<IO>(connection: &mut LineConnection<IO>, reply: &Reply)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = connection.write_json(reply).await {
        tracing::debug!(error = %e, "Failed to write reply");
    }
}
