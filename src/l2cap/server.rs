use std::fmt::Debug;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::channel::{FrameReadError, FrameReader};
use super::command::{L2capCommand, L2capCommandId};
use crate::error::BleError;

/// Produces the reply, if any, for one received command.
pub trait L2capCommandHandler: Send + Sync + Debug {
    fn handle(&self, command: L2capCommand) -> Option<L2capCommand>;
}

/// Answers `Echo` with the same payload and `SendImage` with `AckImage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCommandHandler;

impl L2capCommandHandler for EchoCommandHandler {
    fn handle(&self, command: L2capCommand) -> Option<L2capCommand> {
        match command.id() {
            L2capCommandId::Echo => Some(command),
            L2capCommandId::SendImage => {
                let received = u32::try_from(command.received_len()).unwrap_or(u32::MAX);
                Some(L2capCommand::ack_image(received))
            }
            L2capCommandId::AckImage => None,
        }
    }
}

/// Serves command frames arriving on accepted L2CAP streams.
#[derive(Debug, Clone)]
pub struct L2capCommandServer<H> {
    handler: H,
}

impl<H> L2capCommandServer<H>
where
    H: L2capCommandHandler + Clone + 'static,
{
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Answers frames on `stream` until the peer closes it.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolDecodeFailed` on a malformed frame, or a platform
    /// failure when the stream breaks.
    #[instrument(skip_all, level = "debug")]
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), BleError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frames = FrameReader::default();
        loop {
            let command = match frames.read_frame(&mut stream).await {
                Ok(Some(command)) => command,
                Ok(None) => {
                    debug!("peer closed command stream");
                    return Ok(());
                }
                Err(FrameReadError::Decode(source)) => {
                    return Err(BleError::ProtocolDecodeFailed(source));
                }
                Err(error) => return Err(BleError::platform("l2cap_serve", error)),
            };

            debug!(command = %command.id(), len = command.declared_len(), "received command");
            if let Some(reply) = self.handler.handle(command) {
                stream
                    .write_all(&reply.encode())
                    .await
                    .map_err(|error| BleError::platform("l2cap_serve", error))?;
                stream
                    .flush()
                    .await
                    .map_err(|error| BleError::platform("l2cap_serve", error))?;
            }
        }
    }

    /// Serves every stream received on `incoming`, one task per stream.
    pub async fn serve_incoming<S>(&self, mut incoming: mpsc::Receiver<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(stream) = incoming.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(error) = server.serve(stream).await {
                    warn!(%error, "command stream ended with an error");
                }
            });
        }
    }
}
