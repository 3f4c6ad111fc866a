use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tracing::{debug, error};

use crate::core::{WebSocketError, WebSocketResult, WsFrame};

/// Owns the sink half of one socket and serializes writes to it.
///
/// A writer lives exactly as long as its socket; the connection actor spawns a new
/// one per handshake and stops it on teardown.
pub struct WsWriterActor<W>
where
    W: Sink<WsFrame, Error = WebSocketError> + Send + Unpin + 'static,
{
    writer: W,
    closed: bool,
}

impl<W> WsWriterActor<W>
where
    W: Sink<WsFrame, Error = WebSocketError> + Send + Unpin + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }
}

impl<W> Actor for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = WebSocketError> + Send + Unpin + 'static,
{
    type Args = Self;
    type Error = WebSocketError;

    fn name() -> &'static str {
        "WsWriterActor"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            error!(error = ?err, "WsWriterActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

/// Write one frame and flush it.
#[derive(Clone, Debug)]
pub struct WriterWrite {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriterWrite> for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = WebSocketError> + Send + Unpin + 'static,
{
    type Reply = WebSocketResult<()>;

    async fn handle(
        &mut self,
        msg: WriterWrite,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.closed {
            return Err(WebSocketError::InvalidState("writer closed".to_string()));
        }
        let is_close = msg.frame.is_close();
        debug!(target: "ws-writer", close = is_close, "sending websocket frame to wire");
        self.writer.send(msg.frame).await?;
        if is_close {
            // Nothing may follow a close frame on the wire.
            self.closed = true;
        }
        Ok(())
    }
}
